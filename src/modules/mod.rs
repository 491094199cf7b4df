// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

pub mod chunk;
pub mod envelope;
pub mod error;
pub mod hash;
pub mod logger;
pub mod parts;
pub mod scanner;
pub mod settings;
pub mod smtp;
pub mod storage;
pub mod utils;
