// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

pub mod buffer;
pub mod decode;
pub mod reader;
pub mod saver;
pub mod stream;
#[cfg(test)]
mod tests;
