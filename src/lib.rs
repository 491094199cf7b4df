// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

pub mod modules;

pub use modules::chunk::decode::PartDecoder;
pub use modules::chunk::reader::{ChunkedReader, MessageCache};
pub use modules::chunk::stream::ChunkStream;
pub use modules::envelope::{Email, Envelope, Protocol, Transport};
pub use modules::error::{MailVaultError, MailVaultResult};
pub use modules::hash::HashKey;
pub use modules::parts::{ChunkedPart, PartsInfo};
pub use modules::scanner::MimeScanner;
pub use modules::storage::registry::StorageRegistry;
pub use modules::storage::{Storage, StorageConfig};
