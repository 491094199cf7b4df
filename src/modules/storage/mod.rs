// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::envelope::{Email, Envelope};
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::hash::HashKey;
use crate::modules::parts::PartsInfo;
use crate::modules::settings::cli::SETTINGS;
use crate::raise_error;
use async_trait::async_trait;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

pub mod memory;
pub mod registry;
pub mod sql;
pub mod sweep;

/// Backend-facing slice of the configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub compress_level: i32,
    pub sql_driver: String,
    pub sql_dsn: Option<String>,
    pub email_table: String,
    pub email_table_chunks: String,
    pub sql_max_open_conns: u32,
    pub sql_max_idle_conns: u32,
    pub sql_max_conn_lifetime: u64,
}

impl StorageConfig {
    pub fn from_settings() -> Self {
        StorageConfig {
            compress_level: SETTINGS.compress_level,
            sql_driver: SETTINGS.sql_driver.clone(),
            sql_dsn: SETTINGS.sql_dsn.clone(),
            email_table: SETTINGS.email_table.clone(),
            email_table_chunks: SETTINGS.email_table_chunks.clone(),
            sql_max_open_conns: SETTINGS.sql_max_open_conns,
            sql_max_idle_conns: SETTINGS.sql_max_idle_conns,
            sql_max_conn_lifetime: SETTINGS.sql_max_conn_lifetime,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            compress_level: -1,
            sql_driver: "mysql".into(),
            sql_dsn: None,
            email_table: "in_emails".into(),
            email_table_chunks: "in_emails_chunks".into(),
            sql_max_open_conns: 50,
            sql_max_idle_conns: 10,
            sql_max_conn_lifetime: 1800,
        }
    }
}

/// One stored chunk as handed back to a reader.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub data: Vec<u8>,
}

/// Contract every storage engine fulfills.
///
/// For a single message the write path is strictly ordered:
/// `open_message` → `add_chunk`* → `close_message`. `get_chunks` must
/// return chunks in the requested order regardless of internal row
/// order, and for a given hash the bytes returned on read equal the
/// bytes originally written.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn initialize(&self, config: &StorageConfig) -> MailVaultResult<()>;

    /// Create the message row, returning its fresh monotonic id.
    async fn open_message(&self, envelope: &Envelope) -> MailVaultResult<u64>;

    /// Seal a message: persist its size, manifest and final envelope
    /// fields.
    #[allow(clippy::too_many_arguments)]
    async fn close_message(
        &self,
        mail_id: u64,
        size: u64,
        parts_info: &PartsInfo,
        subject: &str,
        queued_id: &HashKey,
        to: &str,
        from: &str,
    ) -> MailVaultResult<()>;

    /// Atomically insert the chunk with refcount 1, or bump the
    /// refcount of an existing row with the same hash.
    async fn add_chunk(&self, data: &[u8], hash: &HashKey) -> MailVaultResult<()>;

    async fn get_message(&self, mail_id: u64) -> MailVaultResult<Email>;

    /// Fetch chunks in the same order as requested.
    async fn get_chunks(&self, hashes: &[HashKey]) -> MailVaultResult<Vec<Chunk>>;

    /// Drop a message and decrement the refcount of every chunk it
    /// references; chunks reaching zero are tombstoned for the sweeper.
    async fn delete_message(&self, mail_id: u64) -> MailVaultResult<u64>;

    /// Hard-delete tombstoned chunks and unfinalized messages older
    /// than the grace window. Returns the number of rows removed.
    async fn sweep(&self, grace_millis: i64) -> MailVaultResult<u64>;

    async fn shutdown(&self) -> MailVaultResult<()>;
}

/// Map the configured level onto zlib. -1 is the zlib default; -2
/// (huffman-only in the original knob) has no flate2 equivalent and
/// degrades to fastest.
pub(crate) fn compression_for_level(level: i32) -> Compression {
    match level {
        0..=9 => Compression::new(level as u32),
        -2 => Compression::fast(),
        _ => Compression::default(),
    }
}

pub(crate) fn zlib_compress(data: &[u8], level: i32) -> MailVaultResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(data.len() / 2 + 16),
        compression_for_level(level),
    );
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageError))
}

pub(crate) fn zlib_decompress(data: &[u8]) -> MailVaultResult<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageError))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zlib_round_trip_at_each_level() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(20);
        for level in [-2, -1, 0, 1, 5, 9] {
            let packed = zlib_compress(&data, level).unwrap();
            assert_eq!(zlib_decompress(&packed).unwrap(), data);
        }
    }
}
