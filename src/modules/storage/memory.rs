// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::envelope::{Email, Envelope};
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::hash::HashKey;
use crate::modules::parts::PartsInfo;
use crate::modules::storage::{
    zlib_compress, zlib_decompress, Chunk, Storage, StorageConfig,
};
use crate::{raise_error, utc_now};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

struct StoredChunk {
    /// zlib-compressed at the configured level.
    data: Vec<u8>,
    reference_count: u32,
    modified_at: i64,
}

/// In-memory engine. Chunks are compressed with zlib at the configured
/// level; everything lives in concurrent maps, so it is also the
/// engine the test suite runs against.
pub struct MemoryStorage {
    chunks: DashMap<HashKey, StoredChunk>,
    emails: DashMap<u64, Email>,
    next_mail_id: AtomicU64,
    compress_level: AtomicI32,
}

impl MemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryStorage {
            chunks: DashMap::new(),
            emails: DashMap::new(),
            next_mail_id: AtomicU64::new(0),
            compress_level: AtomicI32::new(-1),
        })
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn reference_count(&self, hash: &HashKey) -> Option<u32> {
        self.chunks.get(hash).map(|c| c.reference_count)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn initialize(&self, config: &StorageConfig) -> MailVaultResult<()> {
        self.compress_level
            .store(config.compress_level, Ordering::Relaxed);
        Ok(())
    }

    async fn open_message(&self, envelope: &Envelope) -> MailVaultResult<u64> {
        let mail_id = self.next_mail_id.fetch_add(1, Ordering::Relaxed) + 1;
        let email = Email {
            mail_id,
            created_at: utc_now!(),
            from: envelope.from.clone(),
            to: envelope.to.clone(),
            helo: envelope.helo.clone(),
            recipient: envelope.recipient.clone(),
            return_path: envelope.return_path.clone(),
            queued_id: envelope.queued_id,
            remote_ip: envelope.remote_ip,
            protocol: envelope.protocol,
            transport: envelope.transport,
            ..Default::default()
        };
        self.emails.insert(mail_id, email);
        Ok(mail_id)
    }

    async fn close_message(
        &self,
        mail_id: u64,
        size: u64,
        parts_info: &PartsInfo,
        subject: &str,
        queued_id: &HashKey,
        to: &str,
        from: &str,
    ) -> MailVaultResult<()> {
        let mut email = self.emails.get_mut(&mail_id).ok_or_else(|| {
            raise_error!(
                format!("message {} not open", mail_id),
                ErrorCode::MessageNotFound
            )
        })?;
        email.size = size;
        email.subject = subject.to_string();
        email.queued_id = *queued_id;
        email.to = to.to_string();
        email.from = from.to_string();
        email.parts_info = Some(parts_info.clone());
        email.finalized = true;
        Ok(())
    }

    async fn add_chunk(&self, data: &[u8], hash: &HashKey) -> MailVaultResult<()> {
        let now = utc_now!();
        match self.chunks.entry(*hash) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let chunk = entry.get_mut();
                chunk.reference_count += 1;
                chunk.modified_at = now;
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let level = self.compress_level.load(Ordering::Relaxed);
                entry.insert(StoredChunk {
                    data: zlib_compress(data, level)?,
                    reference_count: 1,
                    modified_at: now,
                });
            }
        }
        Ok(())
    }

    async fn get_message(&self, mail_id: u64) -> MailVaultResult<Email> {
        self.emails
            .get(&mail_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| {
                raise_error!(
                    format!("message {} not found", mail_id),
                    ErrorCode::MessageNotFound
                )
            })
    }

    async fn get_chunks(&self, hashes: &[HashKey]) -> MailVaultResult<Vec<Chunk>> {
        let mut out = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let stored = self.chunks.get(hash).ok_or_else(|| {
                raise_error!(format!("chunk {} missing", hash), ErrorCode::ChunkMissing)
            })?;
            out.push(Chunk {
                data: zlib_decompress(&stored.data)?,
            });
        }
        Ok(out)
    }

    async fn delete_message(&self, mail_id: u64) -> MailVaultResult<u64> {
        let (_, email) = self.emails.remove(&mail_id).ok_or_else(|| {
            raise_error!(
                format!("message {} not found", mail_id),
                ErrorCode::MessageNotFound
            )
        })?;
        let now = utc_now!();
        let mut released = 0u64;
        if let Some(parts_info) = &email.parts_info {
            for part in &parts_info.parts {
                for hash in &part.chunk_hashes {
                    if let Some(mut chunk) = self.chunks.get_mut(hash) {
                        chunk.reference_count = chunk.reference_count.saturating_sub(1);
                        chunk.modified_at = now;
                        released += 1;
                    }
                }
            }
        }
        Ok(released)
    }

    async fn sweep(&self, grace_millis: i64) -> MailVaultResult<u64> {
        let cutoff = utc_now!() - grace_millis;
        let before_chunks = self.chunks.len();
        self.chunks
            .retain(|_, c| c.reference_count > 0 || c.modified_at > cutoff);
        let before_emails = self.emails.len();
        self.emails
            .retain(|_, e| e.finalized || e.created_at > cutoff);
        Ok(before_chunks.saturating_sub(self.chunks.len()) as u64
            + before_emails.saturating_sub(self.emails.len()) as u64)
    }

    async fn shutdown(&self) -> MailVaultResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(data: &[u8]) -> HashKey {
        HashKey::digest(data)
    }

    #[tokio::test]
    async fn add_chunk_deduplicates() {
        let storage = MemoryStorage::new();
        storage.initialize(&StorageConfig::default()).await.unwrap();
        let data = b"shared chunk payload";
        let hash = key(data);
        storage.add_chunk(data, &hash).await.unwrap();
        storage.add_chunk(data, &hash).await.unwrap();
        storage.add_chunk(data, &hash).await.unwrap();
        assert_eq!(storage.chunk_count(), 1);
        assert_eq!(storage.reference_count(&hash), Some(3));
    }

    #[tokio::test]
    async fn chunks_come_back_byte_identical_and_in_order() {
        let storage = MemoryStorage::new();
        storage.initialize(&StorageConfig::default()).await.unwrap();
        let payloads: Vec<Vec<u8>> = (0u8..5).map(|i| vec![i; 64 + i as usize]).collect();
        let hashes: Vec<HashKey> = payloads.iter().map(|p| key(p)).collect();
        for (payload, hash) in payloads.iter().zip(&hashes) {
            storage.add_chunk(payload, hash).await.unwrap();
        }
        // every permutation-ish ordering: forwards, backwards, shuffled
        for order in [[0usize, 1, 2, 3, 4], [4, 3, 2, 1, 0], [2, 0, 4, 1, 3]] {
            let request: Vec<HashKey> = order.iter().map(|&i| hashes[i]).collect();
            let chunks = storage.get_chunks(&request).await.unwrap();
            for (slot, &i) in order.iter().enumerate() {
                assert_eq!(chunks[slot].data, payloads[i]);
            }
        }
    }

    #[tokio::test]
    async fn missing_chunk_fails_the_read() {
        let storage = MemoryStorage::new();
        storage.initialize(&StorageConfig::default()).await.unwrap();
        let err = storage.get_chunks(&[key(b"nope")]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ChunkMissing);
    }

    async fn store_one(storage: &MemoryStorage, data: &[u8], hash: &HashKey) -> u64 {
        let mail_id = storage.open_message(&Envelope::default()).await.unwrap();
        storage.add_chunk(data, hash).await.unwrap();
        let mut info = PartsInfo::new();
        info.parts.push(crate::modules::parts::ChunkedPart {
            part_id: "1".into(),
            size: data.len() as u64,
            chunk_hashes: vec![*hash],
            ..Default::default()
        });
        info.count = 1;
        storage
            .close_message(mail_id, data.len() as u64, &info, "", hash, "", "")
            .await
            .unwrap();
        mail_id
    }

    #[tokio::test]
    async fn delete_decrements_and_sweep_collects() {
        let storage = MemoryStorage::new();
        storage.initialize(&StorageConfig::default()).await.unwrap();
        let data = b"chunk shared by two messages";
        let hash = key(data);

        let first = store_one(&storage, data, &hash).await;
        let second = store_one(&storage, data, &hash).await;
        assert_eq!(storage.reference_count(&hash), Some(2));

        storage.delete_message(first).await.unwrap();
        assert_eq!(storage.reference_count(&hash), Some(1));
        storage.delete_message(second).await.unwrap();
        assert_eq!(storage.reference_count(&hash), Some(0));

        // tombstoned, not yet gone
        assert_eq!(storage.chunk_count(), 1);
        storage.sweep(0).await.unwrap();
        assert_eq!(storage.chunk_count(), 0);
    }

    #[tokio::test]
    async fn sweep_respects_grace_window() {
        let storage = MemoryStorage::new();
        storage.initialize(&StorageConfig::default()).await.unwrap();
        let hash = key(b"soon to be orphaned");
        storage.add_chunk(b"soon to be orphaned", &hash).await.unwrap();
        let mail_id = storage.open_message(&Envelope::default()).await.unwrap();
        let mut info = PartsInfo::new();
        info.parts.push(crate::modules::parts::ChunkedPart {
            part_id: "1".into(),
            size: 19,
            chunk_hashes: vec![hash],
            ..Default::default()
        });
        storage
            .close_message(mail_id, 19, &info, "", &hash, "", "")
            .await
            .unwrap();
        storage.delete_message(mail_id).await.unwrap();
        // a generous grace keeps the tombstone around
        storage.sweep(3_600_000).await.unwrap();
        assert_eq!(storage.chunk_count(), 1);
    }

    #[tokio::test]
    async fn unfinalized_messages_are_sweeper_fodder() {
        let storage = MemoryStorage::new();
        storage.initialize(&StorageConfig::default()).await.unwrap();
        let mail_id = storage.open_message(&Envelope::default()).await.unwrap();
        assert!(storage.get_message(mail_id).await.is_ok());
        storage.sweep(0).await.unwrap();
        assert!(storage.get_message(mail_id).await.is_err());
    }

    #[tokio::test]
    async fn mail_ids_are_monotonic() {
        let storage = MemoryStorage::new();
        storage.initialize(&StorageConfig::default()).await.unwrap();
        let a = storage.open_message(&Envelope::default()).await.unwrap();
        let b = storage.open_message(&Envelope::default()).await.unwrap();
        assert!(b > a);
    }
}
