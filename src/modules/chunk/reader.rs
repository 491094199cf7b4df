// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::envelope::Email;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::hash::HashKey;
use crate::modules::parts::{ChunkedPart, PartsInfo};
use crate::modules::storage::Storage;
use crate::modules::utils::lru::TimedLruCache;
use crate::raise_error;
use std::sync::Arc;
use std::time::Duration;

/// Chunks fetched ahead per storage call.
pub const DEFAULT_PRELOAD: usize = 2;

/// Parallel arrays of hashes and fetched chunk slots for one part.
struct PartSlots {
    hashes: Vec<HashKey>,
    slots: Vec<Option<Vec<u8>>>,
}

/// Reconstructs a message, or a single MIME part, from storage.
///
/// With selector 0 the reader concatenates every part in tree order;
/// with selector p ≥ 1 it produces only the bytes of the p-th part.
/// Chunks are fetched `preload` at a time, and slots behind the read
/// position are dropped to bound memory.
pub struct ChunkedReader {
    storage: Arc<dyn Storage>,
    info: PartsInfo,
    parts: Vec<PartSlots>,
    /// 0 = whole message, n ≥ 1 = only the n-th part.
    selector: usize,
    cur_part: usize,
    cur_chunk: usize,
    cur_off: usize,
    preload: usize,
    eof: bool,
}

impl ChunkedReader {
    pub fn new(storage: Arc<dyn Storage>, email: &Email, part: usize) -> MailVaultResult<Self> {
        let info = email.parts_info.clone().ok_or_else(|| {
            raise_error!(
                format!("message {} has no parts manifest", email.mail_id),
                ErrorCode::MessageNotFound
            )
        })?;
        if part > info.parts.len() {
            return Err(raise_error!(
                format!(
                    "part {} out of range, message has {}",
                    part,
                    info.parts.len()
                ),
                ErrorCode::InvalidParameter
            ));
        }
        let parts = info
            .parts
            .iter()
            .map(|p| PartSlots {
                hashes: p.chunk_hashes.clone(),
                slots: vec![None; p.chunk_hashes.len()],
            })
            .collect();
        let mut reader = ChunkedReader {
            storage,
            info,
            parts,
            selector: 0,
            cur_part: 0,
            cur_chunk: 0,
            cur_off: 0,
            preload: DEFAULT_PRELOAD,
            eof: false,
        };
        if part >= 1 {
            reader.seek_part(part)?;
        }
        Ok(reader)
    }

    /// Fetch the message through the metadata cache and open a reader
    /// on it.
    pub async fn load(
        storage: Arc<dyn Storage>,
        cache: &MessageCache,
        mail_id: u64,
        part: usize,
    ) -> MailVaultResult<Self> {
        let email = cache.load(&storage, mail_id).await?;
        Self::new(storage, &email, part)
    }

    pub fn with_preload(mut self, preload: usize) -> Self {
        self.preload = preload.max(1);
        self
    }

    pub fn parts_info(&self) -> &PartsInfo {
        &self.info
    }

    /// Descriptor of the 1-based n-th part.
    pub fn part_meta(&self, n: usize) -> Option<&ChunkedPart> {
        n.checked_sub(1).and_then(|i| self.info.parts.get(i))
    }

    /// Reset iteration to the 1-based n-th part; may be called
    /// repeatedly.
    pub fn seek_part(&mut self, n: usize) -> MailVaultResult<()> {
        if n == 0 || n > self.parts.len() {
            return Err(raise_error!(
                format!("part {} out of range, message has {}", n, self.parts.len()),
                ErrorCode::InvalidParameter
            ));
        }
        self.selector = n;
        self.cur_part = n - 1;
        self.cur_chunk = 0;
        self.cur_off = 0;
        self.eof = false;
        Ok(())
    }

    async fn ensure_loaded(&mut self) -> MailVaultResult<()> {
        let (start, end, wanted) = {
            let part = &self.parts[self.cur_part];
            if part.slots[self.cur_chunk].is_some() {
                return Ok(());
            }
            let end = (self.cur_chunk + self.preload).min(part.hashes.len());
            (
                self.cur_chunk,
                end,
                part.hashes[self.cur_chunk..end].to_vec(),
            )
        };
        let chunks = self.storage.get_chunks(&wanted).await?;
        let part = &mut self.parts[self.cur_part];
        for (slot, chunk) in part.slots[start..end].iter_mut().zip(chunks) {
            *slot = Some(chunk.data);
        }
        // drop consumed slots behind the cursor, walking back until the
        // first already-empty one
        let mut i = start;
        while i > 0 {
            i -= 1;
            if part.slots[i].is_none() {
                break;
            }
            part.slots[i] = None;
        }
        Ok(())
    }

    fn advance_part(&mut self) {
        if self.selector != 0 {
            self.eof = true;
            return;
        }
        self.cur_part += 1;
        self.cur_chunk = 0;
        self.cur_off = 0;
        if self.cur_part >= self.parts.len() {
            self.eof = true;
        }
    }

    /// Read some bytes; `Ok(0)` is end of the selected range.
    pub async fn read(&mut self, out: &mut [u8]) -> MailVaultResult<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            if self.eof {
                return Ok(0);
            }
            if self.cur_part >= self.parts.len() {
                self.eof = true;
                continue;
            }
            if self.cur_chunk >= self.parts[self.cur_part].hashes.len() {
                self.advance_part();
                continue;
            }
            self.ensure_loaded().await?;
            let cur_chunk = self.cur_chunk;
            let part = &mut self.parts[self.cur_part];
            let chunk = part.slots[cur_chunk].as_ref().unwrap();
            if self.cur_off >= chunk.len() {
                part.slots[cur_chunk] = None;
                self.cur_chunk += 1;
                self.cur_off = 0;
                continue;
            }
            let n = out.len().min(chunk.len() - self.cur_off);
            out[..n].copy_from_slice(&chunk[self.cur_off..self.cur_off + n]);
            self.cur_off += n;
            if self.cur_off == chunk.len() {
                part.slots[cur_chunk] = None;
                self.cur_chunk += 1;
                self.cur_off = 0;
            }
            return Ok(n);
        }
    }

    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> MailVaultResult<usize> {
        let mut total = 0usize;
        let mut buf = [0u8; 8192];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&buf[..n]);
            total += n;
        }
    }
}

/// TTL'd LRU in front of `get_message` for repeated part reads of the
/// same message.
pub struct MessageCache {
    inner: TimedLruCache<u64, Email>,
}

impl MessageCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        MessageCache {
            inner: TimedLruCache::new(capacity, ttl),
        }
    }

    pub async fn load(
        &self,
        storage: &Arc<dyn Storage>,
        mail_id: u64,
    ) -> MailVaultResult<Arc<Email>> {
        if let Some(email) = self.inner.get(&mail_id).await {
            return Ok(email);
        }
        let email = Arc::new(storage.get_message(mail_id).await?);
        self.inner.set(mail_id, Arc::clone(&email)).await;
        Ok(email)
    }

    pub async fn invalidate(&self, mail_id: u64) {
        self.inner.invalidate(&mail_id).await;
    }
}
