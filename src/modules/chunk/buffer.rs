// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::hash::HashKey;
use crate::modules::parts::{ChunkedPart, PartsInfo};
use crate::modules::scanner::MimePart;
use crate::modules::storage::Storage;
use crate::raise_error;
use md5::{Digest, Md5};
use std::sync::Arc;

/// Default chunk capacity: 16 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Content metadata of the part currently receiving bytes, snapshotted
/// from the scanner's tree.
#[derive(Debug, Clone)]
struct CurrentPart {
    part_id: String,
    content_type: String,
    charset: String,
    transfer_encoding: String,
    content_disposition: String,
    content_name: String,
    content_boundary: String,
}

impl From<&MimePart> for CurrentPart {
    fn from(part: &MimePart) -> Self {
        CurrentPart {
            part_id: part.part_id.clone(),
            content_type: part.content_type.clone(),
            charset: part.charset.clone(),
            transfer_encoding: part.transfer_encoding.clone(),
            content_disposition: part.content_disposition.clone(),
            content_name: part.content_name.clone(),
            content_boundary: part.content_boundary.clone(),
        }
    }
}

/// Fixed-capacity byte sink feeding the storage backend.
///
/// Fills to capacity, flushes, and continues; every flush hashes the
/// buffered bytes and records the digest in the current part's
/// descriptor. The hash is per-chunk: the hasher is reset on every
/// flush, so identical byte ranges produce identical chunk rows across
/// messages.
pub struct ChunkingBuffer {
    storage: Arc<dyn Storage>,
    buf: Vec<u8>,
    capacity: usize,
    hasher: Md5,
    info: PartsInfo,
    current: Option<CurrentPart>,
}

impl ChunkingBuffer {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        ChunkingBuffer {
            storage,
            buf: Vec::with_capacity(DEFAULT_CHUNK_SIZE),
            capacity: DEFAULT_CHUNK_SIZE,
            hasher: Md5::new(),
            info: PartsInfo::new(),
            current: None,
        }
    }

    /// Resize to capacity `n` with length zero.
    pub fn cap_to(&mut self, n: usize) {
        self.capacity = n;
        self.buf = Vec::with_capacity(n);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Clear both the buffer and the running hash.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.hasher = Md5::new();
    }

    /// Point subsequent flushes at `part`. The first call of a message
    /// initializes the enclosing PartsInfo.
    pub fn current_part(&mut self, part: &MimePart) {
        if self.current.is_none() {
            self.info = PartsInfo::new();
        }
        self.current = Some(CurrentPart::from(part));
        if self.buf.is_empty() {
            // a new part begins; per-chunk hashing starts clean
            self.hasher = Md5::new();
        }
    }

    /// Hand over the accumulated manifest and rearm for the next
    /// message.
    pub fn take_parts_info(&mut self) -> PartsInfo {
        self.current = None;
        let mut info = std::mem::take(&mut self.info);
        info.count = info.parts.len() as u32;
        info
    }

    /// Write never grows the buffer: it fills to capacity, fires a
    /// flush, resets, and continues. Returns the number of bytes
    /// written.
    pub async fn write(&mut self, bytes: &[u8]) -> MailVaultResult<usize> {
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let space = self.capacity - self.buf.len();
            let take = space.min(remaining.len());
            self.buf.extend_from_slice(&remaining[..take]);
            self.hasher.update(&remaining[..take]);
            remaining = &remaining[take..];
            if self.buf.len() == self.capacity {
                self.flush().await?;
            }
        }
        Ok(bytes.len())
    }

    /// No-op when empty; otherwise hash the buffered bytes, update the
    /// current part's descriptor, persist the chunk and reset.
    pub async fn flush(&mut self) -> MailVaultResult<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let digest: [u8; 16] = self.hasher.finalize_reset().into();
        let hash = HashKey::new(digest);
        let current = self.current.clone().ok_or_else(|| {
            raise_error!(
                "flush without a current part".into(),
                ErrorCode::InternalError
            )
        })?;
        let size = self.buf.len() as u64;
        let appends_to_last = self
            .info
            .parts
            .last()
            .is_some_and(|last| last.part_id == current.part_id);
        if appends_to_last {
            let last = self.info.parts.last_mut().unwrap();
            last.chunk_hashes.push(hash);
            last.size += size;
        } else {
            let boundary_index = self.info.intern_boundary(&current.content_boundary);
            let index = self.info.parts.len() as i32;
            if self.info.text_part < 0 && current.content_type == "text/plain" {
                self.info.text_part = index;
            }
            if self.info.html_part < 0 && current.content_type == "text/html" {
                self.info.html_part = index;
            }
            if current
                .content_disposition
                .to_ascii_lowercase()
                .contains("attach")
            {
                self.info.has_attach = true;
            }
            self.info.parts.push(ChunkedPart {
                part_id: current.part_id.clone(),
                size,
                chunk_hashes: vec![hash],
                content_type: current.content_type.clone(),
                charset: current.charset.clone(),
                transfer_encoding: current.transfer_encoding.clone(),
                content_disposition: current.content_disposition.clone(),
                content_name: current.content_name.clone(),
                content_boundary_index: boundary_index,
            });
        }
        self.info.count = self.info.parts.len() as u32;
        self.storage.add_chunk(&self.buf, &hash).await?;
        self.buf.clear();
        Ok(())
    }

    pub fn parts_info(&self) -> &PartsInfo {
        &self.info
    }
}
