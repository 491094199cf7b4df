// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::chunk::buffer::ChunkingBuffer;
use crate::modules::envelope::Envelope;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::scanner::MimePart;
use crate::modules::settings::cli::SETTINGS;
use crate::modules::storage::Storage;
use crate::raise_error;
use std::sync::Arc;
use tracing::debug;

/// Pipeline stage that drives the chunking buffer from the scanner's
/// tree: it opens the message row, splits the byte stream at part and
/// header boundaries, and seals the row on close.
///
/// Headers and bodies land in separate chunks: headers are
/// high-entropy, bodies are often duplicated across copies and
/// forwards, and the separation is what makes body chunks dedup.
pub struct ChunkSaver {
    storage: Arc<dyn Storage>,
    buffer: ChunkingBuffer,
    mail_id: Option<u64>,
    envelope: Envelope,
    /// Absolute position of the next unwritten stream byte.
    message_pos: u64,
    /// Parts below this index are settled and never re-examined.
    next_part: usize,
    size: u64,
}

impl ChunkSaver {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        let mut buffer = ChunkingBuffer::new(Arc::clone(&storage));
        buffer.cap_to(SETTINGS.chunk_size as usize);
        ChunkSaver {
            buffer,
            storage,
            mail_id: None,
            envelope: Envelope::default(),
            message_pos: 0,
            next_part: 0,
            size: 0,
        }
    }

    pub fn cap_to(&mut self, n: usize) {
        self.buffer.cap_to(n);
    }

    pub fn mail_id(&self) -> Option<u64> {
        self.mail_id
    }

    /// Total stream bytes written so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Open the message row and reset the written counters.
    pub async fn open(&mut self, envelope: &Envelope) -> MailVaultResult<u64> {
        let mail_id = self.storage.open_message(envelope).await?;
        self.mail_id = Some(mail_id);
        self.envelope = envelope.clone();
        self.message_pos = 0;
        self.next_part = 0;
        self.size = 0;
        // clear any leftovers from an aborted previous message
        let _ = self.buffer.take_parts_info();
        self.buffer.reset();
        debug!("message {} opened for chunking", mail_id);
        Ok(mail_id)
    }

    /// Consume one slice of the stream. The scanner must already have
    /// processed this slice, so every offset the tree carries is at or
    /// before the end of the slice.
    pub async fn write(&mut self, slice: &[u8], parts: &[MimePart]) -> MailVaultResult<usize> {
        if slice.is_empty() {
            return Ok(0);
        }
        if parts.is_empty() {
            return Err(raise_error!(
                "write before the scanner produced a tree".into(),
                ErrorCode::InternalError
            ));
        }
        if self.mail_id.is_none() {
            return Err(raise_error!(
                "write without an open message".into(),
                ErrorCode::InternalError
            ));
        }
        let slice_offset = self.message_pos;
        let mut local = 0usize;
        if self.message_pos == 0 {
            self.buffer.current_part(&parts[0]);
        }
        for i in self.next_part..parts.len() {
            let part = &parts[i];
            // part-boundary split: everything before this part belongs
            // to the previous one
            if part.starting_pos > 0 && part.starting_pos >= self.message_pos {
                let cut = (part.starting_pos - slice_offset) as usize;
                if cut > local {
                    self.size += self.buffer.write(&slice[local..cut]).await? as u64;
                    local = cut;
                }
                self.buffer.flush().await?;
                self.message_pos = part.starting_pos;
                self.buffer.current_part(part);
            }
            // header split: headers and body go to separate chunks
            if part.starting_pos_body > 0 && part.starting_pos_body >= self.message_pos {
                let cut = (part.starting_pos_body - slice_offset) as usize;
                if cut > local {
                    self.size += self.buffer.write(&slice[local..cut]).await? as u64;
                    local = cut;
                }
                self.buffer.flush().await?;
                self.message_pos = part.starting_pos_body;
                self.buffer.current_part(part);
            }
            if i == parts.len() - 1 && local < slice.len() {
                self.size += self.buffer.write(&slice[local..]).await? as u64;
                local = slice.len();
            }
        }
        self.message_pos = slice_offset + slice.len() as u64;
        self.next_part = self.next_part.max(parts.len().saturating_sub(2));
        Ok(slice.len())
    }

    /// Flush the tail chunk and seal the message. A failed flush leaves
    /// the row unfinalized, which is exactly what the sweeper collects.
    pub async fn close(&mut self, subject: &str, err: &str) -> MailVaultResult<u64> {
        let mail_id = self.mail_id.take().ok_or_else(|| {
            raise_error!("close without an open message".into(), ErrorCode::InternalError)
        })?;
        self.buffer.flush().await?;
        let mut info = self.buffer.take_parts_info();
        info.err = err.to_string();
        self.storage
            .close_message(
                mail_id,
                self.size,
                &info,
                subject,
                &self.envelope.queued_id,
                &self.envelope.to,
                &self.envelope.from,
            )
            .await?;
        debug!(
            "message {} sealed, {} bytes in {} parts",
            mail_id, self.size, info.count
        );
        Ok(mail_id)
    }
}
