// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::chunk::saver::ChunkSaver;
use crate::modules::envelope::Envelope;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::scanner::MimePart;
use crate::modules::smtp::dot::MimeDotReader;
use crate::modules::storage::Storage;
use std::sync::Arc;
use tracing::debug;

/// One in-flight message: dot-reader, scanner and chunk-saver wired
/// together. Feed raw DATA slices with [`write`]; [`close`] seals the
/// message and returns its id.
///
/// A fatal scan or storage error aborts the message and leaves its
/// unfinalized row to the sweeper; soft scan outcomes (not MIME, node
/// budget, early EOF) still store the tree built so far.
pub struct ChunkStream {
    reader: MimeDotReader,
    saver: ChunkSaver,
    envelope: Envelope,
    clean: Vec<u8>,
}

impl ChunkStream {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        ChunkStream {
            reader: MimeDotReader::default(),
            saver: ChunkSaver::new(storage),
            envelope: Envelope::default(),
            clean: Vec::new(),
        }
    }

    /// Chunk capacity for subsequent messages.
    pub fn cap_to(&mut self, n: usize) {
        self.saver.cap_to(n);
    }

    pub fn mail_id(&self) -> Option<u64> {
        self.saver.mail_id()
    }

    pub fn size(&self) -> u64 {
        self.saver.size()
    }

    /// The tree scanned so far.
    pub fn parts(&self) -> &[MimePart] {
        self.reader.parts()
    }

    pub async fn open(&mut self, envelope: &Envelope) -> MailVaultResult<u64> {
        self.reader.open();
        self.envelope = envelope.clone();
        self.saver.open(envelope).await
    }

    /// Consume one slice of the raw dot-stuffed stream. Returns true
    /// once the terminating dot line was seen.
    pub async fn write(&mut self, slice: &[u8]) -> MailVaultResult<bool> {
        self.clean.clear();
        let done = self.reader.process(slice, &mut self.clean)?;
        if !self.clean.is_empty() {
            self.saver.write(&self.clean, self.reader.parts()).await?;
        }
        Ok(done)
    }

    /// Finish the scan, flush the tail chunk and seal the message.
    pub async fn close(&mut self) -> MailVaultResult<u64> {
        let err_label = match self.reader.close() {
            Ok(()) => String::new(),
            Err(e) if e.is_soft_scan_outcome() => match e.code() {
                // a non-MIME message is stored whole; that is not an error
                ErrorCode::NotMime => String::new(),
                _ => e.to_string(),
            },
            Err(e) => return Err(e),
        };
        let root_subject = self
            .reader
            .parts()
            .first()
            .and_then(|p| p.header("Subject"))
            .unwrap_or_default()
            .to_string();
        let subject = if self.envelope.subject.is_empty() {
            root_subject
        } else {
            self.envelope.subject.clone()
        };
        let mail_id = self.saver.close(&subject, &err_label).await?;
        debug!("stream for message {} closed", mail_id);
        Ok(mail_id)
    }
}
