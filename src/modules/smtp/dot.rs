// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::MailVaultResult;
use crate::modules::scanner::{MimePart, MimeScanner};

/// Adapts an SMTP DATA stream to the MIME scanner.
///
/// Each input slice is un-stuffed (a '.' opening a line is dropped),
/// CR-normalized (the storage stream carries no CR bytes) and checked
/// for the lone-dot terminator. The transformed bytes are run through
/// the scanner before the caller sees them, so by the time the
/// chunk-saver reads the tree, every offset it needs is in place.
pub struct MimeDotReader {
    scanner: MimeScanner,
    at_line_start: bool,
    /// A '.' opened the current line; the next byte decides whether it
    /// was stuffing or the terminator.
    pending_dot: bool,
    done: bool,
}

impl Default for MimeDotReader {
    fn default() -> Self {
        Self::new(MimeScanner::new())
    }
}

impl MimeDotReader {
    pub fn new(scanner: MimeScanner) -> Self {
        MimeDotReader {
            scanner,
            at_line_start: true,
            pending_dot: false,
            done: false,
        }
    }

    /// Reset for the next message.
    pub fn open(&mut self) {
        self.scanner.open();
        self.at_line_start = true;
        self.pending_dot = false;
        self.done = false;
    }

    pub fn scanner(&self) -> &MimeScanner {
        &self.scanner
    }

    pub fn parts(&self) -> &[MimePart] {
        self.scanner.parts()
    }

    /// True once the terminating dot line was consumed.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Transform one slice, appending the clean bytes to `out`, and
    /// scan them. Returns true when the terminator was reached; input
    /// past the terminator is ignored.
    pub fn process(&mut self, input: &[u8], out: &mut Vec<u8>) -> MailVaultResult<bool> {
        let emitted_from = out.len();
        for &b in input {
            if self.done {
                break;
            }
            if b == b'\r' {
                continue;
            }
            if self.pending_dot {
                self.pending_dot = false;
                if b == b'\n' {
                    // lone dot: end of DATA
                    self.done = true;
                    break;
                }
                // stuffing: the leading dot is dropped, the rest stays
                out.push(b);
                self.at_line_start = b == b'\n';
                continue;
            }
            if self.at_line_start && b == b'.' {
                self.pending_dot = true;
                continue;
            }
            out.push(b);
            self.at_line_start = b == b'\n';
        }
        if out.len() > emitted_from {
            self.scanner.parse(&out[emitted_from..])?;
        }
        Ok(self.done)
    }

    /// Deliver end-of-input to the scanner and return its terminal
    /// status.
    pub fn close(&mut self) -> MailVaultResult<()> {
        self.scanner.close()
    }
}
