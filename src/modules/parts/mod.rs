// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::hash::HashKey;
use crate::raise_error;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Compression level for the persisted metadata envelope.
const ENVELOPE_COMPRESS_LEVEL: u32 = 9;

/// One MIME part as stored: the ordered chunk list plus the content
/// metadata extracted from the part's headers. Field names follow the
/// compact on-disk JSON form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkedPart {
    /// Dotted path identifier; root is "1", children "1.1", "1.2", …
    #[serde(rename = "i")]
    pub part_id: String,
    /// Total bytes written through the chunking buffer for this part.
    #[serde(rename = "s")]
    pub size: u64,
    /// Concatenation order is reconstruction order.
    #[serde(rename = "h")]
    pub chunk_hashes: Vec<HashKey>,
    #[serde(rename = "t")]
    pub content_type: String,
    #[serde(rename = "c")]
    pub charset: String,
    #[serde(rename = "e")]
    pub transfer_encoding: String,
    #[serde(rename = "d")]
    pub content_disposition: String,
    /// Attachment file name, absent for unnamed parts.
    #[serde(rename = "n", default, skip_serializing_if = "String::is_empty")]
    pub content_name: String,
    /// Index into the message's boundary table.
    #[serde(rename = "cb")]
    pub content_boundary_index: i32,
}

/// Per-message manifest linking parts to chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartsInfo {
    #[serde(rename = "c")]
    pub count: u32,
    /// Index of the first text/plain part, -1 if absent.
    #[serde(rename = "tp")]
    pub text_part: i32,
    /// Index of the first text/html part, -1 if absent.
    #[serde(rename = "hp")]
    pub html_part: i32,
    #[serde(rename = "a")]
    pub has_attach: bool,
    #[serde(rename = "p")]
    pub parts: Vec<ChunkedPart>,
    /// De-duped boundary string table referenced by parts.
    #[serde(rename = "cbl")]
    pub boundaries: Vec<String>,
    /// Parse-error indicator, empty when the scan was clean.
    #[serde(rename = "e")]
    pub err: String,
}

impl Default for PartsInfo {
    fn default() -> Self {
        PartsInfo {
            count: 0,
            text_part: -1,
            html_part: -1,
            has_attach: false,
            parts: Vec::new(),
            boundaries: Vec::new(),
            err: String::new(),
        }
    }
}

impl PartsInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a boundary string, returning its table index.
    pub fn intern_boundary(&mut self, boundary: &str) -> i32 {
        if let Some(idx) = self.boundaries.iter().position(|b| b == boundary) {
            return idx as i32;
        }
        self.boundaries.push(boundary.to_string());
        (self.boundaries.len() - 1) as i32
    }

    /// Serialize to the persisted blob: compact JSON, zlib level 9.
    pub fn to_blob(&self) -> MailVaultResult<Vec<u8>> {
        let json = serde_json::to_vec(self)
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
        let mut encoder = ZlibEncoder::new(
            Vec::with_capacity(json.len() / 2),
            Compression::new(ENVELOPE_COMPRESS_LEVEL),
        );
        encoder
            .write_all(&json)
            .and_then(|_| encoder.finish())
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))
    }

    pub fn from_blob(blob: &[u8]) -> MailVaultResult<Self> {
        let mut decoder = ZlibDecoder::new(blob);
        let mut json = Vec::new();
        decoder
            .read_to_end(&mut json)
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
        serde_json::from_slice(&json)
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PartsInfo {
        let mut info = PartsInfo::new();
        let boundary = info.intern_boundary("D7F------------D7FD5A0B8AB9C65CCDBFA872");
        info.parts.push(ChunkedPart {
            part_id: "1".into(),
            size: 412,
            chunk_hashes: vec![HashKey::digest(b"headers"), HashKey::digest(b"body")],
            content_type: "multipart/mixed".into(),
            charset: "US-ASCII".into(),
            transfer_encoding: String::new(),
            content_disposition: String::new(),
            content_name: String::new(),
            content_boundary_index: boundary,
        });
        info.count = 1;
        info
    }

    #[test]
    fn intern_deduplicates() {
        let mut info = PartsInfo::new();
        let a = info.intern_boundary("alpha");
        let b = info.intern_boundary("beta");
        assert_eq!(info.intern_boundary("alpha"), a);
        assert_eq!(info.intern_boundary("beta"), b);
        assert_eq!(info.boundaries.len(), 2);
    }

    #[test]
    fn short_field_names() {
        let info = sample();
        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("c").is_some());
        assert!(json.get("tp").is_some());
        assert!(json.get("cbl").is_some());
        let part = &json["p"][0];
        assert_eq!(part["i"], "1");
        assert_eq!(part["s"], 412);
        assert_eq!(part["cb"], 0);
        // unnamed parts omit the name field entirely
        assert!(part.get("n").is_none());
    }

    #[test]
    fn blob_round_trip() {
        let info = sample();
        let blob = info.to_blob().unwrap();
        // zlib header byte for deflate with 32k window
        assert_eq!(blob[0], 0x78);
        let back = PartsInfo::from_blob(&blob).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn rollup_defaults() {
        let info = PartsInfo::new();
        assert_eq!(info.text_part, -1);
        assert_eq!(info.html_part, -1);
        assert!(!info.has_attach);
    }
}
