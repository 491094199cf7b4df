// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::{base64_decode_raw, base64_encode_raw, raise_error};
use md5::{Digest, Md5};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Number of bytes in a content hash.
pub const HASH_KEY_LEN: usize = 16;

/// 128-bit content address of a chunk.
///
/// Equality and map lookup cover the full 16 bytes. The canonical
/// textual form is base64 without padding; a lowercase hex form is
/// available for logs and tooling. MD5 here is a content-addressing
/// hash, not a security primitive.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashKey([u8; HASH_KEY_LEN]);

impl HashKey {
    pub fn new(bytes: [u8; HASH_KEY_LEN]) -> Self {
        HashKey(bytes)
    }

    /// Hash a byte sequence into its content address.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(data);
        HashKey(hasher.finalize().into())
    }

    pub fn from_slice(bytes: &[u8]) -> MailVaultResult<Self> {
        let arr: [u8; HASH_KEY_LEN] = bytes.try_into().map_err(|_| {
            raise_error!(
                format!("hash length {} is not {}", bytes.len(), HASH_KEY_LEN),
                ErrorCode::BadHash
            )
        })?;
        Ok(HashKey(arr))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_KEY_LEN] {
        &self.0
    }

    /// Canonical metadata form: base64 without padding.
    pub fn to_base64(&self) -> String {
        base64_encode_raw!(self.0)
    }

    pub fn from_base64(encoded: &str) -> MailVaultResult<Self> {
        let bytes = base64_decode_raw!(encoded).map_err(|e| {
            raise_error!(
                format!("invalid base64 hash {:?}: {}", encoded, e),
                ErrorCode::BadHash
            )
        })?;
        Self::from_slice(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl AsRef<[u8]> for HashKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashKey({})", self.to_hex())
    }
}

impl Serialize for HashKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

struct HashKeyVisitor;

impl Visitor<'_> for HashKeyVisitor {
    type Value = HashKey;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a raw base64 string of 16 bytes")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<HashKey, E> {
        HashKey::from_base64(value).map_err(|e| E::custom(e.to_string()))
    }
}

impl<'de> Deserialize<'de> for HashKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(HashKeyVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: [u8; 16] = [
        0xDE, 0x17, 0x03, 0x80, 0x01, 0x17, 0x03, 0x80, 0x01, 0x17, 0x03, 0xFF, 0x01, 0x17, 0x03,
        0x80,
    ];

    #[test]
    fn base64_canonical_form() {
        let key = HashKey::new(SAMPLE);
        assert_eq!(key.to_base64(), "3hcDgAEXA4ABFwP/ARcDgA");
        let back = HashKey::from_base64("3hcDgAEXA4ABFwP/ARcDgA").unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn json_round_trip() {
        let key = HashKey::new(SAMPLE);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"3hcDgAEXA4ABFwP/ARcDgA\"");
        let back: HashKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn digest_is_deterministic() {
        let a = HashKey::digest(b"From: al@gore.example\n\nbody");
        let b = HashKey::digest(b"From: al@gore.example\n\nbody");
        assert_eq!(a, b);
        assert_ne!(a, HashKey::digest(b"From: al@gore.example\n\nbody."));
    }

    #[test]
    fn bad_lengths_rejected() {
        assert!(HashKey::from_slice(&[0u8; 15]).is_err());
        assert!(HashKey::from_slice(&[0u8; 17]).is_err());
        assert!(HashKey::from_base64("AAAA").is_err());
    }

    #[test]
    fn hex_form() {
        let key = HashKey::new(SAMPLE);
        assert_eq!(key.to_hex(), "de17038001170380011703ff01170380");
    }
}
