// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::hash::HashKey;
use crate::modules::parts::PartsInfo;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

pub mod pool;

/// Session protocol the message arrived over. The E prefix means EHLO
/// was used, the S suffix means TLS was negotiated.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum Protocol {
    Smtp,
    Smtps,
    Esmtp,
    Esmtps,
    Lmtp,
    Lmtps,
    #[default]
    Unknown,
}

impl Protocol {
    pub fn derive(lmtp: bool, ehlo: bool, tls: bool) -> Self {
        match (lmtp, ehlo, tls) {
            (true, _, false) => Protocol::Lmtp,
            (true, _, true) => Protocol::Lmtps,
            (false, false, false) => Protocol::Smtp,
            (false, false, true) => Protocol::Smtps,
            (false, true, false) => Protocol::Esmtp,
            (false, true, true) => Protocol::Esmtps,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Smtp => "SMTP",
            Protocol::Smtps => "SMTPS",
            Protocol::Esmtp => "ESMTP",
            Protocol::Esmtps => "ESMTPS",
            Protocol::Lmtp => "LMTP",
            Protocol::Lmtps => "LMTPS",
            Protocol::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

impl FromStr for Protocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "SMTP" => Protocol::Smtp,
            "SMTPS" => Protocol::Smtps,
            "ESMTP" => Protocol::Esmtp,
            "ESMTPS" => Protocol::Esmtps,
            "LMTP" => Protocol::Lmtp,
            "LMTPS" => Protocol::Lmtps,
            _ => Protocol::Unknown,
        })
    }
}

/// Declared body transport of the message stream.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum Transport {
    SevenBit,
    EightBit,
    #[default]
    Unknown,
    Invalid,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transport::SevenBit => "7bit",
            Transport::EightBit => "8bit",
            Transport::Unknown => "unknown",
            Transport::Invalid => "invalid",
        };
        f.write_str(name)
    }
}

impl FromStr for Transport {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "7bit" => Transport::SevenBit,
            "8bit" => Transport::EightBit,
            "invalid" => Transport::Invalid,
            _ => Transport::Unknown,
        })
    }
}

/// Identity of an in-flight message, captured from the SMTP session
/// before any DATA bytes arrive. Reusable through the envelope pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    pub helo: String,
    pub recipient: String,
    pub return_path: String,
    pub subject: String,
    /// 128-bit id assigned when the message was queued.
    pub queued_id: HashKey,
    pub remote_ip: Option<IpAddr>,
    pub protocol: Protocol,
    pub transport: Transport,
}

impl Envelope {
    /// Clear session-specific fields so the allocation can be reused
    /// for the next message.
    pub fn reset(&mut self) {
        self.from.clear();
        self.to.clear();
        self.helo.clear();
        self.recipient.clear();
        self.return_path.clear();
        self.subject.clear();
        self.queued_id = HashKey::new([0u8; 16]);
        self.remote_ip = None;
        self.protocol = Protocol::Unknown;
        self.transport = Transport::Unknown;
    }
}

/// Persisted per-message header envelope, stored alongside PartsInfo.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Email {
    /// Monotonic id assigned at open_message.
    pub mail_id: u64,
    pub created_at: i64,
    /// Total stream bytes written to chunks.
    pub size: u64,
    pub from: String,
    pub to: String,
    pub helo: String,
    pub recipient: String,
    pub return_path: String,
    pub subject: String,
    pub queued_id: HashKey,
    pub remote_ip: Option<IpAddr>,
    pub protocol: Protocol,
    pub transport: Transport,
    pub parts_info: Option<PartsInfo>,
    /// Set by close_message; unfinalized rows are sweeper fodder.
    pub finalized: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_derivation() {
        assert_eq!(Protocol::derive(false, false, false), Protocol::Smtp);
        assert_eq!(Protocol::derive(false, true, false), Protocol::Esmtp);
        assert_eq!(Protocol::derive(false, true, true), Protocol::Esmtps);
        assert_eq!(Protocol::derive(false, false, true), Protocol::Smtps);
        assert_eq!(Protocol::derive(true, false, false), Protocol::Lmtp);
        assert_eq!(Protocol::derive(true, true, true), Protocol::Lmtps);
    }

    #[test]
    fn enum_text_round_trip() {
        for p in [
            Protocol::Smtp,
            Protocol::Smtps,
            Protocol::Esmtp,
            Protocol::Esmtps,
            Protocol::Lmtp,
            Protocol::Lmtps,
        ] {
            assert_eq!(p.to_string().parse::<Protocol>().unwrap(), p);
        }
        for t in [Transport::SevenBit, Transport::EightBit, Transport::Invalid] {
            assert_eq!(t.to_string().parse::<Transport>().unwrap(), t);
        }
        assert_eq!("bogus".parse::<Protocol>().unwrap(), Protocol::Unknown);
        assert_eq!("base64".parse::<Transport>().unwrap(), Transport::Unknown);
    }

    #[test]
    fn envelope_reset_clears_identity() {
        let mut envelope = Envelope {
            from: "al@gore.example".into(),
            to: "bill@clinton.example".into(),
            helo: "mail.gore.example".into(),
            queued_id: HashKey::digest(b"queued"),
            protocol: Protocol::Esmtps,
            ..Default::default()
        };
        envelope.reset();
        assert!(envelope.from.is_empty());
        assert!(envelope.helo.is_empty());
        assert_eq!(envelope.queued_id, HashKey::new([0u8; 16]));
        assert_eq!(envelope.protocol, Protocol::Unknown);
    }
}
