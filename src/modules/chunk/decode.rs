// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::chunk::reader::ChunkedReader;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::get_encoding;
use crate::raise_error;
use encoding_rs::{Decoder as CharsetDecoder, UTF_8};

/// Where the decoder is in the stored part stream.
///
/// A stored part starts with its header block; the payload begins
/// after the "\n\n" that closes it. DecodeSetup is traversed the
/// moment the blank line is found: the transfer decoder and, when the
/// declared charset is not UTF-8, a charset converter are stacked on
/// the chunk reader, and every further read delegates to that chain.
#[derive(Debug, Clone, Copy, PartialEq)]
enum DecodeState {
    /// Scanning for "\n\n" within the current buffer.
    FindHeader,
    /// The previous buffer ended in '\n'; one more decides the match.
    MatchNl,
    /// Steady state: delegate to the decoder chain.
    Decode,
}

enum Transfer {
    Identity,
    Base64 { quantum: u32, count: u8 },
    QuotedPrintable { state: QpState, hex1: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum QpState {
    Text,
    Eq,
    Hex1,
}

/// Streams one stored part through header skip, transfer decoding and
/// charset conversion.
pub struct PartDecoder {
    reader: ChunkedReader,
    state: DecodeState,
    transfer_encoding: String,
    charset_label: String,
    boundary: String,
    transfer: Transfer,
    trim: Option<BoundaryTrim>,
    charset: Option<CharsetDecoder>,
    out_buf: Vec<u8>,
    out_pos: usize,
    finished: bool,
}

impl PartDecoder {
    /// Wrap a reader positioned on the 1-based n-th part.
    pub fn new(reader: ChunkedReader, n: usize) -> MailVaultResult<Self> {
        let meta = reader.part_meta(n).ok_or_else(|| {
            raise_error!(format!("part {} not present", n), ErrorCode::InvalidParameter)
        })?;
        let boundary = usize::try_from(meta.content_boundary_index)
            .ok()
            .and_then(|i| reader.parts_info().boundaries.get(i).cloned())
            .unwrap_or_default();
        Ok(PartDecoder {
            transfer_encoding: meta.transfer_encoding.to_ascii_lowercase(),
            charset_label: meta.charset.clone(),
            boundary,
            reader,
            state: DecodeState::FindHeader,
            transfer: Transfer::Identity,
            trim: None,
            charset: None,
            out_buf: Vec::new(),
            out_pos: 0,
            finished: false,
        })
    }

    pub async fn read(&mut self, out: &mut [u8]) -> MailVaultResult<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            if self.out_pos < self.out_buf.len() {
                let n = out.len().min(self.out_buf.len() - self.out_pos);
                out[..n].copy_from_slice(&self.out_buf[self.out_pos..self.out_pos + n]);
                self.out_pos += n;
                return Ok(n);
            }
            if self.finished {
                return Ok(0);
            }
            self.out_buf.clear();
            self.out_pos = 0;
            self.fill().await?;
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

    async fn fill(&mut self) -> MailVaultResult<()> {
        let mut buf = [0u8; 8192];
        let n = self.reader.read(&mut buf).await?;
        if n == 0 {
            if self.state == DecodeState::Decode {
                self.finalize_chain();
            }
            self.finished = true;
            return Ok(());
        }
        let data = &buf[..n];
        match self.state {
            DecodeState::FindHeader => self.scan_header(data),
            DecodeState::MatchNl => {
                if data[0] == b'\n' {
                    self.enter_decode();
                    self.decode_input(&data[1..]);
                } else {
                    self.scan_header(data)
                }
            }
            DecodeState::Decode => self.decode_input(data),
        }
        Ok(())
    }

    fn scan_header(&mut self, data: &[u8]) {
        if let Some(i) = data.windows(2).position(|w| w == b"\n\n") {
            self.enter_decode();
            self.decode_input(&data[i + 2..]);
        } else if data.last() == Some(&b'\n') {
            self.state = DecodeState::MatchNl;
        } else {
            self.state = DecodeState::FindHeader;
        }
    }

    /// DecodeSetup: stack the decoder chain for this part.
    fn enter_decode(&mut self) {
        self.transfer = match self.transfer_encoding.as_str() {
            "base64" => Transfer::Base64 {
                quantum: 0,
                count: 0,
            },
            "quoted-printable" => Transfer::QuotedPrintable {
                state: QpState::Text,
                hex1: 0,
            },
            _ => Transfer::Identity,
        };
        self.trim = match self.transfer {
            Transfer::Identity => None,
            _ if self.boundary.is_empty() => None,
            _ => Some(BoundaryTrim::new(&self.boundary)),
        };
        self.charset = if self.charset_label.is_empty() {
            None
        } else {
            match get_encoding!(self.charset_label) {
                Some(encoding) if encoding != UTF_8 => Some(encoding.new_decoder()),
                _ => None,
            }
        };
        self.state = DecodeState::Decode;
    }

    fn decode_input(&mut self, data: &[u8]) {
        let mut raw = Vec::with_capacity(data.len());
        match &mut self.trim {
            Some(trim) => {
                for &b in data {
                    trim.push(b, &mut raw);
                }
            }
            None => raw.extend_from_slice(data),
        }
        let mut decoded = Vec::with_capacity(raw.len());
        for &b in &raw {
            self.transfer.push(b, &mut decoded);
        }
        self.emit(&decoded, false);
    }

    fn finalize_chain(&mut self) {
        let mut raw = Vec::new();
        if let Some(trim) = &mut self.trim {
            trim.finish(&mut raw);
        }
        let mut decoded = Vec::new();
        for &b in &raw {
            self.transfer.push(b, &mut decoded);
        }
        self.transfer.finish(&mut decoded);
        self.emit(&decoded, true);
    }

    fn emit(&mut self, decoded: &[u8], last: bool) {
        match &mut self.charset {
            Some(decoder) => {
                let mut src = decoded;
                let mut dst = [0u8; 4096];
                loop {
                    let (result, read, written, _) = decoder.decode_to_utf8(src, &mut dst, last);
                    self.out_buf.extend_from_slice(&dst[..written]);
                    src = &src[read..];
                    if src.is_empty() && matches!(result, encoding_rs::CoderResult::InputEmpty) {
                        break;
                    }
                }
            }
            None => self.out_buf.extend_from_slice(decoded),
        }
    }
}

impl Transfer {
    fn push(&mut self, b: u8, out: &mut Vec<u8>) {
        match self {
            Transfer::Identity => out.push(b),
            Transfer::Base64 { quantum, count } => {
                if let Some(val) = decode64(b) {
                    *quantum = (*quantum << 6) | val as u32;
                    *count += 1;
                    if *count == 4 {
                        out.push((*quantum >> 16) as u8);
                        out.push((*quantum >> 8) as u8);
                        out.push(*quantum as u8);
                        *quantum = 0;
                        *count = 0;
                    }
                } else if b == b'=' {
                    match *count {
                        2 => out.push((*quantum >> 4) as u8),
                        3 => {
                            out.push((*quantum >> 10) as u8);
                            out.push((*quantum >> 2) as u8);
                        }
                        _ => {}
                    }
                    *quantum = 0;
                    *count = 0;
                }
                // anything else, including line breaks, is skipped
            }
            Transfer::QuotedPrintable { state, hex1 } => match *state {
                QpState::Text => {
                    if b == b'=' {
                        *state = QpState::Eq;
                    } else {
                        out.push(b);
                    }
                }
                QpState::Eq => {
                    if b == b'\n' {
                        // soft line break
                        *state = QpState::Text;
                    } else if let Some(h) = hex_val(b) {
                        *hex1 = h;
                        *state = QpState::Hex1;
                    } else {
                        out.push(b'=');
                        out.push(b);
                        *state = QpState::Text;
                    }
                }
                QpState::Hex1 => {
                    if let Some(h) = hex_val(b) {
                        out.push((*hex1 << 4) | h);
                    } else {
                        out.push(b'=');
                        out.push(hex_char(*hex1));
                        out.push(b);
                    }
                    *state = QpState::Text;
                }
            },
        }
    }

    fn finish(&mut self, out: &mut Vec<u8>) {
        match self {
            Transfer::Identity => {}
            Transfer::Base64 { quantum, count } => {
                // unpadded tail
                match *count {
                    2 => out.push((*quantum >> 4) as u8),
                    3 => {
                        out.push((*quantum >> 10) as u8);
                        out.push((*quantum >> 2) as u8);
                    }
                    _ => {}
                }
                *quantum = 0;
                *count = 0;
            }
            Transfer::QuotedPrintable { state, hex1 } => {
                match *state {
                    QpState::Eq => out.push(b'='),
                    QpState::Hex1 => {
                        out.push(b'=');
                        out.push(hex_char(*hex1));
                    }
                    QpState::Text => {}
                }
                *state = QpState::Text;
            }
        }
    }
}

fn decode64(b: u8) -> Option<u8> {
    match b {
        b'A'..=b'Z' => Some(b - b'A'),
        b'a'..=b'z' => Some(b - b'a' + 26),
        b'0'..=b'9' => Some(b - b'0' + 52),
        b'+' => Some(62),
        b'/' => Some(63),
        _ => None,
    }
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'A'..=b'F' => Some(b - b'A' + 10),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}

fn hex_char(v: u8) -> u8 {
    match v {
        0..=9 => b'0' + v,
        _ => b'A' + v - 10,
    }
}

/// Drops the enclosing boundary line and everything after it from a
/// part's byte stream, holding partial matches across pushes. The held
/// bytes always equal a needle prefix, so a mismatch replays the
/// prefix instead of buffering.
struct BoundaryTrim {
    needle: Vec<u8>,
    match_len: usize,
    /// The initial match position is a pretend LF so a boundary at the
    /// very start of the payload is caught; it must never be replayed.
    virtual_lf: bool,
    terminated: bool,
}

impl BoundaryTrim {
    fn new(boundary: &str) -> Self {
        let mut needle = Vec::with_capacity(boundary.len() + 3);
        needle.extend_from_slice(b"\n--");
        needle.extend_from_slice(boundary.as_bytes());
        BoundaryTrim {
            needle,
            match_len: 1,
            virtual_lf: true,
            terminated: false,
        }
    }

    fn push(&mut self, b: u8, out: &mut Vec<u8>) {
        if self.terminated {
            return;
        }
        if self.match_len < self.needle.len() && b == self.needle[self.match_len] {
            self.match_len += 1;
            if self.match_len == self.needle.len() {
                self.terminated = true;
            }
            return;
        }
        self.replay(out);
        if b == b'\n' {
            self.match_len = 1;
        } else {
            out.push(b);
        }
    }

    fn finish(&mut self, out: &mut Vec<u8>) {
        if !self.terminated {
            self.replay(out);
        }
    }

    fn replay(&mut self, out: &mut Vec<u8>) {
        if self.match_len > 0 {
            let from = usize::from(self.virtual_lf);
            out.extend_from_slice(&self.needle[from..self.match_len]);
        }
        self.match_len = 0;
        self.virtual_lf = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base64_decode_all(input: &[u8]) -> Vec<u8> {
        let mut transfer = Transfer::Base64 {
            quantum: 0,
            count: 0,
        };
        let mut out = Vec::new();
        for &b in input {
            transfer.push(b, &mut out);
        }
        transfer.finish(&mut out);
        out
    }

    fn qp_decode_all(input: &[u8]) -> Vec<u8> {
        let mut transfer = Transfer::QuotedPrintable {
            state: QpState::Text,
            hex1: 0,
        };
        let mut out = Vec::new();
        for &b in input {
            transfer.push(b, &mut out);
        }
        transfer.finish(&mut out);
        out
    }

    #[test]
    fn base64_basic() {
        for (encoded, expected) in [
            ("VGVzdA==", "Test"),
            ("WWU=", "Ye"),
            ("QQ==", "A"),
            (
                "QXJlIHlvdSBhIFNoaW1hbm8gb3IgQ2FtcGFnbm9sbyBwZXJzb24/",
                "Are you a Shimano or Campagnolo person?",
            ),
            ("d2l0aApuZXdsaW5lcw==", "with\nnewlines"),
        ] {
            assert_eq!(
                base64_decode_all(encoded.as_bytes()),
                expected.as_bytes(),
                "failed for {:?}",
                encoded
            );
        }
    }

    #[test]
    fn base64_ignores_line_structure() {
        let folded = "R0lG\nODlh\n IA Ag\nAPAA\n";
        let joined = "R0lGODlhIAAgAPAA";
        assert_eq!(
            base64_decode_all(folded.as_bytes()),
            base64_decode_all(joined.as_bytes())
        );
    }

    #[test]
    fn base64_unpadded_tail() {
        assert_eq!(base64_decode_all(b"WWU"), b"Ye");
        assert_eq!(base64_decode_all(b"QQ"), b"A");
    }

    #[test]
    fn gif_magic_survives() {
        let decoded = base64_decode_all(b"R0lGODlhIAAgAPAAAP8AAAAAACwAAAAAIAAgAAAC");
        assert!(decoded.starts_with(b"GIF89a"));
    }

    #[test]
    fn quoted_printable_basic() {
        for (encoded, expected) in [
            ("hello=20world", "hello world"),
            ("caf=C3=A9", "café"),
            ("soft=\nbreak", "softbreak"),
            ("plain text\nwith lines\n", "plain text\nwith lines\n"),
            ("equals =3D sign", "equals = sign"),
        ] {
            assert_eq!(
                qp_decode_all(encoded.as_bytes()),
                expected.as_bytes(),
                "failed for {:?}",
                encoded
            );
        }
    }

    #[test]
    fn quoted_printable_invalid_escape_passes_through() {
        assert_eq!(qp_decode_all(b"=ZZ"), b"=ZZ");
        assert_eq!(qp_decode_all(b"=A"), b"=A");
        assert_eq!(qp_decode_all(b"="), b"=");
    }

    #[test]
    fn boundary_trim_drops_terminator() {
        let mut trim = BoundaryTrim::new("DC8");
        let mut out = Vec::new();
        for &b in b"QUJD\nREVG\n--DC8--\ntrailing garbage".iter() {
            trim.push(b, &mut out);
        }
        trim.finish(&mut out);
        assert_eq!(out, b"QUJD\nREVG");
    }

    #[test]
    fn boundary_trim_at_payload_start() {
        let mut trim = BoundaryTrim::new("xy");
        let mut out = Vec::new();
        for &b in b"--xy\nrest".iter() {
            trim.push(b, &mut out);
        }
        trim.finish(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn boundary_trim_replays_near_misses() {
        let mut trim = BoundaryTrim::new("real");
        let mut out = Vec::new();
        for &b in b"a\n--reel\n--real".iter() {
            trim.push(b, &mut out);
        }
        trim.finish(&mut out);
        assert_eq!(out, b"a\n--reel");
    }
}
