// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::scanner::MAX_BOUNDARY_LEN;
use crate::raise_error;

/// Parsed `Content-Type` field: `type "/" subtype *(";" parameter)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentTypeField {
    /// Lowercased "type/subtype".
    pub media_type: String,
    /// Upper-cased charset parameter, empty if absent.
    pub charset: String,
    pub boundary: String,
    pub name: String,
}

/// Parse a Content-Type header value. RFC-822 parenthesized comments
/// are accepted anywhere whitespace is and dropped. Parameter values
/// may be tokens or quoted strings. A boundary of MAX_BOUNDARY_LEN or
/// more rejects the message.
pub fn parse_content_type(value: &str) -> MailVaultResult<ContentTypeField> {
    let mut lexer = Lexer {
        bytes: value.as_bytes(),
        pos: 0,
    };

    let media_type = {
        let main = lexer.token()?;
        lexer.expect(b'/')?;
        let sub = lexer.token()?;
        format!("{}/{}", main.to_ascii_lowercase(), sub.to_ascii_lowercase())
    };

    let mut field = ContentTypeField {
        media_type,
        ..Default::default()
    };

    while lexer.skip_to_semicolon()? {
        // trailing ";" with nothing after it is tolerated
        lexer.skip_ws()?;
        if lexer.at_end() {
            break;
        }
        let name = lexer.token()?.to_ascii_lowercase();
        lexer.expect(b'=')?;
        let value = lexer.value()?;
        match name.as_str() {
            "charset" => field.charset = value.to_ascii_uppercase(),
            "boundary" => {
                if value.len() >= MAX_BOUNDARY_LEN {
                    return Err(raise_error!(
                        format!("boundary length {} exceeds limit", value.len()),
                        ErrorCode::ScannerSyntax
                    ));
                }
                field.boundary = value;
            }
            "name" => field.name = value,
            _ => {}
        }
    }

    Ok(field)
}

struct Lexer<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Lexer<'_> {
    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Skip whitespace and RFC-822 comments, which may nest.
    fn skip_ws(&mut self) -> MailVaultResult<()> {
        while let Some(&b) = self.bytes.get(self.pos) {
            match b {
                b' ' | b'\t' | b'\r' | b'\n' => self.pos += 1,
                b'(' => {
                    let mut depth = 0usize;
                    loop {
                        let Some(&c) = self.bytes.get(self.pos) else {
                            return Err(raise_error!(
                                "unterminated comment in Content-Type".into(),
                                ErrorCode::InvalidParameter
                            ));
                        };
                        self.pos += 1;
                        match c {
                            b'(' => depth += 1,
                            b')' => {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                            b'\\' => {
                                // quoted-pair inside a comment
                                if self.pos < self.bytes.len() {
                                    self.pos += 1;
                                }
                            }
                            _ => {}
                        }
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn token(&mut self) -> MailVaultResult<String> {
        self.skip_ws()?;
        let start = self.pos;
        while let Some(&b) = self.bytes.get(self.pos) {
            if is_token_char(b) {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(raise_error!(
                format!("expected token at offset {} in Content-Type", start),
                ErrorCode::InvalidParameter
            ));
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    fn expect(&mut self, expected: u8) -> MailVaultResult<()> {
        self.skip_ws()?;
        if self.bytes.get(self.pos) == Some(&expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(raise_error!(
                format!("expected {:?} in Content-Type", expected as char),
                ErrorCode::InvalidParameter
            ))
        }
    }

    /// Advance to just past the next ";". Returns false at end of input.
    fn skip_to_semicolon(&mut self) -> MailVaultResult<bool> {
        self.skip_ws()?;
        match self.bytes.get(self.pos) {
            Some(b';') => {
                self.pos += 1;
                Ok(true)
            }
            None => Ok(false),
            Some(&b) => Err(raise_error!(
                format!("unexpected {:?} in Content-Type", b as char),
                ErrorCode::InvalidParameter
            )),
        }
    }

    /// Parameter value: token or quoted-string.
    fn value(&mut self) -> MailVaultResult<String> {
        self.skip_ws()?;
        if self.bytes.get(self.pos) == Some(&b'"') {
            self.pos += 1;
            let mut out = String::new();
            loop {
                let Some(&b) = self.bytes.get(self.pos) else {
                    return Err(raise_error!(
                        "unterminated quoted-string in Content-Type".into(),
                        ErrorCode::InvalidParameter
                    ));
                };
                self.pos += 1;
                match b {
                    b'"' => break,
                    b'\\' => {
                        if let Some(&c) = self.bytes.get(self.pos) {
                            self.pos += 1;
                            out.push(c as char);
                        }
                    }
                    _ => out.push(b as char),
                }
            }
            Ok(out)
        } else {
            self.token()
        }
    }
}

fn is_token_char(b: u8) -> bool {
    matches!(b, 33..=126)
        && !matches!(
            b,
            b'(' | b')'
                | b'<'
                | b'>'
                | b'@'
                | b','
                | b';'
                | b':'
                | b'\\'
                | b'"'
                | b'/'
                | b'['
                | b']'
                | b'?'
                | b'='
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_media_type() {
        let ct = parse_content_type("text/plain").unwrap();
        assert_eq!(ct.media_type, "text/plain");
        assert!(ct.charset.is_empty());
    }

    #[test]
    fn charset_upper_cased() {
        let ct = parse_content_type("text/plain; charset=us-ascii").unwrap();
        assert_eq!(ct.charset, "US-ASCII");
    }

    #[test]
    fn quoted_boundary() {
        let ct = parse_content_type(
            "multipart/mixed; boundary=\"D7F------------D7FD5A0B8AB9C65CCDBFA872\"",
        )
        .unwrap();
        assert_eq!(ct.media_type, "multipart/mixed");
        assert_eq!(ct.boundary, "D7F------------D7FD5A0B8AB9C65CCDBFA872");
    }

    #[test]
    fn comments_dropped() {
        let ct = parse_content_type("text/plain (plain text); charset=utf-8 (Unicode)").unwrap();
        assert_eq!(ct.media_type, "text/plain");
        assert_eq!(ct.charset, "UTF-8");
    }

    #[test]
    fn case_normalization() {
        let ct = parse_content_type("TEXT/Html; Charset=UTF-8").unwrap();
        assert_eq!(ct.media_type, "text/html");
        assert_eq!(ct.charset, "UTF-8");
    }

    #[test]
    fn attachment_name() {
        let ct = parse_content_type("image/gif; name=\"kitty.gif\"").unwrap();
        assert_eq!(ct.name, "kitty.gif");
    }

    #[test]
    fn overlong_boundary_rejected() {
        let boundary = "b".repeat(MAX_BOUNDARY_LEN);
        let header = format!("multipart/mixed; boundary=\"{}\"", boundary);
        assert!(parse_content_type(&header).is_err());
        let boundary = "b".repeat(MAX_BOUNDARY_LEN - 1);
        let header = format!("multipart/mixed; boundary=\"{}\"", boundary);
        assert!(parse_content_type(&header).is_ok());
    }

    #[test]
    fn missing_subtype_rejected() {
        assert!(parse_content_type("text").is_err());
        assert!(parse_content_type("text/").is_err());
    }
}
