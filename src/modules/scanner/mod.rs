// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::raise_error;

pub mod content_type;
pub mod node;

pub use content_type::{parse_content_type, ContentTypeField};
pub use node::MimePart;

/// Boundary strings of this length or more reject the message.
pub const MAX_BOUNDARY_LEN: usize = 80;
/// Default cap on the total number of parts in one message.
pub const DEFAULT_MAX_NODES: usize = 512;
/// Malformed header lines absorbed per part before the parse fails.
pub const HEADER_ERROR_THRESHOLD: u32 = 4;

#[derive(Debug, Clone, Copy)]
pub struct ScannerConfig {
    pub max_nodes: usize,
    pub header_error_threshold: u32,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            max_nodes: DEFAULT_MAX_NODES,
            header_error_threshold: HEADER_ERROR_THRESHOLD,
        }
    }
}

/// A multipart container currently being walked.
#[derive(Debug)]
struct Frame {
    part_idx: usize,
    boundary: String,
    child_count: usize,
}

/// Micro-state of the scan. The machine suspends by returning from
/// `parse` when the slice is exhausted; every field of the scanner is
/// carryover state, so the next slice resumes exactly where this one
/// stopped.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Step {
    /// At the start of a header line; a bare LF here ends the block.
    HeaderStart,
    HeaderName,
    /// A single SP was seen after the name; only ':' may follow.
    HeaderColonWait,
    HeaderValue,
    /// LF seen inside a value; the next byte decides fold vs end.
    HeaderFold,
    /// Discarding a malformed header line up to its LF.
    SkipBadLine,
    /// Scanning body bytes for the innermost "\n--boundary".
    Body,
    /// Full boundary matched; '-' starts a terminator, WSP pads, LF ends.
    BoundaryDashOrPart,
    /// One terminator dash seen, the second must follow.
    BoundaryDash2,
    BoundaryPad { terminator: bool },
    /// LF seen after padding; WSP continues the padding, else line ends.
    BoundaryPadFold { terminator: bool },
    /// Consuming to end of input with no boundary to watch for.
    BodyEof,
    /// Node budget exceeded; swallow the rest of the stream.
    Drain,
    Done,
}

/// Streaming MIME scanner.
///
/// Feed the message as a sequence of slices via [`parse`]; each call
/// either consumes the slice completely (ready for more input) or
/// fails with a fatal parse error. [`close`] delivers the end-of-input
/// sentinel and returns the terminal status. After every `parse` the
/// tree built so far is readable through [`parts`], so a consumer can
/// slice the bytes already delivered by their offsets.
///
/// The scanner never backtracks and never buffers the message; the
/// only buffered state is the current header line and the partial
/// boundary match carried across slice ends.
pub struct MimeScanner {
    cfg: ScannerConfig,
    parts: Vec<MimePart>,
    /// Indexes of currently-open parts, root first.
    open_stack: Vec<usize>,
    frames: Vec<Frame>,
    /// Absolute message position of the next byte; CR bytes do not count.
    pos: u64,
    step: Step,
    name_buf: Vec<u8>,
    value_buf: Vec<u8>,
    header_errors: u32,
    /// "\n--" + innermost boundary.
    needle: Vec<u8>,
    /// Matched needle prefix, carried across slices (tail overlap).
    bmatch: usize,
    /// Start of the most recently consumed boundary line.
    last_boundary_pos: u64,
    fatal: Option<(ErrorCode, String)>,
    not_mime: bool,
    max_nodes_hit: bool,
    /// Root container closed by its terminating boundary.
    complete: bool,
}

enum Action {
    Consume,
    Hold,
}

impl Default for MimeScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl MimeScanner {
    pub fn new() -> Self {
        Self::with_config(ScannerConfig::default())
    }

    pub fn with_config(cfg: ScannerConfig) -> Self {
        let mut scanner = MimeScanner {
            cfg,
            parts: Vec::new(),
            open_stack: Vec::new(),
            frames: Vec::new(),
            pos: 0,
            step: Step::HeaderStart,
            name_buf: Vec::new(),
            value_buf: Vec::new(),
            header_errors: 0,
            needle: Vec::new(),
            bmatch: 0,
            last_boundary_pos: 0,
            fatal: None,
            not_mime: false,
            max_nodes_hit: false,
            complete: false,
        };
        scanner.open();
        scanner
    }

    /// Reset all state and prepare an empty tree with the eager root
    /// part "1".
    pub fn open(&mut self) {
        self.parts.clear();
        self.parts.push(MimePart::new("1".into(), 0));
        self.open_stack.clear();
        self.open_stack.push(0);
        self.frames.clear();
        self.pos = 0;
        self.step = Step::HeaderStart;
        self.name_buf.clear();
        self.value_buf.clear();
        self.header_errors = 0;
        self.needle.clear();
        self.bmatch = 0;
        self.last_boundary_pos = 0;
        self.fatal = None;
        self.not_mime = false;
        self.max_nodes_hit = false;
        self.complete = false;
    }

    /// The tree scanned so far.
    pub fn parts(&self) -> &[MimePart] {
        &self.parts
    }

    /// Absolute position of the next expected byte.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Consume one slice. `Ok` means the slice was consumed completely
    /// and the scanner is ready for more input; `Err` is a fatal parse
    /// error that poisons the current message (but not the scanner,
    /// after the next `open`).
    pub fn parse(&mut self, slice: &[u8]) -> MailVaultResult<()> {
        if let Some((code, message)) = &self.fatal {
            return Err(raise_error!(message.clone(), *code));
        }
        let mut i = 0usize;
        while i < slice.len() {
            let b = slice[i];
            // CR is invisible: consumed, never counted.
            if b == b'\r' {
                i += 1;
                continue;
            }
            let action = match self.step {
                Step::HeaderStart => self.on_header_start(b)?,
                Step::HeaderName => self.on_header_name(b)?,
                Step::HeaderColonWait => self.on_header_colon_wait(b)?,
                Step::HeaderValue => self.on_header_value(b),
                Step::HeaderFold => self.on_header_fold(b)?,
                Step::SkipBadLine => {
                    if b == b'\n' {
                        self.step = Step::HeaderStart;
                    }
                    Action::Consume
                }
                Step::Body => self.on_body(b),
                Step::BoundaryDashOrPart => self.on_boundary_dash_or_part(b)?,
                Step::BoundaryDash2 => {
                    if b == b'-' {
                        self.step = Step::BoundaryPad { terminator: true };
                        Action::Consume
                    } else {
                        return Err(self.fail(
                            ErrorCode::BoundaryExpected,
                            "terminating boundary missing second dash",
                        ));
                    }
                }
                Step::BoundaryPad { terminator } => match b {
                    b' ' | b'\t' => Action::Consume,
                    b'\n' => {
                        self.step = Step::BoundaryPadFold { terminator };
                        Action::Consume
                    }
                    _ => {
                        return Err(self.fail(
                            ErrorCode::BoundaryExpected,
                            "boundary not terminated by LF after transport padding",
                        ));
                    }
                },
                Step::BoundaryPadFold { terminator } => {
                    if b == b' ' || b == b'\t' {
                        self.step = Step::BoundaryPad { terminator };
                        Action::Consume
                    } else {
                        // the LF already consumed ended the boundary line
                        if terminator {
                            self.finish_terminator();
                        } else {
                            self.begin_sibling();
                        }
                        Action::Hold
                    }
                }
                Step::BodyEof | Step::Drain => Action::Consume,
                Step::Done => Action::Consume,
            };
            if let Action::Consume = action {
                i += 1;
                self.pos += 1;
            }
        }
        Ok(())
    }

    /// Signal end of input. Returns `Ok` for a cleanly terminated
    /// message; soft outcomes (`EofSentinel`, `NotMime`, `MaxNodes`)
    /// leave a storable tree behind.
    pub fn close(&mut self) -> MailVaultResult<()> {
        if let Some((code, message)) = &self.fatal {
            return Err(raise_error!(message.clone(), *code));
        }
        match self.step {
            Step::HeaderValue | Step::HeaderFold => {
                self.finalize_header()?;
            }
            Step::BoundaryPad { terminator } | Step::BoundaryPadFold { terminator } => {
                if terminator {
                    self.finish_terminator();
                } else {
                    self.begin_sibling();
                }
            }
            _ => {}
        }
        while let Some(idx) = self.open_stack.pop() {
            let pos = self.pos;
            let part = &mut self.parts[idx];
            if !part.closed {
                if part.starting_pos_body == 0 && !part.headers.is_empty() {
                    part.starting_pos_body = pos;
                }
                part.ending_pos = pos;
                part.ending_pos_body = pos;
                part.closed = true;
            }
        }
        self.step = Step::Done;
        if self.max_nodes_hit {
            return Err(raise_error!(
                format!("part budget of {} exceeded", self.cfg.max_nodes),
                ErrorCode::MaxNodes
            ));
        }
        if self.not_mime {
            return Err(raise_error!(
                "message has no multipart or message root".into(),
                ErrorCode::NotMime
            ));
        }
        if self.complete {
            Ok(())
        } else {
            Err(raise_error!(
                "input ended before the structure did".into(),
                ErrorCode::EofSentinel
            ))
        }
    }

    fn fail(&mut self, code: ErrorCode, message: &str) -> crate::modules::error::MailVaultError {
        self.fatal = Some((code, message.to_string()));
        raise_error!(message.to_string(), code)
    }

    fn on_header_start(&mut self, b: u8) -> MailVaultResult<Action> {
        match b {
            b'\n' => {
                // blank line: end of this part's header block
                let idx = *self.open_stack.last().unwrap();
                self.parts[idx].starting_pos_body = self.pos + 1;
                self.after_headers();
                Ok(Action::Consume)
            }
            _ if is_header_name_char(b) => {
                self.name_buf.clear();
                self.value_buf.clear();
                self.name_buf.push(b);
                self.step = Step::HeaderName;
                Ok(Action::Consume)
            }
            _ => {
                self.count_bad_header_line()?;
                self.step = Step::SkipBadLine;
                Ok(Action::Consume)
            }
        }
    }

    fn on_header_name(&mut self, b: u8) -> MailVaultResult<Action> {
        match b {
            b':' => {
                self.step = Step::HeaderValue;
                Ok(Action::Consume)
            }
            b' ' => {
                // a single SP before the colon is tolerated
                self.step = Step::HeaderColonWait;
                Ok(Action::Consume)
            }
            b'\n' => {
                // line ended without a colon
                self.count_bad_header_line()?;
                self.step = Step::HeaderStart;
                Ok(Action::Consume)
            }
            _ if is_header_name_char(b) => {
                self.name_buf.push(b);
                Ok(Action::Consume)
            }
            _ => {
                self.count_bad_header_line()?;
                self.step = Step::SkipBadLine;
                Ok(Action::Consume)
            }
        }
    }

    fn on_header_colon_wait(&mut self, b: u8) -> MailVaultResult<Action> {
        match b {
            b':' => {
                self.step = Step::HeaderValue;
                Ok(Action::Consume)
            }
            b'\n' => {
                self.count_bad_header_line()?;
                self.step = Step::HeaderStart;
                Ok(Action::Consume)
            }
            _ => {
                self.count_bad_header_line()?;
                self.step = Step::SkipBadLine;
                Ok(Action::Consume)
            }
        }
    }

    fn on_header_value(&mut self, b: u8) -> Action {
        match b {
            b'\n' => {
                self.step = Step::HeaderFold;
                Action::Consume
            }
            b' ' | b'\t' => {
                // collapse leading and folded whitespace runs
                if !self.value_buf.is_empty() && self.value_buf.last() != Some(&b' ') {
                    self.value_buf.push(b' ');
                }
                Action::Consume
            }
            _ => {
                self.value_buf.push(b);
                Action::Consume
            }
        }
    }

    fn on_header_fold(&mut self, b: u8) -> MailVaultResult<Action> {
        match b {
            b' ' | b'\t' => {
                // LWS continuation: the value goes on
                if self.value_buf.last() != Some(&b' ') {
                    self.value_buf.push(b' ');
                }
                self.step = Step::HeaderValue;
                Ok(Action::Consume)
            }
            b'\n' => {
                // header complete, and the blank line ends the block
                self.finalize_header()?;
                let idx = *self.open_stack.last().unwrap();
                self.parts[idx].starting_pos_body = self.pos + 1;
                self.after_headers();
                Ok(Action::Consume)
            }
            _ => {
                self.finalize_header()?;
                self.step = Step::HeaderStart;
                Ok(Action::Hold)
            }
        }
    }

    fn on_body(&mut self, b: u8) -> Action {
        if b == self.needle[self.bmatch] {
            self.bmatch += 1;
            if self.bmatch == self.needle.len() {
                // boundary line starts right after the '\n' of the needle
                self.last_boundary_pos = self.pos - (self.needle.len() as u64 - 2);
                self.bmatch = 0;
                self.step = Step::BoundaryDashOrPart;
            }
        } else if b == b'\n' {
            // the needle's only LF is its first byte, so a failed match
            // can only restart at the current byte
            self.bmatch = 1;
        } else {
            self.bmatch = 0;
        }
        Action::Consume
    }

    fn on_boundary_dash_or_part(&mut self, b: u8) -> MailVaultResult<Action> {
        match b {
            b'-' => {
                self.step = Step::BoundaryDash2;
                Ok(Action::Consume)
            }
            b' ' | b'\t' => {
                self.step = Step::BoundaryPad { terminator: false };
                Ok(Action::Consume)
            }
            b'\n' => {
                self.step = Step::BoundaryPadFold { terminator: false };
                Ok(Action::Consume)
            }
            _ => Err(self.fail(
                ErrorCode::BoundaryExpected,
                "boundary not terminated by LF after transport padding",
            )),
        }
    }

    fn count_bad_header_line(&mut self) -> MailVaultResult<()> {
        self.header_errors += 1;
        if self.header_errors > self.cfg.header_error_threshold {
            return Err(self.fail(
                ErrorCode::ScannerSyntax,
                "too many malformed header lines in part",
            ));
        }
        Ok(())
    }

    fn finalize_header(&mut self) -> MailVaultResult<()> {
        let name = normalize_header_name(&self.name_buf);
        let value = String::from_utf8_lossy(&self.value_buf)
            .trim_end()
            .to_string();
        self.name_buf.clear();
        self.value_buf.clear();
        let idx = *self.open_stack.last().unwrap();
        match name.as_str() {
            "Content-Type" => match parse_content_type(&value) {
                Ok(ct) => {
                    let part = &mut self.parts[idx];
                    part.content_type = ct.media_type;
                    part.charset = ct.charset;
                    // an own boundary shadows the inherited enclosing one
                    if !ct.boundary.is_empty() {
                        part.content_boundary = ct.boundary;
                    }
                    part.content_name = ct.name;
                }
                Err(e) if e.code() == ErrorCode::ScannerSyntax => {
                    // over-long boundary rejects the whole message
                    let message = e.to_string();
                    self.fatal = Some((ErrorCode::ScannerSyntax, message.clone()));
                    return Err(raise_error!(message, ErrorCode::ScannerSyntax));
                }
                Err(_) => {
                    // unparseable Content-Type counts as one bad line
                    self.count_bad_header_line()?;
                }
            },
            "Content-Transfer-Encoding" => {
                self.parts[idx].transfer_encoding = value.clone();
            }
            "Content-Disposition" => {
                self.parts[idx].content_disposition = value.clone();
            }
            _ => {}
        }
        self.parts[idx].headers.push((name, value));
        Ok(())
    }

    /// Decide what the body of the just-headed part looks like.
    fn after_headers(&mut self) {
        let idx = *self.open_stack.last().unwrap();
        self.header_errors = 0;
        if self.cfg.max_nodes == 1 {
            // the single header is the whole envelope
            self.complete = true;
            self.step = Step::BodyEof;
            return;
        }
        let parent_boundary = self.frames.last().map(|f| f.boundary.as_str());
        let part = &self.parts[idx];
        let nested_duplicate = Some(part.content_boundary.as_str()) == parent_boundary;
        if part.is_multipart() && !part.content_boundary.is_empty() && !nested_duplicate {
            let boundary = part.content_boundary.clone();
            self.frames.push(Frame {
                part_idx: idx,
                boundary: boundary.clone(),
                child_count: 0,
            });
            self.set_needle(&boundary);
            // the blank line's LF doubles as the delimiter's leading LF
            self.bmatch = 1;
            self.step = Step::Body;
        } else if part.content_type == "message/rfc822" {
            // a nested message: one child, terminated by the parent's
            // boundary (message/delivery-status and friends fall through
            // to the leaf path and never branch)
            if self.parts.len() >= self.cfg.max_nodes {
                self.max_nodes_hit = true;
                self.step = Step::Drain;
                return;
            }
            let child_id = format!("{}.1", part.part_id);
            let mut child = MimePart::new(child_id, self.pos + 1);
            child.content_boundary = part.content_boundary.clone();
            self.parts.push(child);
            self.open_stack.push(self.parts.len() - 1);
            self.step = Step::HeaderStart;
        } else if self.frames.is_empty() {
            if idx == 0 {
                self.not_mime = true;
            }
            self.step = Step::BodyEof;
        } else {
            self.bmatch = 1;
            self.step = Step::Body;
        }
    }

    /// Close every open part strictly deeper than the container.
    fn close_deeper_than(&mut self, container_idx: usize, at: u64) {
        while let Some(&top) = self.open_stack.last() {
            if top == container_idx {
                break;
            }
            self.open_stack.pop();
            let part = &mut self.parts[top];
            part.ending_pos = at;
            part.ending_pos_body = at;
            part.closed = true;
        }
    }

    /// A sibling delimiter line was fully consumed; the byte at the
    /// current position is the first of the new part.
    fn begin_sibling(&mut self) {
        let frame_idx = self.frames.len() - 1;
        let container_idx = self.frames[frame_idx].part_idx;
        self.close_deeper_than(container_idx, self.last_boundary_pos);
        if self.parts.len() >= self.cfg.max_nodes {
            self.max_nodes_hit = true;
            self.step = Step::Drain;
            return;
        }
        let frame = &mut self.frames[frame_idx];
        frame.child_count += 1;
        let part_id = format!(
            "{}.{}",
            self.parts[container_idx].part_id, frame.child_count
        );
        let mut part = MimePart::new(part_id, self.pos);
        part.content_boundary = frame.boundary.clone();
        self.parts.push(part);
        self.open_stack.push(self.parts.len() - 1);
        self.bmatch = 0;
        self.step = Step::HeaderStart;
    }

    /// A terminating boundary line was fully consumed; close the
    /// container and resume in the enclosing one.
    fn finish_terminator(&mut self) {
        let frame = self.frames.pop().unwrap();
        self.close_deeper_than(frame.part_idx, self.last_boundary_pos);
        self.open_stack.pop();
        let part = &mut self.parts[frame.part_idx];
        part.ending_pos_body = self.last_boundary_pos;
        part.ending_pos = self.pos;
        part.closed = true;
        if let Some(top) = self.frames.last() {
            let boundary = top.boundary.clone();
            self.set_needle(&boundary);
            self.bmatch = 1;
            self.step = Step::Body;
        } else {
            self.complete = true;
            self.step = Step::BodyEof;
        }
    }

    fn set_needle(&mut self, boundary: &str) {
        self.needle.clear();
        self.needle.extend_from_slice(b"\n--");
        self.needle.extend_from_slice(boundary.as_bytes());
        self.bmatch = 0;
    }
}

fn is_header_name_char(b: u8) -> bool {
    matches!(b, 33..=126) && b != b':'
}

/// Normalize header-name case: first character and every character
/// following a '-' upper-cased, the rest lower-cased.
fn normalize_header_name(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut upper = true;
    for &b in raw {
        if b == b'-' {
            out.push('-');
            upper = true;
        } else if upper {
            out.push(b.to_ascii_uppercase() as char);
            upper = false;
        } else {
            out.push(b.to_ascii_lowercase() as char);
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// Canonical two-level forwarded message: a multipart/mixed root
    /// holding a text part and a message/rfc822 part whose nested
    /// message carries its own multipart with a text part and a
    /// base64 GIF.
    pub(crate) const NESTED_MESSAGE: &str = "From: Al Gore <vice-president@whitehouse.example>\n\
To: White House Transportation Coordinator <transport@whitehouse.example>\n\
Subject: [Fwd: Map of Argentina with Description]\n\
Content-Type: multipart/mixed; boundary=\"D7F------------D7FD5A0B8AB9C65CCDBFA872\"\n\
\n\
This is a multi-part message in MIME format.\n\
--D7F------------D7FD5A0B8AB9C65CCDBFA872\n\
Content-Type: text/plain; charset=us-ascii\n\
Content-Transfer-Encoding: 7bit\n\
\n\
Fred,\n\
\n\
Fire up Air Force One!  We're going South!\n\
\n\
Thanks,\n\
Al\n\
--D7F------------D7FD5A0B8AB9C65CCDBFA872\n\
Content-Type: message/rfc822\n\
Content-Transfer-Encoding: 7bit\n\
Content-Disposition: inline\n\
\n\
Return-Path: <president@whitehouse.example>\n\
From: Bill Clinton <president@whitehouse.example>\n\
To: Al (Al) Gore <vice-president@whitehouse.example>\n\
Subject: Map of Argentina with Description\n\
Content-Type: multipart/mixed; boundary=\"DC8------------DC8638F443D87A7F0726DEF7\"\n\
\n\
This is a multi-part message in MIME format.\n\
--DC8------------DC8638F443D87A7F0726DEF7\n\
Content-Type: text/plain; charset=us-ascii\n\
Content-Transfer-Encoding: 7bit\n\
\n\
Hi Al,\n\
\n\
I finally figured out this MIME thing.  Pretty cool.  I'll send you\n\
some sax music in .au files next week!\n\
\n\
All the best,\n\
Bill\n\
--DC8------------DC8638F443D87A7F0726DEF7\n\
Content-Type: image/gif; name=\"map_of_Argentina.gif\"\n\
Content-Transfer-Encoding: base64\n\
Content-Disposition: inline; filename=\"map_of_Argentina.gif\"\n\
\n\
R0lGODlhIAAgAPAAAP8AAAAAACwAAAAAIAAgAAACJISPqcvtD6OctNqLs968+w+G\n\
4kiW5omm6sq27gvH8kzX9o1TAAA7\n\
--DC8------------DC8638F443D87A7F0726DEF7--\n\
--D7F------------D7FD5A0B8AB9C65CCDBFA872--\n";
}
