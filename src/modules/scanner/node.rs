// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

/// One node of the scanned MIME tree.
///
/// Parts form a tree but are stored flat; the dotted `part_id` ("1",
/// "1.2", "1.2.1", …) is the sole parent-child relation. All offsets
/// are absolute message-byte positions with CR bytes excluded.
#[derive(Debug, Clone, Default)]
pub struct MimePart {
    pub part_id: String,
    /// First byte of the part (its header block).
    pub starting_pos: u64,
    /// First byte after the blank line that ends the header block.
    pub starting_pos_body: u64,
    pub ending_pos: u64,
    pub ending_pos_body: u64,
    /// Header fields in arrival order, names case-normalized.
    pub headers: Vec<(String, String)>,
    /// Lowercased "type/subtype", empty when no Content-Type was seen.
    pub content_type: String,
    /// Upper-cased charset parameter.
    pub charset: String,
    /// Boundary parameter of this part's own Content-Type.
    pub content_boundary: String,
    pub transfer_encoding: String,
    pub content_disposition: String,
    /// Name parameter of the Content-Type.
    pub content_name: String,
    pub closed: bool,
}

impl MimePart {
    pub fn new(part_id: String, starting_pos: u64) -> Self {
        MimePart {
            part_id,
            starting_pos,
            ..Default::default()
        }
    }

    /// First header with the given (case-normalized) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_multipart(&self) -> bool {
        self.content_type.starts_with("multipart/")
    }
}
