// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum ErrorCode {
    // Client-side errors (10000–10999)
    InvalidParameter = 10000,
    MissingConfiguration = 10010,
    BadHash = 10020,

    // Scan errors (20000–20999)
    ScannerSyntax = 20000,
    BoundaryExpected = 20010,
    MaxNodes = 20020,
    NotMime = 20030,
    EofSentinel = 20040,

    // Storage errors (30000–30999)
    StorageError = 30000,
    ChunkMissing = 30010,
    MessageNotFound = 30020,
    UnknownStorageEngine = 30030,

    // Internal system errors (70000–70999)
    InternalError = 70000,
}
