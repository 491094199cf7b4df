// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use code::ErrorCode;
use snafu::{Location, Snafu};

pub mod code;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MailVaultError {
    #[snafu(display("{message}"))]
    Generic {
        message: String,
        #[snafu(implicit)]
        location: Location,
        code: ErrorCode,
    },
}

pub type MailVaultResult<T, E = MailVaultError> = std::result::Result<T, E>;

impl MailVaultError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MailVaultError::Generic { code, .. } => *code,
        }
    }

    /// True for scan outcomes the write path may absorb: the partial
    /// tree is still storable as-is.
    pub fn is_soft_scan_outcome(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::NotMime | ErrorCode::MaxNodes | ErrorCode::EofSentinel
        )
    }
}
