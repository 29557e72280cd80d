//! Application error model with MCP error mapping
//!
//! Defines a typed error hierarchy using `thiserror` for internal error handling,
//! and maps each variant to the appropriate MCP `ErrorData` type for protocol
//! compliance. Variants are split by stage so the engine can tell session-level
//! failures (connect, login, mailbox open) from per-identifier ones.

use rmcp::model::ErrorData;
use serde_json::json;
use thiserror::Error;

/// Application error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid user input (validation failed, malformed request)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Attachment filter could not be built (bad pattern or flags)
    #[error("invalid attachment filter: {0}")]
    InvalidFilter(String),
    /// TCP, TLS, or greeting failure while establishing the session
    #[error("connection failed: {0}")]
    Connection(String),
    /// Authentication failure (bad credentials, account disabled)
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Mailbox could not be opened
    #[error("cannot open mailbox: {0}")]
    MailboxOpen(String),
    /// Resource not found (account, message)
    #[error("not found: {0}")]
    NotFound(String),
    /// SEARCH or FETCH exchange failed after the mailbox was opened
    #[error("transport error: {0}")]
    Transport(String),
    /// Raw message could not be decoded as MIME
    #[error("decode failed: {0}")]
    Decode(String),
    /// Writing to attachment storage failed
    #[error("persistence failed: {0}")]
    Persistence(String),
    /// Operation timeout (TCP connect, TLS handshake, IMAP response)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Convert to MCP `ErrorData`
    ///
    /// Maps each `AppError` variant to the appropriate MCP error type and
    /// includes a structured `code` field for client error handling.
    ///
    /// # Mappings
    ///
    /// - `InvalidInput`, `InvalidFilter` → `invalid_params`
    /// - `NotFound`, `MailboxOpen` → `resource_not_found`
    /// - `AuthFailed` → `invalid_request`
    /// - everything else → `internal_error`
    pub fn to_error_data(&self) -> ErrorData {
        let msg = self.to_string();
        let data = Some(json!({ "code": self.code() }));
        match self {
            Self::InvalidInput(_) | Self::InvalidFilter(_) => ErrorData::invalid_params(msg, data),
            Self::NotFound(_) | Self::MailboxOpen(_) => ErrorData::resource_not_found(msg, data),
            Self::AuthFailed(_) => ErrorData::invalid_request(msg, data),
            Self::Connection(_)
            | Self::Transport(_)
            | Self::Decode(_)
            | Self::Persistence(_)
            | Self::Timeout(_)
            | Self::Internal(_) => ErrorData::internal_error(msg, data),
        }
    }

    /// Stable machine-readable code for the variant
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::InvalidFilter(_) => "invalid_filter",
            Self::Connection(_) => "connection_failed",
            Self::AuthFailed(_) => "auth_failed",
            Self::MailboxOpen(_) => "mailbox_open_failed",
            Self::NotFound(_) => "not_found",
            Self::Transport(_) => "transport",
            Self::Decode(_) => "decode",
            Self::Persistence(_) => "persistence",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) => "internal",
        }
    }
}

/// Type alias for fallible return values
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn display_names_the_failed_stage() {
        assert_eq!(
            AppError::MailboxOpen("'Archive': NO".to_owned()).to_string(),
            "cannot open mailbox: 'Archive': NO"
        );
        assert_eq!(
            AppError::Connection("refused".to_owned()).to_string(),
            "connection failed: refused"
        );
    }

    #[test]
    fn error_data_carries_code() {
        let data = AppError::InvalidFilter("bad regex".to_owned()).to_error_data();
        let code = data
            .data
            .as_ref()
            .and_then(|d| d.get("code"))
            .and_then(|c| c.as_str());
        assert_eq!(code, Some("invalid_filter"));
    }
}
