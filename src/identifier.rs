//! Caller identifier resolution
//!
//! Callers name messages either by IMAP UID (only meaningful inside the
//! mailbox being opened) or by `Message-ID` header value, which is stable
//! across sessions and stores. Both must become a UID before anything can be
//! fetched.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::imap::MailSession;

/// Header searched when resolving addresses
const MESSAGE_ID_HEADER: &str = "Message-ID";

/// How a caller-supplied identifier should be interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum IdentifierKind {
    /// `Message-ID` header value, with or without angle brackets
    #[default]
    #[serde(rename = "message_id", alias = "address")]
    Address,
    /// IMAP UID within the selected mailbox
    #[serde(rename = "uid", alias = "handle")]
    Handle,
}

impl IdentifierKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Address => "message_id",
            Self::Handle => "uid",
        }
    }
}

/// Resolve an identifier to the UID the transport needs
///
/// UIDs are parsed locally and never checked against the store here; a UID
/// that does not exist surfaces later as a fetch miss. Addresses are searched
/// by bracketed form first, then unbracketed, because mail agents disagree on
/// whether the brackets belong to the value.
///
/// # Errors
///
/// - `NotFound` if the identifier is malformed or no candidate matches
/// - transport errors from the search exchange, unchanged
pub async fn resolve<S: MailSession>(
    session: &mut S,
    identifier: &str,
    kind: IdentifierKind,
) -> AppResult<u32> {
    match kind {
        IdentifierKind::Handle => parse_handle(identifier)
            .ok_or_else(|| AppError::NotFound(format!("'{identifier}' is not a valid uid"))),
        IdentifierKind::Address => {
            let candidates = address_candidates(identifier);
            if candidates.is_empty() {
                return Err(AppError::NotFound("empty message_id".to_owned()));
            }
            for candidate in &candidates {
                let uids = session.search_header(MESSAGE_ID_HEADER, candidate).await?;
                debug!(candidate = %candidate, matches = uids.len(), "Message-ID search");
                if let Some(uid) = uids.first() {
                    return Ok(*uid);
                }
            }
            Err(AppError::NotFound(format!(
                "no message with Message-ID '{identifier}'"
            )))
        }
    }
}

/// Parse a base-10 positive UID
pub fn parse_handle(identifier: &str) -> Option<u32> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    trimmed.parse::<u32>().ok().filter(|uid| *uid > 0)
}

/// Search candidates for a `Message-ID`, in the order they must be tried
pub fn address_candidates(identifier: &str) -> Vec<String> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    match trimmed
        .strip_prefix('<')
        .and_then(|rest| rest.strip_suffix('>'))
    {
        Some(inner) if inner.is_empty() => vec![trimmed.to_owned()],
        Some(inner) => vec![trimmed.to_owned(), inner.to_owned()],
        None => vec![format!("<{trimmed}>"), trimmed.to_owned()],
    }
}

#[cfg(test)]
mod tests {
    use super::{IdentifierKind, address_candidates, parse_handle};

    #[test]
    fn bracketed_input_tries_bracketed_then_stripped() {
        assert_eq!(address_candidates("<a@b>"), vec!["<a@b>", "a@b"]);
    }

    #[test]
    fn bare_input_tries_bracketed_form_first() {
        assert_eq!(address_candidates("a@b"), vec!["<a@b>", "a@b"]);
        assert_eq!(address_candidates("  a@b \t"), vec!["<a@b>", "a@b"]);
    }

    #[test]
    fn empty_brackets_yield_single_candidate() {
        assert_eq!(address_candidates("<>"), vec!["<>"]);
        assert!(address_candidates("   ").is_empty());
    }

    #[test]
    fn handle_parsing_rejects_non_positive_and_non_numeric() {
        assert_eq!(parse_handle("42"), Some(42));
        assert_eq!(parse_handle(" 7 "), Some(7));
        for bad in ["0", "-3", "+3", "abc", "4.2", "", "99999999999"] {
            assert_eq!(parse_handle(bad), None, "{bad} must not parse");
        }
    }

    #[test]
    fn kind_accepts_both_spellings() {
        let kind: IdentifierKind = serde_json::from_str("\"uid\"").expect("uid parses");
        assert_eq!(kind, IdentifierKind::Handle);
        let kind: IdentifierKind = serde_json::from_str("\"address\"").expect("alias parses");
        assert_eq!(kind, IdentifierKind::Address);
        assert_eq!(IdentifierKind::default().as_str(), "message_id");
    }
}
