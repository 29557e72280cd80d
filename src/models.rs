//! Input/output DTOs and schema-bearing types
//!
//! Defines all data structures used in MCP tool contracts. Each type is
//! annotated with `JsonSchema` for automatic schema generation.

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::identifier::IdentifierKind;

/// Metadata included in all tool responses
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Meta {
    /// Current UTC timestamp in RFC 3339 format with milliseconds
    pub now_utc: String,
    /// Tool execution duration in milliseconds
    pub duration_ms: u64,
}

impl Meta {
    /// Create metadata populated with current time and elapsed duration
    pub fn now(duration_ms: u64) -> Self {
        Self {
            now_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms,
        }
    }
}

/// Standard response envelope for all tools
///
/// Wraps tool-specific data with human-readable summary and execution metadata.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolEnvelope<T>
where
    T: JsonSchema,
{
    /// Human-readable summary of the operation outcome
    pub summary: String,
    /// Tool-specific data payload
    pub data: T,
    /// Execution metadata (timestamp, duration)
    pub meta: Meta,
}

/// Account metadata (no credentials)
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AccountInfo {
    /// Account identifier
    pub account_id: String,
    /// IMAP server hostname
    pub host: String,
    /// IMAP server port
    pub port: u16,
    /// Whether TLS is enabled (always true in this implementation)
    pub secure: bool,
}

/// One identifier or a list of them
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(one) => vec![one],
            Self::Many(many) => many,
        }
    }
}

/// Attachment filter; every configured constraint must hold
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct AttachmentFilterInput {
    /// Exact filename (case-insensitive)
    pub filename: Option<String>,
    /// Filename substring (case-insensitive)
    pub filename_contains: Option<String>,
    /// Regular expression tested against the filename
    pub filename_pattern: Option<String>,
    /// Pattern flags: `i`, `m`, `s`, `x`, `u`, `g`
    pub pattern_flags: Option<String>,
    /// Content types to keep, exact (`application/pdf`) or family (`image/*`)
    pub content_types: Option<Vec<String>>,
}

/// Input: download attachments for one or more messages
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DownloadAttachmentsInput {
    /// Account identifier (defaults to `"default"`)
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Message identifier or list of identifiers
    pub identifiers: OneOrMany,
    /// How identifiers are interpreted (`message_id` default, or `uid`)
    #[serde(default)]
    pub identifier_kind: IdentifierKind,
    /// Mailbox to open (defaults to `INBOX`)
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
    /// Optional attachment filter; omitted means all attachments
    pub filter: Option<AttachmentFilterInput>,
}

/// Input: peek at one or more messages without downloading attachments
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct PeekMessagesInput {
    /// Account identifier (defaults to `"default"`)
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Message identifier or list of identifiers
    pub identifiers: OneOrMany,
    /// How identifiers are interpreted (`message_id` default, or `uid`)
    #[serde(default)]
    pub identifier_kind: IdentifierKind,
    /// Mailbox to open (defaults to `INBOX`)
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
}

/// Body representation for content retrieval
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ContentFormat {
    /// Sanitized HTML body, or plain text rendered as HTML
    Html,
    /// Plain text body, or text derived from HTML
    #[default]
    Text,
    /// Full RFC822 source
    Raw,
}

/// Input: get one message's body
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GetMessageContentInput {
    /// Account identifier (defaults to `"default"`)
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Message identifier
    pub identifier: String,
    /// How the identifier is interpreted (`message_id` default, or `uid`)
    #[serde(default)]
    pub identifier_kind: IdentifierKind,
    /// Mailbox to open (defaults to `INBOX`)
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
    /// Body representation (`text` default)
    #[serde(default)]
    pub format: ContentFormat,
    /// Also save the raw message bytes to the attachment directory
    #[serde(default)]
    pub save_raw: bool,
}

/// Per-identifier result of a batch operation
///
/// `found` is true exactly when `error` is absent.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ResultRecord<T>
where
    T: JsonSchema,
{
    /// Identifier as supplied by the caller
    pub identifier: String,
    /// How the identifier was interpreted
    pub identifier_kind: IdentifierKind,
    /// Mailbox searched
    pub mailbox: String,
    /// Whether the message was found and processed
    pub found: bool,
    /// Resolved UID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    /// URI reference to the resolved message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_uri: Option<String>,
    /// Operation-specific payload
    #[serde(flatten)]
    pub payload: Option<T>,
    /// Failure cause
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Batch result data
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct BatchData<T>
where
    T: JsonSchema,
{
    pub account_id: String,
    pub mailbox: String,
    /// Number of identifiers processed
    pub total: usize,
    /// Number of identifiers that succeeded
    pub found: usize,
    /// One record per identifier, in input order
    pub results: Vec<ResultRecord<T>>,
}

/// Attachments payload of a download record
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct AttachmentsPayload {
    pub attachments: Vec<AttachmentResult>,
}

/// One matched attachment
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct AttachmentResult {
    /// Filename if present
    pub filename: Option<String>,
    /// MIME content type
    pub content_type: String,
    /// Decoded size in bytes
    pub size_bytes: usize,
    /// Content-Disposition type if present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disposition: Option<String>,
    /// Content-ID if present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    /// Inline content, saved path, or failure
    #[serde(flatten)]
    pub delivery: AttachmentDelivery,
}

/// How attachment content is delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(tag = "delivery", rename_all = "snake_case")]
pub enum AttachmentDelivery {
    /// Text content returned directly
    Inline { content: String },
    /// Content written to the attachment directory
    Saved { path: String },
    /// Content could not be saved
    Failed { error: String },
}

/// Attachment metadata without content
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct AttachmentSummary {
    pub filename: Option<String>,
    pub content_type: String,
    pub size_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disposition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
}

/// Peek payload: headers, body presence, attachment inventory
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct PeekPayload {
    pub subject: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cc: Option<String>,
    pub date: Option<String>,
    /// Message-ID header value
    pub message_id: Option<String>,
    pub has_html: bool,
    pub has_text: bool,
    /// HTML body size in bytes
    pub html_size: usize,
    /// Plain text body size in bytes
    pub text_size: usize,
    pub attachments: Vec<AttachmentSummary>,
}

/// Result of single-message content retrieval
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ContentRecord {
    pub identifier: String,
    pub identifier_kind: IdentifierKind,
    pub mailbox: String,
    pub found: bool,
    pub uid: u32,
    pub message_uri: String,
    pub format: ContentFormat,
    pub content: String,
    /// Path of the saved raw message (if `save_raw=true`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_path: Option<String>,
    /// Size of the saved raw message in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_size: Option<usize>,
}

/// Default value for `account_id` field
pub fn default_account_id() -> String {
    "default".to_owned()
}

/// Default value for `mailbox` field
pub fn default_mailbox() -> String {
    "INBOX".to_owned()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        AttachmentDelivery, AttachmentResult, AttachmentsPayload, DownloadAttachmentsInput,
        ResultRecord,
    };
    use crate::identifier::IdentifierKind;

    #[test]
    fn download_input_defaults_and_single_identifier() {
        let input: DownloadAttachmentsInput =
            serde_json::from_value(json!({ "identifiers": "<a@b>" })).expect("valid input");
        assert_eq!(input.account_id, "default");
        assert_eq!(input.mailbox, "INBOX");
        assert_eq!(input.identifier_kind, IdentifierKind::Address);
        assert_eq!(input.identifiers.into_vec(), vec!["<a@b>"]);
    }

    #[test]
    fn download_input_accepts_identifier_list() {
        let input: DownloadAttachmentsInput = serde_json::from_value(json!({
            "identifiers": ["1", "2"],
            "identifier_kind": "uid",
            "filter": { "content_types": ["image/*"] }
        }))
        .expect("valid input");
        assert_eq!(input.identifier_kind, IdentifierKind::Handle);
        assert_eq!(input.identifiers.into_vec(), vec!["1", "2"]);
        assert!(input.filter.is_some());
    }

    #[test]
    fn failed_record_omits_payload() {
        let record: ResultRecord<AttachmentsPayload> = ResultRecord {
            identifier: "notfound@x".to_owned(),
            identifier_kind: IdentifierKind::Address,
            mailbox: "INBOX".to_owned(),
            found: false,
            uid: None,
            message_uri: None,
            payload: None,
            error: Some("not found: no message".to_owned()),
        };
        let value = serde_json::to_value(record).expect("serializes");
        assert_eq!(
            value,
            json!({
                "identifier": "notfound@x",
                "identifier_kind": "message_id",
                "mailbox": "INBOX",
                "found": false,
                "error": "not found: no message"
            })
        );
    }

    #[test]
    fn attachment_delivery_is_flattened() {
        let result = AttachmentResult {
            filename: Some("a.txt".to_owned()),
            content_type: "text/plain".to_owned(),
            size_bytes: 2,
            disposition: None,
            content_id: None,
            delivery: AttachmentDelivery::Inline {
                content: "hi".to_owned(),
            },
        };
        let value = serde_json::to_value(result).expect("serializes");
        assert_eq!(value["delivery"], "inline");
        assert_eq!(value["content"], "hi");
        assert!(value.get("path").is_none());
    }
}
