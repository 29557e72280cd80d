//! MCP server implementation with tool handlers
//!
//! Implements the `ServerHandler` trait and registers the attachment, peek,
//! and content tools. Handles input validation and response formatting; the
//! per-message work happens in [`crate::engine`].

use std::sync::Arc;
use std::time::Instant;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{ErrorData, ServerCapabilities, ServerInfo};
use rmcp::{Json, ServerHandler, tool, tool_handler, tool_router};
use schemars::JsonSchema;

use crate::attachments::AttachmentStore;
use crate::config::ServerConfig;
use crate::engine::{DownloadPolicy, PeekPolicy, SessionEngine};
use crate::errors::{AppError, AppResult};
use crate::filter::AttachmentFilter;
use crate::imap::ImapConnector;
use crate::models::{
    AccountInfo, AttachmentFilterInput, AttachmentsPayload, BatchData, ContentRecord,
    DownloadAttachmentsInput, GetMessageContentInput, Meta, PeekMessagesInput, PeekPayload,
    ResultRecord, ToolEnvelope,
};

/// Maximum identifiers accepted by one batch call
const MAX_BATCH_IDENTIFIERS: usize = 50;
/// RFC 5322 line length limit; no Message-ID can be longer
const MAX_IDENTIFIER_CHARS: usize = 998;
/// Maximum length of filter text fields
const MAX_FILTER_TEXT_CHARS: usize = 256;

/// IMAP MCP server
///
/// Holds shared configuration. Implements MCP tool handlers via `#[tool]`
/// attribute macro and `ServerHandler` trait.
#[derive(Clone)]
pub struct MailImapServer {
    /// Server config (accounts, timeouts, attachment storage)
    config: Arc<ServerConfig>,
    /// Tool router for dispatching MCP tool calls
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl MailImapServer {
    /// Create a new MCP server instance
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            tool_router: Self::tool_router(),
        }
    }

    /// Tool: List configured IMAP accounts
    ///
    /// Returns account metadata (host, port, secure) without exposing
    /// credentials.
    #[tool(
        name = "imap_list_accounts",
        description = "List configured IMAP accounts"
    )]
    async fn list_accounts(&self) -> Result<Json<ToolEnvelope<Vec<AccountInfo>>>, ErrorData> {
        let started = Instant::now();
        let data = self
            .config
            .accounts
            .values()
            .map(|a| AccountInfo {
                account_id: a.account_id.clone(),
                host: a.host.clone(),
                port: a.port,
                secure: a.secure,
            })
            .collect::<Vec<_>>();
        finalize_tool(
            started,
            Ok((format!("{} account(s) configured", data.len()), data)),
        )
    }

    /// Tool: Download attachments for one or more messages
    ///
    /// Small text attachments come back inline; everything else is saved to
    /// the attachment directory and returned by path.
    #[tool(
        name = "imap_download_attachments",
        description = "Download attachments from messages identified by Message-ID or UID. Small text attachments are returned inline, others are saved to disk and returned by path. Never marks messages as read."
    )]
    async fn download_attachments(
        &self,
        Parameters(input): Parameters<DownloadAttachmentsInput>,
    ) -> Result<Json<ToolEnvelope<BatchData<AttachmentsPayload>>>, ErrorData> {
        let started = Instant::now();
        let result = self.download_attachments_impl(input).await.map(|data| {
            let saved = data
                .results
                .iter()
                .filter_map(|r| r.payload.as_ref())
                .map(|p| p.attachments.len())
                .sum::<usize>();
            (
                format!(
                    "{} of {} message(s) found, {saved} attachment(s) returned",
                    data.found, data.total
                ),
                data,
            )
        });
        finalize_tool(started, result)
    }

    /// Tool: Peek at one or more messages
    #[tool(
        name = "imap_peek_messages",
        description = "Summarize messages (headers, body presence and size, attachment inventory) without downloading attachments or marking them as read"
    )]
    async fn peek_messages(
        &self,
        Parameters(input): Parameters<PeekMessagesInput>,
    ) -> Result<Json<ToolEnvelope<BatchData<PeekPayload>>>, ErrorData> {
        let started = Instant::now();
        let result = self.peek_messages_impl(input).await.map(|data| {
            (
                format!("{} of {} message(s) found", data.found, data.total),
                data,
            )
        });
        finalize_tool(started, result)
    }

    /// Tool: Get one message's body as HTML, text, or raw source
    #[tool(
        name = "imap_get_message_content",
        description = "Get a single message body as sanitized HTML, plain text, or raw RFC822 source; optionally save the raw message to disk"
    )]
    async fn get_message_content(
        &self,
        Parameters(input): Parameters<GetMessageContentInput>,
    ) -> Result<Json<ToolEnvelope<ContentRecord>>, ErrorData> {
        let started = Instant::now();
        let result = self.get_message_content_impl(input).await.map(|data| {
            (
                format!(
                    "Message uid {} retrieved ({} chars)",
                    data.uid,
                    data.content.chars().count()
                ),
                data,
            )
        });
        finalize_tool(started, result)
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for MailImapServer {
    fn get_info(&self) -> ServerInfo {
        // `ServerInfo` is non-exhaustive; fill a default instead of a literal
        let mut info = ServerInfo::default();
        info.instructions = Some(
            "Read-only IMAP attachment server. Mailboxes are opened with EXAMINE and bodies fetched with BODY.PEEK[], so no tool changes message flags. Saved files land in MAIL_IMAP_ATTACHMENT_DIR.".to_owned(),
        );
        info.capabilities = ServerCapabilities::builder().enable_tools().build();
        info
    }
}

/// Tool implementation methods
///
/// Private methods handle the actual business logic for each tool, separated
/// from the public `#[tool]` methods that handle response formatting.
impl MailImapServer {
    async fn download_attachments_impl(
        &self,
        input: DownloadAttachmentsInput,
    ) -> AppResult<BatchData<AttachmentsPayload>> {
        validate_account_id(&input.account_id)?;
        validate_mailbox(&input.mailbox)?;
        let identifiers = validate_identifiers(input.identifiers.into_vec())?;
        validate_filter(input.filter.as_ref())?;
        // a bad pattern must fail before any connection is made
        let filter = AttachmentFilter::compile(input.filter.as_ref())?;

        let engine = self.engine(&input.account_id)?;
        let store = AttachmentStore::from_config(&self.config);
        let policy = DownloadPolicy {
            filter: filter.as_ref(),
            store: &store,
        };
        let results = engine
            .run(&identifiers, input.identifier_kind, &input.mailbox, &policy)
            .await?;
        Ok(batch_data(&input.account_id, &input.mailbox, results))
    }

    async fn peek_messages_impl(&self, input: PeekMessagesInput) -> AppResult<BatchData<PeekPayload>> {
        validate_account_id(&input.account_id)?;
        validate_mailbox(&input.mailbox)?;
        let identifiers = validate_identifiers(input.identifiers.into_vec())?;

        let engine = self.engine(&input.account_id)?;
        let results = engine
            .run(&identifiers, input.identifier_kind, &input.mailbox, &PeekPolicy)
            .await?;
        Ok(batch_data(&input.account_id, &input.mailbox, results))
    }

    async fn get_message_content_impl(
        &self,
        input: GetMessageContentInput,
    ) -> AppResult<ContentRecord> {
        validate_account_id(&input.account_id)?;
        validate_mailbox(&input.mailbox)?;
        validate_identifier(&input.identifier)?;

        let engine = self.engine(&input.account_id)?;
        let store = input
            .save_raw
            .then(|| AttachmentStore::from_config(&self.config));
        let content = engine
            .fetch_content(
                &input.identifier,
                input.identifier_kind,
                &input.mailbox,
                input.format,
                store.as_ref(),
            )
            .await?;

        Ok(ContentRecord {
            message_uri: build_message_uri(&input.account_id, &input.mailbox, content.uid),
            identifier: input.identifier,
            identifier_kind: input.identifier_kind,
            mailbox: input.mailbox,
            found: true,
            uid: content.uid,
            format: input.format,
            content: content.content,
            saved_path: content
                .saved
                .as_ref()
                .map(|s| s.path.display().to_string()),
            saved_size: content.saved.map(|s| s.size_bytes),
        })
    }

    /// Engine bound to one configured account
    fn engine(&self, account_id: &str) -> AppResult<SessionEngine<ImapConnector>> {
        let account = self.config.get_account(account_id)?;
        Ok(SessionEngine::new(ImapConnector::new(
            Arc::clone(&self.config),
            account.clone(),
        )))
    }
}

/// Wrap engine records as batch data and attach message URIs
fn batch_data<T: JsonSchema>(
    account_id: &str,
    mailbox: &str,
    mut results: Vec<ResultRecord<T>>,
) -> BatchData<T> {
    for record in &mut results {
        record.message_uri = record
            .uid
            .map(|uid| build_message_uri(account_id, mailbox, uid));
    }
    BatchData {
        account_id: account_id.to_owned(),
        mailbox: mailbox.to_owned(),
        total: results.len(),
        found: results.iter().filter(|r| r.found).count(),
        results,
    }
}

/// Calculate elapsed milliseconds
fn duration_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

/// Build a standardized MCP tool response envelope from business logic output
fn finalize_tool<T>(
    started: Instant,
    result: AppResult<(String, T)>,
) -> Result<Json<ToolEnvelope<T>>, ErrorData>
where
    T: JsonSchema,
{
    match result {
        Ok((summary, data)) => Ok(Json(ToolEnvelope {
            summary,
            data,
            meta: Meta::now(duration_ms(started)),
        })),
        Err(e) => Err(e.to_error_data()),
    }
}

/// Validate account_id format
fn validate_account_id(account_id: &str) -> AppResult<()> {
    if account_id.is_empty() || account_id.len() > 64 {
        return Err(AppError::InvalidInput(
            "account_id must be 1..64 characters".to_owned(),
        ));
    }
    if !account_id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
    {
        return Err(AppError::InvalidInput(
            "account_id must match [A-Za-z0-9_-]+".to_owned(),
        ));
    }
    Ok(())
}

/// Validate mailbox name format
fn validate_mailbox(mailbox: &str) -> AppResult<()> {
    if mailbox.is_empty() || mailbox.len() > 256 {
        return Err(AppError::InvalidInput(
            "mailbox must be 1..256 characters".to_owned(),
        ));
    }
    validate_no_controls(mailbox, "mailbox")?;
    Ok(())
}

/// Reject IMAP control characters in user-provided values
fn validate_no_controls(value: &str, field: &str) -> AppResult<()> {
    if value.chars().any(|ch| ch.is_ascii_control()) {
        return Err(AppError::InvalidInput(format!(
            "{field} must not contain control characters"
        )));
    }
    Ok(())
}

/// Validate text length in characters
fn validate_chars(value: &str, min: usize, max: usize, field: &str) -> AppResult<()> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(AppError::InvalidInput(format!(
            "{field} must be {min}..{max} characters"
        )));
    }
    Ok(())
}

/// Validate a single message identifier
fn validate_identifier(identifier: &str) -> AppResult<()> {
    validate_chars(identifier, 1, MAX_IDENTIFIER_CHARS, "identifier")?;
    validate_no_controls(identifier, "identifier")
}

/// Validate a batch of identifiers; duplicates are kept and processed twice
fn validate_identifiers(identifiers: Vec<String>) -> AppResult<Vec<String>> {
    if identifiers.is_empty() || identifiers.len() > MAX_BATCH_IDENTIFIERS {
        return Err(AppError::invalid(format!(
            "identifiers must contain 1..{MAX_BATCH_IDENTIFIERS} entries"
        )));
    }
    for identifier in &identifiers {
        validate_identifier(identifier)?;
    }
    Ok(identifiers)
}

/// Validate filter text fields before compiling
fn validate_filter(filter: Option<&AttachmentFilterInput>) -> AppResult<()> {
    let Some(filter) = filter else {
        return Ok(());
    };
    for (value, field) in [
        (&filter.filename, "filter.filename"),
        (&filter.filename_contains, "filter.filename_contains"),
        (&filter.filename_pattern, "filter.filename_pattern"),
    ] {
        if let Some(value) = value {
            validate_chars(value, 1, MAX_FILTER_TEXT_CHARS, field)?;
        }
    }
    if let Some(flags) = &filter.pattern_flags {
        validate_chars(flags, 0, 8, "filter.pattern_flags")?;
    }
    for content_type in filter.content_types.iter().flatten() {
        validate_chars(content_type, 1, MAX_FILTER_TEXT_CHARS, "filter.content_types")?;
        validate_no_controls(content_type, "filter.content_types")?;
        let trimmed = content_type.trim();
        if trimmed != "*" && !trimmed.contains('/') {
            return Err(AppError::invalid(format!(
                "filter.content_types entry '{trimmed}' must look like type/subtype or type/*"
            )));
        }
    }
    Ok(())
}

/// Build message URI for display
fn build_message_uri(account_id: &str, mailbox: &str, uid: u32) -> String {
    format!(
        "imap://{}/mailbox/{}/message/{}",
        account_id,
        urlencoding::encode(mailbox),
        uid
    )
}
