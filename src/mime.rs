//! Message parsing and MIME handling
//!
//! Decodes raw RFC822 bytes using `mailparse` into headers, body variants,
//! and an ordered list of attachment entries carrying their decoded bytes.

use std::collections::BTreeMap;

use mailparse::{DispositionType, MailHeader, MailHeaderMap, ParsedMail};

use crate::errors::{AppError, AppResult};
use crate::render;

/// Decoded message representation
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    /// Parsed Date header
    pub date: Option<String>,
    /// Parsed From header
    pub from: Option<String>,
    /// Parsed To header
    pub to: Option<String>,
    /// Parsed Cc header
    pub cc: Option<String>,
    /// Parsed Subject header
    pub subject: Option<String>,
    /// Message-ID header, as written by the sender
    pub message_id: Option<String>,
    /// First plain text body part
    pub body_text: Option<String>,
    /// First HTML body part, unsanitized
    pub body_html: Option<String>,
    /// Attachments in MIME tree order
    pub attachments: Vec<AttachmentEntry>,
}

impl DecodedMessage {
    /// Plain text body rendered as minimal HTML
    pub fn text_as_html(&self) -> Option<String> {
        self.body_text.as_deref().map(render::text_to_html)
    }
}

/// One attachment with its transfer-decoded content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentEntry {
    /// Filename from Content-Disposition or Content-Type `name`
    pub filename: Option<String>,
    /// Lowercased MIME type (e.g. `application/pdf`)
    pub content_type: String,
    /// Decoded bytes
    pub content: Vec<u8>,
    /// Decoded size in bytes
    pub size_bytes: usize,
    /// Disposition type if a Content-Disposition header was present
    pub disposition: Option<String>,
    /// Content-ID header value
    pub content_id: Option<String>,
}

/// Decode an RFC822 message
///
/// # Errors
///
/// - `Decode` if `mailparse` rejects the message or an attachment body
pub fn decode_message(raw: &[u8]) -> AppResult<DecodedMessage> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| AppError::Decode(format!("failed to parse RFC822 message: {e}")))?;

    let headers = parse_all_headers(raw)?;
    let mut body_text = None;
    let mut body_html = None;
    let mut attachments = Vec::new();

    walk_parts(&parsed, &mut body_text, &mut body_html, &mut attachments)?;

    let header_map = to_header_map(&headers);
    Ok(DecodedMessage {
        date: header_map.get("date").cloned(),
        from: header_map.get("from").cloned(),
        to: header_map.get("to").cloned(),
        cc: header_map.get("cc").cloned(),
        subject: header_map.get("subject").cloned(),
        message_id: header_map.get("message-id").cloned(),
        body_text,
        body_html,
        attachments,
    })
}

/// Walk MIME part tree recursively
///
/// The first non-attachment `text/plain` and `text/html` leaves become the
/// bodies. Any leaf that is explicitly an attachment, carries a filename, or
/// is not a text body type is collected as an attachment.
fn walk_parts(
    part: &ParsedMail<'_>,
    body_text: &mut Option<String>,
    body_html: &mut Option<String>,
    attachments: &mut Vec<AttachmentEntry>,
) -> AppResult<()> {
    if part.subparts.is_empty() {
        let ctype = part.ctype.mimetype.to_ascii_lowercase();
        let disp = part.get_content_disposition();
        let filename = attachment_filename(part, &disp.params);
        let is_body_type = ctype == "text/plain" || ctype == "text/html";
        let is_attachment = disp.disposition == DispositionType::Attachment
            || filename.is_some()
            || !is_body_type;

        if !is_attachment {
            if ctype == "text/plain"
                && body_text.is_none()
                && let Ok(text) = part.get_body()
            {
                *body_text = Some(text);
            }

            if ctype == "text/html"
                && body_html.is_none()
                && let Ok(html) = part.get_body()
            {
                *body_html = Some(html);
            }
            return Ok(());
        }

        let content = part
            .get_body_raw()
            .map_err(|e| AppError::Decode(format!("failed decoding attachment body: {e}")))?;
        let disposition = part
            .headers
            .get_first_header("Content-Disposition")
            .map(|_| disposition_name(&disp.disposition));

        attachments.push(AttachmentEntry {
            filename,
            content_type: ctype,
            size_bytes: content.len(),
            content,
            disposition,
            content_id: part.headers.get_first_value("Content-ID"),
        });
        return Ok(());
    }

    for sub in &part.subparts {
        walk_parts(sub, body_text, body_html, attachments)?;
    }
    Ok(())
}

fn disposition_name(disposition: &DispositionType) -> String {
    match disposition {
        DispositionType::Inline => "inline".to_owned(),
        DispositionType::Attachment => "attachment".to_owned(),
        DispositionType::FormData => "form-data".to_owned(),
        DispositionType::Extension(other) => other.to_ascii_lowercase(),
    }
}

/// Extract attachment filename from part
///
/// Checks Content-Disposition parameter first, falls back to Content-Type
/// name parameter. Blank names count as absent.
fn attachment_filename(
    part: &ParsedMail<'_>,
    disp_params: &BTreeMap<String, String>,
) -> Option<String> {
    disp_params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
        .filter(|name| !name.trim().is_empty())
}

/// Parse all headers from raw message
fn parse_all_headers(raw: &[u8]) -> AppResult<Vec<(String, String)>> {
    let (headers, _) = mailparse::parse_headers(raw)
        .map_err(|e| AppError::Decode(format!("failed to parse message headers: {e}")))?;
    Ok(to_tuples(headers))
}

/// Convert mailparse headers to tuples
fn to_tuples(headers: Vec<MailHeader<'_>>) -> Vec<(String, String)> {
    headers
        .into_iter()
        .map(|h| (h.get_key(), h.get_value()))
        .collect()
}

/// Convert header tuples to case-insensitive map
///
/// Returns first value for each header key (case-insensitive).
fn to_header_map(headers: &[(String, String)]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (k, v) in headers {
        let key = k.to_ascii_lowercase();
        map.entry(key).or_insert_with(|| v.clone());
    }
    map
}
