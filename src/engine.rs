//! Mailbox session engine
//!
//! Runs resolve → fetch → decode → policy for each identifier inside one
//! session. Session establishment failures (connect, login, mailbox open)
//! abort the whole operation; anything that goes wrong for a single
//! identifier is recorded in that identifier's result and the batch moves on.
//! Identifiers are processed strictly in order, one exchange at a time.

use std::future::Future;

use schemars::JsonSchema;
use tracing::{debug, info, warn};

use crate::attachments::{AttachmentStore, Placement, SavedFile};
use crate::errors::AppResult;
use crate::filter::{self, AttachmentFilter};
use crate::identifier::{self, IdentifierKind};
use crate::imap::{Connector, MailSession};
use crate::mime::{self, DecodedMessage};
use crate::models::{
    AttachmentDelivery, AttachmentResult, AttachmentSummary, AttachmentsPayload, ContentFormat,
    PeekPayload, ResultRecord,
};
use crate::render;
use crate::retrieve::{self, RawMessage};

/// What to produce from each decoded message in a batch
pub trait MessagePolicy: Sync {
    /// Per-identifier success payload
    type Output: JsonSchema + Send;

    fn apply(
        &self,
        uid: u32,
        message: DecodedMessage,
    ) -> impl Future<Output = AppResult<Self::Output>> + Send;
}

/// Select attachments with the filter and place each one
pub struct DownloadPolicy<'a> {
    pub filter: Option<&'a AttachmentFilter>,
    pub store: &'a AttachmentStore,
}

impl MessagePolicy for DownloadPolicy<'_> {
    type Output = AttachmentsPayload;

    /// A failed write marks only that attachment as failed.
    async fn apply(&self, uid: u32, message: DecodedMessage) -> AppResult<AttachmentsPayload> {
        let selected = filter::select(self.filter, &message.attachments);
        let mut attachments = Vec::with_capacity(selected.len());
        for entry in selected {
            let delivery = match self.store.place(uid, entry).await {
                Ok(Placement::Inline(content)) => AttachmentDelivery::Inline { content },
                Ok(Placement::Saved(saved)) => AttachmentDelivery::Saved {
                    path: saved.path.display().to_string(),
                },
                Err(e) => {
                    warn!(uid, filename = ?entry.filename, error = %e, "attachment not saved");
                    AttachmentDelivery::Failed {
                        error: e.to_string(),
                    }
                }
            };
            attachments.push(AttachmentResult {
                filename: entry.filename.clone(),
                content_type: entry.content_type.clone(),
                size_bytes: entry.size_bytes,
                disposition: entry.disposition.clone(),
                content_id: entry.content_id.clone(),
                delivery,
            });
        }
        Ok(AttachmentsPayload { attachments })
    }
}

/// Summarize headers, bodies, and attachments without saving anything
pub struct PeekPolicy;

impl MessagePolicy for PeekPolicy {
    type Output = PeekPayload;

    async fn apply(&self, _uid: u32, message: DecodedMessage) -> AppResult<PeekPayload> {
        Ok(peek_payload(message))
    }
}

fn peek_payload(message: DecodedMessage) -> PeekPayload {
    let attachments = message
        .attachments
        .into_iter()
        .map(|a| AttachmentSummary {
            filename: a.filename,
            content_type: a.content_type,
            size_bytes: a.size_bytes,
            disposition: a.disposition,
            content_id: a.content_id,
        })
        .collect();
    PeekPayload {
        subject: message.subject,
        from: message.from,
        to: message.to,
        cc: message.cc,
        date: message.date,
        message_id: message.message_id,
        has_html: message.body_html.is_some(),
        has_text: message.body_text.is_some(),
        html_size: message.body_html.as_ref().map_or(0, String::len),
        text_size: message.body_text.as_ref().map_or(0, String::len),
        attachments,
    }
}

/// Body retrieved for a single identifier
#[derive(Debug, Clone)]
pub struct MessageContent {
    pub uid: u32,
    pub content: String,
    pub saved: Option<SavedFile>,
}

/// Orchestrates one session per operation
#[derive(Debug, Clone)]
pub struct SessionEngine<C> {
    connector: C,
}

impl<C: Connector> SessionEngine<C> {
    pub fn new(connector: C) -> Self {
        Self { connector }
    }

    /// Run a batch, one result per identifier in input order
    ///
    /// # Errors
    ///
    /// Only session-level failures: connect, login, or mailbox open.
    pub async fn run<P: MessagePolicy>(
        &self,
        identifiers: &[String],
        kind: IdentifierKind,
        mailbox: &str,
        policy: &P,
    ) -> AppResult<Vec<ResultRecord<P::Output>>> {
        let mut session = self.open(mailbox).await?;

        let mut records = Vec::with_capacity(identifiers.len());
        for identifier in identifiers {
            let outcome = process_one(&mut session, identifier, kind, policy).await;
            if let Err(e) = &outcome {
                warn!(identifier = %identifier, kind = kind.as_str(), error = %e, "identifier failed");
            }
            records.push(to_record(identifier, kind, mailbox, outcome));
        }

        close_session(session).await;
        info!(
            mailbox,
            total = records.len(),
            found = records.iter().filter(|r| r.found).count(),
            "batch completed"
        );
        Ok(records)
    }

    /// Retrieve one message body in the requested format
    ///
    /// Any failure, including an unresolvable identifier, is returned as an
    /// error.
    pub async fn fetch_content(
        &self,
        identifier: &str,
        kind: IdentifierKind,
        mailbox: &str,
        format: ContentFormat,
        save_raw_to: Option<&AttachmentStore>,
    ) -> AppResult<MessageContent> {
        let mut session = self.open(mailbox).await?;
        let outcome = content_for(&mut session, identifier, kind, format, save_raw_to).await;
        close_session(session).await;
        outcome
    }

    /// Connect, authenticate, and open the mailbox read-only
    ///
    /// The session is closed before returning if the mailbox cannot be opened.
    async fn open(&self, mailbox: &str) -> AppResult<C::Session> {
        let mut session = self.connector.connect().await?;
        if let Err(e) = session.open_mailbox(mailbox).await {
            close_session(session).await;
            return Err(e);
        }
        debug!(mailbox, "mailbox opened read-only");
        Ok(session)
    }
}

async fn process_one<S: MailSession, P: MessagePolicy>(
    session: &mut S,
    identifier: &str,
    kind: IdentifierKind,
    policy: &P,
) -> AppResult<(u32, P::Output)> {
    let uid = identifier::resolve(session, identifier, kind).await?;
    let raw = retrieve::fetch_raw(session, uid).await?;
    let message = mime::decode_message(raw.as_bytes())?;
    let output = policy.apply(uid, message).await?;
    Ok((uid, output))
}

async fn content_for<S: MailSession>(
    session: &mut S,
    identifier: &str,
    kind: IdentifierKind,
    format: ContentFormat,
    save_raw_to: Option<&AttachmentStore>,
) -> AppResult<MessageContent> {
    let uid = identifier::resolve(session, identifier, kind).await?;
    let raw = retrieve::fetch_raw(session, uid).await?;
    let content = render_content(&raw, format)?;
    let saved = match save_raw_to {
        Some(store) => Some(store.save_raw(&raw).await?),
        None => None,
    };
    Ok(MessageContent {
        uid,
        content,
        saved,
    })
}

/// Render a raw message in the requested representation
///
/// `html` falls back to the plain text rendered as HTML; `text` falls back to
/// text derived from the HTML body. A message with neither yields "".
pub fn render_content(raw: &RawMessage, format: ContentFormat) -> AppResult<String> {
    if format == ContentFormat::Raw {
        return Ok(String::from_utf8_lossy(raw.as_bytes()).into_owned());
    }

    let message = mime::decode_message(raw.as_bytes())?;
    let rendered = match format {
        ContentFormat::Html => message
            .body_html
            .as_deref()
            .map(ammonia::clean)
            .or_else(|| message.text_as_html()),
        _ => message
            .body_text
            .clone()
            .or_else(|| message.body_html.as_deref().map(render::html_to_text)),
    };
    Ok(rendered.unwrap_or_default())
}

fn to_record<T: JsonSchema>(
    identifier: &str,
    kind: IdentifierKind,
    mailbox: &str,
    outcome: AppResult<(u32, T)>,
) -> ResultRecord<T> {
    let (found, uid, payload, error) = match outcome {
        Ok((uid, payload)) => (true, Some(uid), Some(payload), None),
        Err(e) => (false, None, None, Some(e.to_string())),
    };
    ResultRecord {
        identifier: identifier.to_owned(),
        identifier_kind: kind,
        mailbox: mailbox.to_owned(),
        found,
        uid,
        message_uri: None,
        payload,
        error,
    }
}

async fn close_session<S: MailSession>(session: S) {
    if let Err(e) = session.close().await {
        warn!(error = %e, "failed to close IMAP session");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::{Arc, Mutex};

    use futures::stream::{self, StreamExt};

    use super::{DownloadPolicy, PeekPolicy, SessionEngine};
    use crate::attachments::AttachmentStore;
    use crate::errors::{AppError, AppResult};
    use crate::filter::AttachmentFilter;
    use crate::identifier::IdentifierKind;
    use crate::imap::{Connector, FETCH_ITEMS, FetchEvent, FetchEvents, MailSession};
    use crate::models::{AttachmentDelivery, AttachmentFilterInput, ContentFormat};

    const WITH_ATTACHMENTS: &str = "From: a@example.com\r\n\
To: b@example.com\r\n\
Subject: Files\r\n\
Message-ID: <a@b>\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain\r\n\
\r\n\
Two files attached.\r\n\
--b1\r\n\
Content-Type: text/plain; name=\"notes.txt\"\r\n\
Content-Disposition: attachment; filename=\"notes.txt\"\r\n\
\r\n\
short note\r\n\
--b1\r\n\
Content-Type: application/pdf; name=\"report.pdf\"\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQK/wA=\r\n\
--b1--\r\n";

    const HTML_ONLY: &str = "From: a@example.com\r\n\
Subject: Newsletter\r\n\
Message-ID: news-1@example.com\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<html><body><p>Hello &amp; welcome</p><script>track()</script></body></html>";

    #[derive(Debug, Default)]
    struct State {
        /// mailbox → uid → (message-id, raw)
        mailboxes: BTreeMap<String, BTreeMap<u32, (String, Vec<u8>)>>,
        seen: BTreeSet<u32>,
        searches: Vec<String>,
        fetches: Vec<u32>,
        closed: usize,
        refuse_login: bool,
        fail_search_for: Option<String>,
    }

    #[derive(Clone, Default)]
    struct FakeStore(Arc<Mutex<State>>);

    impl FakeStore {
        fn with_inbox(messages: &[(u32, &str, &str)]) -> Self {
            let store = Self::default();
            {
                let mut state = store.state();
                let inbox = state.mailboxes.entry("INBOX".to_owned()).or_default();
                for (uid, id, raw) in messages {
                    inbox.insert(*uid, ((*id).to_owned(), raw.as_bytes().to_vec()));
                }
            }
            store
        }

        fn state(&self) -> std::sync::MutexGuard<'_, State> {
            self.0.lock().expect("state lock")
        }
    }

    impl Connector for FakeStore {
        type Session = FakeSession;

        async fn connect(&self) -> AppResult<FakeSession> {
            if self.state().refuse_login {
                return Err(AppError::AuthFailed("LOGIN rejected".to_owned()));
            }
            Ok(FakeSession {
                store: self.clone(),
                mailbox: None,
            })
        }
    }

    struct FakeSession {
        store: FakeStore,
        mailbox: Option<String>,
    }

    impl MailSession for FakeSession {
        async fn open_mailbox(&mut self, mailbox: &str) -> AppResult<()> {
            let state = self.store.state();
            if !state.mailboxes.contains_key(mailbox) {
                return Err(AppError::MailboxOpen(format!("'{mailbox}': NO no such mailbox")));
            }
            self.mailbox = Some(mailbox.to_owned());
            Ok(())
        }

        /// Exact header comparison, like stores that do not substring-match
        async fn search_header(&mut self, header: &str, value: &str) -> AppResult<Vec<u32>> {
            assert_eq!(header, "Message-ID");
            let mut state = self.store.state();
            state.searches.push(value.to_owned());
            if state.fail_search_for.as_deref() == Some(value) {
                return Err(AppError::Transport("uid search failed: BAD".to_owned()));
            }
            let mailbox = self.mailbox.as_deref().expect("mailbox open");
            Ok(state.mailboxes[mailbox]
                .iter()
                .filter(|(_, (id, _))| id == value)
                .map(|(uid, _)| *uid)
                .collect())
        }

        async fn fetch_message(&mut self, uid: u32) -> AppResult<FetchEvents<'_>> {
            let mut state = self.store.state();
            state.fetches.push(uid);
            let mailbox = self.mailbox.as_deref().expect("mailbox open");
            let events = match state.mailboxes[mailbox].get(&uid) {
                Some((_, raw)) => {
                    let (head, tail) = raw.split_at(raw.len() / 2);
                    vec![
                        Ok(FetchEvent::Found),
                        Ok(FetchEvent::Chunk(head.to_vec())),
                        Ok(FetchEvent::Chunk(tail.to_vec())),
                    ]
                }
                None => Vec::new(),
            };
            // a non-PEEK body fetch sets \Seen, as a real server would
            if !events.is_empty() && !FETCH_ITEMS.contains(".PEEK[") {
                state.seen.insert(uid);
            }
            Ok(stream::iter(events).boxed())
        }

        async fn close(self) -> AppResult<()> {
            self.store.state().closed += 1;
            Ok(())
        }
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_owned()).collect()
    }

    #[tokio::test]
    async fn batch_keeps_order_and_isolates_missing_identifier() {
        let store = FakeStore::with_inbox(&[(10, "<a@b>", WITH_ATTACHMENTS)]);
        let dir = tempfile::tempdir().expect("tempdir");
        let attachments = AttachmentStore::new(dir.path(), 1_000);
        let engine = SessionEngine::new(store.clone());
        let policy = DownloadPolicy {
            filter: None,
            store: &attachments,
        };

        let records = engine
            .run(&ids(&["<a@b>", "notfound@x"]), IdentifierKind::Address, "INBOX", &policy)
            .await
            .expect("batch runs");

        assert_eq!(records.len(), 2);
        let first = &records[0];
        assert!(first.found);
        assert_eq!(first.uid, Some(10));
        let payload = first.payload.as_ref().expect("payload");
        assert_eq!(payload.attachments.len(), 2);
        let AttachmentDelivery::Inline { content } = &payload.attachments[0].delivery else {
            panic!("short text must be inline");
        };
        assert_eq!(content.trim_end(), "short note");
        let AttachmentDelivery::Saved { path } = &payload.attachments[1].delivery else {
            panic!("pdf must be saved");
        };
        assert_eq!(
            std::fs::read(path).expect("saved file"),
            b"%PDF-1.4\n\xff\x00"
        );

        let second = &records[1];
        assert!(!second.found);
        assert!(second.payload.is_none());
        assert!(second.error.as_deref().is_some_and(|e| e.contains("notfound@x")));

        let state = store.state();
        assert_eq!(state.searches, vec!["<a@b>", "<notfound@x>", "notfound@x"]);
        assert_eq!(state.closed, 1);
        assert_eq!(state.fetches, vec![10]);
        assert!(state.seen.is_empty(), "download must not mark messages read");
    }

    #[tokio::test]
    async fn unbracketed_store_value_is_found_on_second_candidate() {
        let store = FakeStore::with_inbox(&[(3, "news-1@example.com", HTML_ONLY)]);
        let engine = SessionEngine::new(store.clone());

        let records = engine
            .run(&ids(&["news-1@example.com"]), IdentifierKind::Address, "INBOX", &PeekPolicy)
            .await
            .expect("batch runs");

        assert_eq!(records[0].uid, Some(3));
        assert_eq!(
            store.state().searches,
            vec!["<news-1@example.com>", "news-1@example.com"]
        );
    }

    #[tokio::test]
    async fn invalid_uids_never_reach_the_store() {
        let store = FakeStore::with_inbox(&[(1, "<a@b>", WITH_ATTACHMENTS)]);
        let engine = SessionEngine::new(store.clone());

        let records = engine
            .run(&ids(&["abc", "0", "-1", "1", "1", "99"]), IdentifierKind::Handle, "INBOX", &PeekPolicy)
            .await
            .expect("batch runs");

        let found: Vec<bool> = records.iter().map(|r| r.found).collect();
        assert_eq!(found, vec![false, false, false, true, true, false]);
        let state = store.state();
        assert!(state.searches.is_empty());
        assert_eq!(state.fetches, vec![1, 1, 99]);
    }

    #[tokio::test]
    async fn search_failure_is_recorded_and_batch_continues() {
        let store = FakeStore::with_inbox(&[(10, "<a@b>", WITH_ATTACHMENTS)]);
        store.state().fail_search_for = Some("<broken@x>".to_owned());
        let engine = SessionEngine::new(store.clone());

        let records = engine
            .run(&ids(&["broken@x", "a@b"]), IdentifierKind::Address, "INBOX", &PeekPolicy)
            .await
            .expect("batch runs");

        assert!(!records[0].found);
        assert!(records[0].error.as_deref().is_some_and(|e| e.starts_with("transport error")));
        assert!(records[1].found);
        // transport errors are not retried with the unbracketed form
        assert_eq!(store.state().searches, vec!["<broken@x>", "<a@b>"]);
    }

    #[tokio::test]
    async fn session_failures_abort_and_close() {
        let store = FakeStore::with_inbox(&[(10, "<a@b>", WITH_ATTACHMENTS)]);
        let engine = SessionEngine::new(store.clone());

        let err = engine
            .run(&ids(&["<a@b>"]), IdentifierKind::Address, "Archive", &PeekPolicy)
            .await
            .expect_err("mailbox open must fail");
        assert!(matches!(err, AppError::MailboxOpen(_)));
        assert_eq!(store.state().closed, 1);
        assert!(store.state().searches.is_empty());

        store.state().refuse_login = true;
        let err = engine
            .run(&ids(&["<a@b>"]), IdentifierKind::Address, "INBOX", &PeekPolicy)
            .await
            .expect_err("login must fail");
        assert!(matches!(err, AppError::AuthFailed(_)));
    }

    #[tokio::test]
    async fn peek_reports_metadata_and_leaves_flags_alone() {
        let store = FakeStore::with_inbox(&[(10, "<a@b>", WITH_ATTACHMENTS)]);
        let engine = SessionEngine::new(store.clone());

        for _ in 0..3 {
            let records = engine
                .run(&ids(&["<a@b>"]), IdentifierKind::Address, "INBOX", &PeekPolicy)
                .await
                .expect("peek runs");
            let peek = records[0].payload.as_ref().expect("payload");
            assert_eq!(peek.subject.as_deref(), Some("Files"));
            assert_eq!(peek.message_id.as_deref(), Some("<a@b>"));
            assert!(peek.has_text);
            assert!(!peek.has_html);
            assert_eq!(peek.attachments.len(), 2);
            assert_eq!(peek.attachments[1].size_bytes, 11);
        }
        assert!(store.state().seen.is_empty());
    }

    #[tokio::test]
    async fn filter_selects_subset() {
        let store = FakeStore::with_inbox(&[(10, "<a@b>", WITH_ATTACHMENTS)]);
        let dir = tempfile::tempdir().expect("tempdir");
        let attachments = AttachmentStore::new(dir.path(), 1_000);
        let filter = AttachmentFilter::compile(Some(&AttachmentFilterInput {
            content_types: Some(vec!["application/*".to_owned()]),
            ..Default::default()
        }))
        .expect("filter compiles");
        let policy = DownloadPolicy {
            filter: filter.as_ref(),
            store: &attachments,
        };
        let engine = SessionEngine::new(store);

        let records = engine
            .run(&ids(&["10"]), IdentifierKind::Handle, "INBOX", &policy)
            .await
            .expect("batch runs");
        let payload = records[0].payload.as_ref().expect("payload");
        assert_eq!(payload.attachments.len(), 1);
        assert_eq!(payload.attachments[0].filename.as_deref(), Some("report.pdf"));
    }

    #[tokio::test]
    async fn content_derives_text_from_html_and_saves_raw() {
        let store = FakeStore::with_inbox(&[(3, "news-1@example.com", HTML_ONLY)]);
        let dir = tempfile::tempdir().expect("tempdir");
        let attachments = AttachmentStore::new(dir.path(), 1_000);
        let engine = SessionEngine::new(store.clone());

        let content = engine
            .fetch_content("3", IdentifierKind::Handle, "INBOX", ContentFormat::Text, Some(&attachments))
            .await
            .expect("content");
        assert_eq!(content.uid, 3);
        assert_eq!(content.content, "Hello & welcome");
        let saved = content.saved.expect("raw saved");
        assert_eq!(saved.size_bytes, HTML_ONLY.len());
        assert_eq!(std::fs::read(&saved.path).expect("saved"), HTML_ONLY.as_bytes());
        assert!(
            saved
                .path
                .to_string_lossy()
                .ends_with("_uid3.eml")
        );

        let html = engine
            .fetch_content("3", IdentifierKind::Handle, "INBOX", ContentFormat::Html, None)
            .await
            .expect("content");
        assert!(html.content.contains("Hello &amp; welcome"));
        assert!(!html.content.contains("track()"));
        assert!(html.saved.is_none());
        assert_eq!(store.state().closed, 2);
    }

    #[tokio::test]
    async fn content_failure_propagates() {
        let store = FakeStore::with_inbox(&[(3, "news-1@example.com", HTML_ONLY)]);
        let engine = SessionEngine::new(store.clone());

        let err = engine
            .fetch_content("<missing@x>", IdentifierKind::Address, "INBOX", ContentFormat::Raw, None)
            .await
            .expect_err("must fail");
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(store.state().closed, 1);
    }
}
