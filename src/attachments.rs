//! Attachment placement and materialization
//!
//! Small text-like attachments are returned inline; everything else is
//! written to the attachment directory under a random token and returned by
//! path. Names are unique per write, so concurrent requests sharing the
//! directory need no locking.

use std::borrow::Cow;
use std::path::PathBuf;

use tracing::debug;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::errors::{AppError, AppResult};
use crate::mime::AttachmentEntry;
use crate::render;
use crate::retrieve::RawMessage;

/// Where an attachment's content ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Content returned directly as text
    Inline(String),
    /// Content written to storage
    Saved(SavedFile),
}

/// A file written by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    pub path: PathBuf,
    pub size_bytes: usize,
}

/// Side-channel storage for attachment bytes
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    dir: PathBuf,
    inline_text_max_chars: usize,
}

impl AttachmentStore {
    pub fn new(dir: impl Into<PathBuf>, inline_text_max_chars: usize) -> Self {
        Self {
            dir: dir.into(),
            inline_text_max_chars,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.attachment_dir.clone(), config.inline_text_max_chars)
    }

    /// Decide inline vs. saved for one attachment and act on it
    ///
    /// # Errors
    ///
    /// - `Persistence` if the content had to be saved and the write failed
    pub async fn place(&self, uid: u32, entry: &AttachmentEntry) -> AppResult<Placement> {
        if let Some(text) =
            inline_text(&entry.content_type, &entry.content, self.inline_text_max_chars)
        {
            return Ok(Placement::Inline(text));
        }
        self.materialize(uid, entry).await.map(Placement::Saved)
    }

    /// Write attachment bytes to `<dir>/<token>_<sanitized filename>`
    pub async fn materialize(&self, uid: u32, entry: &AttachmentEntry) -> AppResult<SavedFile> {
        let name = entry
            .filename
            .as_deref()
            .map(sanitize_filename)
            .unwrap_or_else(|| format!("uid{uid}-attachment"));
        self.write(&name, &entry.content).await
    }

    /// Write a raw message to `<dir>/<token>_uid<uid>.eml`
    pub async fn save_raw(&self, raw: &RawMessage) -> AppResult<SavedFile> {
        self.write(&format!("uid{}.eml", raw.uid), raw.as_bytes())
            .await
    }

    async fn write(&self, name: &str, bytes: &[u8]) -> AppResult<SavedFile> {
        let path = self.dir.join(format!("{}_{name}", random_token()));
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            AppError::Persistence(format!("cannot create {}: {e}", self.dir.display()))
        })?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| AppError::Persistence(format!("cannot write {}: {e}", path.display())))?;
        debug!(path = %path.display(), size_bytes = bytes.len(), "saved content");
        Ok(SavedFile {
            path,
            size_bytes: bytes.len(),
        })
    }
}

/// Inline text for `content`, if its type is eligible and it is short enough
///
/// Length is counted in characters after lossy UTF-8 decoding.
pub fn inline_text(content_type: &str, content: &[u8], max_chars: usize) -> Option<String> {
    if !render::is_inline_eligible(content_type) {
        return None;
    }
    let text = String::from_utf8_lossy(content);
    if text.chars().count() < max_chars {
        Some(Cow::into_owned(text))
    } else {
        None
    }
}

/// Replace path separators so the name cannot escape the storage directory
pub fn sanitize_filename(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}

/// 128-bit random token from the OS CSPRNG, as 32 lowercase hex chars
fn random_token() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::{AttachmentStore, Placement, inline_text, sanitize_filename};
    use crate::errors::AppError;
    use crate::mime::AttachmentEntry;

    fn entry(filename: Option<&str>, content_type: &str, content: Vec<u8>) -> AttachmentEntry {
        AttachmentEntry {
            filename: filename.map(str::to_owned),
            content_type: content_type.to_owned(),
            size_bytes: content.len(),
            content,
            disposition: Some("attachment".to_owned()),
            content_id: None,
        }
    }

    #[test]
    fn inline_boundary_is_exclusive() {
        let below = "é".repeat(999);
        assert_eq!(
            inline_text("text/plain", below.as_bytes(), 1_000).as_deref(),
            Some(below.as_str())
        );
        let at_limit = "a".repeat(1_000);
        assert_eq!(inline_text("text/plain", at_limit.as_bytes(), 1_000), None);
    }

    #[test]
    fn non_text_types_never_inline() {
        assert_eq!(inline_text("application/pdf", b"%PDF", 1_000), None);
        assert_eq!(inline_text("image/png", b"", 1_000), None);
        assert_eq!(
            inline_text("application/json", b"{\"a\":1}", 1_000).as_deref(),
            Some("{\"a\":1}")
        );
    }

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize_filename("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize_filename(r"C:\temp\a.txt"), "C:_temp_a.txt");
    }

    #[tokio::test]
    async fn materialized_bytes_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AttachmentStore::new(dir.path(), 1_000);
        let content: Vec<u8> = (0..=255u8).cycle().take(4_096).collect();
        let pdf = entry(Some("nested/report.pdf"), "application/pdf", content.clone());

        let placement = store.place(7, &pdf).await.expect("placement succeeds");
        let Placement::Saved(saved) = placement else {
            panic!("pdf must be saved, got {placement:?}");
        };
        assert_eq!(saved.size_bytes, content.len());
        assert_eq!(saved.path.parent(), Some(dir.path()));
        let name = saved
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .expect("utf-8 file name");
        assert!(name.ends_with("_nested_report.pdf"), "{name}");
        assert_eq!(std::fs::read(&saved.path).expect("readable"), content);
    }

    #[tokio::test]
    async fn long_text_is_saved_and_unnamed_entries_use_uid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AttachmentStore::new(dir.path(), 1_000);
        let long = entry(None, "text/plain", "x".repeat(1_000).into_bytes());

        let Placement::Saved(saved) = store.place(42, &long).await.expect("saved") else {
            panic!("long text must be saved");
        };
        let name = saved.path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        assert!(name.ends_with("_uid42-attachment"), "{name}");

        let short = entry(Some("notes.md"), "text/markdown", b"# hi".to_vec());
        assert_eq!(
            store.place(42, &short).await.expect("inline"),
            Placement::Inline("# hi".to_owned())
        );
    }

    #[tokio::test]
    async fn repeated_writes_never_collide() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AttachmentStore::new(dir.path(), 1_000);
        let png = entry(Some("logo.png"), "image/png", vec![1, 2, 3]);
        let first = store.materialize(1, &png).await.expect("first write");
        let second = store.materialize(1, &png).await.expect("second write");
        assert_ne!(first.path, second.path);
    }

    #[tokio::test]
    async fn write_failure_is_persistence_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").expect("create blocker");
        let store = AttachmentStore::new(&blocker, 1_000);
        let png = entry(Some("logo.png"), "image/png", vec![1, 2, 3]);
        let err = store.place(1, &png).await.expect_err("must fail");
        assert!(matches!(err, AppError::Persistence(_)));
    }
}
