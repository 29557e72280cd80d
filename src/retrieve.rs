//! Raw message retrieval
//!
//! Drives one fetch exchange to its terminal signal and assembles the body
//! chunks into a single buffer.

use futures::StreamExt;

use crate::errors::{AppError, AppResult};
use crate::imap::{FetchEvent, MailSession};

/// Message bytes exactly as delivered by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub uid: u32,
    bytes: Vec<u8>,
}

impl RawMessage {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Fetch the full message for `uid` without marking it read
///
/// # Errors
///
/// - `NotFound` if the exchange ends without reporting any message
/// - `Transport` (or `Timeout`) if the exchange fails before its end; the
///   first error is returned after the remaining events are drained
pub async fn fetch_raw<S: MailSession>(session: &mut S, uid: u32) -> AppResult<RawMessage> {
    let mut events = session.fetch_message(uid).await?;
    let mut found = 0usize;
    let mut bytes = Vec::new();
    let mut failure = None;

    // the exchange is read to its end even after an error so the next
    // command on this session does not see leftover responses
    while let Some(event) = events.next().await {
        match event {
            Ok(_) if failure.is_some() => {}
            Ok(FetchEvent::Found) => found += 1,
            Ok(FetchEvent::Chunk(chunk)) => bytes.extend_from_slice(&chunk),
            Err(e) => {
                failure.get_or_insert(e);
            }
        }
    }

    if let Some(e) = failure {
        return Err(e);
    }
    if found == 0 {
        return Err(AppError::NotFound(format!("message uid {uid} not found")));
    }
    Ok(RawMessage { uid, bytes })
}
