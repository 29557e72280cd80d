//! IMAP transport and session operations
//!
//! Defines the transport seam used by the session engine ([`Connector`] and
//! [`MailSession`]) and its production implementation over `async-imap`. All
//! network calls are enforced to use TLS, and timeouts are derived from server
//! config. Timeouts live here, not in the engine.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_imap::{Client, Session};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use rustls::ClientConfig;
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::{AccountConfig, ServerConfig};
use crate::errors::{AppError, AppResult};

/// Fetch items for message retrieval; `PEEK` keeps `\Seen` unchanged
pub const FETCH_ITEMS: &str = "BODY.PEEK[]";

/// Type alias for authenticated IMAP session over TLS
pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

/// One signal of a fetch exchange
///
/// A fetch produces `Found` for each message the store reports, each followed
/// by the message body bytes. Stream exhaustion is the terminal "end" signal
/// and an `Err` item is the terminal "error" signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    /// The store reported a message for the requested UID
    Found,
    /// A chunk of message body bytes, in delivery order
    Chunk(Vec<u8>),
}

/// Event stream produced by a single fetch exchange
pub type FetchEvents<'a> = BoxStream<'a, AppResult<FetchEvent>>;

/// Opens authenticated sessions against one mail store
///
/// Implementations carry their own (immutable) connection settings so that
/// independent engines never share ambient state.
pub trait Connector: Send + Sync {
    /// Session type produced by a successful connect + login
    type Session: MailSession;

    /// Connect and authenticate
    ///
    /// Fails with `Connection`/`Timeout` for transport problems and
    /// `AuthFailed` when the store rejects the credentials.
    fn connect(&self) -> impl Future<Output = AppResult<Self::Session>> + Send;
}

/// A single authenticated session
///
/// Every method takes `&mut self`, so at most one exchange is outstanding at a
/// time.
pub trait MailSession: Send {
    /// Open a mailbox read-only; fails with `MailboxOpen`
    fn open_mailbox(&mut self, mailbox: &str) -> impl Future<Output = AppResult<()>> + Send;

    /// Search the open mailbox by header value, returning UIDs in ascending order
    fn search_header(
        &mut self,
        header: &str,
        value: &str,
    ) -> impl Future<Output = AppResult<Vec<u32>>> + Send;

    /// Start a non-destructive full-body fetch for one UID
    fn fetch_message(
        &mut self,
        uid: u32,
    ) -> impl Future<Output = AppResult<FetchEvents<'_>>> + Send;

    /// Log out and drop the connection
    fn close(self) -> impl Future<Output = AppResult<()>> + Send;
}

/// Get socket timeout duration from server config
fn socket_timeout(server: &ServerConfig) -> Duration {
    Duration::from_millis(server.socket_timeout_ms)
}

/// Production connector for one configured account
#[derive(Debug, Clone)]
pub struct ImapConnector {
    config: Arc<ServerConfig>,
    account: AccountConfig,
}

impl ImapConnector {
    pub fn new(config: Arc<ServerConfig>, account: AccountConfig) -> Self {
        Self { config, account }
    }
}

impl Connector for ImapConnector {
    type Session = ImapMailSession;

    async fn connect(&self) -> AppResult<ImapMailSession> {
        let session = connect_authenticated(&self.config, &self.account).await?;
        debug!(account_id = %self.account.account_id, "IMAP session authenticated");
        Ok(ImapMailSession {
            config: Arc::clone(&self.config),
            session,
        })
    }
}

/// Authenticated `async-imap` session bound to its server config
pub struct ImapMailSession {
    config: Arc<ServerConfig>,
    session: ImapSession,
}

impl MailSession for ImapMailSession {
    /// Uses `EXAMINE` so nothing done in this session can change flags.
    /// Mailbox names are encoded as modified UTF-7 on the wire.
    async fn open_mailbox(&mut self, mailbox: &str) -> AppResult<()> {
        let encoded = utf7_imap::encode_utf7_imap(mailbox.to_owned());
        timeout(
            socket_timeout(&self.config),
            self.session.examine(encoded.as_str()),
        )
        .await
        .map_err(|_| AppError::Timeout(format!("EXAMINE timed out for mailbox '{mailbox}'")))
        .and_then(|r| r.map_err(|e| AppError::MailboxOpen(format!("'{mailbox}': {e}"))))?;
        Ok(())
    }

    async fn search_header(&mut self, header: &str, value: &str) -> AppResult<Vec<u32>> {
        let query = format!("HEADER {header} \"{}\"", escape_imap_quoted(value));
        let set = timeout(
            socket_timeout(&self.config),
            self.session.uid_search(query.as_str()),
        )
        .await
        .map_err(|_| AppError::Timeout("UID SEARCH timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Transport(format!("uid search failed: {e}"))))?;
        let mut uids: Vec<u32> = set.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    /// Runs `UID FETCH <uid> BODY.PEEK[]`, which leaves `\Seen` untouched.
    /// Every response read from the exchange gets the socket timeout.
    async fn fetch_message(&mut self, uid: u32) -> AppResult<FetchEvents<'_>> {
        let limit = socket_timeout(&self.config);
        let stream = timeout(limit, self.session.uid_fetch(uid.to_string(), FETCH_ITEMS))
            .await
            .map_err(|_| AppError::Timeout("UID FETCH timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Transport(format!("uid fetch failed: {e}"))))?;

        let events = stream
            .map_err(|e| AppError::Transport(format!("uid fetch stream failed: {e}")))
            .map_ok(move |fetch| stream::iter(events_for(fetch.uid, fetch.body(), uid)))
            .try_flatten()
            .boxed();
        Ok(with_item_timeout(events, limit, "UID FETCH response"))
    }

    async fn close(mut self) -> AppResult<()> {
        timeout(socket_timeout(&self.config), self.session.logout())
            .await
            .map_err(|_| AppError::Timeout("LOGOUT timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Transport(format!("LOGOUT failed: {e}"))))
    }
}

/// Translate one FETCH response into engine events
///
/// Only a response carrying the requested UID counts as the message. Servers
/// may interleave unsolicited FETCH responses (flag updates from other
/// clients, with or without a UID); those are skipped.
fn events_for(got: Option<u32>, body: Option<&[u8]>, want: u32) -> Vec<AppResult<FetchEvent>> {
    if got != Some(want) {
        return Vec::new();
    }
    let mut events = vec![Ok(FetchEvent::Found)];
    if let Some(body) = body {
        events.push(Ok(FetchEvent::Chunk(body.to_vec())));
    }
    events
}

/// Bound the wait for each item of `inner` by `limit`
///
/// A stall yields one `Timeout` error and ends the stream.
fn with_item_timeout<'a, T: Send + 'a>(
    inner: BoxStream<'a, AppResult<T>>,
    limit: Duration,
    what: &'static str,
) -> BoxStream<'a, AppResult<T>> {
    stream::unfold(Some(inner), move |state| async move {
        let mut inner = state?;
        match timeout(limit, inner.next()).await {
            Ok(Some(item)) => Some((item, Some(inner))),
            Ok(None) => None,
            Err(_) => Some((
                Err(AppError::Timeout(format!("{what} timed out"))),
                None,
            )),
        }
    })
    .boxed()
}

/// Escape backslashes and quotes for IMAP quoted strings
pub fn escape_imap_quoted(input: &str) -> String {
    input.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Connect to IMAP server and authenticate
///
/// Performs full connection sequence with timeouts:
/// 1. TCP connect
/// 2. TLS handshake with webpki root certificates
/// 3. Read IMAP greeting
/// 4. LOGIN authentication
///
/// # Security
///
/// Rejects insecure connections (`secure: false`) to prevent password exposure.
///
/// # Errors
///
/// - `InvalidInput` if `secure` is false or hostname is invalid for TLS SNI
/// - `Timeout` if any connection phase times out
/// - `Connection` for TCP, TLS, or greeting failures
/// - `AuthFailed` if LOGIN is rejected
pub async fn connect_authenticated(
    server: &ServerConfig,
    account: &AccountConfig,
) -> AppResult<ImapSession> {
    if !account.secure {
        return Err(AppError::InvalidInput(
            "insecure IMAP is not supported; set MAIL_IMAP_<ACCOUNT>_SECURE=true".to_owned(),
        ));
    }

    let connect_duration = Duration::from_millis(server.connect_timeout_ms);
    let greeting_duration = Duration::from_millis(server.greeting_timeout_ms);

    let tcp = timeout(
        connect_duration,
        TcpStream::connect((account.host.as_str(), account.port)),
    )
    .await
    .map_err(|_| AppError::Timeout("tcp connect timeout".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Connection(format!("tcp connect failed: {e}"))))?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(account.host.clone())
        .map_err(|_| AppError::InvalidInput("invalid IMAP host for TLS SNI".to_owned()))?;
    let tls_stream = timeout(greeting_duration, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AppError::Timeout("TLS handshake timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Connection(format!("TLS handshake failed: {e}"))))?;

    let mut client = Client::new(tls_stream);
    let greeting = timeout(greeting_duration, client.read_response())
        .await
        .map_err(|_| AppError::Timeout("IMAP greeting timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Connection(format!("IMAP greeting failed: {e}"))))?;

    if greeting.is_none() {
        return Err(AppError::Connection(
            "IMAP server closed connection before greeting".to_owned(),
        ));
    }

    let pass = account.pass.expose_secret();
    let session = timeout(greeting_duration, client.login(account.user.as_str(), pass))
        .await
        .map_err(|_| AppError::Timeout("IMAP login timeout".to_owned()))
        .and_then(|r| r.map_err(|(e, _)| AppError::AuthFailed(e.to_string())))?;

    Ok(session)
}
