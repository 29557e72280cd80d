//! Configuration module for IMAP accounts and server settings
//!
//! All configuration is loaded from environment variables following the pattern
//! `MAIL_IMAP_<SEGMENT>_<KEY>`. Account segments are discovered by scanning for
//! `MAIL_IMAP_*_HOST` variables. The loaded value is immutable and handed to
//! the server (and from there to each session engine) behind an `Arc`.

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::env::VarError;
use std::path::PathBuf;
use std::str::FromStr;

use regex::Regex;
use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

/// Text attachments shorter than this many characters are returned inline
const DEFAULT_INLINE_MAX_CHARS: usize = 1_000;

/// IMAP account configuration
///
/// Holds connection details and credentials for a single IMAP account.
/// Passwords are stored using `SecretString` to prevent accidental logging.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    /// Account identifier (lowercase, used as default `account_id` parameter)
    pub account_id: String,
    /// IMAP server hostname
    pub host: String,
    /// IMAP server port (typically 993 for TLS)
    pub port: u16,
    /// Whether to use TLS (currently enforced to `true`)
    pub secure: bool,
    /// Username for authentication
    pub user: String,
    /// Password stored in a type that prevents accidental logging
    pub pass: SecretString,
}

/// Server-wide configuration
///
/// Wraps all account configs and global server settings. Cloned into MCP tool
/// handlers via `Arc` for thread-safe shared access.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// All configured accounts, keyed by `account_id`
    pub accounts: BTreeMap<String, AccountConfig>,
    /// TCP connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// IMAP greeting/TLS handshake timeout in milliseconds
    pub greeting_timeout_ms: u64,
    /// Socket I/O timeout in milliseconds
    pub socket_timeout_ms: u64,
    /// Directory receiving materialized attachments and saved raw messages
    pub attachment_dir: PathBuf,
    /// Text-like attachments shorter than this many characters are inlined
    pub inline_text_max_chars: usize,
}

impl ServerConfig {
    /// Load all configuration from environment variables
    ///
    /// Discovers accounts by scanning for `MAIL_IMAP_*_HOST` patterns.
    /// If no accounts are explicitly defined, a `default` account is required
    /// via `MAIL_IMAP_DEFAULT_HOST`, `MAIL_IMAP_DEFAULT_USER`, and
    /// `MAIL_IMAP_DEFAULT_PASS`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if required environment variables are missing
    /// or malformed.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_IMAP_DEFAULT_HOST=imap.gmail.com
    /// MAIL_IMAP_DEFAULT_USER=user@gmail.com
    /// MAIL_IMAP_DEFAULT_PASS=app-password
    /// MAIL_IMAP_WORK_HOST=outlook.office365.com
    /// MAIL_IMAP_WORK_USER=user@company.com
    /// MAIL_IMAP_WORK_PASS=work-pass
    /// MAIL_IMAP_ATTACHMENT_DIR=/var/tmp/mail-attachments
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let accounts = discover_segments()?
            .iter()
            .map(|seg| load_account(seg).map(|a| (a.account_id.clone(), a)))
            .collect::<AppResult<BTreeMap<_, _>>>()?;

        Ok(Self {
            accounts,
            connect_timeout_ms: parse_env("MAIL_IMAP_CONNECT_TIMEOUT_MS", 30_000)?,
            greeting_timeout_ms: parse_env("MAIL_IMAP_GREETING_TIMEOUT_MS", 15_000)?,
            socket_timeout_ms: parse_env("MAIL_IMAP_SOCKET_TIMEOUT_MS", 300_000)?,
            attachment_dir: parse_path_env("MAIL_IMAP_ATTACHMENT_DIR", env::temp_dir())?,
            inline_text_max_chars: parse_inline_max_chars("MAIL_IMAP_INLINE_MAX_CHARS")?,
        })
    }

    /// Get account configuration by ID
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account ID is not configured.
    pub fn get_account(&self, account_id: &str) -> AppResult<&AccountConfig> {
        self.accounts
            .get(account_id)
            .ok_or_else(|| AppError::NotFound(format!("account '{account_id}' is not configured")))
    }
}

/// Account segments named by `MAIL_IMAP_<SEGMENT>_HOST`, or `DEFAULT` if none
fn discover_segments() -> AppResult<BTreeSet<String>> {
    let host_key = Regex::new(r"^MAIL_IMAP_([A-Z0-9_]+)_HOST$")
        .map_err(|e| AppError::Internal(format!("invalid account regex: {e}")))?;
    let mut segments: BTreeSet<String> = env::vars()
        .filter_map(|(k, _)| host_key.captures(&k).map(|c| c[1].to_owned()))
        .collect();
    if segments.is_empty() {
        segments.insert("DEFAULT".to_owned());
    }
    Ok(segments)
}

/// Load a single account configuration from environment
///
/// Reads `MAIL_IMAP_<SEGMENT>_HOST`, `_USER`, `_PASS`, `_PORT`, and `_SECURE`.
/// Normalizes the segment name to lowercase for `account_id` (except `DEFAULT`
/// becomes `default`).
fn load_account(segment: &str) -> AppResult<AccountConfig> {
    let prefix = format!("MAIL_IMAP_{segment}_");
    let host = required_env(&format!("{prefix}HOST"))?;
    let user = required_env(&format!("{prefix}USER"))?;
    let pass = required_env(&format!("{prefix}PASS"))?;

    Ok(AccountConfig {
        account_id: if segment == "DEFAULT" {
            "default".to_owned()
        } else {
            segment.to_ascii_lowercase()
        },
        host,
        port: parse_env(&format!("{prefix}PORT"), 993)?,
        secure: parse_bool_env(&format!("{prefix}SECURE"), true)?,
        user,
        pass: SecretString::new(pass.into()),
    })
}

/// Read a required, non-blank environment variable
fn required_env(key: &str) -> AppResult<String> {
    read_env(key)?
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AppError::InvalidInput(format!("missing required environment variable {key}")))
}

/// Read an environment variable; unset is `None`, non-unicode is an error
fn read_env(key: &str) -> AppResult<Option<String>> {
    match env::var(key) {
        Ok(v) => Ok(Some(v)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a numeric environment variable, falling back to `default` if unset
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but does not parse as `T`.
fn parse_env<T: FromStr>(key: &str, default: T) -> AppResult<T> {
    match read_env(key)? {
        Some(v) => v.trim().parse::<T>().map_err(|_| {
            AppError::InvalidInput(format!("invalid numeric environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

/// Inline threshold in characters; zero would make every attachment a file
fn parse_inline_max_chars(key: &str) -> AppResult<usize> {
    match parse_env(key, DEFAULT_INLINE_MAX_CHARS)? {
        0 => Err(AppError::InvalidInput(format!(
            "{key} must be greater than zero"
        ))),
        n => Ok(n),
    }
}

/// Parse a boolean environment variable with flexible values
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive. Returns `default` if unset.
fn parse_bool_env(key: &str, default: bool) -> AppResult<bool> {
    match read_env(key)? {
        Some(v) => parse_bool_value(&v).ok_or_else(|| {
            AppError::InvalidInput(format!("invalid boolean environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a directory path; unset or blank falls back to `default`
fn parse_path_env(key: &str, default: PathBuf) -> AppResult<PathBuf> {
    Ok(read_env(key)?
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .map_or(default, PathBuf::from))
}
