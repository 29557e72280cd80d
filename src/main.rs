//! mail-imap-attachments-mcp: read-only IMAP attachment server over stdio
//!
//! This server fetches messages from IMAP mailboxes by Message-ID or UID and
//! returns their attachments, a metadata peek, or the body content via the
//! Model Context Protocol (MCP) over stdio. Mailboxes are opened read-only and
//! connections are TLS-only.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading and stdio serving
//! - [`config`]: Environment-driven configuration for accounts and server settings
//! - [`errors`]: Application error model with MCP error mapping
//! - [`imap`]: Transport seam and its `async-imap` implementation
//! - [`identifier`]: Message-ID / UID resolution
//! - [`retrieve`]: Raw message retrieval from fetch events
//! - [`mime`]: Message decoding and attachment classification
//! - [`filter`]: Attachment filter compilation and matching
//! - [`attachments`]: Inline-vs-saved placement and file materialization
//! - [`render`]: HTML/text conversion helpers
//! - [`engine`]: Per-session orchestration of the above
//! - [`server`]: MCP tool handlers with validation
//! - [`models`]: Input/output DTOs and schema-bearing types

mod attachments;
mod config;
mod engine;
mod errors;
mod filter;
mod identifier;
mod imap;
mod mime;
mod models;
mod render;
mod retrieve;
mod server;

use config::ServerConfig;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use tracing_subscriber::EnvFilter;

/// Application entry point
///
/// Initializes tracing from environment, loads config, and serves the MCP
/// server over stdio. This process expects to be spawned by an MCP client
/// via `stdio` transport.
///
/// # Environment Variables
///
/// See [`ServerConfig::load_from_env`] for full configuration options.
///
/// # Example
///
/// ```no_run
/// MAIL_IMAP_DEFAULT_HOST=imap.example.com \
/// MAIL_IMAP_DEFAULT_USER=user@example.com \
/// MAIL_IMAP_DEFAULT_PASS=secret \
/// MAIL_IMAP_ATTACHMENT_DIR=/tmp/mail-attachments \
/// cargo run
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = ServerConfig::load_from_env()?;
    tracing::info!(
        accounts = config.accounts.len(),
        attachment_dir = %config.attachment_dir.display(),
        "starting IMAP attachment MCP server"
    );
    let service = server::MailImapServer::new(config).serve(stdio()).await?;
    service.waiting().await?;
    Ok(())
}
