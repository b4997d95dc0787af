use std::collections::HashSet;
use std::fmt;

use async_imap::{Client, Session};
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use futures::TryStreamExt;
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use crate::error::MigrationError;
use crate::message::EmailMessage;
use crate::settings::SourceConfig;

pub mod parse;

pub const DEFAULT_MAILBOX: &str = "INBOX";

// Ports where the server expects TLS before the first protocol byte.
const IMPLICIT_TLS_PORTS: [u16; 2] = [993, 995];

type TlsSession = Session<Compat<tokio_native_tls::TlsStream<TcpStream>>>;
type PlainSession = Session<Compat<TcpStream>>;

enum ImapConnection {
    Tls(TlsSession),
    Plain(PlainSession),
}

// Seam between the orchestrator and the source session, so the run's
// cleanup behavior is testable without a server.
#[async_trait]
pub trait SourceMailbox {
    async fn connect(&mut self) -> Result<(), MigrationError>;
    async fn fetch_all(&mut self) -> Result<Vec<EmailMessage>, MigrationError>;
    async fn disconnect(&mut self);
}

// Read-only view of the source account: connect, drain the mailbox,
// disconnect. Nothing here ever changes server-side state.
pub struct MailSource {
    config: SourceConfig,
    connection: Option<ImapConnection>,
}

impl MailSource {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            connection: None,
        }
    }

    async fn open_session(&self) -> anyhow::Result<ImapConnection> {
        let config = &self.config;
        let tcp_stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
        info!("-- connected to {}:{}", config.host, config.port);

        let mailbox = config.mailbox.as_deref().unwrap_or(DEFAULT_MAILBOX);

        if uses_implicit_tls(config.port) {
            let connector = tls_connector(config.accept_invalid_certs)?;
            let tls = tokio_native_tls::TlsConnector::from(connector);
            let tls_stream = tls.connect(&config.host, tcp_stream).await?;
            let client = Client::new(tls_stream.compat());
            let session = open_mailbox(client, &config.email, &config.password, mailbox).await?;
            Ok(ImapConnection::Tls(session))
        } else {
            let client = Client::new(tcp_stream.compat());
            let session = open_mailbox(client, &config.email, &config.password, mailbox).await?;
            Ok(ImapConnection::Plain(session))
        }
    }
}

#[async_trait]
impl SourceMailbox for MailSource {
    // Connect to the source server, authenticate and open the configured
    // mailbox read-only.
    async fn connect(&mut self) -> Result<(), MigrationError> {
        debug!("-- source protocol configured as {}", self.config.protocol);
        let connection = self
            .open_session()
            .await
            .map_err(|e| MigrationError::SourceConnection(format!("{:#}", e)))?;
        self.connection = Some(connection);
        Ok(())
    }

    // Fetch and parse every message in the opened mailbox, in mailbox
    // order. Messages that cannot be parsed are dropped with a warning.
    async fn fetch_all(&mut self) -> Result<Vec<EmailMessage>, MigrationError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| MigrationError::SourceConnection("not connected".to_string()))?;

        let fetched = match connection {
            ImapConnection::Tls(session) => fetch_mailbox(session).await,
            ImapConnection::Plain(session) => fetch_mailbox(session).await,
        };
        fetched.map_err(|e| MigrationError::SourceConnection(format!("{:#}", e)))
    }

    // Log out and drop the session. Safe to call when connect() never
    // ran or already failed.
    async fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            let result = match connection {
                ImapConnection::Tls(mut session) => session.logout().await,
                ImapConnection::Plain(mut session) => session.logout().await,
            };
            match result {
                Ok(()) => info!("-- logged out from {}", self.config.host),
                Err(e) => warn!("Error disconnecting from source server: {}", e),
            }
        }
    }
}

fn uses_implicit_tls(port: u16) -> bool {
    IMPLICIT_TLS_PORTS.contains(&port)
}

fn tls_connector(accept_invalid_certs: bool) -> Result<native_tls::TlsConnector, native_tls::Error> {
    native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
}

// Login to the server and open the requested mailbox with EXAMINE, so
// the fetch later on cannot flip \Seen flags or expunge anything.
async fn open_mailbox<T>(
    client: Client<T>,
    username: &str,
    password: &str,
    mailbox: &str,
) -> anyhow::Result<Session<T>>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send + Sync,
{
    let mut session = client.login(username, password).await.map_err(|e| e.0)?;
    info!("-- logged in as {}", username);

    session.examine(mailbox).await?;
    info!("-- {} opened read-only", mailbox);
    Ok(session)
}

async fn fetch_mailbox<T>(session: &mut Session<T>) -> anyhow::Result<Vec<EmailMessage>>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send + Sync,
{
    let ids = session.search("ALL").await?;

    let messages = match sequence_set(&ids) {
        None => {
            info!("No emails found");
            Vec::new()
        }
        Some(range) => {
            info!("Found {} emails to migrate", ids.len());
            let messages_stream = session.fetch(&range, "BODY.PEEK[]").await?;
            let fetched: Vec<_> = messages_stream.try_collect().await?;

            let (messages, skipped) = parse::parse_all(fetched.iter().map(|m| m.body()));
            if skipped > 0 {
                warn!(
                    "Skipped {} messages that could not be parsed; totals below exclude them",
                    skipped
                );
            }
            messages
        }
    };

    // Under EXAMINE, CLOSE never expunges.
    session.close().await?;
    Ok(messages)
}

// Ascending sequence set with consecutive runs collapsed to colon
// ranges ("1:3,7"), or None for an empty mailbox. SEARCH ALL returns
// the contiguous 1..=N, so the usual value is a single range.
fn sequence_set(ids: &HashSet<u32>) -> Option<String> {
    let mut sorted: Vec<u32> = ids.iter().copied().collect();
    sorted.sort_unstable();

    let (&first, rest) = sorted.split_first()?;
    let mut ranges = Vec::new();
    let mut start = first;
    let mut end = first;
    for &id in rest {
        if id == end + 1 {
            end = id;
        } else {
            ranges.push(format_range(start, end));
            start = id;
            end = id;
        }
    }
    ranges.push(format_range(start, end));
    Some(ranges.join(","))
}

fn format_range(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}:{}", start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SourceProtocol;

    fn test_config() -> SourceConfig {
        SourceConfig {
            email: "old@example.com".to_string(),
            password: "hunter2".to_string(),
            host: "mail.example.com".to_string(),
            port: 993,
            protocol: SourceProtocol::Imap,
            mailbox: None,
            accept_invalid_certs: false,
        }
    }

    #[test]
    fn test_implicit_tls_ports() {
        assert!(uses_implicit_tls(993));
        assert!(uses_implicit_tls(995));
        assert!(!uses_implicit_tls(143));
        assert!(!uses_implicit_tls(3143));
    }

    #[test]
    fn test_sequence_set_is_sorted() {
        let ids: HashSet<u32> = [7, 1, 4].into_iter().collect();
        assert_eq!(sequence_set(&ids).as_deref(), Some("1,4,7"));
    }

    #[test]
    fn test_sequence_set_collapses_a_full_mailbox_to_one_range() {
        let ids: HashSet<u32> = (1..=500).collect();
        assert_eq!(sequence_set(&ids).as_deref(), Some("1:500"));
    }

    #[test]
    fn test_sequence_set_mixes_ranges_and_singletons() {
        let ids: HashSet<u32> = [1, 2, 3, 7, 9, 10].into_iter().collect();
        assert_eq!(sequence_set(&ids).as_deref(), Some("1:3,7,9:10"));
    }

    #[test]
    fn test_sequence_set_empty_mailbox() {
        assert_eq!(sequence_set(&HashSet::new()), None);
    }

    #[tokio::test]
    async fn test_fetch_before_connect_is_an_error() {
        let mut source = MailSource::new(test_config());
        match source.fetch_all().await {
            Err(MigrationError::SourceConnection(reason)) => {
                assert_eq!(reason, "not connected");
            }
            other => panic!("expected a source connection error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_is_a_no_op() {
        let mut source = MailSource::new(test_config());
        source.disconnect().await;
        source.disconnect().await;
    }
}
