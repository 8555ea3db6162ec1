//! IMAP mailbox access.
//!
//! The bridge consumes the mailbox through the [`MailboxConnector`] and
//! [`MailboxSession`] traits: open a session, list unseen message ids in a
//! folder, fetch raw headers for a batch in one round trip, log out.
//!
//! [`ImapConnector`] is the production implementation: a blocking IMAP
//! client over rustls (or plain TCP when SSL is disabled), driven through
//! `spawn_blocking` so the async poll loop never blocks a runtime thread.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::BridgeConfig;
use crate::error::MailboxError;

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// A live mailbox session. One is opened per poll cycle.
#[async_trait]
pub trait MailboxSession: Send {
    /// Select `folder` and list identifiers of unseen messages, in mailbox order.
    async fn list_unseen(&mut self, folder: &str) -> Result<Vec<u32>, MailboxError>;

    /// Fetch raw header bytes for a batch of identifiers in one round trip.
    async fn fetch_headers(&mut self, ids: &[u32]) -> Result<Vec<(u32, Vec<u8>)>, MailboxError>;

    /// End the session. Best-effort.
    async fn logout(&mut self) -> Result<(), MailboxError>;
}

/// Opens mailbox sessions.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    type Session: MailboxSession;

    async fn connect(&self) -> Result<Self::Session, MailboxError>;
}

// ── Production connector ────────────────────────────────────────────

/// IMAP server settings for the production connector.
pub struct ImapConnector {
    host: String,
    port: u16,
    username: String,
    password: String,
    use_tls: bool,
}

impl ImapConnector {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            host: config.imap_host.clone(),
            port: config.imap_port,
            username: config.imap_username.clone(),
            password: config.imap_password.clone(),
            use_tls: config.imap_use_ssl,
        }
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    type Session = ImapSession;

    async fn connect(&self) -> Result<ImapSession, MailboxError> {
        info!(host = %self.host, port = self.port, "Connecting to IMAP server");

        let host = self.host.clone();
        let port = self.port;
        let username = self.username.clone();
        let password = self.password.clone();
        let use_tls = self.use_tls;

        let client = tokio::task::spawn_blocking(move || {
            connect_blocking(&host, port, use_tls, &username, &password)
        })
        .await
        .map_err(|e| MailboxError::Protocol(format!("blocking task failed: {e}")))??;

        info!("IMAP login successful");
        Ok(ImapSession {
            client: Some(client),
        })
    }
}

/// Session wrapper moving the blocking client in and out of `spawn_blocking`
/// for each operation.
pub struct ImapSession {
    client: Option<ImapClient>,
}

impl ImapSession {
    async fn with_client<T, F>(&mut self, op: F) -> Result<T, MailboxError>
    where
        F: FnOnce(&mut ImapClient) -> Result<T, MailboxError> + Send + 'static,
        T: Send + 'static,
    {
        let mut client = self
            .client
            .take()
            .ok_or_else(|| MailboxError::Protocol("session is closed".to_string()))?;

        let (client, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut client);
            (client, result)
        })
        .await
        .map_err(|e| MailboxError::Protocol(format!("blocking task failed: {e}")))?;

        self.client = Some(client);
        result
    }
}

#[async_trait]
impl MailboxSession for ImapSession {
    async fn list_unseen(&mut self, folder: &str) -> Result<Vec<u32>, MailboxError> {
        let folder = folder.to_string();
        self.with_client(move |client| {
            client.select(&folder)?;
            client.search_unseen()
        })
        .await
    }

    async fn fetch_headers(&mut self, ids: &[u32]) -> Result<Vec<(u32, Vec<u8>)>, MailboxError> {
        let ids = ids.to_vec();
        self.with_client(move |client| client.fetch_headers(&ids))
            .await
    }

    async fn logout(&mut self) -> Result<(), MailboxError> {
        self.with_client(|client| {
            client.logout();
            Ok(())
        })
        .await
    }
}

// ── Blocking IMAP client ────────────────────────────────────────────

/// TLS or plain TCP, behind one Read/Write surface.
enum ImapStream {
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
    Plain(TcpStream),
}

impl Read for ImapStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ImapStream::Tls(stream) => stream.read(buf),
            ImapStream::Plain(stream) => stream.read(buf),
        }
    }
}

impl Write for ImapStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            ImapStream::Tls(stream) => stream.write(buf),
            ImapStream::Plain(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            ImapStream::Tls(stream) => stream.flush(),
            ImapStream::Plain(stream) => stream.flush(),
        }
    }
}

/// One server response line plus the literal bytes that followed it, if the
/// line announced one with a `{N}` marker.
struct ResponseLine {
    text: String,
    literal: Option<Vec<u8>>,
}

/// Blocking IMAP protocol client. All methods run inside `spawn_blocking`.
struct ImapClient {
    stream: ImapStream,
    tag: u32,
}

/// Connect, read the greeting, and log in.
fn connect_blocking(
    host: &str,
    port: u16,
    use_tls: bool,
    username: &str,
    password: &str,
) -> Result<ImapClient, MailboxError> {
    let tcp = TcpStream::connect((host, port)).map_err(|e| MailboxError::Connection {
        host: host.to_string(),
        port,
        reason: e.to_string(),
    })?;
    tcp.set_read_timeout(Some(READ_TIMEOUT))?;

    let stream = if use_tls {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| MailboxError::Tls(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| MailboxError::Tls(e.to_string()))?;
        ImapStream::Tls(Box::new(rustls::StreamOwned::new(conn, tcp)))
    } else {
        ImapStream::Plain(tcp)
    };

    let mut client = ImapClient { stream, tag: 0 };
    let _greeting = client.read_line()?;
    client.login(username, password)?;
    Ok(client)
}

impl ImapClient {
    fn read_line(&mut self) -> Result<String, MailboxError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte) {
                Ok(0) => return Err(MailboxError::Protocol("connection closed".to_string())),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).into_owned());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_literal(&mut self, len: usize) -> Result<Vec<u8>, MailboxError> {
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Send a tagged command and collect every response line (with literals)
    /// up to and including the tagged completion line.
    fn command(&mut self, cmd: &str) -> Result<Vec<ResponseLine>, MailboxError> {
        self.tag += 1;
        let tag = format!("A{}", self.tag);
        let full = format!("{tag} {cmd}\r\n");
        self.stream.write_all(full.as_bytes())?;
        self.stream.flush()?;

        let mut lines = Vec::new();
        loop {
            let text = self.read_line()?;
            let literal = match literal_size(&text) {
                Some(len) => Some(self.read_literal(len)?),
                None => None,
            };
            let done = text.starts_with(&tag);
            lines.push(ResponseLine { text, literal });
            if done {
                return Ok(lines);
            }
        }
    }

    fn login(&mut self, username: &str, password: &str) -> Result<(), MailboxError> {
        let resp = self.command(&format!("LOGIN \"{username}\" \"{password}\""))?;
        if !is_ok(&resp) {
            return Err(MailboxError::Auth {
                user: username.to_string(),
                reason: completion_text(&resp),
            });
        }
        Ok(())
    }

    fn select(&mut self, folder: &str) -> Result<(), MailboxError> {
        let resp = self.command(&format!("SELECT \"{folder}\""))?;
        if !is_ok(&resp) {
            return Err(MailboxError::Folder {
                folder: folder.to_string(),
                reason: completion_text(&resp),
            });
        }
        Ok(())
    }

    fn search_unseen(&mut self) -> Result<Vec<u32>, MailboxError> {
        let resp = self.command("SEARCH UNSEEN")?;
        if !is_ok(&resp) {
            return Err(MailboxError::Protocol(completion_text(&resp)));
        }
        Ok(parse_search(resp.iter().map(|line| line.text.as_str())))
    }

    fn fetch_headers(&mut self, ids: &[u32]) -> Result<Vec<(u32, Vec<u8>)>, MailboxError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let set = ids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let resp = self.command(&format!("FETCH {set} (RFC822.HEADER)"))?;
        if !is_ok(&resp) {
            return Err(MailboxError::Protocol(completion_text(&resp)));
        }

        let mut headers = Vec::new();
        for line in resp {
            let Some(literal) = line.literal else {
                continue;
            };
            if let Some(seq) = fetch_sequence(&line.text) {
                headers.push((seq, literal));
            } else {
                debug!(line = %line.text.trim_end(), "Ignoring unexpected literal in FETCH response");
            }
        }
        Ok(headers)
    }

    fn logout(&mut self) {
        let _ = self.command("LOGOUT");
    }
}

// ── Response parsing ────────────────────────────────────────────────

/// Size of the literal announced by a `{N}` at the end of a line, if any.
fn literal_size(line: &str) -> Option<usize> {
    let rest = line.trim_end().strip_suffix('}')?;
    let open = rest.rfind('{')?;
    rest[open + 1..].parse().ok()
}

/// Whether the tagged completion line reports OK.
fn is_ok(lines: &[ResponseLine]) -> bool {
    lines.last().is_some_and(|line| {
        line.text
            .split_whitespace()
            .nth(1)
            .is_some_and(|word| word.eq_ignore_ascii_case("OK"))
    })
}

/// The tagged completion line, trimmed, for error messages.
fn completion_text(lines: &[ResponseLine]) -> String {
    lines
        .last()
        .map(|line| line.text.trim_end().to_string())
        .unwrap_or_default()
}

/// Collect ids from `* SEARCH n n n…` lines.
fn parse_search<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<u32> {
    let mut ids = Vec::new();
    for line in lines {
        if let Some(rest) = line.strip_prefix("* SEARCH") {
            ids.extend(rest.split_whitespace().filter_map(|word| word.parse::<u32>().ok()));
        }
    }
    ids
}

/// Sequence number from an untagged `* <seq> FETCH …` line.
fn fetch_sequence(line: &str) -> Option<u32> {
    let rest = line.strip_prefix("* ")?;
    let (seq, rest) = rest.split_once(' ')?;
    if !rest.trim_start().starts_with("FETCH") {
        return None;
    }
    seq.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str) -> ResponseLine {
        ResponseLine {
            text: text.to_string(),
            literal: None,
        }
    }

    #[test]
    fn literal_size_parsed_from_line_end() {
        assert_eq!(
            literal_size("* 12 FETCH (RFC822.HEADER {345}\r\n"),
            Some(345)
        );
        assert_eq!(literal_size("* SEARCH 1 2 3\r\n"), None);
        assert_eq!(literal_size("* 1 FETCH (BODY {not-a-number}\r\n"), None);
    }

    #[test]
    fn ok_detected_on_tagged_completion() {
        assert!(is_ok(&[line("A2 OK SELECT completed\r\n")]));
        assert!(is_ok(&[line("* 3 EXISTS\r\n"), line("A2 OK done\r\n")]));
        assert!(!is_ok(&[line("A2 NO [NONEXISTENT] Unknown Mailbox\r\n")]));
        assert!(!is_ok(&[line("A2 BAD parse error\r\n")]));
        assert!(!is_ok(&[]));
    }

    #[test]
    fn search_ids_collected() {
        let lines = ["* SEARCH 4 8 15 16\r\n", "A3 OK SEARCH completed\r\n"];
        assert_eq!(parse_search(lines.into_iter()), vec![4, 8, 15, 16]);
    }

    #[test]
    fn search_empty_result() {
        let lines = ["* SEARCH\r\n", "A3 OK SEARCH completed\r\n"];
        assert!(parse_search(lines.into_iter()).is_empty());
    }

    #[test]
    fn search_ignores_unrelated_untagged_lines() {
        let lines = [
            "* 7 EXISTS\r\n",
            "* SEARCH 2 9\r\n",
            "A3 OK SEARCH completed\r\n",
        ];
        assert_eq!(parse_search(lines.into_iter()), vec![2, 9]);
    }

    #[test]
    fn fetch_sequence_extracted() {
        assert_eq!(
            fetch_sequence("* 12 FETCH (RFC822.HEADER {345}\r\n"),
            Some(12)
        );
        assert_eq!(fetch_sequence("* 7 EXISTS\r\n"), None);
        assert_eq!(fetch_sequence("A4 OK FETCH completed\r\n"), None);
    }
}
