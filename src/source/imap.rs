//! IMAP message source: raw IMAP over rustls, parsed with mail-parser.
//!
//! Blocking I/O; every session runs inside `spawn_blocking`.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders, PartType};
use secrecy::ExposeSecret;

use super::mime::MimePart;
use super::{FetchResult, MarkReport, MessageFilter, MessageSource};
use crate::config::ImapConfig;
use crate::error::SourceError;
use crate::pipeline::types::RawMessage;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Largest `{N}` literal accepted from the server.
const MAX_LITERAL_BYTES: usize = 50 * 1024 * 1024;

/// Tagged-command IMAP session over TLS.
struct ImapSession {
    stream: BufReader<TlsStream>,
    tag: u32,
}

/// Final status line of a tagged command plus everything before it.
struct Response {
    ok: bool,
    status: String,
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
}

impl ImapSession {
    fn connect(config: &ImapConfig) -> Result<Self, SourceError> {
        let tcp = TcpStream::connect((config.host.as_str(), config.port))?;
        tcp.set_read_timeout(Some(config.timeout))?;
        tcp.set_write_timeout(Some(config.timeout))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(config.host.clone())
            .map_err(|e| SourceError::Imap(format!("invalid host name: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| SourceError::Imap(format!("TLS setup failed: {e}")))?;

        let mut session = Self {
            stream: BufReader::new(rustls::StreamOwned::new(conn, tcp)),
            tag: 0,
        };
        let greeting = session.read_line()?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(SourceError::Imap(format!(
                "unexpected greeting: {}",
                greeting.trim_end()
            )));
        }
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, SourceError> {
        let mut buf = Vec::new();
        let n = self.stream.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Err(SourceError::Imap("connection closed".into()));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Send one tagged command and collect untagged lines and `{N}` literals.
    fn command(&mut self, cmd: &str) -> Result<Response, SourceError> {
        self.tag += 1;
        let tag = format!("A{}", self.tag);
        let stream = self.stream.get_mut();
        stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        stream.flush()?;

        let mut lines = Vec::new();
        let mut literals = Vec::new();
        loop {
            let line = self.read_line()?;
            if let Some(rest) = line.strip_prefix(&format!("{tag} ")) {
                let status = rest.trim_end().to_string();
                return Ok(Response {
                    ok: status.starts_with("OK"),
                    status,
                    lines,
                    literals,
                });
            }
            if let Some(len) = checked_literal_len(&line)? {
                let mut data = vec![0u8; len];
                self.stream.read_exact(&mut data)?;
                literals.push(data);
            }
            lines.push(line);
        }
    }

    fn login(&mut self, config: &ImapConfig) -> Result<(), SourceError> {
        let resp = self.command(&format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        ))?;
        if !resp.ok {
            return Err(SourceError::AuthFailed {
                account: config.username.clone(),
                reason: resp.status,
            });
        }
        Ok(())
    }

    fn logout(&mut self) {
        if let Err(e) = self.command("LOGOUT") {
            tracing::debug!(error = %e, "IMAP logout failed");
        }
    }
}

/// Length of a trailing `{N}` literal marker, if the line ends with one.
fn literal_len(line: &str) -> Option<usize> {
    let line = line.trim_end();
    let open = line.rfind('{')?;
    line.strip_suffix('}')?[open + 1..].parse().ok()
}

/// [`literal_len`], rejecting sizes above [`MAX_LITERAL_BYTES`].
fn checked_literal_len(line: &str) -> Result<Option<usize>, SourceError> {
    match literal_len(line) {
        Some(len) if len > MAX_LITERAL_BYTES => Err(SourceError::Imap(format!(
            "server announced a {len}-byte literal (limit {MAX_LITERAL_BYTES})"
        ))),
        other => Ok(other),
    }
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// UIDs from `* SEARCH` lines.
fn parse_search(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|l| l.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().map(str::to_string))
        .collect()
}

// ── Parsing ─────────────────────────────────────────────────────────

/// Convert an RFC 822 message into a [`RawMessage`].
pub fn parse_rfc822(uid: &str, raw: &[u8]) -> Option<RawMessage> {
    let message = MessageParser::default().parse(raw)?;

    let sender = message
        .from()
        .and_then(|addr| addr.first())
        .map(|a| match (a.name(), a.address()) {
            (Some(name), Some(addr)) => format!("{name} <{addr}>"),
            (None, Some(addr)) => addr.to_string(),
            (Some(name), None) => name.to_string(),
            (None, None) => "Unknown Sender".to_string(),
        })
        .unwrap_or_else(|| "Unknown Sender".to_string());
    let subject = message.subject().unwrap_or("No Subject").to_string();
    let received_at = message
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    let body = if message.parts.is_empty() {
        MimePart::default()
    } else {
        mime_tree(&message, 0)
    };

    Some(RawMessage {
        id: uid.to_string(),
        sender,
        subject,
        body,
        received_at,
    })
}

fn mime_tree(message: &mail_parser::Message<'_>, index: usize) -> MimePart {
    let Some(part) = message.parts.get(index) else {
        return MimePart::default();
    };
    let mime_type = MimeHeaders::content_type(part)
        .map(|ct| match ct.subtype() {
            Some(sub) => format!("{}/{}", ct.ctype(), sub),
            None => ct.ctype().to_string(),
        })
        .unwrap_or_else(|| "text/plain".to_string())
        .to_ascii_lowercase();

    match &part.body {
        PartType::Text(text) => MimePart::leaf(mime_type, text.as_bytes()),
        PartType::Html(html) => MimePart::leaf(mime_type, html.as_bytes()),
        PartType::Multipart(children) => MimePart::multipart(
            mime_type,
            children
                .iter()
                .map(|child| mime_tree(message, *child as usize))
                .collect(),
        ),
        PartType::Binary(_) | PartType::InlineBinary(_) | PartType::Message(_) => MimePart {
            mime_type,
            data: None,
            parts: Vec::new(),
        },
    }
}

// ── Source ──────────────────────────────────────────────────────────

/// Reads a mailbox named after the label over IMAP.
pub struct ImapSource {
    account: String,
    config: ImapConfig,
    /// Mailbox of the last fetch; UIDs are only meaningful inside it.
    mailbox: tokio::sync::Mutex<Option<String>>,
}

impl ImapSource {
    pub fn new(account: &str, config: ImapConfig) -> Self {
        Self {
            account: account.to_string(),
            config,
            mailbox: tokio::sync::Mutex::new(None),
        }
    }
}

fn fetch_blocking(
    config: &ImapConfig,
    filter: &MessageFilter,
    limit: usize,
) -> Result<FetchResult, SourceError> {
    let mut session = ImapSession::connect(config)?;
    session.login(config)?;

    let mut result = FetchResult::default();
    let select = session.command(&format!("SELECT {}", quote(&filter.label)))?;
    if !select.ok {
        let warning = format!(
            "Label '{}' not found as an IMAP mailbox ({})",
            filter.label, select.status
        );
        tracing::warn!("{warning}");
        result.warnings.push(warning);
        session.logout();
        return Ok(result);
    }

    let criteria = if filter.unread_only { "UNSEEN" } else { "ALL" };
    let search = session.command(&format!("UID SEARCH {criteria}"))?;
    if !search.ok {
        return Err(SourceError::Imap(format!("SEARCH failed: {}", search.status)));
    }

    for uid in parse_search(&search.lines).into_iter().take(limit) {
        let fetch = session.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        let Some(raw) = fetch.literals.into_iter().next() else {
            tracing::warn!(uid = %uid, status = %fetch.status, "FETCH returned no body");
            continue;
        };
        match parse_rfc822(&uid, &raw) {
            Some(message) => result.messages.push(message),
            None => tracing::warn!(uid = %uid, "Unparseable RFC 822 message skipped"),
        }
    }

    session.logout();
    Ok(result)
}

fn mark_blocking(config: &ImapConfig, label: Option<&str>, ids: &[String]) -> MarkReport {
    let mut report = MarkReport::default();
    let session = ImapSession::connect(config).and_then(|mut s| {
        s.login(config)?;
        let mailbox = label.unwrap_or("INBOX");
        let select = s.command(&format!("SELECT {}", quote(mailbox)))?;
        if !select.ok {
            return Err(SourceError::Imap(format!(
                "SELECT {mailbox} failed: {}",
                select.status
            )));
        }
        Ok(s)
    });

    let mut session = match session {
        Ok(s) => s,
        Err(e) => {
            let reason = e.to_string();
            for id in ids {
                report.record(id, Err(SourceError::Imap(reason.clone())));
            }
            return report;
        }
    };

    for id in ids {
        let result = session
            .command(&format!("UID STORE {id} +FLAGS (\\Seen)"))
            .and_then(|resp| {
                if resp.ok {
                    Ok(())
                } else {
                    Err(SourceError::Imap(resp.status))
                }
            });
        report.record(id, result);
    }
    session.logout();
    report
}

#[async_trait]
impl MessageSource for ImapSource {
    fn name(&self) -> &str {
        "imap"
    }

    async fn fetch(
        &self,
        filter: &MessageFilter,
        limit: usize,
    ) -> Result<FetchResult, SourceError> {
        *self.mailbox.lock().await = Some(filter.label.clone());
        let config = self.config.clone();
        let filter = filter.clone();
        let result =
            tokio::task::spawn_blocking(move || fetch_blocking(&config, &filter, limit))
                .await
                .map_err(|e| SourceError::Imap(format!("IMAP task panicked: {e}")))??;
        tracing::info!(
            account = %self.account,
            count = result.messages.len(),
            "Fetched IMAP messages"
        );
        Ok(result)
    }

    async fn mark_consumed(&self, ids: &[String]) -> MarkReport {
        let config = self.config.clone();
        let ids_owned = ids.to_vec();
        let label = self.mailbox.lock().await.clone();
        match tokio::task::spawn_blocking(move || {
            mark_blocking(&config, label.as_deref(), &ids_owned)
        })
        .await
        {
            Ok(report) => report,
            Err(e) => {
                let mut report = MarkReport::default();
                for id in ids {
                    report.record(id, Err(SourceError::Imap(format!("IMAP task panicked: {e}"))));
                }
                report
            }
        }
    }
}
