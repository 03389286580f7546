//! Mailbox access: fetch labeled unread messages and mark them consumed.

pub mod gmail;
pub mod imap;
pub mod mime;
pub mod oauth;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::pipeline::types::RawMessage;

pub use gmail::GmailSource;
pub use imap::ImapSource;
pub use mime::{MimePart, extract_body};

/// Which messages a fetch should return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFilter {
    /// User-facing label name (Gmail label or IMAP mailbox).
    pub label: String,
    pub unread_only: bool,
}

impl MessageFilter {
    pub fn unread(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            unread_only: true,
        }
    }
}

/// Messages returned by a fetch plus non-fatal notes.
#[derive(Debug, Default)]
pub struct FetchResult {
    pub messages: Vec<RawMessage>,
    /// Conditions worth surfacing in the run report, e.g. a missing label.
    pub warnings: Vec<String>,
}

/// Per-id outcome of a best-effort mark-as-read pass.
#[derive(Debug, Default)]
pub struct MarkReport {
    pub marked: Vec<String>,
    pub failures: Vec<(String, String)>,
}

impl MarkReport {
    pub fn record(&mut self, id: &str, result: Result<(), SourceError>) {
        match result {
            Ok(()) => self.marked.push(id.to_string()),
            Err(e) => {
                tracing::warn!(message_id = %id, error = %e, "Failed to mark message as read");
                self.failures.push((id.to_string(), e.to_string()));
            }
        }
    }
}

/// A mailbox that yields newsletters and accepts read-state changes.
#[async_trait]
pub trait MessageSource: Send + Sync {
    fn name(&self) -> &str;

    /// Return at most `limit` matching messages. A label that does not exist
    /// yields an empty result with a warning rather than an error.
    async fn fetch(&self, filter: &MessageFilter, limit: usize)
    -> Result<FetchResult, SourceError>;

    /// Mark each id as read. Individual failures are collected, never raised.
    async fn mark_consumed(&self, ids: &[String]) -> MarkReport;
}

/// Build the configured source for one account.
pub fn create_source(
    account: &str,
    config: &SourceConfig,
) -> Result<Arc<dyn MessageSource>, SourceError> {
    match config {
        SourceConfig::Gmail(gmail) => {
            tracing::info!(account, "Using Gmail API source");
            Ok(Arc::new(GmailSource::new(account, gmail.clone())?))
        }
        SourceConfig::Imap(imap) => {
            tracing::info!(account, host = %imap.host, "Using IMAP source");
            Ok(Arc::new(ImapSource::new(account, imap.clone())))
        }
    }
}
