//! `StatusStore` trait: per-item processing status keyed by (account, message id).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FailureCode, StatusError};
use crate::pipeline::types::SummarizedItem;

/// Lifecycle of one fetched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Allowed moves. `completed` is terminal; `failed` may be retried on a
    /// later run; a `processing` left behind by an interrupted run may restart.
    /// `pending → failed` covers a status write that failed before processing began.
    pub fn can_transition_to(&self, target: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        matches!(
            (self, target),
            (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Processing)
        )
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reject a move the lifecycle does not allow.
pub fn check_transition(
    message_id: &str,
    from: ProcessingStatus,
    to: ProcessingStatus,
) -> Result<(), StatusError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StatusError::InvalidTransition {
            id: message_id.to_string(),
            state: from.to_string(),
            target: to.to_string(),
        })
    }
}

/// One tracked message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub account: String,
    pub message_id: String,
    pub status: ProcessingStatus,
    pub failure: Option<FailureCode>,
    pub sender: String,
    pub subject: String,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Summary kept until the digest carrying it is delivered.
    pub summary: Option<SummarizedItem>,
    /// Set once a digest containing this item was sent or skipped.
    pub delivered_at: Option<DateTime<Utc>>,
}

impl StatusRecord {
    /// Completed, but no digest has carried it yet.
    pub fn awaits_delivery(&self) -> bool {
        self.status == ProcessingStatus::Completed && self.delivered_at.is_none()
    }
}

/// Persistence for per-item status.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Start tracking a message as `pending`. Existing records are returned unchanged.
    async fn register(
        &self,
        account: &str,
        message_id: &str,
        sender: &str,
        subject: &str,
    ) -> Result<StatusRecord, StatusError>;

    async fn get(
        &self,
        account: &str,
        message_id: &str,
    ) -> Result<Option<StatusRecord>, StatusError>;

    /// Move a registered message to `to`. `failure` is kept only for `failed`;
    /// `completed` stamps the completion time.
    async fn transition(
        &self,
        account: &str,
        message_id: &str,
        to: ProcessingStatus,
        failure: Option<FailureCode>,
    ) -> Result<StatusRecord, StatusError>;

    /// Attach the summary produced for a message before it is completed.
    async fn record_summary(
        &self,
        account: &str,
        message_id: &str,
        summary: &SummarizedItem,
    ) -> Result<(), StatusError>;

    /// Stamp completed messages as delivered. Unknown or non-completed ids are ignored.
    async fn mark_delivered(
        &self,
        account: &str,
        message_ids: &[String],
    ) -> Result<(), StatusError>;

    /// All records for an account, most recently updated first.
    async fn list(&self, account: &str) -> Result<Vec<StatusRecord>, StatusError>;
}
