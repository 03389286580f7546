//! Shared types for the digest pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FailureCode;
use crate::source::mime::MimePart;
use crate::store::ProcessingStatus;

// ── Fetched message ─────────────────────────────────────────────────

/// A message as fetched from the mailbox. Immutable once fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    /// Source-native identifier (Gmail message id, IMAP UID).
    pub id: String,
    pub sender: String,
    pub subject: String,
    /// Decoded MIME structure of the body.
    pub body: MimePart,
    pub received_at: DateTime<Utc>,
}

// ── Normalized item ─────────────────────────────────────────────────

/// An outbound hyperlink found in a message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub text: String,
    pub url: String,
}

/// Clean, length-bounded text derived from one [`RawMessage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedItem {
    /// Id of the originating [`RawMessage`].
    pub source_id: String,
    pub sender: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub body: String,
    pub links: Vec<Link>,
}

// ── Summarized item ─────────────────────────────────────────────────

/// How a summary came to be. Drives status tracking; bullets are display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum SummaryOutcome {
    /// The backend produced real bullets.
    Summarized,
    /// Body below the minimum length; the backend was not called.
    Skipped,
    /// The backend answered but no bullet could be recovered.
    Unparseable,
    /// The backend call failed.
    Failed(FailureCode),
}

/// A normalized item plus its 1–3 bullet summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizedItem {
    pub item: NormalizedItem,
    bullets: Vec<String>,
    pub outcome: SummaryOutcome,
}

impl SummarizedItem {
    /// Maximum bullets kept per item.
    pub const MAX_BULLETS: usize = 3;

    /// Build from backend bullets. Extra bullets beyond three are dropped;
    /// an empty list is replaced by `fallback`.
    pub fn new(
        item: NormalizedItem,
        mut bullets: Vec<String>,
        outcome: SummaryOutcome,
        fallback: &str,
    ) -> Self {
        bullets.retain(|b| !b.trim().is_empty());
        bullets.truncate(Self::MAX_BULLETS);
        if bullets.is_empty() {
            bullets.push(fallback.to_string());
        }
        Self {
            item,
            bullets,
            outcome,
        }
    }

    /// Build an item whose single bullet is a sentinel.
    pub fn sentinel(item: NormalizedItem, sentinel: &str, outcome: SummaryOutcome) -> Self {
        Self {
            item,
            bullets: vec![sentinel.to_string()],
            outcome,
        }
    }

    /// Always between one and three entries.
    pub fn bullets(&self) -> &[String] {
        &self.bullets
    }
}

// ── Digest ──────────────────────────────────────────────────────────

/// The compiled HTML document sent to a recipient.
#[derive(Debug, Clone)]
pub struct Digest {
    pub html: String,
    pub generated_at: DateTime<Utc>,
    pub section_count: usize,
}

// ── Run report ──────────────────────────────────────────────────────

/// Result of a single dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchStatus {
    /// No digest was built (nothing fetched, nothing completed, or aborted earlier).
    NotAttempted,
    Sent { recipient: String },
    Skipped { reason: String },
    Failed { reason: String },
}

/// Pipeline stage at which a run was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Fetching,
    Compiling,
    Dispatching,
}

/// Overall verdict for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    NothingToDo,
    Completed,
    PartialSuccess { failed: usize },
    /// A shutdown request stopped the item loop with `remaining` items untouched.
    Cancelled { remaining: usize },
    Aborted { stage: RunStage, reason: String },
}

/// Per-item line in the run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemReport {
    pub id: String,
    pub sender: String,
    pub subject: String,
    pub status: ProcessingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureCode>,
    pub bullets: Vec<String>,
}

/// A mark-as-read failure, collected rather than raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkFailure {
    pub id: String,
    pub reason: String,
}

/// Structured summary of one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub account: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub processed: usize,
    pub failed: usize,
    /// Fetched messages already `completed` by an earlier run.
    pub already_completed: usize,
    /// Of those, items whose digest never went out; re-included in this digest.
    pub carried_over: usize,
    /// Set when a shutdown request stopped the item loop early.
    pub cancelled: bool,
    pub dispatch: DispatchStatus,
    pub mark_failures: Vec<MarkFailure>,
    pub items: Vec<ItemReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub outcome: RunOutcome,
}

impl RunReport {
    pub fn new(account: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            account: account.to_string(),
            started_at: now,
            finished_at: now,
            fetched: 0,
            processed: 0,
            failed: 0,
            already_completed: 0,
            carried_over: 0,
            cancelled: false,
            dispatch: DispatchStatus::NotAttempted,
            mark_failures: Vec::new(),
            items: Vec::new(),
            warnings: Vec::new(),
            outcome: RunOutcome::NothingToDo,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.outcome, RunOutcome::Aborted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> NormalizedItem {
        NormalizedItem {
            source_id: "m1".into(),
            sender: "news@example.com".into(),
            subject: "Weekly".into(),
            received_at: Utc::now(),
            body: "body".into(),
            links: vec![],
        }
    }

    #[test]
    fn summarized_item_caps_at_three_bullets() {
        let bullets = (1..=5).map(|i| format!("point {i}")).collect();
        let s = SummarizedItem::new(item(), bullets, SummaryOutcome::Summarized, "fallback");
        assert_eq!(s.bullets().len(), 3);
        assert_eq!(s.bullets()[2], "point 3");
    }

    #[test]
    fn summarized_item_never_empty() {
        let s = SummarizedItem::new(
            item(),
            vec!["  ".into()],
            SummaryOutcome::Unparseable,
            "Unable to extract summary",
        );
        assert_eq!(s.bullets(), ["Unable to extract summary"]);
    }

    #[test]
    fn outcome_serializes_with_code() {
        let json =
            serde_json::to_value(SummaryOutcome::Failed(FailureCode::BackendTimeout)).unwrap();
        assert_eq!(json["kind"], "failed");
        assert_eq!(json["code"], "backend_timeout");
    }

    #[test]
    fn run_outcome_serialization() {
        let json = serde_json::to_value(RunOutcome::Aborted {
            stage: RunStage::Dispatching,
            reason: "auth".into(),
        })
        .unwrap();
        assert_eq!(json["outcome"], "aborted");
        assert_eq!(json["stage"], "dispatching");
    }

    #[test]
    fn cancelled_outcome_reports_remaining() {
        let json = serde_json::to_value(RunOutcome::Cancelled { remaining: 2 }).unwrap();
        assert_eq!(json["outcome"], "cancelled");
        assert_eq!(json["remaining"], 2);
    }

    #[test]
    fn new_report_is_nothing_to_do() {
        let report = RunReport::new("default");
        assert_eq!(report.outcome, RunOutcome::NothingToDo);
        assert_eq!(report.dispatch, DispatchStatus::NotAttempted);
        assert!(!report.is_aborted());
    }
}
