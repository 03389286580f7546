//! libSQL status store. Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;

use crate::error::{FailureCode, StatusError};
use crate::pipeline::types::SummarizedItem;
use crate::store::migrations;
use crate::store::traits::{ProcessingStatus, StatusRecord, StatusStore, check_transition};

/// libSQL-backed `StatusStore`.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStatusStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStatusStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StatusError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StatusError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StatusError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Status database opened");
        Ok(store)
    }

    /// Create an in-memory database.
    pub async fn new_memory() -> Result<Self, StatusError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StatusError::Pool(format!("Failed to create in-memory database: {e}")))?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StatusError> {
        let conn = db
            .connect()
            .map_err(|e| StatusError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    async fn fetch_one(
        &self,
        account: &str,
        message_id: &str,
    ) -> Result<Option<StatusRecord>, StatusError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {STATUS_COLUMNS} FROM item_status WHERE account = ?1 AND message_id = ?2"
                ),
                params![account, message_id],
            )
            .await
            .map_err(|e| StatusError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| StatusError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_record(&row)?)),
            None => Ok(None),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

const STATUS_COLUMNS: &str = "account, message_id, status, failure, sender, subject, \
     updated_at, completed_at, summary, delivered_at";

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn row_to_record(row: &libsql::Row) -> Result<StatusRecord, StatusError> {
    let get_str = |i: i32| -> Result<String, StatusError> {
        row.get::<String>(i)
            .map_err(|e| StatusError::Query(format!("column {i}: {e}")))
    };
    // NULL columns fail the String conversion.
    let get_opt = |i: i32| -> Option<String> { row.get::<String>(i).ok() };

    let status_str = get_str(2)?;
    let status = ProcessingStatus::parse(&status_str)
        .ok_or_else(|| StatusError::Query(format!("unknown status '{status_str}'")))?;

    let summary = get_opt(8)
        .map(|json| serde_json::from_str::<SummarizedItem>(&json))
        .transpose()
        .map_err(|e| StatusError::Query(format!("stored summary: {e}")))?;

    Ok(StatusRecord {
        account: get_str(0)?,
        message_id: get_str(1)?,
        status,
        failure: get_opt(3).as_deref().and_then(FailureCode::parse),
        sender: get_str(4)?,
        subject: get_str(5)?,
        updated_at: parse_datetime(&get_str(6)?),
        completed_at: get_opt(7).as_deref().map(parse_datetime),
        summary,
        delivered_at: get_opt(9).as_deref().map(parse_datetime),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl StatusStore for LibSqlStatusStore {
    async fn register(
        &self,
        account: &str,
        message_id: &str,
        sender: &str,
        subject: &str,
    ) -> Result<StatusRecord, StatusError> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT OR IGNORE INTO item_status
                    (account, message_id, status, sender, subject, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?5)",
                params![account, message_id, sender, subject, now],
            )
            .await
            .map_err(|e| StatusError::Query(e.to_string()))?;

        self.fetch_one(account, message_id).await?.ok_or_else(|| {
            StatusError::Query(format!("status record for {account}/{message_id} vanished"))
        })
    }

    async fn get(
        &self,
        account: &str,
        message_id: &str,
    ) -> Result<Option<StatusRecord>, StatusError> {
        self.fetch_one(account, message_id).await
    }

    async fn transition(
        &self,
        account: &str,
        message_id: &str,
        to: ProcessingStatus,
        failure: Option<FailureCode>,
    ) -> Result<StatusRecord, StatusError> {
        let current = self.fetch_one(account, message_id).await?.ok_or_else(|| {
            StatusError::Query(format!("no status record for {account}/{message_id}"))
        })?;
        check_transition(message_id, current.status, to)?;

        let now = Utc::now().to_rfc3339();
        let failure = match to {
            ProcessingStatus::Failed => failure.map(|f| f.as_str()),
            _ => None,
        };
        let completed_at = (to == ProcessingStatus::Completed).then_some(now.as_str());

        // Guard on the status we read so a concurrent writer cannot be overwritten.
        let changed = self
            .conn
            .execute(
                "UPDATE item_status
                 SET status = ?1, failure = ?2, updated_at = ?3, completed_at = ?4
                 WHERE account = ?5 AND message_id = ?6 AND status = ?7",
                params![
                    to.as_str(),
                    opt_text(failure),
                    now.as_str(),
                    opt_text(completed_at),
                    account,
                    message_id,
                    current.status.as_str()
                ],
            )
            .await
            .map_err(|e| StatusError::Query(e.to_string()))?;

        if changed == 0 {
            return Err(StatusError::Query(format!(
                "status of {account}/{message_id} changed concurrently"
            )));
        }

        self.fetch_one(account, message_id).await?.ok_or_else(|| {
            StatusError::Query(format!("status record for {account}/{message_id} vanished"))
        })
    }

    async fn record_summary(
        &self,
        account: &str,
        message_id: &str,
        summary: &SummarizedItem,
    ) -> Result<(), StatusError> {
        let json = serde_json::to_string(summary)
            .map_err(|e| StatusError::Query(format!("serialize summary: {e}")))?;
        let changed = self
            .conn
            .execute(
                "UPDATE item_status SET summary = ?1, updated_at = ?2
                 WHERE account = ?3 AND message_id = ?4",
                params![json, Utc::now().to_rfc3339(), account, message_id],
            )
            .await
            .map_err(|e| StatusError::Query(e.to_string()))?;

        if changed == 0 {
            return Err(StatusError::Query(format!(
                "no status record for {account}/{message_id}"
            )));
        }
        Ok(())
    }

    async fn mark_delivered(
        &self,
        account: &str,
        message_ids: &[String],
    ) -> Result<(), StatusError> {
        let now = Utc::now().to_rfc3339();
        for id in message_ids {
            self.conn
                .execute(
                    "UPDATE item_status SET delivered_at = ?1
                     WHERE account = ?2 AND message_id = ?3 AND status = 'completed'",
                    params![now.as_str(), account, id.as_str()],
                )
                .await
                .map_err(|e| StatusError::Query(e.to_string()))?;
        }
        Ok(())
    }

    async fn list(&self, account: &str) -> Result<Vec<StatusRecord>, StatusError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {STATUS_COLUMNS} FROM item_status WHERE account = ?1
                     ORDER BY updated_at DESC"
                ),
                params![account],
            )
            .await
            .map_err(|e| StatusError::Query(e.to_string()))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StatusError::Query(e.to_string()))?
        {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{NormalizedItem, SummaryOutcome};

    fn summary(id: &str) -> SummarizedItem {
        SummarizedItem::new(
            NormalizedItem {
                source_id: id.into(),
                sender: "News <news@example.com>".into(),
                subject: "Weekly".into(),
                received_at: Utc::now(),
                body: "body".into(),
                links: vec![],
            },
            vec!["First point".into(), "Second point".into()],
            SummaryOutcome::Summarized,
            "Unable to extract summary",
        )
    }

    #[tokio::test]
    async fn register_and_complete() {
        let store = LibSqlStatusStore::new_memory().await.unwrap();
        let rec = store
            .register("default", "m1", "News <news@example.com>", "Weekly")
            .await
            .unwrap();
        assert_eq!(rec.status, ProcessingStatus::Pending);
        assert_eq!(rec.sender, "News <news@example.com>");
        assert!(rec.completed_at.is_none());

        store
            .transition("default", "m1", ProcessingStatus::Processing, None)
            .await
            .unwrap();
        let done = store
            .transition("default", "m1", ProcessingStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(done.status, ProcessingStatus::Completed);
        assert!(done.completed_at.is_some());
        assert!(done.failure.is_none());
    }

    #[tokio::test]
    async fn completed_is_terminal() {
        let store = LibSqlStatusStore::new_memory().await.unwrap();
        store.register("default", "m1", "a", "s").await.unwrap();
        store
            .transition("default", "m1", ProcessingStatus::Processing, None)
            .await
            .unwrap();
        store
            .transition("default", "m1", ProcessingStatus::Completed, None)
            .await
            .unwrap();

        let err = store
            .transition("default", "m1", ProcessingStatus::Processing, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StatusError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn failure_code_persisted_and_cleared_on_retry() {
        let store = LibSqlStatusStore::new_memory().await.unwrap();
        store.register("default", "m1", "a", "s").await.unwrap();
        store
            .transition("default", "m1", ProcessingStatus::Processing, None)
            .await
            .unwrap();
        store
            .transition(
                "default",
                "m1",
                ProcessingStatus::Failed,
                Some(FailureCode::BackendUnavailable),
            )
            .await
            .unwrap();

        let rec = store.get("default", "m1").await.unwrap().unwrap();
        assert_eq!(rec.status, ProcessingStatus::Failed);
        assert_eq!(rec.failure, Some(FailureCode::BackendUnavailable));

        let retry = store
            .transition("default", "m1", ProcessingStatus::Processing, None)
            .await
            .unwrap();
        assert_eq!(retry.failure, None);
    }

    #[tokio::test]
    async fn completion_time_cleared_outside_completed() {
        let store = LibSqlStatusStore::new_memory().await.unwrap();
        store.register("default", "m1", "a", "s").await.unwrap();
        store
            .transition("default", "m1", ProcessingStatus::Processing, None)
            .await
            .unwrap();
        let failed = store
            .transition("default", "m1", ProcessingStatus::Failed, None)
            .await
            .unwrap();
        assert!(failed.completed_at.is_none());
    }

    #[tokio::test]
    async fn summary_kept_until_delivered() {
        let store = LibSqlStatusStore::new_memory().await.unwrap();
        store.register("default", "m1", "a", "s").await.unwrap();
        store
            .transition("default", "m1", ProcessingStatus::Processing, None)
            .await
            .unwrap();
        store
            .record_summary("default", "m1", &summary("m1"))
            .await
            .unwrap();
        let done = store
            .transition("default", "m1", ProcessingStatus::Completed, None)
            .await
            .unwrap();

        assert!(done.awaits_delivery());
        let stored = done.summary.unwrap();
        assert_eq!(stored.bullets(), ["First point", "Second point"]);
        assert_eq!(stored.item.source_id, "m1");

        store
            .mark_delivered("default", &["m1".to_string()])
            .await
            .unwrap();
        let delivered = store.get("default", "m1").await.unwrap().unwrap();
        assert!(delivered.delivered_at.is_some());
        assert!(!delivered.awaits_delivery());
    }

    #[tokio::test]
    async fn summary_for_unknown_item_fails() {
        let store = LibSqlStatusStore::new_memory().await.unwrap();
        let err = store
            .record_summary("default", "ghost", &summary("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, StatusError::Query(_)));
    }

    #[tokio::test]
    async fn register_keeps_existing_state() {
        let store = LibSqlStatusStore::new_memory().await.unwrap();
        store.register("default", "m1", "a", "s").await.unwrap();
        store
            .transition("default", "m1", ProcessingStatus::Processing, None)
            .await
            .unwrap();

        let again = store.register("default", "m1", "other", "other").await.unwrap();
        assert_eq!(again.status, ProcessingStatus::Processing);
        assert_eq!(again.sender, "a");
    }

    #[tokio::test]
    async fn list_is_scoped_to_account() {
        let store = LibSqlStatusStore::new_memory().await.unwrap();
        store.register("alice", "m1", "a", "s").await.unwrap();
        store.register("alice", "m2", "a", "s").await.unwrap();
        store.register("bob", "m1", "a", "s").await.unwrap();

        assert_eq!(store.list("alice").await.unwrap().len(), 2);
        assert_eq!(store.list("bob").await.unwrap().len(), 1);
        assert!(store.list("carol").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("status.db");
        {
            let store = LibSqlStatusStore::new_local(&path).await.unwrap();
            store.register("default", "m1", "a", "s").await.unwrap();
        }
        let store = LibSqlStatusStore::new_local(&path).await.unwrap();
        let rec = store.get("default", "m1").await.unwrap().unwrap();
        assert_eq!(rec.status, ProcessingStatus::Pending);
    }

    #[test]
    fn parses_both_datetime_formats() {
        let a = parse_datetime("2024-03-05T07:00:00+00:00");
        let b = parse_datetime("2024-03-05 07:00:00");
        assert_eq!(a, b);
        assert_eq!(parse_datetime("garbage"), DateTime::<Utc>::MIN_UTC);
    }
}
