//! In-memory `StatusStore`, used when no database path is configured.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::{FailureCode, StatusError};
use crate::pipeline::types::SummarizedItem;
use crate::store::traits::{ProcessingStatus, StatusRecord, StatusStore, check_transition};

type Key = (String, String);

#[derive(Default)]
pub struct MemoryStatusStore {
    records: RwLock<HashMap<Key, StatusRecord>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(account: &str, message_id: &str) -> Key {
    (account.to_string(), message_id.to_string())
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn register(
        &self,
        account: &str,
        message_id: &str,
        sender: &str,
        subject: &str,
    ) -> Result<StatusRecord, StatusError> {
        let mut records = self.records.write().await;
        let record = records
            .entry(key(account, message_id))
            .or_insert_with(|| StatusRecord {
                account: account.to_string(),
                message_id: message_id.to_string(),
                status: ProcessingStatus::Pending,
                failure: None,
                sender: sender.to_string(),
                subject: subject.to_string(),
                updated_at: Utc::now(),
                completed_at: None,
                summary: None,
                delivered_at: None,
            });
        Ok(record.clone())
    }

    async fn get(
        &self,
        account: &str,
        message_id: &str,
    ) -> Result<Option<StatusRecord>, StatusError> {
        Ok(self.records.read().await.get(&key(account, message_id)).cloned())
    }

    async fn transition(
        &self,
        account: &str,
        message_id: &str,
        to: ProcessingStatus,
        failure: Option<FailureCode>,
    ) -> Result<StatusRecord, StatusError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&key(account, message_id)).ok_or_else(|| {
            StatusError::Query(format!("no status record for {account}/{message_id}"))
        })?;
        check_transition(message_id, record.status, to)?;

        let now = Utc::now();
        record.status = to;
        record.failure = if to == ProcessingStatus::Failed {
            failure
        } else {
            None
        };
        record.updated_at = now;
        record.completed_at = (to == ProcessingStatus::Completed).then_some(now);
        Ok(record.clone())
    }

    async fn record_summary(
        &self,
        account: &str,
        message_id: &str,
        summary: &SummarizedItem,
    ) -> Result<(), StatusError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&key(account, message_id)).ok_or_else(|| {
            StatusError::Query(format!("no status record for {account}/{message_id}"))
        })?;
        record.summary = Some(summary.clone());
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_delivered(
        &self,
        account: &str,
        message_ids: &[String],
    ) -> Result<(), StatusError> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        for id in message_ids {
            if let Some(record) = records.get_mut(&key(account, id))
                && record.status == ProcessingStatus::Completed
            {
                record.delivered_at = Some(now);
            }
        }
        Ok(())
    }

    async fn list(&self, account: &str) -> Result<Vec<StatusRecord>, StatusError> {
        let mut list: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.account == account)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(list)
    }
}
