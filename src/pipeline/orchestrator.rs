//! One digest run for one account:
//!
//! 1. `MessageSource::fetch()` labeled unread messages
//! 2. per item: status `processing` → `Normalizer` → `Summarizer` → `completed`/`failed`
//! 3. `DigestCompiler::compile()` over completed items
//! 4. `DigestDispatcher::send()` once, then stamp the digest's items delivered
//! 5. `MessageSource::mark_consumed()` for completed items, best effort
//!
//! Items completed by an earlier run whose digest was never delivered are
//! re-included from their stored summary.
//!
//! A failing item never stops its siblings. Only fetch, compile and dispatch
//! failures abort a run.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::AccountConfig;
use crate::deliver::{DigestDispatcher, DispatchOutcome};
use crate::digest::DigestCompiler;
use crate::error::{FailureCode, StatusError};
use crate::normalize::Normalizer;
use crate::pipeline::types::{
    DispatchStatus, ItemReport, MarkFailure, RawMessage, RunOutcome, RunReport, RunStage,
    SummarizedItem, SummaryOutcome,
};
use crate::source::{MessageFilter, MessageSource};
use crate::store::{ProcessingStatus, StatusStore};
use crate::summarize::Summarizer;

/// How one fetched message ended up.
enum ItemResult {
    Completed(SummarizedItem),
    Failed(FailureCode),
    /// Completed and delivered by an earlier run; only needs marking.
    AlreadyDelivered,
    /// Completed by an earlier run whose digest never went out.
    Undelivered(SummarizedItem),
}

/// Runs the fetch → summarize → dispatch → mark sequence for one account.
pub struct Orchestrator {
    account: String,
    filter: MessageFilter,
    fetch_limit: usize,
    recipient: String,
    source: Arc<dyn MessageSource>,
    normalizer: Normalizer,
    summarizer: Arc<Summarizer>,
    compiler: DigestCompiler,
    dispatcher: Arc<dyn DigestDispatcher>,
    store: Arc<dyn StatusStore>,
}

impl Orchestrator {
    pub fn new(
        account: &AccountConfig,
        recipient: impl Into<String>,
        source: Arc<dyn MessageSource>,
        summarizer: Arc<Summarizer>,
        dispatcher: Arc<dyn DigestDispatcher>,
        store: Arc<dyn StatusStore>,
    ) -> Self {
        Self {
            account: account.name.clone(),
            filter: MessageFilter::unread(&account.label),
            fetch_limit: account.fetch_limit,
            recipient: recipient.into(),
            source,
            normalizer: Normalizer::default(),
            summarizer,
            compiler: DigestCompiler::new(),
            dispatcher,
            store,
        }
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Execute one run. Always returns a report; failures are described in it.
    ///
    /// `cancel` is checked between items. Items finished before cancellation
    /// still flow through compile, dispatch and mark.
    pub async fn run(&self, cancel: &AtomicBool) -> RunReport {
        let mut report = RunReport::new(&self.account);
        info!(
            account = %self.account,
            run_id = %report.run_id,
            label = %self.filter.label,
            source = self.source.name(),
            backend = self.summarizer.backend_name(),
            "Starting digest run"
        );

        let fetched = match self.source.fetch(&self.filter, self.fetch_limit).await {
            Ok(fetched) => fetched,
            Err(e) => {
                error!(account = %self.account, error = %e, "Fetch failed, aborting run");
                return self.finish(
                    report,
                    RunOutcome::Aborted {
                        stage: RunStage::Fetching,
                        reason: e.to_string(),
                    },
                );
            }
        };
        report.warnings.extend(fetched.warnings);
        report.fetched = fetched.messages.len();

        if fetched.messages.is_empty() {
            info!(account = %self.account, "No newsletters to process");
            return self.finish(report, RunOutcome::NothingToDo);
        }
        info!(account = %self.account, count = report.fetched, "Fetched newsletters");

        let mut summaries = Vec::new();
        let mut to_mark = Vec::new();
        let mut remaining = 0;

        for (index, message) in fetched.messages.iter().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                remaining = report.fetched - index;
                warn!(
                    account = %self.account,
                    remaining,
                    "Shutdown requested, stopping before next item"
                );
                report.cancelled = true;
                break;
            }

            info!(
                id = %message.id,
                position = index + 1,
                total = report.fetched,
                sender = %message.sender,
                "Processing newsletter"
            );

            match self.process_item(message).await {
                ItemResult::Completed(summary) => {
                    report.processed += 1;
                    report.items.push(item_report(
                        message,
                        ProcessingStatus::Completed,
                        None,
                        summary.bullets().to_vec(),
                    ));
                    to_mark.push(message.id.clone());
                    summaries.push(summary);
                }
                ItemResult::Failed(code) => {
                    report.failed += 1;
                    report.items.push(item_report(
                        message,
                        ProcessingStatus::Failed,
                        Some(code),
                        Vec::new(),
                    ));
                }
                ItemResult::AlreadyDelivered => {
                    report.already_completed += 1;
                    report.items.push(item_report(
                        message,
                        ProcessingStatus::Completed,
                        None,
                        Vec::new(),
                    ));
                    to_mark.push(message.id.clone());
                }
                ItemResult::Undelivered(summary) => {
                    report.already_completed += 1;
                    report.carried_over += 1;
                    report.items.push(item_report(
                        message,
                        ProcessingStatus::Completed,
                        None,
                        summary.bullets().to_vec(),
                    ));
                    to_mark.push(message.id.clone());
                    summaries.push(summary);
                }
            }
        }

        if !summaries.is_empty() {
            let digest = match catch_unwind(AssertUnwindSafe(|| self.compiler.compile(&summaries)))
            {
                Ok(digest) => digest,
                Err(_) => {
                    error!(account = %self.account, "Digest compilation panicked");
                    return self.finish(
                        report,
                        RunOutcome::Aborted {
                            stage: RunStage::Compiling,
                            reason: "digest compilation panicked".to_string(),
                        },
                    );
                }
            };

            match self.dispatcher.send(&digest, &self.recipient).await {
                Ok(DispatchOutcome::Sent { recipient }) => {
                    report.dispatch = DispatchStatus::Sent { recipient };
                }
                Ok(DispatchOutcome::Skipped { reason }) => {
                    report.dispatch = DispatchStatus::Skipped { reason };
                }
                Err(e) => {
                    error!(account = %self.account, error = %e, "Digest dispatch failed");
                    report.dispatch = DispatchStatus::Failed {
                        reason: e.to_string(),
                    };
                    return self.finish(
                        report,
                        RunOutcome::Aborted {
                            stage: RunStage::Dispatching,
                            reason: e.to_string(),
                        },
                    );
                }
            }

            let delivered: Vec<String> =
                summaries.iter().map(|s| s.item.source_id.clone()).collect();
            if let Err(e) = self.store.mark_delivered(&self.account, &delivered).await {
                warn!(account = %self.account, error = %e, "Failed to record delivery");
                report.warnings.push(format!("delivery not recorded: {e}"));
            }
        } else {
            info!(account = %self.account, "No completed items, digest not sent");
        }

        if !to_mark.is_empty() {
            let marked = self.source.mark_consumed(&to_mark).await;
            debug!(
                account = %self.account,
                marked = marked.marked.len(),
                failed = marked.failures.len(),
                "Marked newsletters as read"
            );
            report.mark_failures = marked
                .failures
                .into_iter()
                .map(|(id, reason)| MarkFailure { id, reason })
                .collect();
        }

        let outcome = if report.cancelled {
            RunOutcome::Cancelled { remaining }
        } else if report.failed > 0 {
            RunOutcome::PartialSuccess {
                failed: report.failed,
            }
        } else if summaries.is_empty() {
            RunOutcome::NothingToDo
        } else {
            RunOutcome::Completed
        };
        self.finish(report, outcome)
    }

    async fn process_item(&self, message: &RawMessage) -> ItemResult {
        let record = match self
            .store
            .register(&self.account, &message.id, &message.sender, &message.subject)
            .await
        {
            Ok(record) => record,
            Err(e) => return self.status_failure(&message.id, e).await,
        };

        if record.awaits_delivery()
            && let Some(summary) = record.summary
        {
            info!(id = %message.id, "Completed earlier but never delivered, re-including");
            return ItemResult::Undelivered(summary);
        }
        if record.status == ProcessingStatus::Completed {
            debug!(id = %message.id, "Already completed by an earlier run");
            return ItemResult::AlreadyDelivered;
        }

        if let Err(e) = self
            .store
            .transition(&self.account, &message.id, ProcessingStatus::Processing, None)
            .await
        {
            return self.status_failure(&message.id, e).await;
        }

        let normalized = self.normalizer.normalize(message);
        let summary = self.summarizer.summarize(normalized).await;

        if let SummaryOutcome::Failed(code) = summary.outcome {
            if let Err(e) = self
                .store
                .transition(
                    &self.account,
                    &message.id,
                    ProcessingStatus::Failed,
                    Some(code),
                )
                .await
            {
                warn!(id = %message.id, error = %e, "Failed to record item failure");
            }
            return ItemResult::Failed(code);
        }

        if let Err(e) = self
            .store
            .record_summary(&self.account, &message.id, &summary)
            .await
        {
            return self.status_failure(&message.id, e).await;
        }

        match self
            .store
            .transition(&self.account, &message.id, ProcessingStatus::Completed, None)
            .await
        {
            Ok(_) => ItemResult::Completed(summary),
            Err(e) => self.status_failure(&message.id, e).await,
        }
    }

    /// A status write failed mid-item: mark the item failed if the store lets us.
    async fn status_failure(&self, id: &str, e: StatusError) -> ItemResult {
        error!(id = %id, error = %e, "Status store error, marking item failed");
        if let Err(e) = self
            .store
            .transition(
                &self.account,
                id,
                ProcessingStatus::Failed,
                Some(FailureCode::StatusStore),
            )
            .await
        {
            debug!(id = %id, error = %e, "Could not record status-store failure");
        }
        ItemResult::Failed(FailureCode::StatusStore)
    }

    fn finish(&self, mut report: RunReport, outcome: RunOutcome) -> RunReport {
        report.outcome = outcome;
        report.finished_at = Utc::now();
        info!(
            account = %self.account,
            run_id = %report.run_id,
            fetched = report.fetched,
            processed = report.processed,
            failed = report.failed,
            mark_failures = report.mark_failures.len(),
            outcome = ?report.outcome,
            "Digest run finished"
        );
        report
    }
}

fn item_report(
    message: &RawMessage,
    status: ProcessingStatus,
    failure: Option<FailureCode>,
    bullets: Vec<String>,
) -> ItemReport {
    ItemReport {
        id: message.id.clone(),
        sender: message.sender.clone(),
        subject: message.subject.clone(),
        status,
        failure,
        bullets,
    }
}
