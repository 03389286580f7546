//! Summarizer: normalized text → 1–3 bullets via a pluggable backend.

pub mod backend;
pub mod prompt;

use std::sync::Arc;

pub use backend::{OllamaBackend, OpenAiBackend, SummaryBackend, create_backend};
pub use prompt::{SummaryStyle, build_prompt, parse_bullets};

use crate::config::SummarizerConfig;
use crate::error::BackendError;
use crate::pipeline::types::{NormalizedItem, SummarizedItem, SummaryOutcome};

/// Bullet shown when the body is too short to summarize.
pub const NO_CONTENT_SENTINEL: &str = "No content to summarize";

/// Bullet shown when the backend answered with nothing usable.
pub const UNPARSEABLE_SENTINEL: &str = "Unable to extract summary";

/// Bullet shown when the backend call failed.
pub const ERROR_SENTINEL: &str = "Error during summarization";

/// Summarizes items with one backend chosen at construction.
pub struct Summarizer {
    backend: Arc<dyn SummaryBackend>,
    config: SummarizerConfig,
}

impl Summarizer {
    pub fn new(backend: Arc<dyn SummaryBackend>, config: SummarizerConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Summarize one item. Never fails; the outcome records what happened.
    pub async fn summarize(&self, item: NormalizedItem) -> SummarizedItem {
        if item.body.trim().chars().count() < self.config.min_chars {
            tracing::warn!(
                id = %item.source_id,
                sender = %item.sender,
                "Newsletter too short to summarize"
            );
            return SummarizedItem::sentinel(item, NO_CONTENT_SENTINEL, SummaryOutcome::Skipped);
        }

        let prompt = build_prompt(&item.sender, &item.body, self.config.style);
        match self.generate_with_timeout(&prompt).await {
            Ok(response) => {
                let bullets = parse_bullets(&response);
                if bullets.is_empty() {
                    tracing::warn!(id = %item.source_id, "No bullets in backend response");
                    return SummarizedItem::sentinel(
                        item,
                        UNPARSEABLE_SENTINEL,
                        SummaryOutcome::Unparseable,
                    );
                }
                tracing::info!(
                    id = %item.source_id,
                    sender = %item.sender,
                    bullets = bullets.len(),
                    "Summarized newsletter"
                );
                SummarizedItem::new(
                    item,
                    bullets,
                    SummaryOutcome::Summarized,
                    UNPARSEABLE_SENTINEL,
                )
            }
            Err(e) => {
                tracing::error!(
                    id = %item.source_id,
                    backend = self.backend.name(),
                    error = %e,
                    "Summarization failed"
                );
                SummarizedItem::sentinel(item, ERROR_SENTINEL, SummaryOutcome::Failed(e.code()))
            }
        }
    }

    async fn generate_with_timeout(&self, prompt: &str) -> Result<String, BackendError> {
        match tokio::time::timeout(self.config.timeout, self.backend.generate(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout {
                provider: self.backend.name().to_string(),
                timeout: self.config.timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::error::FailureCode;

    enum Reply {
        Text(&'static str),
        Fail,
        Hang,
    }

    struct MockBackend {
        reply: Reply,
        calls: AtomicUsize,
    }

    impl MockBackend {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SummaryBackend for MockBackend {
        fn name(&self) -> &str {
            "mock"
        }

        fn model_name(&self) -> &str {
            "mock-model"
        }

        async fn generate(&self, _prompt: &str) -> Result<String, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.reply {
                Reply::Text(t) => Ok(t.to_string()),
                Reply::Fail => Err(BackendError::Unavailable {
                    provider: "mock".into(),
                    url: "http://localhost:0".into(),
                    reason: "connection refused".into(),
                }),
                Reply::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(String::new())
                }
            }
        }
    }

    fn item(body: &str) -> NormalizedItem {
        NormalizedItem {
            source_id: "m1".into(),
            sender: "news@example.com".into(),
            subject: "Weekly".into(),
            received_at: Utc::now(),
            body: body.into(),
            links: vec![],
        }
    }

    fn long_body() -> String {
        "Markets rallied as inflation cooled for the third month in a row. ".repeat(3)
    }

    fn summarizer(backend: Arc<MockBackend>) -> Summarizer {
        Summarizer::new(
            backend,
            SummarizerConfig {
                timeout: Duration::from_millis(50),
                ..SummarizerConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn short_body_skips_backend() {
        let backend = MockBackend::new(Reply::Text("- never"));
        let s = summarizer(Arc::clone(&backend));

        let out = s.summarize(item("   too short   ")).await;
        assert_eq!(out.bullets(), [NO_CONTENT_SENTINEL]);
        assert_eq!(out.outcome, SummaryOutcome::Skipped);
        let out = s.summarize(item("")).await;
        assert_eq!(out.outcome, SummaryOutcome::Skipped);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn successful_summary_has_at_most_three_bullets() {
        let backend = MockBackend::new(Reply::Text("- A\n- B\n- C\n- D"));
        let out = summarizer(Arc::clone(&backend))
            .summarize(item(&long_body()))
            .await;
        assert_eq!(out.bullets(), ["A", "B", "C"]);
        assert_eq!(out.outcome, SummaryOutcome::Summarized);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_response_is_unparseable() {
        let backend = MockBackend::new(Reply::Text("\n  \n"));
        let out = summarizer(backend).summarize(item(&long_body())).await;
        assert_eq!(out.bullets(), [UNPARSEABLE_SENTINEL]);
        assert_eq!(out.outcome, SummaryOutcome::Unparseable);
    }

    #[tokio::test]
    async fn backend_failure_records_code() {
        let backend = MockBackend::new(Reply::Fail);
        let out = summarizer(backend).summarize(item(&long_body())).await;
        assert_eq!(out.bullets(), [ERROR_SENTINEL]);
        assert_eq!(
            out.outcome,
            SummaryOutcome::Failed(FailureCode::BackendUnavailable)
        );
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let backend = MockBackend::new(Reply::Hang);
        let out = summarizer(backend).summarize(item(&long_body())).await;
        assert_eq!(out.bullets(), [ERROR_SENTINEL]);
        assert_eq!(out.outcome, SummaryOutcome::Failed(FailureCode::BackendTimeout));
    }
}
