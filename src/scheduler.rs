//! Multi-account runner and cron ticker.
//!
//! `Distiller` owns the components shared by every account (summarizer,
//! dispatcher, status store) and builds a per-account `Orchestrator` on each
//! run. Runs for different accounts may overlap; runs for the same account
//! are serialized.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::DistillerConfig;
use crate::deliver::{DigestDispatcher, SmtpDispatcher};
use crate::error::{ConfigError, Error};
use crate::normalize::Normalizer;
use crate::pipeline::{Orchestrator, RunReport};
use crate::source::{MessageSource, create_source};
use crate::store::{StatusStore, open_status_store};
use crate::summarize::{Summarizer, create_backend};

/// How often the ticker wakes to check the shutdown flag while waiting.
const SHUTDOWN_POLL: Duration = Duration::from_secs(1);

/// Parse a cron expression. Five-field expressions get a leading seconds field.
pub fn parse_schedule(expr: &str) -> Result<Schedule, ConfigError> {
    let expr = expr.trim();
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| ConfigError::InvalidValue {
        key: "DIGEST_SCHEDULE".to_string(),
        message: format!("invalid cron '{expr}': {e}"),
    })
}

/// Runs digests for every configured account.
pub struct Distiller {
    config: DistillerConfig,
    summarizer: Arc<Summarizer>,
    dispatcher: Arc<dyn DigestDispatcher>,
    store: Arc<dyn StatusStore>,
    /// Sources are built on first use and reused so refreshed tokens stick.
    sources: Mutex<HashMap<String, Arc<dyn MessageSource>>>,
    locks: HashMap<String, Arc<Mutex<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl Distiller {
    /// Build every shared component from configuration.
    pub async fn from_config(config: DistillerConfig) -> Result<Self, Error> {
        let backend = create_backend(&config.backend)?;
        info!(
            provider = backend.name(),
            model = backend.model_name(),
            "Summary backend ready"
        );
        let summarizer = Arc::new(Summarizer::new(backend, config.summarizer.clone()));
        let dispatcher: Arc<dyn DigestDispatcher> =
            Arc::new(SmtpDispatcher::new(config.smtp.clone()));
        let store = open_status_store(config.db_path.as_deref()).await?;
        Ok(Self::new(config, summarizer, dispatcher, store))
    }

    pub fn new(
        config: DistillerConfig,
        summarizer: Arc<Summarizer>,
        dispatcher: Arc<dyn DigestDispatcher>,
        store: Arc<dyn StatusStore>,
    ) -> Self {
        let locks = config
            .accounts
            .iter()
            .map(|a| (a.name.clone(), Arc::new(Mutex::new(()))))
            .collect();
        Self {
            config,
            summarizer,
            dispatcher,
            store,
            sources: Mutex::new(HashMap::new()),
            locks,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Use `source` for `account` instead of building one from configuration.
    pub fn with_source(mut self, account: &str, source: Arc<dyn MessageSource>) -> Self {
        self.sources.get_mut().insert(account.to_string(), source);
        self
    }

    pub fn account_names(&self) -> Vec<String> {
        self.config.accounts.iter().map(|a| a.name.clone()).collect()
    }

    /// Flag checked between items; set it to stop in-flight runs early.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn status_store(&self) -> Arc<dyn StatusStore> {
        Arc::clone(&self.store)
    }

    async fn source_for(&self, account: &str) -> Result<Arc<dyn MessageSource>, Error> {
        let mut sources = self.sources.lock().await;
        if let Some(source) = sources.get(account) {
            return Ok(Arc::clone(source));
        }
        let config = self.account_config(account)?;
        let source = create_source(account, &config.source)?;
        sources.insert(account.to_string(), Arc::clone(&source));
        Ok(source)
    }

    fn account_config(&self, account: &str) -> Result<&crate::config::AccountConfig, Error> {
        self.config.account(account).ok_or_else(|| {
            ConfigError::InvalidValue {
                key: "account".to_string(),
                message: format!("unknown account '{account}'"),
            }
            .into()
        })
    }

    /// Run once for one credential set.
    ///
    /// Configuration problems (unknown account, missing token file) are
    /// returned as errors; everything after that is described in the report.
    pub async fn run_account(&self, account: &str) -> Result<RunReport, Error> {
        let config = self.account_config(account)?;
        let lock = self
            .locks
            .get(account)
            .cloned()
            .unwrap_or_else(|| Arc::new(Mutex::new(())));

        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                info!(account, "Run already in progress, waiting for it to finish");
                lock.lock().await
            }
        };

        let source = self.source_for(account).await?;
        let recipient = config
            .recipient
            .clone()
            .unwrap_or_else(|| self.config.smtp.recipient.clone());

        let orchestrator = Orchestrator::new(
            config,
            recipient,
            source,
            Arc::clone(&self.summarizer),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.store),
        )
        .with_normalizer(Normalizer::new(self.config.normalizer.clone()));

        Ok(orchestrator.run(&self.shutdown).await)
    }

    /// Run every configured account concurrently.
    pub async fn run_all(&self) -> Vec<(String, Result<RunReport, Error>)> {
        let names = self.account_names();
        let runs = names.iter().map(|name| self.run_account(name));
        let results = futures::future::join_all(runs).await;
        names.into_iter().zip(results).collect()
    }
}

/// Log the result of one account's run.
pub fn log_run_result(account: &str, result: &Result<RunReport, Error>) {
    match result {
        Ok(report) if report.is_aborted() => {
            warn!(account, outcome = ?report.outcome, "Digest run aborted")
        }
        Ok(report) => info!(
            account,
            processed = report.processed,
            failed = report.failed,
            dispatch = ?report.dispatch,
            "Digest run complete"
        ),
        Err(e) => error!(account, error = %e, "Digest run could not start"),
    }
}

/// Spawn a background task that runs every account on each cron fire.
///
/// Returns a `JoinHandle` and the shutdown flag. Setting the flag stops the
/// ticker and cancels in-flight runs between items.
pub fn spawn_digest_scheduler(
    distiller: Arc<Distiller>,
    schedule: Schedule,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = distiller.shutdown_flag();
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(schedule = %schedule, "Digest scheduler started");

        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!("Schedule has no upcoming fire times, stopping scheduler");
                return;
            };
            info!(next = %next, "Next digest run scheduled");

            while Utc::now() < next {
                if shutdown.load(Ordering::Relaxed) {
                    info!("Digest scheduler shutting down");
                    return;
                }
                let remaining = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(remaining.min(SHUTDOWN_POLL)).await;
            }

            if shutdown.load(Ordering::Relaxed) {
                info!("Digest scheduler shutting down");
                return;
            }

            for (account, result) in distiller.run_all().await {
                log_run_result(&account, &result);
            }
        }
    });

    (handle, shutdown_flag)
}
