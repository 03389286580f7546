use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, bail};
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use newsletter_distiller::config::DistillerConfig;
use newsletter_distiller::pipeline::RunReport;
use newsletter_distiller::scheduler::{self, Distiller};

/// Summarize labeled newsletters into one emailed digest.
#[derive(Parser, Debug)]
#[command(name = "distiller", about = "Newsletter digest distiller", version)]
struct Args {
    /// Run immediately and exit, even if DIGEST_SCHEDULE is set.
    #[arg(long)]
    once: bool,

    /// Run only this credential set (implies --once).
    #[arg(long, value_name = "NAME")]
    account: Option<String>,
}

impl Args {
    fn run_once(&self) -> bool {
        self.once || self.account.is_some()
    }
}

/// Console logging plus an optional daily-rotated file.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "distiller.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    guard
}

fn print_reports(reports: &[RunReport]) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(reports)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    dotenvy::dotenv().ok();

    // Both lettre and the IMAP client need a process-wide provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = DistillerConfig::from_env().context("failed to load configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    let schedule = config.schedule.clone();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        accounts = ?config.accounts.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
        provider = config.backend.provider(),
        "Newsletter distiller starting"
    );

    let distiller = Arc::new(Distiller::from_config(config).await?);

    match schedule {
        Some(expr) if !args.run_once() => {
            let schedule = scheduler::parse_schedule(&expr)?;
            let (handle, shutdown) = scheduler::spawn_digest_scheduler(distiller, schedule);

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            tracing::info!("Shutdown requested, finishing current item");
            shutdown.store(true, Ordering::Relaxed);
            handle.await.context("scheduler task panicked")?;
            Ok(())
        }
        _ => {
            let results = match args.account {
                Some(name) => {
                    let result = distiller.run_account(&name).await;
                    vec![(name, result)]
                }
                None => distiller.run_all().await,
            };

            let mut reports = Vec::new();
            let mut failures = 0;
            for (account, result) in results {
                scheduler::log_run_result(&account, &result);
                match result {
                    Ok(report) => {
                        if report.is_aborted() {
                            failures += 1;
                        }
                        reports.push(report);
                    }
                    Err(_) => failures += 1,
                }
            }
            print_reports(&reports)?;

            if failures > 0 {
                bail!("{failures} account run(s) did not complete");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_flags_follows_schedule() {
        let args = Args::try_parse_from(["distiller"]).unwrap();
        assert!(!args.run_once());
        assert!(args.account.is_none());
    }

    #[test]
    fn account_implies_once() {
        let args = Args::try_parse_from(["distiller", "--account", "work"]).unwrap();
        assert_eq!(args.account.as_deref(), Some("work"));
        assert!(args.run_once());
    }

    #[test]
    fn account_requires_a_name() {
        assert!(Args::try_parse_from(["distiller", "--account"]).is_err());
    }

    #[test]
    fn unknown_flag_rejected() {
        assert!(Args::try_parse_from(["distiller", "--loop"]).is_err());
    }
}
