//! Sweeps across every configured subscription.
//!
//! [`run_sweep`] is a single pass (the scheduled-trigger equivalent);
//! [`start_sweep_worker`] repeats it on an interval until shutdown.

use std::{future::Future, sync::Arc};

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::Instrument;

use super::{SubscriptionProcessor, SubscriptionSummary};
use crate::config::CleanupConfig;

/// A subscription whose pass could not run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedSubscription {
    pub subscription: String,
    pub error: String,
}

/// Results from a single sweep.
#[derive(Debug, Default)]
pub struct SweepRunResult {
    /// True when the janitor is disabled and nothing was touched.
    pub skipped: bool,
    /// Completed subscription passes, in configuration order.
    pub subscriptions: Vec<SubscriptionSummary>,
    /// Subscriptions whose listing failed or whose task died.
    pub failed_subscriptions: Vec<FailedSubscription>,
}

impl SweepRunResult {
    /// Resource groups deleted across all subscriptions.
    pub fn total_cleaned(&self) -> usize {
        self.subscriptions.iter().map(|s| s.cleaned_count()).sum()
    }

    /// Resource groups evaluated without error across all subscriptions.
    pub fn total_processed(&self) -> usize {
        self.subscriptions.iter().map(|s| s.processed).sum()
    }

    /// Failed resource groups across all subscriptions.
    pub fn total_failed_groups(&self) -> usize {
        self.subscriptions.iter().map(|s| s.failed).sum()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed_subscriptions.is_empty() || self.total_failed_groups() > 0
    }
}

/// Log suffix for passes that only report expired groups. Follows the
/// processor's policy, which is what actually decides on deletion.
fn dry_run_suffix(processor: &SubscriptionProcessor) -> &'static str {
    if processor.cleanup_enabled() {
        ""
    } else {
        " (DRY RUN)"
    }
}

/// Run one pass over every configured subscription.
///
/// Subscriptions run concurrently, bounded by `max_concurrent_subscriptions`,
/// each in its own task. Nothing here fails the run as a whole: problems end up
/// in the returned result and in the log.
pub async fn run_sweep(
    processor: &SubscriptionProcessor,
    config: &CleanupConfig,
) -> SweepRunResult {
    if !config.is_enabled {
        tracing::info!("Janitor disabled by configuration, skipping run");
        return SweepRunResult {
            skipped: true,
            ..Default::default()
        };
    }

    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_subscriptions.max(1)));
    let mut handles = Vec::with_capacity(config.subscriptions.len());

    for subscription in &config.subscriptions {
        let processor = processor.clone();
        let semaphore = semaphore.clone();
        let id = subscription.clone();
        let span = tracing::info_span!("subscription_pass", subscription = %id);

        let handle = tokio::spawn(
            async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| e.to_string())?;
                processor
                    .process(&id, Utc::now())
                    .await
                    .map_err(|e| e.to_string())
            }
            .instrument(span),
        );
        handles.push((subscription.clone(), handle));
    }

    let mut result = SweepRunResult::default();

    for (subscription, handle) in handles {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(join_error) => Err(join_error.to_string()),
        };

        match outcome {
            Ok(summary) => result.subscriptions.push(summary),
            Err(error) => {
                tracing::error!(
                    subscription = %subscription,
                    error = %error,
                    "Error while processing subscription"
                );
                result.failed_subscriptions.push(FailedSubscription {
                    subscription,
                    error,
                });
            }
        }
    }

    tracing::info!(
        subscriptions = result.subscriptions.len(),
        failed_subscriptions = result.failed_subscriptions.len(),
        cleaned = result.total_cleaned(),
        processed = result.total_processed(),
        failed = result.total_failed_groups(),
        "Sweep complete{}",
        dry_run_suffix(processor)
    );

    result
}

/// Run sweeps every `config.interval_secs` until `shutdown` resolves.
///
/// A sweep in progress always finishes; shutdown is only observed between
/// sweeps.
pub async fn start_sweep_worker<F>(
    processor: SubscriptionProcessor,
    config: CleanupConfig,
    shutdown: F,
) where
    F: Future<Output = ()>,
{
    if !config.is_enabled {
        tracing::info!("Sweep worker disabled by configuration");
        return;
    }

    tracing::info!(
        interval_secs = config.interval_secs,
        subscriptions = config.subscriptions.len(),
        cleanup_enabled = processor.cleanup_enabled(),
        max_concurrency = config.max_concurrency,
        "Starting sweep worker{}",
        dry_run_suffix(&processor)
    );

    let interval = config.interval();
    tokio::pin!(shutdown);

    loop {
        run_sweep(&processor, &config).await;

        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested, stopping sweep worker");
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
