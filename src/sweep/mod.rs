//! Subscription sweeps: the concurrent fan-out around the expiry policy.

mod processor;
mod worker;

pub use processor::{SubscriptionProcessor, SubscriptionSummary};
pub use worker::{FailedSubscription, SweepRunResult, run_sweep, start_sweep_worker};

use crate::cloud::CloudError;

/// Why a single resource group could not be processed.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("Timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Task failed: {0}")]
    Task(String),
}
