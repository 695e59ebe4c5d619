//! One pass over one subscription.
//!
//! Groups are listed once, name-exempted groups are dropped, and every other
//! group is evaluated in its own task. Admission is capped by a semaphore and
//! each group's evaluate-write-delete sequence runs under a deadline. A group
//! that errors, times out or panics is counted as failed and never affects its
//! siblings.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::SweepError;
use crate::{
    cloud::{ActivityLookup, CloudError, ResourceGroup, ResourceGroupRepository},
    config::CleanupConfig,
    expiry::{ExpiryPolicy, ExpiryState, tags::format_expiry},
};

/// Counts for one subscription pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSummary {
    pub subscription: String,
    /// Groups returned by the listing.
    pub total: usize,
    /// Groups skipped because their name matched the exemption pattern.
    pub name_exempted: usize,
    /// Groups evaluated without error (tag-exempt groups included).
    pub processed: usize,
    /// Groups whose evaluation or mutation failed, timed out or panicked.
    pub failed: usize,
    /// Names of the groups deleted in this pass.
    pub cleaned: Vec<String>,
}

impl SubscriptionSummary {
    pub fn cleaned_count(&self) -> usize {
        self.cleaned.len()
    }
}

/// The per-group unit of work, cloned into each task.
#[derive(Clone)]
struct GroupWorker {
    repository: Arc<dyn ResourceGroupRepository>,
    activity: Arc<dyn ActivityLookup>,
    policy: Arc<ExpiryPolicy>,
}

impl GroupWorker {
    async fn process(
        &self,
        subscription: &str,
        group: ResourceGroup,
        now: DateTime<Utc>,
    ) -> Result<ExpiryState, CloudError> {
        let name = group.name.as_str();
        let evaluation = self
            .policy
            .evaluate(subscription, &group, now, self.activity.as_ref())
            .await;

        if let Some(tags) = &evaluation.tags {
            self.repository.update_tags(subscription, name, tags).await?;
        }

        let expires_by = evaluation.expires_by.map(format_expiry);

        if evaluation.should_delete {
            warn!(
                subscription,
                resource_group = name,
                expires_by = expires_by.as_deref(),
                "Deleting expired resource group"
            );
            self.repository.delete(subscription, name).await?;
            return Ok(ExpiryState::Deleted);
        }

        match evaluation.state {
            ExpiryState::ValidPastExpiry => info!(
                subscription,
                resource_group = name,
                expires_by = expires_by.as_deref(),
                "DRY RUN: Resource group expired but cleanup is disabled"
            ),
            state => debug!(
                subscription,
                resource_group = name,
                expires_by = expires_by.as_deref(),
                state = %state,
                "Resource group not deleted"
            ),
        }

        Ok(evaluation.state)
    }
}

/// Runs the expiry policy across one subscription.
#[derive(Clone)]
pub struct SubscriptionProcessor {
    worker: GroupWorker,
    exemptions: Option<Regex>,
    max_concurrency: usize,
    group_timeout: Duration,
}

impl std::fmt::Debug for SubscriptionProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionProcessor")
            .field("policy", &self.worker.policy)
            .field("exemptions", &self.exemptions.as_ref().map(Regex::as_str))
            .field("max_concurrency", &self.max_concurrency)
            .field("group_timeout", &self.group_timeout)
            .finish()
    }
}

impl SubscriptionProcessor {
    /// A processor with default limits and no name exemptions.
    pub fn new(
        repository: Arc<dyn ResourceGroupRepository>,
        activity: Arc<dyn ActivityLookup>,
        policy: ExpiryPolicy,
    ) -> Self {
        let defaults = CleanupConfig::default();
        Self {
            worker: GroupWorker {
                repository,
                activity,
                policy: Arc::new(policy),
            },
            exemptions: None,
            max_concurrency: defaults.max_concurrency,
            group_timeout: defaults.group_timeout(),
        }
    }

    /// Build a processor from the `[cleanup]` section.
    pub fn from_config(
        config: &CleanupConfig,
        repository: Arc<dyn ResourceGroupRepository>,
        activity: Arc<dyn ActivityLookup>,
    ) -> Result<Self, regex::Error> {
        Ok(
            Self::new(repository, activity, ExpiryPolicy::from_config(config))
                .with_exemptions(config.exemption_pattern()?)
                .with_max_concurrency(config.max_concurrency)
                .with_group_timeout(config.group_timeout()),
        )
    }

    pub fn with_exemptions(mut self, exemptions: Option<Regex>) -> Self {
        self.exemptions = exemptions;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_group_timeout(mut self, group_timeout: Duration) -> Self {
        self.group_timeout = group_timeout;
        self
    }

    /// Whether past-expiry groups are deleted rather than only reported.
    pub fn cleanup_enabled(&self) -> bool {
        self.worker.policy.cleanup_enabled()
    }

    fn is_name_exempt(&self, name: &str) -> bool {
        self.exemptions
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(name))
    }

    /// Process every resource group in `subscription` as of `now`.
    ///
    /// Only a listing failure is returned as an error; per-group failures are
    /// counted in the summary.
    pub async fn process(
        &self,
        subscription: &str,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionSummary, CloudError> {
        let groups = self.worker.repository.list(subscription).await?;

        let mut summary = SubscriptionSummary {
            subscription: subscription.to_string(),
            total: groups.len(),
            ..Default::default()
        };

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut handles = Vec::with_capacity(groups.len());

        for group in groups {
            if self.is_name_exempt(&group.name) {
                info!(
                    subscription,
                    resource_group = %group.name,
                    "Resource group is exempted from cleanup by name"
                );
                summary.name_exempted += 1;
                continue;
            }

            let name = group.name.clone();
            let worker = self.worker.clone();
            let semaphore = semaphore.clone();
            let timeout = self.group_timeout;
            let subscription = subscription.to_string();

            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| SweepError::Task(e.to_string()))?;

                let work = worker.process(&subscription, group, now);
                match tokio::time::timeout(timeout, work).await {
                    Ok(result) => result.map_err(SweepError::from),
                    Err(_) => Err(SweepError::Timeout {
                        secs: timeout.as_secs(),
                    }),
                }
            });
            handles.push((name, handle));
        }

        for (name, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_error) => Err(SweepError::Task(join_error.to_string())),
            };

            match result {
                Ok(state) => {
                    summary.processed += 1;
                    if state == ExpiryState::Deleted {
                        summary.cleaned.push(name);
                    }
                }
                Err(e) => {
                    error!(
                        subscription,
                        resource_group = %name,
                        error = %e,
                        "Error while processing resource group"
                    );
                    summary.failed += 1;
                }
            }
        }

        info!(
            subscription,
            cleaned = summary.cleaned_count(),
            processed = summary.processed,
            failed = summary.failed,
            name_exempted = summary.name_exempted,
            total = summary.total,
            "{} resource groups cleaned up in subscription {}",
            summary.cleaned_count(),
            subscription
        );

        Ok(summary)
    }
}
