//! In-memory cloud for tests and local dry runs.
//!
//! Groups and activity are keyed by `(subscription, group)`. Failures and
//! latency can be injected per subscription or per group, and every mutating
//! call is recorded so tests can assert exactly what was written.

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;

use super::{
    ActivityLookup, ActivityRecord, CloudError, ResourceGroup, ResourceGroupRepository, Tags,
};

type GroupKey = (String, String);

fn key(subscription: &str, name: &str) -> GroupKey {
    (subscription.to_string(), name.to_string())
}

/// A tag write observed by [`MemoryCloud`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagUpdate {
    pub subscription: String,
    pub name: String,
    pub tags: Tags,
}

/// Resource groups and activity held in memory, shared across subscriptions.
#[derive(Default)]
pub struct MemoryCloud {
    groups: DashMap<GroupKey, Tags>,
    activity: DashMap<GroupKey, Vec<ActivityRecord>>,

    failing_lists: DashSet<String>,
    failing_updates: DashSet<GroupKey>,
    failing_deletes: DashSet<GroupKey>,
    failing_activity: DashMap<GroupKey, fn(String) -> CloudError>,
    panicking_groups: DashSet<GroupKey>,
    activity_delay: DashMap<GroupKey, Duration>,

    updates: Mutex<Vec<TagUpdate>>,
    deletes: Mutex<Vec<GroupKey>>,
    activity_queries: Mutex<Vec<(GroupKey, DateTime<Utc>, DateTime<Utc>)>>,

    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl std::fmt::Debug for MemoryCloud {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCloud")
            .field("groups", &self.groups.len())
            .finish()
    }
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a resource group.
    pub fn insert_group(&self, subscription: &str, group: ResourceGroup) {
        self.groups.insert(key(subscription, &group.name), group.tags);
    }

    /// Append activity records for a group.
    pub fn add_activity(&self, subscription: &str, group: &str, records: Vec<ActivityRecord>) {
        self.activity
            .entry(key(subscription, group))
            .or_default()
            .extend(records);
    }

    /// Current tags of a group, or `None` once it has been deleted.
    pub fn tags(&self, subscription: &str, name: &str) -> Option<Tags> {
        self.groups
            .get(&key(subscription, name))
            .map(|entry| entry.value().clone())
    }

    pub fn contains(&self, subscription: &str, name: &str) -> bool {
        self.groups.contains_key(&key(subscription, name))
    }

    /// Make `list` fail for the subscription.
    pub fn fail_list(&self, subscription: &str) {
        self.failing_lists.insert(subscription.to_string());
    }

    pub fn fail_update(&self, subscription: &str, name: &str) {
        self.failing_updates.insert(key(subscription, name));
    }

    pub fn fail_delete(&self, subscription: &str, name: &str) {
        self.failing_deletes.insert(key(subscription, name));
    }

    /// Make activity queries for the group fail with the error built by `error`.
    pub fn fail_activity(&self, subscription: &str, name: &str, error: fn(String) -> CloudError) {
        self.failing_activity.insert(key(subscription, name), error);
    }

    /// Panic inside the activity query for the group.
    pub fn panic_on(&self, subscription: &str, name: &str) {
        self.panicking_groups.insert(key(subscription, name));
    }

    /// Delay activity queries for the group.
    pub fn delay_activity(&self, subscription: &str, name: &str, delay: Duration) {
        self.activity_delay.insert(key(subscription, name), delay);
    }

    /// Tag writes in the order they happened.
    pub fn updates(&self) -> Vec<TagUpdate> {
        self.updates.lock().clone()
    }

    /// Deleted `(subscription, group)` pairs in the order they happened.
    pub fn deletes(&self) -> Vec<GroupKey> {
        self.deletes.lock().clone()
    }

    /// Activity query windows in the order they were requested.
    pub fn activity_queries(&self) -> Vec<(GroupKey, DateTime<Utc>, DateTime<Utc>)> {
        self.activity_queries.lock().clone()
    }

    /// Highest number of activity queries that were running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

/// Tracks concurrent activity queries for [`MemoryCloud::peak_concurrency`].
struct InFlight<'a>(&'a MemoryCloud);

impl<'a> InFlight<'a> {
    fn enter(cloud: &'a MemoryCloud) -> Self {
        let now = cloud.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        cloud.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(cloud)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResourceGroupRepository for MemoryCloud {
    async fn list(&self, subscription: &str) -> Result<Vec<ResourceGroup>, CloudError> {
        if self.failing_lists.contains(subscription) {
            return Err(CloudError::Api {
                status: 500,
                message: format!("injected list failure for {}", subscription),
            });
        }

        let mut groups: Vec<ResourceGroup> = self
            .groups
            .iter()
            .filter(|entry| entry.key().0 == subscription)
            .map(|entry| ResourceGroup {
                name: entry.key().1.clone(),
                tags: entry.value().clone(),
            })
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn update_tags(
        &self,
        subscription: &str,
        name: &str,
        tags: &Tags,
    ) -> Result<(), CloudError> {
        let group_key = key(subscription, name);
        if self.failing_updates.contains(&group_key) {
            return Err(CloudError::Api {
                status: 409,
                message: format!("injected update failure for {}", name),
            });
        }

        match self.groups.get_mut(&group_key) {
            Some(mut entry) => *entry.value_mut() = tags.clone(),
            None => return Err(CloudError::NotFound(name.to_string())),
        }

        self.updates.lock().push(TagUpdate {
            subscription: subscription.to_string(),
            name: name.to_string(),
            tags: tags.clone(),
        });
        Ok(())
    }

    async fn delete(&self, subscription: &str, name: &str) -> Result<(), CloudError> {
        let group_key = key(subscription, name);
        if self.failing_deletes.contains(&group_key) {
            return Err(CloudError::Api {
                status: 409,
                message: format!("injected delete failure for {}", name),
            });
        }

        self.groups.remove(&group_key);
        self.deletes.lock().push(group_key);
        Ok(())
    }
}

#[async_trait]
impl ActivityLookup for MemoryCloud {
    async fn query(
        &self,
        subscription: &str,
        group: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ActivityRecord>, CloudError> {
        let group_key = key(subscription, group);
        let _guard = InFlight::enter(self);

        self.activity_queries
            .lock()
            .push((group_key.clone(), from, to));

        let delay = self.activity_delay.get(&group_key).map(|d| *d.value());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        } else {
            // Let other tasks interleave so concurrency is observable.
            tokio::task::yield_now().await;
        }

        if self.panicking_groups.contains(&group_key) {
            panic!("injected panic for {}", group);
        }

        let failure = self.failing_activity.get(&group_key).map(|f| *f.value());
        if let Some(make_error) = failure {
            return Err(make_error(group.to_string()));
        }

        Ok(self
            .activity
            .get(&group_key)
            .map(|records| records.value().clone())
            .unwrap_or_default())
    }
}
