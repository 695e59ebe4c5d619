//! The per-group expiry decision.
//!
//! A group moves through the following states on every pass:
//!
//! 1. `Exempt`: an exemption marker tag is present. Nothing is written.
//! 2. `NoOrInvalidExpiry`: `ExpiresBy` is missing or unparseable. It is set to
//!    `now + default_expiry_days` (midnight UTC) and the pass ends there.
//! 3. Otherwise recent administrative activity may push `ExpiresBy` later and
//!    refresh `LastModifiedBy`. `ExpiresBy` never moves earlier.
//! 4. The resulting expiry is compared with `now`: `ValidPastExpiry` groups are
//!    deletable when cleanup is enabled, `ValidFutureExpiry` groups never are.
//!
//! Every piece of state lives in the tags, so a pass that dies halfway simply
//! picks up again on the next run.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::tags::{
    ADMINISTRATIVE, EXPIRES_BY, LAST_MODIFIED_BY, add_days, exemption_marker, format_expiry,
    owner_from_caller, read_expiry, sub_days, truncate_to_day,
};
use crate::{
    cloud::{ActivityLookup, ActivityRecord, ResourceGroup, Tags},
    config::CleanupConfig,
};

/// Where a group stands after evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryState {
    /// Carries an exemption marker.
    Exempt,
    /// Had no usable `ExpiresBy`; a default was assigned.
    NoOrInvalidExpiry,
    /// `ExpiresBy` is now or later.
    ValidFutureExpiry,
    /// `ExpiresBy` has passed.
    ValidPastExpiry,
    /// Removed from the subscription after a past-expiry verdict.
    Deleted,
}

impl ExpiryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpiryState::Exempt => "exempt",
            ExpiryState::NoOrInvalidExpiry => "no_or_invalid_expiry",
            ExpiryState::ValidFutureExpiry => "valid_future_expiry",
            ExpiryState::ValidPastExpiry => "valid_past_expiry",
            ExpiryState::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for ExpiryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`ExpiryPolicy::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub state: ExpiryState,
    /// The full tag set to write back, present only when something changed.
    pub tags: Option<Tags>,
    pub should_delete: bool,
    /// Effective expiry after this evaluation. `None` only for exempt groups.
    pub expires_by: Option<DateTime<Utc>>,
    /// True when recent activity moved `ExpiresBy` later.
    pub extended: bool,
}

impl Evaluation {
    fn exempt() -> Self {
        Self {
            state: ExpiryState::Exempt,
            tags: None,
            should_delete: false,
            expires_by: None,
            extended: false,
        }
    }
}

/// Expiry rules shared by every group in a pass.
#[derive(Debug, Clone)]
pub struct ExpiryPolicy {
    default_expiry_days: u32,
    default_extension_days: u32,
    usage_lookback_days: u32,
    cleanup_enabled: bool,
}

impl ExpiryPolicy {
    pub fn new(
        default_expiry_days: u32,
        default_extension_days: u32,
        usage_lookback_days: u32,
        cleanup_enabled: bool,
    ) -> Self {
        Self {
            default_expiry_days,
            default_extension_days,
            usage_lookback_days,
            cleanup_enabled,
        }
    }

    pub fn from_config(config: &CleanupConfig) -> Self {
        Self::new(
            config.default_expiry_days,
            config.default_extension_days,
            config.usage_lookback_days,
            config.cleanup_enabled,
        )
    }

    pub fn cleanup_enabled(&self) -> bool {
        self.cleanup_enabled
    }

    /// Decide what happens to `group` at `now`.
    ///
    /// Activity lookup failures are logged and treated as no recent activity;
    /// nothing else here can fail.
    pub async fn evaluate(
        &self,
        subscription: &str,
        group: &ResourceGroup,
        now: DateTime<Utc>,
        activity: &dyn ActivityLookup,
    ) -> Evaluation {
        let name = group.name.as_str();

        if let Some(marker) = exemption_marker(&group.tags) {
            info!(
                subscription,
                resource_group = name,
                marker,
                "Resource group carries an exemption marker, skipping"
            );
            return Evaluation::exempt();
        }

        let Some(mut expires_by) = read_expiry(&group.tags) else {
            let expires_by = truncate_to_day(add_days(now, self.default_expiry_days));
            let mut tags = group.tags.clone();
            tags.insert(EXPIRES_BY.to_string(), format_expiry(expires_by));

            info!(
                subscription,
                resource_group = name,
                expires_by = %format_expiry(expires_by),
                previous = group.tags.get(EXPIRES_BY).map(String::as_str),
                "Assigned default expiry"
            );

            return Evaluation {
                state: ExpiryState::NoOrInvalidExpiry,
                tags: Some(tags),
                should_delete: false,
                expires_by: Some(expires_by),
                extended: false,
            };
        };

        let mut new_tags = None;
        let mut extended = false;

        match self.latest_activity(subscription, name, now, activity).await {
            Some((at, owner)) => {
                let mut tags = group.tags.clone();
                let mut changed = false;

                let candidate = truncate_to_day(add_days(at, self.default_extension_days));
                if candidate > expires_by {
                    expires_by = candidate;
                    tags.insert(EXPIRES_BY.to_string(), format_expiry(candidate));
                    extended = true;
                    changed = true;
                }

                if tags.get(LAST_MODIFIED_BY).map(String::as_str) != Some(owner.as_str()) {
                    tags.insert(LAST_MODIFIED_BY.to_string(), owner.clone());
                    changed = true;
                }

                if changed {
                    info!(
                        subscription,
                        resource_group = name,
                        expires_by = %format_expiry(expires_by),
                        owner = %owner,
                        extended,
                        "Updated expiry and owner from recent activity"
                    );
                    new_tags = Some(tags);
                }
            }
            None => {
                debug!(
                    subscription,
                    resource_group = name,
                    "Resource group not modified recently"
                );
            }
        }

        let (state, should_delete) = if expires_by < now {
            (ExpiryState::ValidPastExpiry, self.cleanup_enabled)
        } else {
            (ExpiryState::ValidFutureExpiry, false)
        };

        Evaluation {
            state,
            tags: new_tags,
            should_delete,
            expires_by: Some(expires_by),
            extended,
        }
    }

    /// Latest qualifying administrative activity in the lookback window, as
    /// `(timestamp, owner)`.
    async fn latest_activity(
        &self,
        subscription: &str,
        group: &str,
        now: DateTime<Utc>,
        activity: &dyn ActivityLookup,
    ) -> Option<(DateTime<Utc>, String)> {
        if self.usage_lookback_days == 0 {
            return None;
        }

        let from = sub_days(now, self.usage_lookback_days);
        match activity.query(subscription, group, from, now).await {
            Ok(records) => latest_administrative(&records)
                .map(|(at, owner)| (at, owner.to_string())),
            Err(e) => {
                warn!(
                    subscription,
                    resource_group = group,
                    error = %e,
                    "Activity lookup failed, treating as no recent activity"
                );
                None
            }
        }
    }
}

/// The most recent administrative record with an `@` caller and a timestamp.
/// Among equal timestamps the last one wins.
fn latest_administrative(records: &[ActivityRecord]) -> Option<(DateTime<Utc>, &str)> {
    records
        .iter()
        .filter(|record| record.category.as_deref() == Some(ADMINISTRATIVE))
        .filter_map(|record| {
            let owner = owner_from_caller(record.caller.as_deref()?)?;
            Some((record.timestamp?, owner))
        })
        .fold(None, |best, (at, owner)| match best {
            Some((best_at, _)) if best_at > at => best,
            _ => Some((at, owner)),
        })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;
    use crate::cloud::{CloudError, MemoryCloud};

    const SUB: &str = "sub-a";

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn now() -> DateTime<Utc> {
        utc(2024, 1, 1)
    }

    fn policy(cleanup_enabled: bool) -> ExpiryPolicy {
        ExpiryPolicy::new(2, 4, 1, cleanup_enabled)
    }

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn group(pairs: &[(&str, &str)]) -> ResourceGroup {
        ResourceGroup {
            name: "rg-dev".into(),
            tags: tags(pairs),
        }
    }

    #[tokio::test]
    async fn test_untagged_group_gets_default_expiry() {
        let cloud = MemoryCloud::new();
        let eval = policy(true)
            .evaluate(SUB, &group(&[]), now(), &cloud)
            .await;

        assert_eq!(eval.state, ExpiryState::NoOrInvalidExpiry);
        assert_eq!(eval.tags, Some(tags(&[("ExpiresBy", "2024-01-03T00:00:00Z")])));
        assert!(!eval.should_delete);
        // No activity lookup before an expiry exists.
        assert!(cloud.activity_queries().is_empty());
    }

    #[tokio::test]
    async fn test_default_expiry_is_day_truncated() {
        let cloud = MemoryCloud::new();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 17, 45, 12).unwrap();
        let eval = policy(true).evaluate(SUB, &group(&[]), at, &cloud).await;

        assert_eq!(eval.expires_by, Some(utc(2024, 1, 3)));
    }

    #[tokio::test]
    async fn test_malformed_expiry_is_replaced_and_other_tags_kept() {
        let cloud = MemoryCloud::new();
        let eval = policy(true)
            .evaluate(
                SUB,
                &group(&[("ExpiresBy", "whenever"), ("team", "data")]),
                now(),
                &cloud,
            )
            .await;

        assert_eq!(eval.state, ExpiryState::NoOrInvalidExpiry);
        assert_eq!(
            eval.tags,
            Some(tags(&[("ExpiresBy", "2024-01-03T00:00:00Z"), ("team", "data")]))
        );
        assert!(!eval.should_delete);
    }

    #[tokio::test]
    async fn test_expired_group_deleted_when_cleanup_enabled() {
        let cloud = MemoryCloud::new();
        let eval = policy(true)
            .evaluate(SUB, &group(&[("ExpiresBy", "2023-12-01T00:00:00Z")]), now(), &cloud)
            .await;

        assert_eq!(eval.state, ExpiryState::ValidPastExpiry);
        assert!(eval.should_delete);
        assert!(eval.tags.is_none());
    }

    #[tokio::test]
    async fn test_expired_group_kept_when_cleanup_disabled() {
        let cloud = MemoryCloud::new();
        let eval = policy(false)
            .evaluate(SUB, &group(&[("ExpiresBy", "2023-12-01T00:00:00Z")]), now(), &cloud)
            .await;

        assert_eq!(eval.state, ExpiryState::ValidPastExpiry);
        assert!(!eval.should_delete);
        assert!(eval.tags.is_none());
    }

    #[tokio::test]
    async fn test_expiry_equal_to_now_is_not_past() {
        let cloud = MemoryCloud::new();
        let eval = policy(true)
            .evaluate(SUB, &group(&[("ExpiresBy", "2024-01-01T00:00:00Z")]), now(), &cloud)
            .await;

        assert_eq!(eval.state, ExpiryState::ValidFutureExpiry);
        assert!(!eval.should_delete);
    }

    #[tokio::test]
    async fn test_later_expiry_keeps_date_but_refreshes_owner() {
        let cloud = MemoryCloud::new();
        cloud.add_activity(
            SUB,
            "rg-dev",
            vec![ActivityRecord::administrative("alice@example.com", utc(2024, 1, 5))],
        );

        let eval = policy(true)
            .evaluate(SUB, &group(&[("ExpiresBy", "2024-02-01T00:00:00Z")]), now(), &cloud)
            .await;

        assert_eq!(eval.state, ExpiryState::ValidFutureExpiry);
        assert_eq!(
            eval.tags,
            Some(tags(&[
                ("ExpiresBy", "2024-02-01T00:00:00Z"),
                ("LastModifiedBy", "alice")
            ]))
        );
        assert!(!eval.extended);
        assert!(!eval.should_delete);
    }

    #[tokio::test]
    async fn test_activity_extends_earlier_expiry() {
        let cloud = MemoryCloud::new();
        cloud.add_activity(
            SUB,
            "rg-dev",
            vec![ActivityRecord::administrative("alice@example.com", utc(2024, 1, 5))],
        );

        let eval = policy(true)
            .evaluate(SUB, &group(&[("ExpiresBy", "2024-01-02T00:00:00Z")]), now(), &cloud)
            .await;

        assert_eq!(
            eval.tags,
            Some(tags(&[
                ("ExpiresBy", "2024-01-09T00:00:00Z"),
                ("LastModifiedBy", "alice")
            ]))
        );
        assert!(eval.extended);
        assert_eq!(eval.expires_by, Some(utc(2024, 1, 9)));
    }

    #[tokio::test]
    async fn test_activity_rescues_expired_group() {
        let cloud = MemoryCloud::new();
        let touched = Utc.with_ymd_and_hms(2023, 12, 31, 18, 0, 0).unwrap();
        cloud.add_activity(
            SUB,
            "rg-dev",
            vec![ActivityRecord::administrative("bob@example.com", touched)],
        );

        let eval = policy(true)
            .evaluate(SUB, &group(&[("ExpiresBy", "2023-12-01T00:00:00Z")]), now(), &cloud)
            .await;

        assert_eq!(eval.state, ExpiryState::ValidFutureExpiry);
        assert_eq!(eval.expires_by, Some(utc(2024, 1, 4)));
        assert!(!eval.should_delete);
    }

    #[tokio::test]
    async fn test_stale_activity_does_not_save_expired_group() {
        let cloud = MemoryCloud::new();
        cloud.add_activity(
            SUB,
            "rg-dev",
            vec![ActivityRecord::administrative("bob@example.com", utc(2023, 11, 1))],
        );

        let eval = policy(true)
            .evaluate(
                SUB,
                &group(&[("ExpiresBy", "2023-12-01T00:00:00Z"), ("LastModifiedBy", "bob")]),
                now(),
                &cloud,
            )
            .await;

        // Candidate 2023-11-05 is earlier than the stored expiry and the owner
        // is unchanged, so there is nothing to write.
        assert!(eval.tags.is_none());
        assert_eq!(eval.state, ExpiryState::ValidPastExpiry);
        assert!(eval.should_delete);
    }

    #[tokio::test]
    async fn test_no_write_when_nothing_changes() {
        let cloud = MemoryCloud::new();
        cloud.add_activity(
            SUB,
            "rg-dev",
            vec![ActivityRecord::administrative("alice@example.com", utc(2024, 1, 5))],
        );

        let eval = policy(true)
            .evaluate(
                SUB,
                &group(&[("ExpiresBy", "2024-01-09T00:00:00Z"), ("LastModifiedBy", "alice")]),
                now(),
                &cloud,
            )
            .await;

        assert!(eval.tags.is_none());
        assert!(!eval.extended);
    }

    #[rstest]
    #[case::manual_setup("ManualSetup")]
    #[case::long_haul("LongHaul")]
    #[case::do_not_delete("DoNotDelete")]
    #[tokio::test]
    async fn test_exempt_groups_are_untouched(#[case] marker: &str) {
        let cloud = MemoryCloud::new();
        cloud.add_activity(
            SUB,
            "rg-dev",
            vec![ActivityRecord::administrative("alice@example.com", utc(2024, 1, 5))],
        );

        for expiry in [None, Some("2023-12-01T00:00:00Z"), Some("garbage")] {
            let mut pairs = vec![(marker, "")];
            if let Some(expiry) = expiry {
                pairs.push(("ExpiresBy", expiry));
            }
            let eval = policy(true)
                .evaluate(SUB, &group(&pairs), now(), &cloud)
                .await;

            assert_eq!(eval.state, ExpiryState::Exempt);
            assert!(eval.tags.is_none());
            assert!(!eval.should_delete);
        }
        assert!(cloud.activity_queries().is_empty());
    }

    #[tokio::test]
    async fn test_activity_window_covers_lookback() {
        let cloud = MemoryCloud::new();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap();
        ExpiryPolicy::new(2, 4, 3, true)
            .evaluate(SUB, &group(&[("ExpiresBy", "2024-02-01T00:00:00Z")]), at, &cloud)
            .await;

        let queries = cloud.activity_queries();
        assert_eq!(queries.len(), 1);
        let ((sub, rg), from, to) = &queries[0];
        assert_eq!(sub, SUB);
        assert_eq!(rg, "rg-dev");
        assert_eq!(*from, Utc.with_ymd_and_hms(2023, 12, 29, 6, 0, 0).unwrap());
        assert_eq!(*to, at);
    }

    #[tokio::test]
    async fn test_zero_lookback_skips_activity() {
        let cloud = MemoryCloud::new();
        ExpiryPolicy::new(2, 4, 0, true)
            .evaluate(SUB, &group(&[("ExpiresBy", "2024-02-01T00:00:00Z")]), now(), &cloud)
            .await;
        assert!(cloud.activity_queries().is_empty());
    }

    #[rstest]
    #[case::forbidden(CloudError::Forbidden as fn(String) -> CloudError)]
    #[case::not_found(CloudError::NotFound as fn(String) -> CloudError)]
    #[case::throttled(CloudError::Throttled as fn(String) -> CloudError)]
    #[tokio::test]
    async fn test_activity_errors_mean_no_activity(#[case] error: fn(String) -> CloudError) {
        let cloud = MemoryCloud::new();
        cloud.fail_activity(SUB, "rg-dev", error);

        let eval = policy(true)
            .evaluate(SUB, &group(&[("ExpiresBy", "2023-12-01T00:00:00Z")]), now(), &cloud)
            .await;

        assert!(eval.tags.is_none());
        assert!(eval.should_delete);
    }

    #[tokio::test]
    async fn test_expiry_is_monotonic_across_passes() {
        let cloud = MemoryCloud::new();
        let policy = policy(true);

        let first = policy.evaluate(SUB, &group(&[]), now(), &cloud).await;
        let mut current = group(&[]);
        current.tags = first.tags.unwrap();
        let mut last = first.expires_by.unwrap();

        let passes = [
            (utc(2024, 1, 2), Some(utc(2024, 1, 1))),
            (utc(2024, 1, 3), None),
            (utc(2024, 1, 6), Some(utc(2024, 1, 5))),
            (utc(2024, 1, 7), Some(utc(2024, 1, 6))),
        ];

        for (at, touched) in passes {
            if let Some(touched) = touched {
                cloud.add_activity(
                    SUB,
                    "rg-dev",
                    vec![ActivityRecord::administrative("alice@example.com", touched)],
                );
            }
            let eval = policy.evaluate(SUB, &current, at, &cloud).await;
            let expires_by = eval.expires_by.unwrap();
            assert!(expires_by >= last, "{expires_by} < {last}");
            last = expires_by;
            if let Some(tags) = eval.tags {
                current.tags = tags;
            }
        }
    }

    #[tokio::test]
    async fn test_huge_extension_stays_parseable_across_passes() {
        let cloud = MemoryCloud::new();
        cloud.add_activity(
            SUB,
            "rg-dev",
            vec![ActivityRecord::administrative("alice@example.com", now())],
        );
        let policy = ExpiryPolicy::new(2, 3_000_000, 1, true);

        let first = policy
            .evaluate(SUB, &group(&[("ExpiresBy", "2024-01-02T00:00:00Z")]), now(), &cloud)
            .await;
        let tags = first.tags.unwrap();
        assert_eq!(tags["ExpiresBy"], "9999-12-31T00:00:00Z");

        let mut current = group(&[]);
        current.tags = tags;
        let second = policy.evaluate(SUB, &current, utc(2024, 1, 2), &cloud).await;

        assert_eq!(second.state, ExpiryState::ValidFutureExpiry);
        assert!(second.tags.is_none());
        assert_eq!(second.expires_by, first.expires_by);
    }

    #[test]
    fn test_latest_administrative_filters_records() {
        let records = vec![
            ActivityRecord {
                category: Some("Policy".into()),
                caller: Some("policy@example.com".into()),
                timestamp: Some(utc(2024, 1, 9)),
            },
            ActivityRecord {
                category: Some("Administrative".into()),
                caller: Some("00000000-0000-0000-0000-000000000000".into()),
                timestamp: Some(utc(2024, 1, 8)),
            },
            ActivityRecord {
                category: Some("Administrative".into()),
                caller: Some("nobody@example.com".into()),
                timestamp: None,
            },
            ActivityRecord::administrative("carol@example.com", utc(2024, 1, 2)),
            ActivityRecord::administrative("dave@example.com", utc(2024, 1, 3)),
        ];

        assert_eq!(
            latest_administrative(&records),
            Some((utc(2024, 1, 3), "dave"))
        );
    }

    #[test]
    fn test_latest_administrative_ties_take_last() {
        let records = vec![
            ActivityRecord::administrative("first@example.com", utc(2024, 1, 3)),
            ActivityRecord::administrative("second@example.com", utc(2024, 1, 3)),
        ];
        assert_eq!(
            latest_administrative(&records),
            Some((utc(2024, 1, 3), "second"))
        );
    }

    #[test]
    fn test_latest_administrative_empty() {
        assert_eq!(latest_administrative(&[]), None);
    }

    #[test]
    fn test_from_config() {
        let config = CleanupConfig {
            cleanup_enabled: true,
            ..Default::default()
        };
        assert!(ExpiryPolicy::from_config(&config).cleanup_enabled());
    }
}
