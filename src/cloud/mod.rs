//! Cloud collaborators consumed by the expiry engine.
//!
//! The engine never talks to Azure directly. It goes through two ports:
//!
//! - [`ResourceGroupRepository`] lists, re-tags and deletes resource groups.
//! - [`ActivityLookup`] returns raw activity log records for a group.
//!
//! Every call names its subscription explicitly, so one implementation can be
//! shared by concurrent subscription passes without per-pass client state.
//!
//! Two implementations ship with the crate: [`ArmClient`] for Azure Resource
//! Manager and [`MemoryCloud`] for tests and local dry runs.

mod arm;
mod memory;
mod retry;
mod token;

use std::collections::BTreeMap;

pub use arm::ArmClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use memory::{MemoryCloud, TagUpdate};
pub use retry::{is_retryable_error, with_retry};
#[cfg(feature = "azure-sdk")]
pub use token::AzureTokenSource;
pub use token::{StaticToken, TokenProvider, token_provider_from_config};

/// Resource group tags. Keys are unique; ordering carries no meaning.
pub type Tags = BTreeMap<String, String>;

/// A resource group as seen by the janitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceGroup {
    pub name: String,
    pub tags: Tags,
}

impl ResourceGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Tags::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// One entry from the subscription activity log.
///
/// Every field is optional because the activity log itself omits them freely;
/// the expiry policy decides which records qualify.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityRecord {
    /// Event category, e.g. `Administrative`, `Policy`, `ServiceHealth`.
    pub category: Option<String>,
    /// Identity that made the change, usually a UPN such as `alice@contoso.com`.
    pub caller: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ActivityRecord {
    pub fn administrative(caller: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            category: Some("Administrative".to_string()),
            caller: Some(caller.into()),
            timestamp: Some(timestamp),
        }
    }
}

/// Errors returned by cloud collaborators.
#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Throttled by Resource Manager: {0}")]
    Throttled(String),

    #[error("Resource Manager returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("{0}")]
    Internal(String),
}

impl CloudError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }

    /// True when the caller lacks permission (including failed authentication).
    pub fn is_denied(&self) -> bool {
        matches!(self, CloudError::Forbidden(_) | CloudError::Auth(_))
    }
}

/// Lists, re-tags and deletes resource groups.
#[async_trait]
pub trait ResourceGroupRepository: Send + Sync {
    /// All resource groups in the subscription, in no particular order.
    async fn list(&self, subscription: &str) -> Result<Vec<ResourceGroup>, CloudError>;

    /// Replace the group's tags with `tags`. Writing identical tags is harmless.
    async fn update_tags(
        &self,
        subscription: &str,
        name: &str,
        tags: &Tags,
    ) -> Result<(), CloudError>;

    /// Delete the group. A group that is already gone counts as deleted.
    async fn delete(&self, subscription: &str, name: &str) -> Result<(), CloudError>;
}

/// Queries the activity log.
#[async_trait]
pub trait ActivityLookup: Send + Sync {
    /// Activity records for `group` between `from` and `to`, unordered and
    /// unfiltered.
    async fn query(
        &self,
        subscription: &str,
        group: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ActivityRecord>, CloudError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(CloudError::NotFound("rg".into()).is_not_found());
        assert!(!CloudError::NotFound("rg".into()).is_denied());
        assert!(CloudError::Forbidden("rg".into()).is_denied());
        assert!(CloudError::Auth("no token".into()).is_denied());
        assert!(
            !CloudError::Api {
                status: 500,
                message: "boom".into()
            }
            .is_denied()
        );
    }

    #[test]
    fn test_resource_group_builder() {
        let group = ResourceGroup::new("rg-dev")
            .with_tag("ExpiresBy", "2024-01-03T00:00:00Z")
            .with_tag("LongHaul", "");
        assert_eq!(group.name, "rg-dev");
        assert_eq!(group.tags.len(), 2);
        assert_eq!(group.tags["LongHaul"], "");
    }
}
