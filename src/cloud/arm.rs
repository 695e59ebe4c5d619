//! Azure Resource Manager REST client.
//!
//! Implements [`ResourceGroupRepository`] and [`ActivityLookup`] on top of the
//! public ARM endpoints:
//!
//! | Operation | Request |
//! |---|---|
//! | list | `GET /subscriptions/{id}/resourcegroups` |
//! | update tags | `PATCH /subscriptions/{id}/resourcegroups/{name}` |
//! | delete | `DELETE /subscriptions/{id}/resourcegroups/{name}` |
//! | activity | `GET /subscriptions/{id}/providers/Microsoft.Insights/eventtypes/management/values` |
//!
//! List responses are paged through `nextLink`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{RequestBuilder, Response, StatusCode, Url, header::AUTHORIZATION};
use serde::{Deserialize, de::DeserializeOwned};

use super::{
    ActivityLookup, ActivityRecord, CloudError, ResourceGroup, ResourceGroupRepository, Tags,
    TokenProvider, with_retry,
};
use crate::config::{AzureConfig, RetryConfig};

const RESOURCE_GROUPS_API_VERSION: &str = "2021-04-01";
const ACTIVITY_LOG_API_VERSION: &str = "2015-04-01";

/// Client for the subset of Resource Manager the janitor needs.
#[derive(Clone)]
pub struct ArmClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
    retry: RetryConfig,
}

impl std::fmt::Debug for ArmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArmClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl ArmClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
        retry: RetryConfig,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            tokens,
            retry,
        }
    }

    /// Build a client from the `[azure]` section.
    pub fn from_config(
        config: &AzureConfig,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("rg-janitor/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self::new(
            http,
            config.base_url(),
            tokens,
            config.retry.clone(),
        ))
    }

    /// `base_url` with `segments` appended, each one percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url, CloudError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| CloudError::Internal(format!("Invalid management URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|()| {
                CloudError::Internal(format!("Invalid management URL: {}", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn group_url(&self, subscription: &str, name: &str) -> Result<Url, CloudError> {
        let mut url = self.url(&["subscriptions", subscription, "resourcegroups", name])?;
        url.query_pairs_mut()
            .append_pair("api-version", RESOURCE_GROUPS_API_VERSION);
        Ok(url)
    }

    /// Send a request with a fresh bearer token, retrying transient failures.
    async fn send<F>(
        &self,
        subscription: &str,
        operation: &str,
        build: F,
    ) -> Result<Response, CloudError>
    where
        F: Fn() -> RequestBuilder,
    {
        let bearer = self.tokens.bearer_header().await?;
        let response = with_retry(&self.retry, subscription, operation, || {
            build().header(AUTHORIZATION, &*bearer).send()
        })
        .await?;
        Ok(response)
    }

    /// Follow `nextLink` until the listing is exhausted.
    async fn get_all_pages<T: DeserializeOwned>(
        &self,
        subscription: &str,
        operation: &str,
        first_url: Url,
    ) -> Result<Vec<T>, CloudError> {
        let mut items = Vec::new();
        let mut next = Some(first_url.to_string());

        while let Some(url) = next.take() {
            let response = self
                .send(subscription, operation, || self.http.get(&url))
                .await?;
            if !response.status().is_success() {
                return Err(error_from_response(response, operation).await);
            }

            let page: Page<T> = decode(response).await?;
            items.extend(page.value);

            next = page.next_link.filter(|link| !link.is_empty() && *link != url);
        }

        Ok(items)
    }
}

#[async_trait]
impl ResourceGroupRepository for ArmClient {
    async fn list(&self, subscription: &str) -> Result<Vec<ResourceGroup>, CloudError> {
        let mut url = self.url(&["subscriptions", subscription, "resourcegroups"])?;
        url.query_pairs_mut()
            .append_pair("api-version", RESOURCE_GROUPS_API_VERSION);

        let groups: Vec<RawResourceGroup> = self
            .get_all_pages(subscription, "list_resource_groups", url)
            .await?;

        Ok(groups
            .into_iter()
            .map(|raw| ResourceGroup {
                name: raw.name,
                tags: raw.tags.unwrap_or_default(),
            })
            .collect())
    }

    async fn update_tags(
        &self,
        subscription: &str,
        name: &str,
        tags: &Tags,
    ) -> Result<(), CloudError> {
        let url = self.group_url(subscription, name)?;
        let body = serde_json::json!({ "tags": tags });

        let response = self
            .send(subscription, "update_tags", || {
                self.http.patch(url.clone()).json(&body)
            })
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_from_response(response, name).await)
        }
    }

    async fn delete(&self, subscription: &str, name: &str) -> Result<(), CloudError> {
        let url = self.group_url(subscription, name)?;

        let response = self
            .send(subscription, "delete_resource_group", || {
                self.http.delete(url.clone())
            })
            .await?;

        match response.status() {
            // 202 means ARM accepted the delete and finishes it asynchronously.
            StatusCode::OK | StatusCode::ACCEPTED | StatusCode::NO_CONTENT => Ok(()),
            StatusCode::NOT_FOUND => {
                tracing::debug!(
                    subscription,
                    resource_group = name,
                    "Resource group already gone"
                );
                Ok(())
            }
            _ => Err(error_from_response(response, name).await),
        }
    }
}

#[async_trait]
impl ActivityLookup for ArmClient {
    async fn query(
        &self,
        subscription: &str,
        group: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ActivityRecord>, CloudError> {
        let filter = activity_filter(group, from, to);
        let mut url = self.url(&[
            "subscriptions",
            subscription,
            "providers",
            "Microsoft.Insights",
            "eventtypes",
            "management",
            "values",
        ])?;
        url.query_pairs_mut()
            .append_pair("api-version", ACTIVITY_LOG_API_VERSION)
            .append_pair("$filter", &filter)
            .append_pair("$select", "caller,category,eventTimestamp");

        let events: Vec<RawActivityEvent> =
            self.get_all_pages(subscription, "query_activity_log", url).await?;

        Ok(events
            .into_iter()
            .map(|raw| ActivityRecord {
                category: raw.category.and_then(|c| c.value),
                caller: raw.caller,
                timestamp: raw.event_timestamp,
            })
            .collect())
    }
}

/// `$filter` expression for one resource group's events in `[from, to]`.
fn activity_filter(group: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> String {
    format!(
        "eventTimestamp ge '{}' and eventTimestamp le '{}' and resourceGroupName eq '{}'",
        from.to_rfc3339_opts(SecondsFormat::Secs, true),
        to.to_rfc3339_opts(SecondsFormat::Secs, true),
        group.replace('\'', "''"),
    )
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, CloudError> {
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| CloudError::Decode(e.to_string()))
}

/// Map a non-success response onto [`CloudError`], keeping ARM's error message.
async fn error_from_response(response: Response, target: &str) -> CloudError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ArmErrorBody>(&body) {
        Ok(ArmErrorBody { error: Some(detail) }) => format!("{}: {}", detail.code, detail.message),
        _ if body.is_empty() => status
            .canonical_reason()
            .unwrap_or("no response body")
            .to_string(),
        _ => body,
    };

    match status {
        StatusCode::NOT_FOUND => CloudError::NotFound(format!("{}: {}", target, message)),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            CloudError::Forbidden(format!("{}: {}", target, message))
        }
        StatusCode::TOO_MANY_REQUESTS => CloudError::Throttled(message),
        _ => CloudError::Api {
            status: status.as_u16(),
            message,
        },
    }
}

#[derive(Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "nextLink", default)]
    next_link: Option<String>,
}

#[derive(Deserialize)]
struct RawResourceGroup {
    name: String,
    #[serde(default)]
    tags: Option<Tags>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawActivityEvent {
    #[serde(default)]
    category: Option<LocalizableString>,
    #[serde(default)]
    caller: Option<String>,
    #[serde(default)]
    event_timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct LocalizableString {
    #[serde(default)]
    value: Option<String>,
}

#[derive(Deserialize)]
struct ArmErrorBody {
    #[serde(default)]
    error: Option<ArmErrorDetail>,
}

#[derive(Deserialize)]
struct ArmErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}
