//! Azure Resource Manager connection configuration.
//!
//! # Example
//!
//! ```toml
//! [azure]
//! management_endpoint = "https://management.azure.com"
//! request_timeout_secs = 30
//!
//! [azure.auth]
//! type = "service_principal"
//! tenant_id = "${AZURE_TENANT_ID}"
//! client_id = "${AZURE_CLIENT_ID}"
//! client_secret = "${AZURE_CLIENT_SECRET}"
//!
//! [azure.retry]
//! max_retries = 3
//! ```

use serde::{Deserialize, Serialize};

/// Azure Resource Manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AzureConfig {
    /// Resource Manager endpoint. Override for sovereign clouds.
    /// Default: https://management.azure.com
    #[serde(default = "default_management_endpoint")]
    pub management_endpoint: String,

    /// Timeout for a single HTTP request, in seconds.
    /// Default: 30
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// How the janitor authenticates to Resource Manager.
    #[serde(default)]
    pub auth: AzureAuth,

    /// Retry behaviour for throttled (429) and transient (5xx) responses.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            management_endpoint: default_management_endpoint(),
            request_timeout_secs: default_request_timeout_secs(),
            auth: AzureAuth::default(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_management_endpoint() -> String {
    "https://management.azure.com".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl AzureConfig {
    /// Management endpoint without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.management_endpoint.trim_end_matches('/')
    }

    /// The OAuth scope for tokens issued against the management endpoint.
    pub fn token_scope(&self) -> String {
        format!("{}/.default", self.base_url())
    }

    /// Get the request timeout as a Duration.
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if !self.management_endpoint.starts_with("http://")
            && !self.management_endpoint.starts_with("https://")
        {
            return Err(format!(
                "azure.management_endpoint must be an http(s) URL, got '{}'",
                self.management_endpoint
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err("azure.request_timeout_secs must be greater than 0".into());
        }
        match &self.auth {
            AzureAuth::ServicePrincipal {
                tenant_id,
                client_id,
                client_secret,
            } if tenant_id.is_empty() || client_id.is_empty() || client_secret.is_empty() => {
                Err("azure.auth service_principal requires tenant_id, client_id and client_secret"
                    .into())
            }
            AzureAuth::StaticToken { token } if token.is_empty() => {
                Err("azure.auth static_token requires a non-empty token".into())
            }
            _ => Ok(()),
        }
    }
}

/// Azure authentication configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum AzureAuth {
    /// Managed identity authentication (App Service, Functions, VMs).
    ManagedIdentity {
        /// Client ID of the managed identity (optional for system-assigned).
        #[serde(default)]
        client_id: Option<String>,
    },

    /// Entra ID service principal with a client secret.
    ServicePrincipal {
        /// Tenant ID.
        tenant_id: String,
        /// Client ID.
        client_id: String,
        /// Client secret.
        client_secret: String,
    },

    /// Credentials of the signed-in Azure CLI user (local development).
    Cli,

    /// A pre-acquired bearer token.
    StaticToken { token: String },
}

impl Default for AzureAuth {
    fn default() -> Self {
        AzureAuth::ManagedIdentity { client_id: None }
    }
}

impl std::fmt::Debug for AzureAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AzureAuth::ManagedIdentity { client_id } => f
                .debug_struct("ManagedIdentity")
                .field("client_id", client_id)
                .finish(),
            AzureAuth::ServicePrincipal {
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("ServicePrincipal")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .field("client_secret", &"****")
                .finish(),
            AzureAuth::Cli => f.write_str("Cli"),
            AzureAuth::StaticToken { .. } => f
                .debug_struct("StaticToken")
                .field("token", &"****")
                .finish(),
        }
    }
}

/// Retry configuration for Resource Manager requests.
///
/// Retries on transient failures with exponential backoff. Only status codes
/// that indicate temporary issues (429, 5xx) are retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Whether retries are enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of retry attempts (not including the initial request).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial delay before first retry in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (percentage, 0.0-1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Status codes that should trigger a retry.
    /// Default: 429 (throttled), 500, 502, 503, 504 (server errors).
    #[serde(default = "default_retryable_status_codes")]
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
            retryable_status_codes: default_retryable_status_codes(),
        }
    }
}

impl RetryConfig {
    /// Check if a status code should trigger a retry.
    pub fn should_retry_status(&self, status: u16) -> bool {
        self.enabled && self.retryable_status_codes.contains(&status)
    }

    /// Calculate the delay for a given retry attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let base_delay =
            (self.initial_delay_ms as f64) * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let jitter_range = capped_delay * self.jitter;
        let jitter = if jitter_range > 0.0 {
            use rand::Rng;
            rand::thread_rng().gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };

        let final_delay = (capped_delay + jitter).max(0.0);
        std::time::Duration::from_millis(final_delay as u64)
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

fn default_retryable_status_codes() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}

fn default_true() -> bool {
    true
}
