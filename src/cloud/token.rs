//! Bearer tokens for Resource Manager requests.
//!
//! [`AzureTokenSource`] wraps an `azure_identity` credential and caches the
//! formatted `Authorization` header until shortly before the token expires.
//! [`StaticToken`] serves a pre-acquired token and is what the tests use.

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(feature = "azure-sdk")]
use azure_core::credentials::{AccessToken, Secret, TokenCredential};
#[cfg(feature = "azure-sdk")]
use azure_identity::{
    AzureCliCredential, ClientSecretCredential, ManagedIdentityCredential,
    ManagedIdentityCredentialOptions, UserAssignedId,
};
#[cfg(feature = "azure-sdk")]
use tokio::sync::RwLock;

use super::CloudError;
use crate::config::AzureAuth;

/// Supplies `Authorization` header values.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A header value of the form `Bearer {token}`.
    async fn bearer_header(&self) -> Result<Arc<str>, CloudError>;
}

/// A fixed bearer token.
#[derive(Clone)]
pub struct StaticToken {
    bearer_header: Arc<str>,
}

impl StaticToken {
    pub fn new(token: &str) -> Self {
        Self {
            bearer_header: format!("Bearer {}", token).into(),
        }
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticToken")
            .field("token", &"****")
            .finish()
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn bearer_header(&self) -> Result<Arc<str>, CloudError> {
        Ok(self.bearer_header.clone())
    }
}

/// Build the token provider described by the `[azure.auth]` section.
///
/// `scope` is the OAuth scope of the management endpoint, e.g.
/// `https://management.azure.com/.default`.
pub fn token_provider_from_config(
    auth: &AzureAuth,
    scope: &str,
) -> Result<Arc<dyn TokenProvider>, CloudError> {
    match auth {
        AzureAuth::StaticToken { token } => Ok(Arc::new(StaticToken::new(token))),
        #[cfg(feature = "azure-sdk")]
        other => Ok(Arc::new(AzureTokenSource::from_config(other, scope)?)),
        #[cfg(not(feature = "azure-sdk"))]
        other => {
            let _ = scope;
            Err(CloudError::Auth(format!(
                "{:?} authentication requires the 'azure-sdk' feature",
                other
            )))
        }
    }
}

/// Buffer time before token expiry to trigger refresh (5 minutes).
#[cfg(feature = "azure-sdk")]
const TOKEN_REFRESH_BUFFER_SECS: u64 = 300;

/// A cached access token with its expiration time.
#[cfg(feature = "azure-sdk")]
#[derive(Debug, Clone)]
struct CachedToken {
    /// Pre-formatted header value: "Bearer {token}"
    bearer_header: Arc<str>,
    /// Expiration time with safety margin applied (see `TOKEN_REFRESH_BUFFER_SECS`).
    expires_at: std::time::Instant,
}

#[cfg(feature = "azure-sdk")]
impl CachedToken {
    fn is_expired(&self) -> bool {
        std::time::Instant::now() >= self.expires_at
    }
}

/// Token source backed by an Entra ID credential.
#[cfg(feature = "azure-sdk")]
pub struct AzureTokenSource {
    credential: Arc<dyn TokenCredential>,
    auth_type: &'static str,
    scope: String,
    cached_token: RwLock<Option<CachedToken>>,
}

#[cfg(feature = "azure-sdk")]
impl std::fmt::Debug for AzureTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureTokenSource")
            .field("type", &self.auth_type)
            .field("scope", &self.scope)
            .finish()
    }
}

#[cfg(feature = "azure-sdk")]
impl AzureTokenSource {
    fn new(credential: Arc<dyn TokenCredential>, auth_type: &'static str, scope: &str) -> Self {
        Self {
            credential,
            auth_type,
            scope: scope.to_string(),
            cached_token: RwLock::new(None),
        }
    }

    /// Service principal with a client secret.
    pub fn from_service_principal(
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
        scope: &str,
    ) -> Result<Self, CloudError> {
        let credential = ClientSecretCredential::new(
            tenant_id,
            client_id.to_string(),
            Secret::new(client_secret.to_string()),
            None,
        )
        .map_err(|e| {
            CloudError::Auth(format!("Failed to create client secret credential: {}", e))
        })?;

        Ok(Self::new(credential, "ServicePrincipal", scope))
    }

    /// Managed identity. Pass the client ID for a user-assigned identity,
    /// `None` for the system-assigned one.
    pub fn from_managed_identity(client_id: Option<&str>, scope: &str) -> Result<Self, CloudError> {
        let options = client_id.map(|id| {
            tracing::info!(client_id = id, "Using user-assigned managed identity");
            ManagedIdentityCredentialOptions {
                user_assigned_id: Some(UserAssignedId::ClientId(id.to_string())),
                ..Default::default()
            }
        });

        let credential = ManagedIdentityCredential::new(options).map_err(|e| {
            CloudError::Auth(format!("Failed to create managed identity credential: {}", e))
        })?;

        Ok(Self::new(credential, "ManagedIdentity", scope))
    }

    /// The signed-in Azure CLI user.
    pub fn from_azure_cli(scope: &str) -> Result<Self, CloudError> {
        let credential = AzureCliCredential::new(None).map_err(|e| {
            CloudError::Auth(format!("Failed to create Azure CLI credential: {}", e))
        })?;

        Ok(Self::new(credential, "AzureCli", scope))
    }

    pub fn from_config(auth: &AzureAuth, scope: &str) -> Result<Self, CloudError> {
        match auth {
            AzureAuth::ManagedIdentity { client_id } => {
                Self::from_managed_identity(client_id.as_deref(), scope)
            }
            AzureAuth::ServicePrincipal {
                tenant_id,
                client_id,
                client_secret,
            } => Self::from_service_principal(tenant_id, client_id, client_secret, scope),
            AzureAuth::Cli => Self::from_azure_cli(scope),
            AzureAuth::StaticToken { .. } => Err(CloudError::Auth(
                "Cannot create a credential-backed token source from a static token".to_string(),
            )),
        }
    }
}

#[cfg(feature = "azure-sdk")]
#[async_trait]
impl TokenProvider for AzureTokenSource {
    async fn bearer_header(&self) -> Result<Arc<str>, CloudError> {
        // Fast path: check if we have a valid cached token
        {
            let cache = self.cached_token.read().await;
            if let Some(ref cached) = *cache
                && !cached.is_expired()
            {
                return Ok(cached.bearer_header.clone());
            }
        }

        let mut cache = self.cached_token.write().await;

        // Double-check after acquiring write lock (another task may have refreshed)
        if let Some(ref cached) = *cache
            && !cached.is_expired()
        {
            return Ok(cached.bearer_header.clone());
        }

        let scopes = &[self.scope.as_str()];
        let access_token: AccessToken = self
            .credential
            .get_token(scopes, None)
            .await
            .map_err(|e| CloudError::Auth(format!("Failed to get Azure token: {}", e)))?;

        let now = time::OffsetDateTime::now_utc();
        let expires_in = access_token.expires_on - now;
        let expires_in_secs = expires_in.whole_seconds().max(0) as u64;
        let safety_margin = std::time::Duration::from_secs(TOKEN_REFRESH_BUFFER_SECS);
        let expires_at = std::time::Instant::now()
            + std::time::Duration::from_secs(expires_in_secs).saturating_sub(safety_margin);

        let bearer_header: Arc<str> = format!("Bearer {}", access_token.token.secret()).into();

        *cache = Some(CachedToken {
            bearer_header: bearer_header.clone(),
            expires_at,
        });

        tracing::debug!(
            auth_type = self.auth_type,
            expires_in_secs,
            "Acquired new Azure management token"
        );

        Ok(bearer_header)
    }
}
