//! ARM access tokens from `azure_identity` credentials.
//!
//! Tokens are cached as a pre-formatted `Arc<str>` header value. Every
//! resolution fans out into one request per candidate, so the cached value is
//! read far more often than it is refreshed.

use std::sync::Arc;

use async_trait::async_trait;
use azure_core::credentials::{AccessToken, Secret, TokenCredential};
use azure_identity::{
    AzureCliCredential, ClientSecretCredential, ManagedIdentityCredential,
    ManagedIdentityCredentialOptions, UserAssignedId, WorkloadIdentityCredential,
};
use tokio::sync::RwLock;

use crate::{
    config::AzureCredentials,
    resolver::{AccessTokenSource, ResolveError},
};

/// Scope for Azure Resource Manager and Resource Graph.
pub const AZURE_MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";

/// Refresh this long before the token actually expires.
const TOKEN_REFRESH_BUFFER_SECS: u64 = 300;

#[derive(Debug, Clone)]
struct CachedToken {
    bearer_header: Arc<str>,
    expires_at: std::time::Instant,
}

impl CachedToken {
    fn is_expired(&self) -> bool {
        std::time::Instant::now() >= self.expires_at
    }
}

/// Caching token source over any `azure_identity` credential.
pub struct AzureTokenSource {
    credential: Arc<dyn TokenCredential>,
    auth_type: &'static str,
    scope: String,
    cached_token: RwLock<Option<CachedToken>>,
}

impl std::fmt::Debug for AzureTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureTokenSource")
            .field("type", &self.auth_type)
            .field("scope", &self.scope)
            .finish()
    }
}

impl AzureTokenSource {
    fn new(credential: Arc<dyn TokenCredential>, auth_type: &'static str, scope: &str) -> Self {
        Self {
            credential,
            auth_type,
            scope: scope.to_string(),
            cached_token: RwLock::new(None),
        }
    }

    /// Build a token source for the configured credential type.
    ///
    /// `tenant_id` is only used by the client secret flow; the other flows
    /// read their tenant from the environment they run in.
    pub fn from_config(
        credentials: &AzureCredentials,
        tenant_id: &str,
        scope: &str,
    ) -> Result<Self, ResolveError> {
        let credential: Arc<dyn TokenCredential> = match credentials {
            AzureCredentials::WorkloadIdentity => WorkloadIdentityCredential::new(None)
                .map_err(|e| {
                    ResolveError::Auth(format!(
                        "Failed to create workload identity credential: {e}"
                    ))
                })?,
            AzureCredentials::ManagedIdentity { client_id } => {
                let options = client_id.as_ref().map(|id| {
                    tracing::info!(client_id = %id, "Using user-assigned managed identity");
                    ManagedIdentityCredentialOptions {
                        user_assigned_id: Some(UserAssignedId::ClientId(id.clone())),
                        ..Default::default()
                    }
                });
                ManagedIdentityCredential::new(options).map_err(|e| {
                    ResolveError::Auth(format!("Failed to create managed identity credential: {e}"))
                })?
            }
            AzureCredentials::ClientSecret {
                client_id,
                client_secret,
            } => ClientSecretCredential::new(
                tenant_id,
                client_id.clone(),
                Secret::new(client_secret.clone()),
                None,
            )
            .map_err(|e| {
                ResolveError::Auth(format!("Failed to create client secret credential: {e}"))
            })?,
            AzureCredentials::AzureCli => AzureCliCredential::new(None).map_err(|e| {
                ResolveError::Auth(format!("Failed to create Azure CLI credential: {e}"))
            })?,
        };

        Ok(Self::new(credential, credentials.kind(), scope))
    }
}

#[async_trait]
impl AccessTokenSource for AzureTokenSource {
    async fn bearer_header(&self) -> Result<Arc<str>, ResolveError> {
        {
            let cache = self.cached_token.read().await;
            if let Some(ref cached) = *cache
                && !cached.is_expired()
            {
                return Ok(cached.bearer_header.clone());
            }
        }

        let mut cache = self.cached_token.write().await;

        // Another task may have refreshed while we waited for the write lock.
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
            .map_err(|e| ResolveError::Auth(format!("Failed to get Azure token: {e}")))?;

        let expires_in = access_token.expires_on - time::OffsetDateTime::now_utc();
        let expires_in_secs = expires_in.whole_seconds().max(0) as u64;
        let expires_at = std::time::Instant::now()
            + std::time::Duration::from_secs(expires_in_secs)
                .saturating_sub(std::time::Duration::from_secs(TOKEN_REFRESH_BUFFER_SECS));

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
