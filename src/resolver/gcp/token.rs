//! OAuth access tokens for the IAM API via `google-cloud-auth`.

use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use google_cloud_auth::{credentials::CredentialsFile, project::Config, token::DefaultTokenSourceProvider};
use google_cloud_token::{TokenSource, TokenSourceProvider};
use tokio::sync::RwLock;

use crate::{
    config::GcpCredentials,
    resolver::{AccessTokenSource, ResolveError},
};

/// Scope covering IAM service account and policy reads.
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Google access tokens live for an hour; refresh a little early.
const TOKEN_CACHE_DURATION: Duration = Duration::from_secs(55 * 60);

struct CachedToken {
    bearer_header: Arc<str>,
    expires_at: std::time::Instant,
}

pub struct GcpTokenSource {
    source: Arc<dyn TokenSource>,
    auth_type: &'static str,
    cached_token: RwLock<Option<CachedToken>>,
}

impl std::fmt::Debug for GcpTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcpTokenSource")
            .field("type", &self.auth_type)
            .finish()
    }
}

impl GcpTokenSource {
    pub async fn from_config(credentials: &GcpCredentials) -> Result<Self, ResolveError> {
        let scopes = [CLOUD_PLATFORM_SCOPE];
        let config = Config::default().with_scopes(&scopes);

        let provider = match credentials {
            GcpCredentials::Default => DefaultTokenSourceProvider::new(config).await,
            GcpCredentials::ServiceAccount { key_path } => {
                let json = read_key_file(Path::new(key_path)).await?;
                let file = parse_key(&json)?;
                DefaultTokenSourceProvider::new_with_credentials(config, Box::new(file)).await
            }
            GcpCredentials::ServiceAccountJson { json } => {
                let file = parse_key(json)?;
                DefaultTokenSourceProvider::new_with_credentials(config, Box::new(file)).await
            }
        }
        .map_err(|e| ResolveError::Auth(format!("Failed to create GCP token source: {e}")))?;

        Ok(Self {
            source: provider.token_source(),
            auth_type: credentials.kind(),
            cached_token: RwLock::new(None),
        })
    }
}

async fn read_key_file(path: &Path) -> Result<String, ResolveError> {
    tokio::fs::read_to_string(path).await.map_err(|e| {
        ResolveError::Config(format!(
            "Failed to read service account key file '{}': {e}",
            path.display()
        ))
    })
}

fn parse_key(json: &str) -> Result<CredentialsFile, ResolveError> {
    serde_json::from_str(json)
        .map_err(|e| ResolveError::Config(format!("Failed to parse service account JSON: {e}")))
}

/// Token sources disagree on whether the scheme is included.
fn bearer(token: &str) -> String {
    if token.starts_with("Bearer ") {
        token.to_string()
    } else {
        format!("Bearer {token}")
    }
}

#[async_trait]
impl AccessTokenSource for GcpTokenSource {
    async fn bearer_header(&self) -> Result<Arc<str>, ResolveError> {
        {
            let cache = self.cached_token.read().await;
            if let Some(cached) = cache.as_ref()
                && cached.expires_at > std::time::Instant::now()
            {
                return Ok(cached.bearer_header.clone());
            }
        }

        let mut cache = self.cached_token.write().await;
        if let Some(cached) = cache.as_ref()
            && cached.expires_at > std::time::Instant::now()
        {
            return Ok(cached.bearer_header.clone());
        }

        let token = self
            .source
            .token()
            .await
            .map_err(|e| ResolveError::Auth(format!("Failed to get GCP token: {e}")))?;

        let bearer_header: Arc<str> = bearer(&token).into();
        *cache = Some(CachedToken {
            bearer_header: bearer_header.clone(),
            expires_at: std::time::Instant::now() + TOKEN_CACHE_DURATION,
        });
        tracing::debug!(auth_type = self.auth_type, "Acquired new GCP access token");

        Ok(bearer_header)
    }
}
