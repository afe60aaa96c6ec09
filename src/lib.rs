//! Kubernetes admission webhook that annotates service accounts with the cloud
//! identity federated to them.
//!
//! The [`resolver`] module holds the identity-resolution engine and its Azure
//! and GCP backends. [`webhook`] exposes it as a mutating admission endpoint.

pub mod cluster;
pub mod config;
pub mod observability;
pub mod resolver;
pub mod webhook;

use std::sync::Arc;

use config::SyncerConfig;
use resolver::{IdentityResolver, ResolveError};

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SyncerConfig>,
    pub resolver: Arc<dyn IdentityResolver>,
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error(transparent)]
    Discovery(#[from] cluster::DiscoveryError),

    #[error("failed to initialize {backend} backend: {source}")]
    Resolver {
        backend: &'static str,
        #[source]
        source: ResolveError,
    },
}

impl AppState {
    /// Build the HTTP client, settle the trusted issuer and construct the
    /// resolver. Runs once at startup; the result is shared by all requests.
    pub async fn build(config: SyncerConfig) -> Result<Self, StartupError> {
        let http = config.http_client.build_client()?;
        let issuer = cluster::resolve_issuer(&config.backend).await?;

        let resolver = resolver::build_resolver(&config.backend, http, issuer)
            .await
            .map_err(|source| StartupError::Resolver {
                backend: config.backend.type_name(),
                source,
            })?;

        tracing::info!(backend = resolver.backend(), "Identity resolver ready");

        Ok(Self {
            config: Arc::new(config),
            resolver,
        })
    }
}
