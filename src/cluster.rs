//! Reads the cluster's service account token issuer from the API server.

use serde::Deserialize;

use crate::config::BackendConfig;

const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to create Kubernetes client: {0}")]
    Client(#[source] kube::Error),

    #[error("failed to read OIDC discovery document from the API server: {0}")]
    Request(#[source] kube::Error),

    #[error("failed to build discovery request: {0}")]
    Http(#[from] http::Error),

    #[error("API server returned an empty issuer")]
    EmptyIssuer,
}

#[derive(Debug, Deserialize)]
struct OpenIdConfiguration {
    issuer: String,
}

/// Fetch the `issuer` field of the API server's OIDC discovery document.
pub async fn discover_issuer(client: &kube::Client) -> Result<String, DiscoveryError> {
    let request = http::Request::get(DISCOVERY_PATH).body(Vec::new())?;
    let document: OpenIdConfiguration = client
        .request(request)
        .await
        .map_err(DiscoveryError::Request)?;

    let issuer = document.issuer.trim().to_string();
    if issuer.is_empty() {
        return Err(DiscoveryError::EmptyIssuer);
    }
    Ok(issuer)
}

/// Decide which issuer the backend should trust.
///
/// Auto-detection, when enabled, wins over a configured URL. Backends that do
/// not match on issuer get `None`.
pub async fn resolve_issuer(backend: &BackendConfig) -> Result<Option<String>, DiscoveryError> {
    let BackendConfig::Azure(azure) = backend else {
        return Ok(None);
    };

    if !azure.auto_detect_oidc_issuer_url {
        return Ok(azure.oidc_issuer_url.clone());
    }

    // The kube client cannot pick a TLS provider on its own when more than
    // one is compiled in. Fails harmlessly if the binary already installed one.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let client = kube::Client::try_default()
        .await
        .map_err(DiscoveryError::Client)?;
    let issuer = discover_issuer(&client).await?;
    tracing::info!(issuer = %issuer, "Detected OIDC issuer URL from the API server");
    Ok(Some(issuer))
}
