//! Identity resolution: find the cloud identity federated to a Kubernetes
//! service account.
//!
//! A resolution call walks four stages:
//!
//! 1. list the scopes (subscriptions, projects) the credential can see
//! 2. list candidate identities in those scopes
//! 3. fetch each candidate's trust bindings, concurrently
//! 4. test every binding against the match key
//!
//! Stages 1 and 2 must be complete to be trusted, so any failure there fails
//! the call. Stage 3 failures only disqualify the one candidate.
//!
//! Backends implement [`IdentityBackend`]; [`Resolver`] drives any backend
//! through those stages and is handed to callers as a `dyn IdentityResolver`.

mod coordinator;
mod error;
pub mod filter;
pub mod pagination;
pub mod predicate;
mod rest;

#[cfg(feature = "azure")]
pub mod azure;
#[cfg(feature = "gcp")]
pub mod gcp;

use std::{collections::BTreeMap, fmt, sync::Arc, time::Instant};

use async_trait::async_trait;
pub use error::ResolveError;
pub use rest::{AccessTokenSource, StaticToken};
use tokio_util::sync::CancellationToken;

use crate::{config::BackendConfig, observability::metrics};

/// A Kubernetes service account, by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceAccountRef {
    pub namespace: String,
    pub name: String,
}

impl ServiceAccountRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The token subject Kubernetes issues for this service account.
    pub fn subject(&self) -> String {
        format!("system:serviceaccount:{}:{}", self.namespace, self.name)
    }
}

impl fmt::Display for ServiceAccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A subscription or project that bounds a listing query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope(String);

impl Scope {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cloud identity under evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Client ID or account email; this is what gets written to the annotation.
    pub identity: String,
    pub scope: Scope,
    /// Resource ID or resource name used to fetch the candidate's bindings.
    pub locator: String,
}

impl Candidate {
    pub fn new(identity: impl Into<String>, scope: Scope, locator: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            scope,
            locator: locator.into(),
        }
    }
}

/// Outcome of a resolution call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(Candidate),
    NotFound,
}

impl Resolution {
    pub fn outcome(&self) -> &'static str {
        match self {
            Resolution::Found(_) => "found",
            Resolution::NotFound => "not_found",
        }
    }
}

/// A cloud backend that can enumerate identities and their trust bindings.
#[async_trait]
pub trait IdentityBackend: Send + Sync + 'static {
    /// What a binding must carry to match, derived once per call.
    type Key: Send + Sync + 'static;
    type Binding: Send + 'static;

    fn name(&self) -> &'static str;

    fn match_key(&self, account: &ServiceAccountRef) -> Self::Key;

    async fn list_scopes(&self) -> Result<Vec<Scope>, ResolveError>;

    /// List candidates across `scopes`, deduplicated by identity.
    async fn list_candidates(
        &self,
        scopes: &[Scope],
        account: &ServiceAccountRef,
    ) -> Result<Vec<Candidate>, ResolveError>;

    /// Fetch one candidate's bindings, stopping early once `cancel` fires.
    async fn fetch_bindings(
        &self,
        candidate: &Candidate,
        cancel: &CancellationToken,
    ) -> Result<Vec<Self::Binding>, ResolveError>;

    fn is_match(key: &Self::Key, binding: &Self::Binding) -> bool;

    /// Annotations to write on a service account resolved to `candidate`.
    fn annotations(&self, candidate: &Candidate) -> BTreeMap<String, String>;
}

/// Object-safe entry point used by the webhook and the CLI.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn resolve(&self, account: &ServiceAccountRef) -> Result<Resolution, ResolveError>;

    fn annotations(&self, candidate: &Candidate) -> BTreeMap<String, String>;
}

/// Drives an [`IdentityBackend`] through a full resolution.
pub struct Resolver<B> {
    backend: Arc<B>,
}

impl<B: IdentityBackend> Resolver<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    async fn run(&self, account: &ServiceAccountRef) -> Result<Resolution, ResolveError> {
        let scopes = self.backend.list_scopes().await?;
        tracing::debug!(scopes = scopes.len(), "Listed scopes");

        let candidates = self.backend.list_candidates(&scopes, account).await?;
        tracing::debug!(candidates = candidates.len(), "Listed candidates");

        let key = Arc::new(self.backend.match_key(account));
        Ok(coordinator::first_match(self.backend.clone(), key, candidates).await)
    }
}

#[async_trait]
impl<B: IdentityBackend> IdentityResolver for Resolver<B> {
    fn backend(&self) -> &'static str {
        self.backend.name()
    }

    #[tracing::instrument(name = "resolver.resolve", skip(self), fields(account = %account))]
    async fn resolve(&self, account: &ServiceAccountRef) -> Result<Resolution, ResolveError> {
        let started = Instant::now();
        let result = self.run(account).await;
        let outcome = match &result {
            Ok(resolution) => resolution.outcome(),
            Err(e) => e.kind(),
        };
        metrics::record_resolution(
            self.backend.name(),
            outcome,
            started.elapsed().as_secs_f64(),
        );
        result
    }

    fn annotations(&self, candidate: &Candidate) -> BTreeMap<String, String> {
        self.backend.annotations(candidate)
    }
}

/// Build the resolver selected by configuration.
///
/// `issuer` is the trusted OIDC issuer, already resolved (configured or
/// discovered from the cluster). It is required by the federated-credential
/// backend and ignored otherwise.
pub async fn build_resolver(
    backend: &BackendConfig,
    http: reqwest::Client,
    issuer: Option<String>,
) -> Result<Arc<dyn IdentityResolver>, ResolveError> {
    match backend {
        BackendConfig::Azure(config) => {
            #[cfg(feature = "azure")]
            {
                let issuer = issuer.ok_or_else(|| {
                    ResolveError::Config("azure backend requires an OIDC issuer URL".into())
                })?;
                let backend = azure::AzureBackend::from_config(config, issuer, http)?;
                Ok(Arc::new(Resolver::new(backend)))
            }
            #[cfg(not(feature = "azure"))]
            {
                let _ = (config, http, issuer);
                Err(ResolveError::Config(
                    "backend type 'azure' requires the 'azure' feature".into(),
                ))
            }
        }
        BackendConfig::Gcp(config) => {
            let _ = issuer;
            #[cfg(feature = "gcp")]
            {
                let backend = gcp::GcpBackend::from_config(config, http).await?;
                Ok(Arc::new(Resolver::new(backend)))
            }
            #[cfg(not(feature = "gcp"))]
            {
                let _ = (config, http);
                Err(ResolveError::Config(
                    "backend type 'gcp' requires the 'gcp' feature".into(),
                ))
            }
        }
    }
}
