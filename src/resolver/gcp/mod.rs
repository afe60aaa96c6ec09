//! GCP backend: IAM service accounts and their `workloadIdentityUser`
//! policy bindings.
//!
//! The scope is the single configured project. Each enabled service account
//! in it is a candidate; its IAM policy is fetched and every member of every
//! binding is tested.

mod token;

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
pub use token::{CLOUD_PLATFORM_SCOPE, GcpTokenSource};
use tokio_util::sync::CancellationToken;

use super::{
    AccessTokenSource, Candidate, IdentityBackend, ResolveError, Scope, ServiceAccountRef,
    pagination::{Page, collect_all, collect_degraded},
    predicate::{PolicyBinding, PolicyMatchKey},
    rest::RestClient,
};
use crate::config::GcpBackendConfig;

/// Annotation carrying the Google service account email.
pub const GCP_SERVICE_ACCOUNT_ANNOTATION: &str = "iam.gke.io/gcp-service-account";

/// Version 3 is required to see conditional bindings.
const IAM_POLICY_VERSION: u8 = 3;

pub struct GcpBackend {
    rest: RestClient,
    iam_endpoint: String,
    project_id: String,
    workload_identity_pool: Option<String>,
}

impl std::fmt::Debug for GcpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcpBackend")
            .field("iam_endpoint", &self.iam_endpoint)
            .field("project_id", &self.project_id)
            .field("workload_identity_pool", &self.workload_identity_pool)
            .finish()
    }
}

impl GcpBackend {
    pub async fn from_config(
        config: &GcpBackendConfig,
        http: reqwest::Client,
    ) -> Result<Self, ResolveError> {
        let tokens = GcpTokenSource::from_config(&config.credentials).await?;
        Ok(Self::with_token_source(config, http, Arc::new(tokens)))
    }

    pub fn with_token_source(
        config: &GcpBackendConfig,
        http: reqwest::Client,
        tokens: Arc<dyn AccessTokenSource>,
    ) -> Self {
        tracing::info!(
            project_id = %config.project_id,
            workload_identity_pool = ?config.workload_identity_pool,
            "GCP identity backend configured"
        );
        Self {
            rest: RestClient::new(http, tokens),
            iam_endpoint: config.iam_endpoint.trim_end_matches('/').to_string(),
            project_id: config.project_id.clone(),
            workload_identity_pool: config.workload_identity_pool.clone(),
        }
    }

    async fn accounts_page(
        &self,
        project: &str,
        page_token: Option<String>,
    ) -> Result<Page<ServiceAccount>, ResolveError> {
        let mut request = self.rest.get(&format!(
            "{}/v1/projects/{project}/serviceAccounts",
            self.iam_endpoint
        ));
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }
        let page: ServiceAccountList = self
            .rest
            .send_json(request, "list service accounts")
            .await?;
        Ok(Page::new(page.accounts, page.next_page_token))
    }

    async fn policy(&self, candidate: &Candidate) -> Result<Page<PolicyBinding>, ResolveError> {
        let request = self
            .rest
            .post(&format!(
                "{}/v1/{}:getIamPolicy",
                self.iam_endpoint, candidate.locator
            ))
            .json(&json!({ "options": { "requestedPolicyVersion": IAM_POLICY_VERSION } }));
        let policy: IamPolicy = self.rest.send_json(request, "get IAM policy").await?;

        let bindings = policy
            .bindings
            .into_iter()
            .flat_map(|binding| {
                let role = binding.role;
                binding.members.into_iter().map(move |member| PolicyBinding {
                    role: role.clone(),
                    member,
                })
            })
            .collect();
        Ok(Page::last(bindings))
    }
}

#[async_trait]
impl IdentityBackend for GcpBackend {
    type Key = PolicyMatchKey;
    type Binding = PolicyBinding;

    fn name(&self) -> &'static str {
        "gcp"
    }

    fn match_key(&self, account: &ServiceAccountRef) -> PolicyMatchKey {
        PolicyMatchKey::workload_identity(account, self.workload_identity_pool.clone())
    }

    async fn list_scopes(&self) -> Result<Vec<Scope>, ResolveError> {
        Ok(vec![Scope::new(self.project_id.clone())])
    }

    async fn list_candidates(
        &self,
        scopes: &[Scope],
        _account: &ServiceAccountRef,
    ) -> Result<Vec<Candidate>, ResolveError> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for scope in scopes {
            let accounts = collect_all(|next| self.accounts_page(scope.id(), next)).await?;
            for account in accounts {
                if account.disabled {
                    tracing::trace!(email = %account.email, "Skipping disabled service account");
                    continue;
                }
                if !seen.insert(account.email.clone()) {
                    continue;
                }
                candidates.push(Candidate::new(account.email, scope.clone(), account.name));
            }
        }
        Ok(candidates)
    }

    async fn fetch_bindings(
        &self,
        candidate: &Candidate,
        cancel: &CancellationToken,
    ) -> Result<Vec<PolicyBinding>, ResolveError> {
        collect_degraded(cancel, |_| self.policy(candidate)).await
    }

    fn is_match(key: &PolicyMatchKey, binding: &PolicyBinding) -> bool {
        key.matches(binding)
    }

    fn annotations(&self, candidate: &Candidate) -> BTreeMap<String, String> {
        BTreeMap::from([(
            GCP_SERVICE_ACCOUNT_ANNOTATION.to_string(),
            candidate.identity.clone(),
        )])
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceAccountList {
    #[serde(default)]
    accounts: Vec<ServiceAccount>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServiceAccount {
    name: String,
    email: String,
    #[serde(default)]
    disabled: bool,
}

#[derive(Debug, Deserialize)]
struct IamPolicy {
    #[serde(default)]
    bindings: Vec<IamBinding>,
}

#[derive(Debug, Deserialize)]
struct IamBinding {
    role: String,
    #[serde(default)]
    members: Vec<String>,
}
