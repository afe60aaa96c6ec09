//! Azure backend: user-assigned managed identities and their federated
//! identity credentials.
//!
//! - scopes: every subscription the credential can list
//! - candidates: managed identities from a Resource Graph query, narrowed by tags
//! - bindings: the identity's federated identity credentials
//! - match: issuer and subject equality

mod token;

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
pub use token::{AZURE_MANAGEMENT_SCOPE, AzureTokenSource};
use tokio_util::sync::CancellationToken;

use super::{
    AccessTokenSource, Candidate, IdentityBackend, ResolveError, Scope, ServiceAccountRef,
    filter::TagFilter,
    pagination::{Page, collect_all, collect_degraded},
    predicate::{FederatedCredential, FederatedMatchKey},
    rest::RestClient,
};
use crate::config::AzureBackendConfig;

/// Annotation carrying the managed identity's client ID.
pub const CLIENT_ID_ANNOTATION: &str = "azure.workload.identity/client-id";
/// Annotation carrying the tenant the identity lives in.
pub const TENANT_ID_ANNOTATION: &str = "azure.workload.identity/tenant-id";

const SUBSCRIPTIONS_API_VERSION: &str = "2020-01-01";
const RESOURCE_GRAPH_API_VERSION: &str = "2021-03-01";
const FEDERATED_CREDENTIALS_API_VERSION: &str = "2023-01-31";

/// Resource Graph accepts at most this many subscriptions per query.
const MAX_GRAPH_SUBSCRIPTIONS: usize = 1000;

const IDENTITY_QUERY: &str =
    "resources | where type == \"microsoft.managedidentity/userassignedidentities\"";

pub struct AzureBackend {
    rest: RestClient,
    management_endpoint: String,
    tenant_id: String,
    issuer: String,
    filter: TagFilter,
}

impl std::fmt::Debug for AzureBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureBackend")
            .field("management_endpoint", &self.management_endpoint)
            .field("tenant_id", &self.tenant_id)
            .field("issuer", &self.issuer)
            .finish()
    }
}

impl AzureBackend {
    /// Build from configuration, creating the configured credential.
    pub fn from_config(
        config: &AzureBackendConfig,
        issuer: String,
        http: reqwest::Client,
    ) -> Result<Self, ResolveError> {
        let tokens = AzureTokenSource::from_config(
            &config.credentials,
            &config.tenant_id,
            AZURE_MANAGEMENT_SCOPE,
        )?;
        Ok(Self::with_token_source(config, issuer, http, Arc::new(tokens)))
    }

    pub fn with_token_source(
        config: &AzureBackendConfig,
        issuer: String,
        http: reqwest::Client,
        tokens: Arc<dyn AccessTokenSource>,
    ) -> Self {
        tracing::info!(
            tenant_id = %config.tenant_id,
            issuer = %issuer,
            filter_tags = config.filter_tags.len(),
            "Azure identity backend configured"
        );
        Self {
            rest: RestClient::new(http, tokens),
            management_endpoint: config.management_endpoint.trim_end_matches('/').to_string(),
            tenant_id: config.tenant_id.clone(),
            issuer,
            filter: TagFilter::new(
                config.filter_tags.clone(),
                config.cluster_identifier.clone(),
            ),
        }
    }

    fn query_for(&self, account: &ServiceAccountRef) -> String {
        format!("{IDENTITY_QUERY}{}", self.filter.to_kusto(account))
    }

    async fn subscriptions_page(&self, next: Option<String>) -> Result<Page<Scope>, ResolveError> {
        let request = match next {
            Some(url) => self.rest.get(&url),
            None => self
                .rest
                .get(&format!("{}/subscriptions", self.management_endpoint))
                .query(&[("api-version", SUBSCRIPTIONS_API_VERSION)]),
        };
        let page: SubscriptionList = self.rest.send_json(request, "list subscriptions").await?;
        let scopes = page
            .value
            .into_iter()
            .map(|s| Scope::new(s.subscription_id))
            .collect();
        Ok(Page::new(scopes, page.next_link))
    }

    async fn graph_page(
        &self,
        subscriptions: &[String],
        query: &str,
        skip_token: Option<String>,
    ) -> Result<Page<IdentityRow>, ResolveError> {
        let body = GraphQuery {
            subscriptions,
            query,
            options: GraphOptions {
                result_format: "objectArray",
                skip_token,
            },
        };
        let request = self
            .rest
            .post(&format!(
                "{}/providers/Microsoft.ResourceGraph/resources",
                self.management_endpoint
            ))
            .query(&[("api-version", RESOURCE_GRAPH_API_VERSION)])
            .json(&body);
        let page: GraphResponse = self
            .rest
            .send_json(request, "query managed identities")
            .await?;
        Ok(Page::new(page.data, page.skip_token))
    }

    async fn credentials_page(
        &self,
        candidate: &Candidate,
        next: Option<String>,
    ) -> Result<Page<FederatedCredential>, ResolveError> {
        let request = match next {
            Some(url) => self.rest.get(&url),
            None => self
                .rest
                .get(&format!(
                    "{}{}/federatedIdentityCredentials",
                    self.management_endpoint, candidate.locator
                ))
                .query(&[("api-version", FEDERATED_CREDENTIALS_API_VERSION)]),
        };
        let page: FederatedCredentialList = self
            .rest
            .send_json(request, "list federated identity credentials")
            .await?;
        let credentials = page
            .value
            .into_iter()
            .filter_map(|item| {
                let properties = item.properties?;
                Some(FederatedCredential {
                    issuer: properties.issuer?,
                    subject: properties.subject?,
                })
            })
            .collect();
        Ok(Page::new(credentials, page.next_link))
    }
}

#[async_trait]
impl IdentityBackend for AzureBackend {
    type Key = FederatedMatchKey;
    type Binding = FederatedCredential;

    fn name(&self) -> &'static str {
        "azure"
    }

    fn match_key(&self, account: &ServiceAccountRef) -> FederatedMatchKey {
        FederatedMatchKey::new(self.issuer.clone(), account)
    }

    async fn list_scopes(&self) -> Result<Vec<Scope>, ResolveError> {
        collect_all(|next| self.subscriptions_page(next)).await
    }

    async fn list_candidates(
        &self,
        scopes: &[Scope],
        account: &ServiceAccountRef,
    ) -> Result<Vec<Candidate>, ResolveError> {
        if scopes.is_empty() {
            tracing::debug!("No subscriptions visible, skipping identity query");
            return Ok(Vec::new());
        }

        let query = self.query_for(account);
        tracing::debug!(query = %query, "Querying managed identities");

        let subscriptions: Vec<String> = scopes.iter().map(|s| s.id().to_string()).collect();
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for chunk in subscriptions.chunks(MAX_GRAPH_SUBSCRIPTIONS) {
            let rows = collect_all(|skip_token| self.graph_page(chunk, &query, skip_token)).await?;
            for row in rows {
                let Some(client_id) = row.properties.and_then(|p| p.client_id) else {
                    tracing::debug!(id = %row.id, "Skipping identity without a client ID");
                    continue;
                };
                if seen.insert(client_id.clone()) {
                    candidates.push(Candidate::new(
                        client_id,
                        Scope::new(row.subscription_id),
                        row.id,
                    ));
                }
            }
        }

        Ok(candidates)
    }

    async fn fetch_bindings(
        &self,
        candidate: &Candidate,
        cancel: &CancellationToken,
    ) -> Result<Vec<FederatedCredential>, ResolveError> {
        collect_degraded(cancel, |next| self.credentials_page(candidate, next)).await
    }

    fn is_match(key: &FederatedMatchKey, binding: &FederatedCredential) -> bool {
        key.matches(binding)
    }

    fn annotations(&self, candidate: &Candidate) -> BTreeMap<String, String> {
        BTreeMap::from([
            (CLIENT_ID_ANNOTATION.to_string(), candidate.identity.clone()),
            (TENANT_ID_ANNOTATION.to_string(), self.tenant_id.clone()),
        ])
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionList {
    #[serde(default)]
    value: Vec<Subscription>,
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Subscription {
    subscription_id: String,
}

#[derive(Debug, Serialize)]
struct GraphQuery<'a> {
    subscriptions: &'a [String],
    query: &'a str,
    options: GraphOptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GraphOptions {
    result_format: &'static str,
    #[serde(rename = "$skipToken", skip_serializing_if = "Option::is_none")]
    skip_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphResponse {
    #[serde(default)]
    data: Vec<IdentityRow>,
    #[serde(rename = "$skipToken")]
    skip_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityRow {
    id: String,
    #[serde(default)]
    subscription_id: String,
    properties: Option<IdentityProperties>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityProperties {
    client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FederatedCredentialList {
    #[serde(default)]
    value: Vec<FederatedCredentialItem>,
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FederatedCredentialItem {
    properties: Option<FederatedCredentialProperties>,
}

#[derive(Debug, Deserialize)]
struct FederatedCredentialProperties {
    issuer: Option<String>,
    subject: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, header, method, path, query_param},
    };

    use super::*;
    use crate::{
        config::AzureCredentials,
        resolver::{IdentityResolver, Resolution, Resolver, StaticToken},
    };

    const ISSUER: &str = "https://oidc.prod-aks.azure.com/tenant/cluster/";

    fn config(endpoint: &str) -> AzureBackendConfig {
        AzureBackendConfig {
            tenant_id: "tenant-1".into(),
            oidc_issuer_url: Some(ISSUER.into()),
            auto_detect_oidc_issuer_url: false,
            filter_tags: BTreeMap::new(),
            cluster_identifier: None,
            management_endpoint: endpoint.into(),
            credentials: AzureCredentials::WorkloadIdentity,
        }
    }

    fn backend_with(config: &AzureBackendConfig) -> AzureBackend {
        AzureBackend::with_token_source(
            config,
            ISSUER.into(),
            reqwest::Client::new(),
            Arc::new(StaticToken::new("test-token")),
        )
    }

    fn identity_path(sub: &str, name: &str) -> String {
        format!(
            "/subscriptions/{sub}/resourceGroups/rg/providers/Microsoft.ManagedIdentity/userAssignedIdentities/{name}"
        )
    }

    fn identity_row(sub: &str, name: &str, client_id: &str) -> serde_json::Value {
        json!({
            "id": identity_path(sub, name),
            "subscriptionId": sub,
            "properties": { "clientId": client_id }
        })
    }

    async fn mount_subscriptions(server: &MockServer, ids: &[&str]) {
        let value: Vec<_> = ids.iter().map(|id| json!({ "subscriptionId": id })).collect();
        Mock::given(method("GET"))
            .and(path("/subscriptions"))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": value })))
            .mount(server)
            .await;
    }

    async fn mount_graph(server: &MockServer, rows: Vec<serde_json::Value>) {
        Mock::given(method("POST"))
            .and(path("/providers/Microsoft.ResourceGraph/resources"))
            .and(query_param("api-version", RESOURCE_GRAPH_API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": rows })))
            .mount(server)
            .await;
    }

    async fn mount_credentials(server: &MockServer, sub: &str, name: &str, subjects: &[&str]) {
        let value: Vec<_> = subjects
            .iter()
            .map(|s| json!({ "name": s, "properties": { "issuer": ISSUER, "subject": s } }))
            .collect();
        Mock::given(method("GET"))
            .and(path(format!(
                "{}/federatedIdentityCredentials",
                identity_path(sub, name)
            )))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": value })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_list_scopes_follows_next_link() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/subscriptions"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{ "subscriptionId": "sub-b" }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/subscriptions"))
            .and(query_param("api-version", SUBSCRIPTIONS_API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{ "subscriptionId": "sub-a" }],
                "nextLink": format!("{}/subscriptions?page=2", server.uri())
            })))
            .mount(&server)
            .await;

        let backend = backend_with(&config(&server.uri()));
        let scopes = backend.list_scopes().await.unwrap();
        assert_eq!(scopes, vec![Scope::new("sub-a"), Scope::new("sub-b")]);
    }

    #[tokio::test]
    async fn test_list_scopes_forbidden_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/subscriptions"))
            .respond_with(ResponseTemplate::new(403).set_body_string("AuthorizationFailed"))
            .mount(&server)
            .await;

        let backend = backend_with(&config(&server.uri()));
        let err = backend.list_scopes().await.unwrap_err();
        assert!(matches!(err, ResolveError::Auth(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_query_includes_rendered_filter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/providers/Microsoft.ResourceGraph/resources"))
            .and(body_partial_json(json!({
                "subscriptions": ["sub-a"],
                "query": "resources | where type == \"microsoft.managedidentity/userassignedidentities\" | where tags['prod-team'] == 'payments'",
                "options": { "resultFormat": "objectArray" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [identity_row("sub-a", "payments", "client-1")]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut cfg = config(&server.uri());
        cfg.filter_tags = BTreeMap::from([("team".into(), "<SERVICE_ACCOUNT_NAME>".into())]);
        cfg.cluster_identifier = Some("prod".into());
        let backend = backend_with(&cfg);

        let candidates = backend
            .list_candidates(
                &[Scope::new("sub-a")],
                &ServiceAccountRef::new("shop", "payments"),
            )
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].identity, "client-1");
        assert_eq!(candidates[0].scope, Scope::new("sub-a"));
    }

    #[tokio::test]
    async fn test_candidates_walk_skip_tokens_and_dedupe() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/providers/Microsoft.ResourceGraph/resources"))
            .and(body_partial_json(json!({ "options": { "$skipToken": "page-2" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    identity_row("sub-a", "one", "client-1"),
                    identity_row("sub-a", "two", "client-2")
                ]
            })))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/providers/Microsoft.ResourceGraph/resources"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [identity_row("sub-a", "one", "client-1")],
                "$skipToken": "page-2"
            })))
            .with_priority(2)
            .mount(&server)
            .await;

        let backend = backend_with(&config(&server.uri()));
        let candidates = backend
            .list_candidates(&[Scope::new("sub-a")], &ServiceAccountRef::new("a", "b"))
            .await
            .unwrap();
        let ids: Vec<_> = candidates.iter().map(|c| c.identity.as_str()).collect();
        assert_eq!(ids, vec!["client-1", "client-2"]);
    }

    #[tokio::test]
    async fn test_candidate_listing_failure_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/providers/Microsoft.ResourceGraph/resources"))
            .and(body_partial_json(json!({ "options": { "$skipToken": "page-2" } })))
            .respond_with(ResponseTemplate::new(500))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/providers/Microsoft.ResourceGraph/resources"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [identity_row("sub-a", "one", "client-1")],
                "$skipToken": "page-2"
            })))
            .with_priority(2)
            .mount(&server)
            .await;

        let backend = backend_with(&config(&server.uri()));
        let err = backend
            .list_candidates(&[Scope::new("sub-a")], &ServiceAccountRef::new("a", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_no_subscriptions_skips_query() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let backend = backend_with(&config(&server.uri()));
        let candidates = backend
            .list_candidates(&[], &ServiceAccountRef::new("a", "b"))
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn test_credentials_degrade_after_first_page() {
        let server = MockServer::start().await;
        let base = format!(
            "{}/federatedIdentityCredentials",
            identity_path("sub-a", "one")
        );
        Mock::given(method("GET"))
            .and(path(base.clone()))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(base.clone()))
            .and(query_param("api-version", FEDERATED_CREDENTIALS_API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{ "properties": { "issuer": ISSUER, "subject": "system:serviceaccount:a:b" } }],
                "nextLink": format!("{}{}?page=2", server.uri(), base)
            })))
            .mount(&server)
            .await;

        let backend = backend_with(&config(&server.uri()));
        let candidate = Candidate::new("client-1", Scope::new("sub-a"), identity_path("sub-a", "one"));
        let bindings = backend
            .fetch_bindings(&candidate, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(bindings.len(), 1);
    }

    #[tokio::test]
    async fn test_end_to_end_found_with_failing_candidate() {
        let server = MockServer::start().await;
        mount_subscriptions(&server, &["sub-a"]).await;
        mount_graph(
            &server,
            vec![
                identity_row("sub-a", "broken", "client-broken"),
                identity_row("sub-a", "other", "client-other"),
                identity_row("sub-a", "payments", "client-payments"),
            ],
        )
        .await;
        Mock::given(method("GET"))
            .and(path(format!(
                "{}/federatedIdentityCredentials",
                identity_path("sub-a", "broken")
            )))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        mount_credentials(&server, "sub-a", "other", &["system:serviceaccount:shop:other"]).await;
        mount_credentials(
            &server,
            "sub-a",
            "payments",
            &["system:serviceaccount:dev:payments", "system:serviceaccount:shop:payments"],
        )
        .await;

        let resolver = Resolver::new(backend_with(&config(&server.uri())));
        let resolution = resolver
            .resolve(&ServiceAccountRef::new("shop", "payments"))
            .await
            .unwrap();

        let Resolution::Found(candidate) = resolution else {
            panic!("expected Found, got {resolution:?}");
        };
        assert_eq!(candidate.identity, "client-payments");

        let annotations = resolver.annotations(&candidate);
        assert_eq!(annotations[CLIENT_ID_ANNOTATION], "client-payments");
        assert_eq!(annotations[TENANT_ID_ANNOTATION], "tenant-1");
    }

    #[tokio::test]
    async fn test_end_to_end_wrong_issuer_is_not_found() {
        let server = MockServer::start().await;
        mount_subscriptions(&server, &["sub-a"]).await;
        mount_graph(&server, vec![identity_row("sub-a", "payments", "client-payments")]).await;
        Mock::given(method("GET"))
            .and(path(format!(
                "{}/federatedIdentityCredentials",
                identity_path("sub-a", "payments")
            )))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{ "properties": {
                    "issuer": "https://other-cluster.example.com/",
                    "subject": "system:serviceaccount:shop:payments"
                } }]
            })))
            .mount(&server)
            .await;

        let resolver = Resolver::new(backend_with(&config(&server.uri())));
        let resolution = resolver
            .resolve(&ServiceAccountRef::new("shop", "payments"))
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::NotFound);
    }
}
