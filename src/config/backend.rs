use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Which cloud the identities live in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Managed identities with federated identity credentials.
    Azure(AzureBackendConfig),
    /// Service accounts with `roles/iam.workloadIdentityUser` bindings.
    Gcp(GcpBackendConfig),
}

impl BackendConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            BackendConfig::Azure(_) => "azure",
            BackendConfig::Gcp(_) => "gcp",
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            BackendConfig::Azure(config) => config.validate(),
            BackendConfig::Gcp(config) => config.validate(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Azure
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AzureBackendConfig {
    /// Tenant written to the `tenant-id` annotation.
    pub tenant_id: String,

    /// Issuer URL the federated credentials must trust.
    #[serde(default)]
    pub oidc_issuer_url: Option<String>,

    /// Read the issuer from the API server at startup.
    /// Takes precedence over `oidc_issuer_url`.
    #[serde(default)]
    pub auto_detect_oidc_issuer_url: bool,

    /// Tags a managed identity must carry to be considered.
    ///
    /// `<NAMESPACE>` and `<SERVICE_ACCOUNT_NAME>` in keys or values are
    /// replaced per request.
    #[serde(default)]
    pub filter_tags: BTreeMap<String, String>,

    /// Prefix applied to every filter tag key as `<cluster>-<key>`.
    #[serde(default)]
    pub cluster_identifier: Option<String>,

    /// Azure Resource Manager endpoint.
    #[serde(default = "default_management_endpoint")]
    pub management_endpoint: String,

    #[serde(default)]
    pub credentials: AzureCredentials,
}

impl AzureBackendConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.tenant_id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "backend.tenant_id must be set for the azure backend".into(),
            ));
        }

        match (&self.oidc_issuer_url, self.auto_detect_oidc_issuer_url) {
            (None, false) => {
                return Err(ConfigError::Validation(
                    "azure backend requires backend.oidc_issuer_url or \
                     backend.auto_detect_oidc_issuer_url = true"
                        .into(),
                ));
            }
            (Some(issuer), false) => {
                url::Url::parse(issuer).map_err(|e| {
                    ConfigError::Validation(format!(
                        "backend.oidc_issuer_url '{issuer}' is not a valid URL: {e}"
                    ))
                })?;
            }
            (Some(_), true) => {
                tracing::info!(
                    "Both oidc_issuer_url and auto_detect_oidc_issuer_url are set; \
                     the auto-detected issuer will be used"
                );
            }
            (None, true) => {}
        }

        url::Url::parse(&self.management_endpoint).map_err(|e| {
            ConfigError::Validation(format!(
                "backend.management_endpoint '{}' is not a valid URL: {e}",
                self.management_endpoint
            ))
        })?;

        if let AzureCredentials::ClientSecret {
            client_id,
            client_secret,
        } = &self.credentials
            && (client_id.is_empty() || client_secret.is_empty())
        {
            return Err(ConfigError::Validation(
                "client_secret credentials require client_id and client_secret".into(),
            ));
        }

        Ok(())
    }
}

fn default_management_endpoint() -> String {
    "https://management.azure.com".to_string()
}

/// How the syncer authenticates to Azure.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AzureCredentials {
    /// Federated token projected into the pod by the workload identity webhook.
    #[default]
    WorkloadIdentity,

    /// Managed identity of the node or pod.
    ManagedIdentity {
        /// Client ID of a user-assigned identity. Omit for system-assigned.
        #[serde(default)]
        client_id: Option<String>,
    },

    /// Service principal with a client secret.
    ClientSecret {
        client_id: String,
        client_secret: String,
    },

    /// Whatever `az login` is signed in as. Local development only.
    AzureCli,
}

impl AzureCredentials {
    pub fn kind(&self) -> &'static str {
        match self {
            AzureCredentials::WorkloadIdentity => "workload_identity",
            AzureCredentials::ManagedIdentity { .. } => "managed_identity",
            AzureCredentials::ClientSecret { .. } => "client_secret",
            AzureCredentials::AzureCli => "azure_cli",
        }
    }
}

impl std::fmt::Debug for AzureCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AzureCredentials::ClientSecret { client_id, .. } => f
                .debug_struct("ClientSecret")
                .field("client_id", client_id)
                .field("client_secret", &"****")
                .finish(),
            AzureCredentials::ManagedIdentity { client_id } => f
                .debug_struct("ManagedIdentity")
                .field("client_id", client_id)
                .finish(),
            other => f.write_str(other.kind()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// GCP
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GcpBackendConfig {
    /// Project whose service accounts are candidates.
    pub project_id: String,

    /// Require members to belong to this pool, e.g. `my-project.svc.id.goog`.
    #[serde(default)]
    pub workload_identity_pool: Option<String>,

    #[serde(default = "default_iam_endpoint")]
    pub iam_endpoint: String,

    #[serde(default)]
    pub credentials: GcpCredentials,
}

impl GcpBackendConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.project_id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "backend.project_id must be set for the gcp backend".into(),
            ));
        }
        if self
            .workload_identity_pool
            .as_deref()
            .is_some_and(|pool| pool.contains(['[', ']', '/']))
        {
            return Err(ConfigError::Validation(
                "backend.workload_identity_pool must be a bare pool name like \
                 'my-project.svc.id.goog'"
                    .into(),
            ));
        }
        url::Url::parse(&self.iam_endpoint).map_err(|e| {
            ConfigError::Validation(format!(
                "backend.iam_endpoint '{}' is not a valid URL: {e}",
                self.iam_endpoint
            ))
        })?;
        Ok(())
    }
}

fn default_iam_endpoint() -> String {
    "https://iam.googleapis.com".to_string()
}

/// GCP credentials configuration.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GcpCredentials {
    /// Application Default Credentials (GKE metadata server, `gcloud auth`).
    #[default]
    Default,

    /// Service account key file.
    ServiceAccount { key_path: String },

    /// Service account key as a JSON string (useful with env vars).
    ServiceAccountJson { json: String },
}

impl GcpCredentials {
    pub fn kind(&self) -> &'static str {
        match self {
            GcpCredentials::Default => "default",
            GcpCredentials::ServiceAccount { .. } => "service_account",
            GcpCredentials::ServiceAccountJson { .. } => "service_account_json",
        }
    }
}

impl std::fmt::Debug for GcpCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GcpCredentials::ServiceAccount { key_path } => f
                .debug_struct("ServiceAccount")
                .field("key_path", key_path)
                .finish(),
            other => f.write_str(other.kind()),
        }
    }
}
