//! Configuration for the client ID syncer.
//!
//! The syncer is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax. Without a file, the
//! same settings are read from plain environment variables (see
//! [`SyncerConfig::from_env`]).
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 9443
//!
//! [server.tls]
//! cert_path = "/certs/tls.crt"
//! key_path = "/certs/tls.key"
//!
//! [backend]
//! type = "azure"
//! tenant_id = "${AZURE_TENANT_ID}"
//! auto_detect_oidc_issuer_url = true
//! cluster_identifier = "prod"
//!
//! [backend.filter_tags]
//! team = "<SERVICE_ACCOUNT_NAME>"
//! ```

mod backend;
mod observability;
mod server;

use std::{collections::BTreeMap, path::Path, sync::LazyLock};

pub use backend::*;
pub use observability::*;
use serde::{Deserialize, Serialize};
pub use server::*;

/// Root configuration, parsed once at startup and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncerConfig {
    /// Webhook server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Cloud backend used to resolve identities.
    pub backend: BackendConfig,

    /// Outbound HTTP client for the cloud APIs.
    #[serde(default)]
    pub http_client: HttpClientConfig,

    /// Logging and metrics.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl SyncerConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing required variables will cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;

        // Catch backends compiled out of this build before serde reports
        // them as an unknown variant.
        let raw: toml::Value = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        check_disabled_features(&raw)?;

        let config: SyncerConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        config.validate()?;

        Ok(config)
    }

    /// Build configuration from plain environment variables.
    ///
    /// | Variable | Meaning |
    /// |---|---|
    /// | `PROVIDER_TYPE` | `azure` (default) or `gcp` |
    /// | `AZURE_TENANT_ID` | tenant for the azure backend |
    /// | `OIDC_ISSUER_URL` | trusted issuer |
    /// | `AUTO_DETECT_OIDC_ISSUER_URL` | read the issuer from the API server |
    /// | `FILTER_TAGS` | `key:value,key2:value2` |
    /// | `CLUSTER_IDENTIFIER` | filter tag key prefix |
    /// | `GCP_PROJECT_ID` | project for the gcp backend |
    /// | `LOG_LEVEL` | `trace` .. `error` |
    pub fn from_env() -> Result<Self, ConfigError> {
        let provider = env_opt("PROVIDER_TYPE").unwrap_or_else(|| "azure".to_string());
        let provider = provider.to_ascii_lowercase();

        let mut issues = Vec::new();
        check_backend_feature(&provider, &mut issues);
        if !issues.is_empty() {
            return Err(feature_error(&issues));
        }

        let backend = match provider.as_str() {
            "azure" => BackendConfig::Azure(AzureBackendConfig {
                tenant_id: env_required("AZURE_TENANT_ID")?,
                oidc_issuer_url: env_opt("OIDC_ISSUER_URL"),
                auto_detect_oidc_issuer_url: env_opt("AUTO_DETECT_OIDC_ISSUER_URL")
                    .map(|v| parse_bool("AUTO_DETECT_OIDC_ISSUER_URL", &v))
                    .transpose()?
                    .unwrap_or(false),
                filter_tags: env_opt("FILTER_TAGS")
                    .map(|v| parse_filter_tags(&v))
                    .transpose()?
                    .unwrap_or_default(),
                cluster_identifier: env_opt("CLUSTER_IDENTIFIER"),
                management_endpoint: "https://management.azure.com".to_string(),
                credentials: AzureCredentials::default(),
            }),
            "gcp" => BackendConfig::Gcp(GcpBackendConfig {
                project_id: env_required("GCP_PROJECT_ID")?,
                workload_identity_pool: None,
                iam_endpoint: "https://iam.googleapis.com".to_string(),
                credentials: GcpCredentials::default(),
            }),
            other => {
                return Err(ConfigError::Validation(format!(
                    "PROVIDER_TYPE '{other}' is not supported (expected 'azure' or 'gcp')"
                )));
            }
        };

        let mut observability = ObservabilityConfig::default();
        if let Some(level) = env_opt("LOG_LEVEL") {
            observability.logging.level = level
                .parse()
                .map_err(|e| ConfigError::Validation(format!("LOG_LEVEL: {e}")))?;
        }
        #[cfg(not(feature = "prometheus"))]
        {
            observability.metrics.enabled = false;
        }

        let config = SyncerConfig {
            server: ServerConfig::default(),
            backend,
            http_client: HttpClientConfig::default(),
            observability,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    fn validate(&self) -> Result<(), ConfigError> {
        self.backend.validate()?;

        if let Some(tls) = &self.server.tls
            && (tls.cert_path.is_empty() || tls.key_path.is_empty())
        {
            return Err(ConfigError::Validation(
                "server.tls requires both cert_path and key_path".into(),
            ));
        }

        if self.http_client.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "http_client.timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Check for feature-gated configuration values before typed deserialization.
fn check_disabled_features(raw: &toml::Value) -> Result<(), ConfigError> {
    let mut issues: Vec<(String, &str)> = Vec::new();

    if let Some(type_val) = raw
        .get("backend")
        .and_then(|v| v.get("type"))
        .and_then(|v| v.as_str())
    {
        check_backend_feature(type_val, &mut issues);
    }

    if raw
        .get("observability")
        .and_then(|v| v.get("metrics"))
        .and_then(|v| v.get("enabled"))
        .and_then(|v| v.as_bool())
        == Some(true)
    {
        check_metrics_feature(&mut issues);
    }

    if issues.is_empty() {
        return Ok(());
    }
    Err(feature_error(&issues))
}

fn feature_error(issues: &[(String, &str)]) -> ConfigError {
    let details = issues
        .iter()
        .map(|(msg, _)| msg.as_str())
        .collect::<Vec<_>>()
        .join("\n  - ");
    let features = issues
        .iter()
        .map(|(_, feat)| *feat)
        .collect::<Vec<_>>()
        .join(",");

    ConfigError::Validation(format!(
        "Configuration requires features not compiled in this build:\n  \
         - {details}\n\n\
         Rebuild with: cargo build --features {features}\n\
         Or use the 'full' profile: cargo build --features full"
    ))
}

fn check_backend_feature(type_val: &str, _issues: &mut Vec<(String, &str)>) {
    match type_val {
        #[cfg(not(feature = "azure"))]
        "azure" => _issues.push((
            "backend type 'azure' requires the 'azure' feature".into(),
            "azure",
        )),
        #[cfg(not(feature = "gcp"))]
        "gcp" => _issues.push((
            "backend type 'gcp' requires the 'gcp' feature".into(),
            "gcp",
        )),
        _ => {}
    }
}

fn check_metrics_feature(_issues: &mut Vec<(String, &str)>) {
    #[cfg(not(feature = "prometheus"))]
    _issues.push((
        "observability.metrics.enabled requires the 'prometheus' feature".into(),
        "prometheus",
    ));
}

static ENV_VAR_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").unwrap());

/// Expand environment variables in the format `${VAR_NAME}`.
/// Variables after a `#` on the same line are left alone.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');
        let mut last_end = 0;

        for cap in ENV_VAR_PATTERN.captures_iter(line) {
            let Some(whole) = cap.get(0) else {
                continue;
            };
            if comment_pos.is_some_and(|pos| whole.start() >= pos) {
                continue;
            }

            result.push_str(&line[last_end..whole.start()]);
            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            result.push_str(&value);
            last_end = whole.end();
        }

        result.push_str(&line[last_end..]);
        result.push('\n');
    }

    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}

/// Read a variable, treating empty as unset.
fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_required(name: &str) -> Result<String, ConfigError> {
    env_opt(name).ok_or_else(|| ConfigError::EnvVarNotFound(name.to_string()))
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" => Ok(true),
        "0" | "f" | "false" | "no" => Ok(false),
        other => Err(ConfigError::Validation(format!(
            "{name} must be a boolean, got '{other}'"
        ))),
    }
}

/// Parse `key:value,key2:value2`. The value may itself contain `:`.
fn parse_filter_tags(value: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut tags = BTreeMap::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((key, value)) = entry.split_once(':') else {
            return Err(ConfigError::Validation(format!(
                "FILTER_TAGS entry '{entry}' must be in key:value form"
            )));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError::Validation(format!(
                "FILTER_TAGS entry '{entry}' has an empty key"
            )));
        }
        tags.insert(key.to_string(), value.trim().to_string());
    }
    Ok(tags)
}
