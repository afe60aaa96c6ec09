//! Tag filters used to narrow the candidate query.

use std::collections::BTreeMap;

use super::ServiceAccountRef;

/// Replaced with the service account's namespace.
pub const NAMESPACE_PLACEHOLDER: &str = "<NAMESPACE>";
/// Replaced with the service account's name.
pub const SERVICE_ACCOUNT_PLACEHOLDER: &str = "<SERVICE_ACCOUNT_NAME>";

/// A templated tag filter plus an optional per-cluster key prefix.
///
/// Keys are kept in a `BTreeMap` so the rendered query is stable across calls.
#[derive(Debug, Clone, Default)]
pub struct TagFilter {
    tags: BTreeMap<String, String>,
    cluster_identifier: Option<String>,
}

impl TagFilter {
    pub fn new(tags: BTreeMap<String, String>, cluster_identifier: Option<String>) -> Self {
        Self {
            tags,
            cluster_identifier: cluster_identifier.filter(|c| !c.is_empty()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Resolve placeholders and apply the cluster prefix.
    ///
    /// Placeholders are substituted in both keys and values.
    pub fn render(&self, account: &ServiceAccountRef) -> Vec<(String, String)> {
        self.tags
            .iter()
            .map(|(key, value)| {
                let key = substitute(key, account);
                let key = match &self.cluster_identifier {
                    Some(cluster) => format!("{cluster}-{key}"),
                    None => key,
                };
                (key, substitute(value, account))
            })
            .collect()
    }

    /// Render as Kusto `where` clauses, one per tag, each with a leading pipe.
    pub fn to_kusto(&self, account: &ServiceAccountRef) -> String {
        self.render(account)
            .into_iter()
            .map(|(key, value)| {
                format!(
                    " | where tags['{}'] == '{}'",
                    escape_kusto(&key),
                    escape_kusto(&value)
                )
            })
            .collect()
    }
}

fn substitute(template: &str, account: &ServiceAccountRef) -> String {
    template
        .replace(NAMESPACE_PLACEHOLDER, &account.namespace)
        .replace(SERVICE_ACCOUNT_PLACEHOLDER, &account.name)
}

/// Escape a value for a single-quoted Kusto string literal.
fn escape_kusto(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
