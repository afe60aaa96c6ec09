//! Match predicates for the two binding shapes.

use std::sync::LazyLock;

use regex::Regex;

use super::ServiceAccountRef;

/// The only IAM role that lets a Kubernetes service account impersonate a
/// GCP service account through workload identity.
pub const WORKLOAD_IDENTITY_USER_ROLE: &str = "roles/iam.workloadIdentityUser";

/// Captures `<namespace>/<name>` from the bracketed suffix of a member string,
/// e.g. `serviceAccount:proj.svc.id.goog[ns1/sa1]`.
static MEMBER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^/\[\]]+)/([^/\[\]]+)\]$").unwrap());

/// A federated identity credential attached to a managed identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederatedCredential {
    pub issuer: String,
    pub subject: String,
}

/// What a federated credential must carry to match.
#[derive(Debug, Clone)]
pub struct FederatedMatchKey {
    pub issuer: String,
    pub subject: String,
}

impl FederatedMatchKey {
    pub fn new(issuer: impl Into<String>, account: &ServiceAccountRef) -> Self {
        Self {
            issuer: issuer.into(),
            subject: account.subject(),
        }
    }

    pub fn matches(&self, credential: &FederatedCredential) -> bool {
        credential.issuer == self.issuer && credential.subject == self.subject
    }
}

/// One member of one role binding in an IAM policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyBinding {
    pub role: String,
    pub member: String,
}

/// What a policy binding must carry to match.
#[derive(Debug, Clone)]
pub struct PolicyMatchKey {
    pub role: String,
    pub namespace: String,
    pub name: String,
    /// When set, the member must name this workload identity pool.
    pub pool: Option<String>,
}

impl PolicyMatchKey {
    pub fn workload_identity(account: &ServiceAccountRef, pool: Option<String>) -> Self {
        Self {
            role: WORKLOAD_IDENTITY_USER_ROLE.to_string(),
            namespace: account.namespace.clone(),
            name: account.name.clone(),
            pool,
        }
    }

    pub fn matches(&self, binding: &PolicyBinding) -> bool {
        if binding.role != WORKLOAD_IDENTITY_USER_ROLE || binding.role != self.role {
            return false;
        }
        if let Some(pool) = &self.pool
            && !binding
                .member
                .strip_prefix("serviceAccount:")
                .and_then(|rest| rest.strip_prefix(pool.as_str()))
                .is_some_and(|rest| rest.starts_with('['))
        {
            return false;
        }
        parse_member(&binding.member)
            .is_some_and(|(ns, name)| ns == self.namespace && name == self.name)
    }
}

/// Extract `(namespace, name)` from a workload identity member string.
///
/// Returns `None` when the member does not end in `[<namespace>/<name>]`.
pub fn parse_member(member: &str) -> Option<(&str, &str)> {
    let captures = MEMBER_PATTERN.captures(member)?;
    Some((captures.get(1)?.as_str(), captures.get(2)?.as_str()))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn account(namespace: &str, name: &str) -> ServiceAccountRef {
        ServiceAccountRef::new(namespace, name)
    }

    #[test]
    fn test_federated_match_requires_issuer_and_subject() {
        let key = FederatedMatchKey::new("https://oidc.example.com/abc", &account("ns1", "sa1"));

        assert!(key.matches(&FederatedCredential {
            issuer: "https://oidc.example.com/abc".into(),
            subject: "system:serviceaccount:ns1:sa1".into(),
        }));
        assert!(!key.matches(&FederatedCredential {
            issuer: "https://oidc.example.com/other".into(),
            subject: "system:serviceaccount:ns1:sa1".into(),
        }));
        assert!(!key.matches(&FederatedCredential {
            issuer: "https://oidc.example.com/abc".into(),
            subject: "system:serviceaccount:ns1:sa2".into(),
        }));
    }

    #[test]
    fn test_federated_match_is_exact() {
        // Trailing slashes and case differences are different issuers.
        let key = FederatedMatchKey::new("https://oidc.example.com/abc", &account("ns1", "sa1"));
        assert!(!key.matches(&FederatedCredential {
            issuer: "https://oidc.example.com/abc/".into(),
            subject: "system:serviceaccount:ns1:sa1".into(),
        }));
        assert!(!key.matches(&FederatedCredential {
            issuer: "https://oidc.example.com/abc".into(),
            subject: "system:serviceaccount:NS1:sa1".into(),
        }));
    }

    #[rstest]
    #[case("serviceAccount:proj.svc.id.goog[ns1/sa1]", Some(("ns1", "sa1")))]
    #[case("serviceAccount:other.svc.id.goog[kube-system/default]", Some(("kube-system", "default")))]
    #[case("serviceAccount:proj.svc.id.goog[ns1]", None)]
    #[case("serviceAccount:proj.svc.id.goog[ns1/sa1/extra]", None)]
    #[case("user:someone@example.com", None)]
    #[case("serviceAccount:proj.svc.id.goog[ns1/sa1] ", None)]
    #[case("", None)]
    fn test_parse_member(#[case] member: &str, #[case] expected: Option<(&str, &str)>) {
        assert_eq!(parse_member(member), expected);
    }

    #[test]
    fn test_policy_match() {
        let key = PolicyMatchKey::workload_identity(&account("ns1", "sa1"), None);
        let binding = PolicyBinding {
            role: WORKLOAD_IDENTITY_USER_ROLE.into(),
            member: "serviceAccount:proj.svc.id.goog[ns1/sa1]".into(),
        };
        assert!(key.matches(&binding));
    }

    #[test]
    fn test_policy_match_rejects_other_roles() {
        let key = PolicyMatchKey::workload_identity(&account("ns1", "sa1"), None);
        let binding = PolicyBinding {
            role: "roles/iam.serviceAccountTokenCreator".into(),
            member: "serviceAccount:proj.svc.id.goog[ns1/sa1]".into(),
        };
        assert!(!key.matches(&binding));
    }

    #[test]
    fn test_policy_match_malformed_member_is_not_a_match() {
        let key = PolicyMatchKey::workload_identity(&account("ns1", "sa1"), None);
        let binding = PolicyBinding {
            role: WORKLOAD_IDENTITY_USER_ROLE.into(),
            member: "serviceAccount:ns1-sa1@proj.iam.gserviceaccount.com".into(),
        };
        assert!(!key.matches(&binding));
    }

    #[test]
    fn test_policy_match_with_pool() {
        let key = PolicyMatchKey::workload_identity(
            &account("ns1", "sa1"),
            Some("proj.svc.id.goog".into()),
        );
        assert!(key.matches(&PolicyBinding {
            role: WORKLOAD_IDENTITY_USER_ROLE.into(),
            member: "serviceAccount:proj.svc.id.goog[ns1/sa1]".into(),
        }));
        assert!(!key.matches(&PolicyBinding {
            role: WORKLOAD_IDENTITY_USER_ROLE.into(),
            member: "serviceAccount:other.svc.id.goog[ns1/sa1]".into(),
        }));
    }
}
