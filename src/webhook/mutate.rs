//! Service account mutation.
//!
//! Resolves the cloud identity federated to the incoming service account and
//! patches the backend's annotations onto it. Other annotations are left alone.

use std::{collections::BTreeMap, time::Instant};

use axum::{Json, body::Bytes, extract::State};
use json_patch::{AddOperation, PatchOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::core::{
    DynamicObject,
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
};

use crate::{
    AppState,
    observability::metrics,
    resolver::{Resolution, ServiceAccountRef},
};

/// Handle a mutating admission review for a ServiceAccount.
///
/// The body is decoded here rather than by an extractor so that every
/// malformed review is still answered with an `AdmissionReview`.
pub async fn mutate_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Json<AdmissionReview<DynamicObject>> {
    let started = Instant::now();

    let request = match parse_review(&body) {
        Ok(request) => request,
        Err(message) => {
            tracing::error!(error = %message, "Failed to parse admission request");
            metrics::record_admission_request("invalid", started.elapsed().as_secs_f64());
            return Json(AdmissionResponse::invalid(message).into_review());
        }
    };

    let (response, outcome) = mutate_service_account(&state, &request).await;
    metrics::record_admission_request(outcome, started.elapsed().as_secs_f64());
    Json(response.into_review())
}

fn parse_review(body: &[u8]) -> Result<AdmissionRequest<ServiceAccount>, String> {
    let review: AdmissionReview<ServiceAccount> =
        serde_json::from_slice(body).map_err(|e| format!("malformed admission review: {e}"))?;
    review.try_into().map_err(|e| format!("{e}"))
}

#[tracing::instrument(
    name = "webhook.mutate",
    skip(state, request),
    fields(uid = %request.uid, operation = ?request.operation)
)]
async fn mutate_service_account(
    state: &AppState,
    request: &AdmissionRequest<ServiceAccount>,
) -> (AdmissionResponse, &'static str) {
    let allow = || AdmissionResponse::from(request);

    let Some(service_account) = &request.object else {
        tracing::debug!("No service account object in request, allowing unchanged");
        return (allow(), "unchanged");
    };

    let Some(account) = account_ref(service_account, request) else {
        tracing::warn!(
            name = ?service_account.metadata.name,
            "Service account has no resolvable name or namespace, allowing unchanged"
        );
        return (allow(), "unchanged");
    };

    tracing::info!(account = %account, "Resolving identity for service account");

    let candidate = match state.resolver.resolve(&account).await {
        Ok(Resolution::Found(candidate)) => candidate,
        Ok(Resolution::NotFound) => {
            tracing::info!(
                account = %account,
                backend = state.resolver.backend(),
                "No federated identity found, no changes will be patched"
            );
            return (allow(), "unchanged");
        }
        Err(e) => {
            tracing::error!(account = %account, error = %e, "Identity resolution failed");
            return (
                allow().deny(format!("failed to resolve identity for {account}: {e}")),
                "denied",
            );
        }
    };

    let desired = state.resolver.annotations(&candidate);
    let ops = annotation_patch(service_account.metadata.annotations.as_ref(), &desired);
    if ops.is_empty() {
        tracing::debug!(account = %account, "Annotations already up to date");
        return (allow(), "unchanged");
    }

    tracing::info!(
        account = %account,
        identity = %candidate.identity,
        scope = %candidate.scope,
        patch_ops = ops.len(),
        "Setting identity annotations"
    );

    match allow().with_patch(json_patch::Patch(ops)) {
        Ok(response) => (response, "patched"),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize patch");
            (
                allow().deny(format!("patch serialization error: {e}")),
                "denied",
            )
        }
    }
}

/// Name from the object, namespace from the object or else the request.
fn account_ref(
    service_account: &ServiceAccount,
    request: &AdmissionRequest<ServiceAccount>,
) -> Option<ServiceAccountRef> {
    let name = service_account
        .metadata
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .or_else(|| Some(request.name.clone()).filter(|n| !n.is_empty()))?;
    let namespace = service_account
        .metadata
        .namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .or_else(|| request.namespace.clone())
        .filter(|ns| !ns.is_empty())?;
    Some(ServiceAccountRef::new(namespace, name))
}

/// JSON patch operations that overlay `desired` onto `existing` annotations.
///
/// Adds the whole map when the object has none, otherwise one `add` per key
/// whose value differs. Returns no operations when nothing would change.
pub fn annotation_patch(
    existing: Option<&BTreeMap<String, String>>,
    desired: &BTreeMap<String, String>,
) -> Vec<PatchOperation> {
    if desired.is_empty() {
        return Vec::new();
    }

    let Some(existing) = existing else {
        return vec![PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["metadata", "annotations"]),
            value: serde_json::to_value(desired).unwrap_or_default(),
        })];
    };

    desired
        .iter()
        .filter(|(key, value)| existing.get(*key) != Some(*value))
        .map(|(key, value)| {
            PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["metadata", "annotations", key.as_str()]),
                value: serde_json::Value::String(value.clone()),
            })
        })
        .collect()
}
