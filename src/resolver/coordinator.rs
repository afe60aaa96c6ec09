//! Fan-out over candidates with a single, claim-once result slot.
//!
//! Every candidate gets its own task. The first task whose bindings match
//! claims the slot and delivers `Found`; the slot ignores every later claim.
//! Each task also holds a [`CompletionGuard`]; when the last guard drops and
//! nobody has claimed the slot, it delivers `NotFound`. Guards drop on panic
//! and on task cancellation too, so the receiver can never wait forever.
//! Outstanding workers are cancelled when the call returns or is dropped.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::{Candidate, IdentityBackend, Resolution};
use crate::observability::metrics;

/// Single-assignment result cell.
pub(crate) struct ResultSlot {
    claimed: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<Resolution>>>,
}

impl ResultSlot {
    pub(crate) fn new(sender: oneshot::Sender<Resolution>) -> Self {
        Self {
            claimed: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Deliver `resolution` if the slot is still free.
    ///
    /// Returns `true` for exactly one caller per slot.
    pub(crate) fn deliver(&self, resolution: Resolution) -> bool {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Some(sender) = self.sender.lock().take() {
            // The receiver is only gone if the caller itself was dropped.
            let _ = sender.send(resolution);
        }
        true
    }
}

/// Counts a worker as finished when dropped.
struct CompletionGuard {
    slot: Arc<ResultSlot>,
    remaining: Arc<AtomicUsize>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.slot.deliver(Resolution::NotFound);
        }
    }
}

/// Evaluate every candidate concurrently and return the first match.
pub(crate) async fn first_match<B: IdentityBackend>(
    backend: Arc<B>,
    key: Arc<B::Key>,
    candidates: Vec<Candidate>,
) -> Resolution {
    if candidates.is_empty() {
        return Resolution::NotFound;
    }

    let (tx, rx) = oneshot::channel();
    let slot = Arc::new(ResultSlot::new(tx));
    let remaining = Arc::new(AtomicUsize::new(candidates.len()));
    let cancel = CancellationToken::new();
    // Fires on return and also when the caller drops this future mid-flight.
    let _cancel_on_exit = cancel.clone().drop_guard();

    for candidate in candidates {
        let guard = CompletionGuard {
            slot: slot.clone(),
            remaining: remaining.clone(),
        };
        let backend = backend.clone();
        let key = key.clone();
        let slot = slot.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let _guard = guard;
            evaluate(backend.as_ref(), &key, candidate, &slot, &cancel).await;
        });
    }

    // Every sender path goes through the slot, and the last guard always
    // claims it, so a closed channel can only mean the runtime is shutting down.
    rx.await.unwrap_or(Resolution::NotFound)
}

async fn evaluate<B: IdentityBackend>(
    backend: &B,
    key: &B::Key,
    candidate: Candidate,
    slot: &ResultSlot,
    cancel: &CancellationToken,
) {
    if cancel.is_cancelled() {
        return;
    }

    let bindings = match backend.fetch_bindings(&candidate, cancel).await {
        Ok(bindings) => bindings,
        Err(e) => {
            tracing::warn!(
                backend = backend.name(),
                candidate = %candidate.identity,
                scope = %candidate.scope,
                error = %e,
                "Failed to fetch bindings, treating candidate as non-matching"
            );
            metrics::record_candidate_error(backend.name(), e.kind());
            return;
        }
    };

    if !bindings.iter().any(|binding| B::is_match(key, binding)) {
        tracing::trace!(
            candidate = %candidate.identity,
            bindings = bindings.len(),
            "No matching binding"
        );
        return;
    }

    let identity = candidate.identity.clone();
    if slot.deliver(Resolution::Found(candidate)) {
        tracing::debug!(candidate = %identity, "Candidate matched, cancelling remaining work");
        cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, time::Duration};

    use async_trait::async_trait;
    use proptest::prelude::*;

    use super::*;
    use crate::resolver::{
        ResolveError, Scope, ServiceAccountRef,
        pagination::{Page, collect_degraded},
    };

    /// Backend whose per-candidate behavior is scripted by identity.
    #[derive(Default)]
    struct ScriptedBackend {
        matching: Vec<String>,
        failing: Vec<String>,
        panicking: Vec<String>,
        delays_ms: BTreeMap<String, u64>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl IdentityBackend for ScriptedBackend {
        type Key = String;
        type Binding = String;

        fn name(&self) -> &'static str {
            "scripted"
        }

        fn match_key(&self, account: &ServiceAccountRef) -> String {
            account.subject()
        }

        async fn list_scopes(&self) -> Result<Vec<Scope>, ResolveError> {
            Ok(vec![Scope::new("scope")])
        }

        async fn list_candidates(
            &self,
            _scopes: &[Scope],
            _account: &ServiceAccountRef,
        ) -> Result<Vec<Candidate>, ResolveError> {
            Ok(Vec::new())
        }

        async fn fetch_bindings(
            &self,
            candidate: &Candidate,
            _cancel: &CancellationToken,
        ) -> Result<Vec<String>, ResolveError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(ms) = self.delays_ms.get(&candidate.identity) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            if self.panicking.contains(&candidate.identity) {
                panic!("scripted panic");
            }
            if self.failing.contains(&candidate.identity) {
                return Err(ResolveError::Upstream("scripted failure".into()));
            }
            if self.matching.contains(&candidate.identity) {
                Ok(vec!["other".into(), "target".into()])
            } else {
                Ok(vec!["other".into()])
            }
        }

        fn is_match(key: &String, binding: &String) -> bool {
            key == binding
        }

        fn annotations(&self, _candidate: &Candidate) -> BTreeMap<String, String> {
            BTreeMap::new()
        }
    }

    /// Every candidate has `pages` pages of non-matching bindings, each
    /// taking a few milliseconds to arrive.
    struct PagedBackend {
        pages: usize,
        requests: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl IdentityBackend for PagedBackend {
        type Key = String;
        type Binding = String;

        fn name(&self) -> &'static str {
            "paged"
        }

        fn match_key(&self, account: &ServiceAccountRef) -> String {
            account.subject()
        }

        async fn list_scopes(&self) -> Result<Vec<Scope>, ResolveError> {
            Ok(Vec::new())
        }

        async fn list_candidates(
            &self,
            _scopes: &[Scope],
            _account: &ServiceAccountRef,
        ) -> Result<Vec<Candidate>, ResolveError> {
            Ok(Vec::new())
        }

        async fn fetch_bindings(
            &self,
            _candidate: &Candidate,
            cancel: &CancellationToken,
        ) -> Result<Vec<String>, ResolveError> {
            let pages = self.pages;
            collect_degraded(cancel, |cursor| {
                let requests = self.requests.clone();
                async move {
                    requests.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    let page = cursor.map_or(0, |c| c.parse::<usize>().unwrap_or(0)) + 1;
                    let next = (page < pages).then(|| page.to_string());
                    Ok(Page::new(vec!["other".to_string()], next))
                }
            })
            .await
        }

        fn is_match(key: &String, binding: &String) -> bool {
            key == binding
        }

        fn annotations(&self, _candidate: &Candidate) -> BTreeMap<String, String> {
            BTreeMap::new()
        }
    }

    fn candidates(ids: &[&str]) -> Vec<Candidate> {
        ids.iter()
            .map(|id| Candidate::new(*id, Scope::new("scope"), format!("/ids/{id}")))
            .collect()
    }

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i}")).collect()
    }

    async fn run(backend: ScriptedBackend, ids: &[&str]) -> Resolution {
        first_match(Arc::new(backend), Arc::new("target".to_string()), candidates(ids)).await
    }

    #[tokio::test]
    async fn test_no_candidates_is_not_found() {
        let resolution = run(ScriptedBackend::default(), &[]).await;
        assert_eq!(resolution, Resolution::NotFound);
    }

    #[tokio::test]
    async fn test_single_match_found() {
        let backend = ScriptedBackend {
            matching: vec!["b".into()],
            delays_ms: BTreeMap::from([("a".into(), 5), ("c".into(), 20)]),
            ..Default::default()
        };
        match run(backend, &["a", "b", "c"]).await {
            Resolution::Found(candidate) => assert_eq!(candidate.identity, "b"),
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slowest_candidate_can_still_win() {
        let backend = ScriptedBackend {
            matching: vec!["slow".into()],
            delays_ms: BTreeMap::from([("slow".into(), 50)]),
            ..Default::default()
        };
        match run(backend, &["fast1", "fast2", "slow"]).await {
            Resolution::Found(candidate) => assert_eq!(candidate.identity, "slow"),
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_match_waits_for_all_workers() {
        let backend = Arc::new(ScriptedBackend {
            delays_ms: BTreeMap::from([("a".into(), 30), ("b".into(), 1)]),
            ..Default::default()
        });
        let resolution = first_match(
            backend.clone(),
            Arc::new("target".to_string()),
            candidates(&["a", "b", "c"]),
        )
        .await;

        assert_eq!(resolution, Resolution::NotFound);
        assert_eq!(backend.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_candidate_does_not_fail_the_call() {
        let backend = ScriptedBackend {
            matching: vec!["b".into()],
            failing: vec!["a".into()],
            ..Default::default()
        };
        match run(backend, &["a", "b"]).await {
            Resolution::Found(candidate) => assert_eq!(candidate.identity, "b"),
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_all_failures_is_not_found() {
        let backend = ScriptedBackend {
            failing: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        assert_eq!(run(backend, &["a", "b"]).await, Resolution::NotFound);
    }

    #[tokio::test]
    async fn test_panicking_worker_still_completes() {
        let backend = ScriptedBackend {
            panicking: vec!["a".into()],
            ..Default::default()
        };
        let resolution = tokio::time::timeout(Duration::from_secs(5), run(backend, &["a", "b"]))
            .await
            .expect("resolution must not hang");
        assert_eq!(resolution, Resolution::NotFound);
    }

    #[tokio::test]
    async fn test_dropped_call_stops_paging() {
        let requests = Arc::new(AtomicUsize::new(0));
        let backend = PagedBackend {
            pages: 50,
            requests: requests.clone(),
        };
        let call = first_match(
            Arc::new(backend),
            Arc::new("target".to_string()),
            candidates(&["a", "b", "c", "d"]),
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(50), call)
                .await
                .is_err()
        );

        let at_drop = requests.load(Ordering::SeqCst);
        assert!(at_drop >= 4);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(requests.load(Ordering::SeqCst), at_drop);
    }

    #[test]
    fn test_slot_delivers_once() {
        let (tx, mut rx) = oneshot::channel();
        let slot = ResultSlot::new(tx);

        assert!(slot.deliver(Resolution::NotFound));
        assert!(!slot.deliver(Resolution::NotFound));
        assert_eq!(rx.try_recv().unwrap(), Resolution::NotFound);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_exactly_one_result_with_many_matches(
            total in 1usize..24,
            matching_mask in prop::collection::vec(any::<bool>(), 24),
            delays in prop::collection::vec(0u64..8, 24),
        ) {
            let all = ids("id", total);
            let matching: Vec<String> = all
                .iter()
                .zip(&matching_mask)
                .filter(|(_, m)| **m)
                .map(|(id, _)| id.clone())
                .collect();
            let delays_ms = all.iter().cloned().zip(delays.iter().copied()).collect();
            let backend = ScriptedBackend {
                matching: matching.clone(),
                delays_ms,
                ..Default::default()
            };

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_time()
                .build()
                .unwrap();
            let refs: Vec<&str> = all.iter().map(String::as_str).collect();
            let resolution = runtime.block_on(async {
                tokio::time::timeout(Duration::from_secs(10), run(backend, &refs)).await
            });

            let resolution = resolution.expect("resolution must not hang");
            match resolution {
                Resolution::Found(candidate) => {
                    prop_assert!(matching.contains(&candidate.identity));
                }
                Resolution::NotFound => prop_assert!(matching.is_empty()),
            }
        }
    }
}
