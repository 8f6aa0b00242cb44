//! Registry of pending read-only requests, used for request coalescing.

use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::{error::ApiError, scheduler::ScheduledTask, signature::RequestSignature};

/// How long a settled entry keeps absorbing duplicate calls.
pub const DEFAULT_INFLIGHT_GRACE: Duration = Duration::from_secs(5);

type SharedOutcome = Shared<BoxFuture<'static, Result<Value, ApiError>>>;

struct InFlightEntry {
    id: u64,
    outcome: SharedOutcome,
    /// When the producer finished; `None` while it is still running.
    settled_at: Option<Instant>,
}

impl InFlightEntry {
    fn settled_longer_than(&self, max_age: Duration, now: Instant) -> bool {
        self.settled_at
            .is_some_and(|settled_at| now.saturating_duration_since(settled_at) >= max_age)
    }
}

struct RegistryInner {
    grace: Duration,
    next_id: AtomicU64,
    entries: Mutex<HashMap<RequestSignature, InFlightEntry>>,
    evictions: Mutex<HashMap<u64, ScheduledTask>>,
}

/// At most one producer runs per signature; every joiner observes its outcome.
///
/// Producers run as spawned tasks, so a producer finishes (and its side
/// effects land) even when every caller has stopped waiting.
#[derive(Clone)]
pub struct InFlightRegistry {
    inner: Arc<RegistryInner>,
}

impl InFlightRegistry {
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                grace,
                next_id: AtomicU64::new(1),
                entries: Mutex::new(HashMap::new()),
                evictions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn grace(&self) -> Duration {
        self.inner.grace
    }

    /// Join the pending outcome for `signature`, or start `producer` if none exists.
    pub async fn begin_or_join<F, Fut>(
        &self,
        signature: RequestSignature,
        producer: F,
    ) -> Result<Value, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ApiError>> + Send + 'static,
    {
        self.begin_or_join_fresh(signature, None, producer).await
    }

    /// Like [`InFlightRegistry::begin_or_join`], but a settled entry older
    /// than `max_settled_age` is replaced by a new producer instead of joined.
    pub async fn begin_or_join_fresh<F, Fut>(
        &self,
        signature: RequestSignature,
        max_settled_age: Option<Duration>,
        producer: F,
    ) -> Result<Value, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ApiError>> + Send + 'static,
    {
        let outcome = {
            let mut entries = self.inner.lock_entries();
            let stale = match (entries.get(&signature), max_settled_age) {
                (Some(existing), Some(max_age)) => {
                    existing.settled_longer_than(max_age, Instant::now())
                }
                _ => false,
            };
            let joinable = entries
                .get(&signature)
                .filter(|_| !stale)
                .map(|existing| existing.outcome.clone());
            match joinable {
                Some(outcome) => {
                    debug!(%signature, "joining in-flight request");
                    outcome
                }
                None => {
                    if stale {
                        debug!(%signature, "settled in-flight entry is too old to join");
                    }
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let outcome = self.inner.start(signature.clone(), id, producer());
                    let replaced = entries.insert(
                        signature,
                        InFlightEntry {
                            id,
                            outcome: outcome.clone(),
                            settled_at: None,
                        },
                    );
                    if let Some(replaced) = replaced {
                        self.inner.lock_evictions().remove(&replaced.id);
                    }
                    outcome
                }
            }
        };
        outcome.await
    }

    pub fn contains(&self, signature: &RequestSignature) -> bool {
        self.inner.lock_entries().contains_key(signature)
    }

    pub fn len(&self) -> usize {
        self.inner.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every entry and cancel pending evictions. Running producers
    /// still complete; their outcomes are simply no longer joinable.
    pub fn clear(&self) {
        self.inner.lock_entries().clear();
        self.inner.lock_evictions().clear();
    }

    /// Drop the settled entry for `signature` so the next call starts a new
    /// producer. A producer that is still running stays joinable.
    pub fn forget_settled(&self, signature: &RequestSignature) -> bool {
        let removed = {
            let mut entries = self.inner.lock_entries();
            match entries.get(signature) {
                Some(entry) if entry.settled_at.is_some() => entries.remove(signature),
                _ => None,
            }
        };
        match removed {
            Some(entry) => {
                self.inner.lock_evictions().remove(&entry.id);
                true
            }
            None => false,
        }
    }

    /// Drop every settled entry; running producers stay joinable.
    pub fn clear_settled(&self) {
        let mut removed = Vec::new();
        self.inner.lock_entries().retain(|_, entry| {
            if entry.settled_at.is_some() {
                removed.push(entry.id);
                false
            } else {
                true
            }
        });
        let mut evictions = self.inner.lock_evictions();
        for id in removed {
            evictions.remove(&id);
        }
    }
}

impl Default for InFlightRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_INFLIGHT_GRACE)
    }
}

impl RegistryInner {
    fn start<Fut>(self: &Arc<Self>, signature: RequestSignature, id: u64, work: Fut) -> SharedOutcome
    where
        Fut: Future<Output = Result<Value, ApiError>> + Send + 'static,
    {
        let registry = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let result = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(result) => result,
                Err(_) => {
                    warn!(%signature, "in-flight request panicked");
                    Err(ApiError::internal(
                        "task_aborted",
                        "in-flight request panicked",
                    ))
                }
            };
            if let Some(registry) = registry.upgrade() {
                registry.schedule_eviction(signature, id);
            }
            result
        });

        async move {
            task.await.unwrap_or_else(|err| {
                Err(ApiError::internal(
                    "task_aborted",
                    format!("in-flight request task failed: {err}"),
                ))
            })
        }
        .boxed()
        .shared()
    }

    fn schedule_eviction(self: &Arc<Self>, signature: RequestSignature, id: u64) {
        {
            let mut entries = self.lock_entries();
            match entries.get_mut(&signature) {
                Some(entry) if entry.id == id => entry.settled_at = Some(Instant::now()),
                // Replaced or forgotten while running: nothing left to evict.
                _ => return,
            }
        }
        let mut evictions = self.lock_evictions();
        let registry = Arc::downgrade(self);
        let timer = ScheduledTask::after(self.grace, async move {
            if let Some(registry) = registry.upgrade() {
                registry.evict(&signature, id);
            }
        });
        evictions.insert(id, timer);
    }

    fn evict(&self, signature: &RequestSignature, id: u64) {
        {
            let mut entries = self.lock_entries();
            if entries.get(signature).is_some_and(|entry| entry.id == id) {
                entries.remove(signature);
                trace!(%signature, "evicted settled in-flight entry");
            }
        }
        self.lock_evictions().remove(&id);
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<RequestSignature, InFlightEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_evictions(&self) -> MutexGuard<'_, HashMap<u64, ScheduledTask>> {
        self.evictions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::types::Method;

    fn sig(endpoint: &str) -> RequestSignature {
        RequestSignature::new(Method::Get, endpoint, None)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_producer() {
        let registry = InFlightRegistry::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let mut handles = Vec::new();
        for _ in 0..3 {
            let registry = registry.clone();
            let calls = calls.clone();
            let release = release.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .begin_or_join(sig("/models"), move || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async move {
                            release.notified().await;
                            Ok(json!(["sd15", "sdxl"]))
                        }
                    })
                    .await
            }));
        }

        while !registry.contains(&sig("/models")) {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        release.notify_one();

        for handle in handles {
            let value = handle.await.expect("join").expect("shared success");
            assert_eq!(value, json!(["sd15", "sdxl"]));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn joiners_observe_identical_error() {
        let registry = InFlightRegistry::default();
        let first = registry.begin_or_join(sig("/broken"), || async {
            Err(ApiError::http(500, "engine crashed"))
        });
        let second = registry.begin_or_join(sig("/broken"), || async {
            Ok(json!("must not run"))
        });

        let (a, b) = tokio::join!(first, second);
        let a = a.expect_err("first fails");
        let b = b.expect_err("second joins the failure");
        assert_eq!(a, b);
        assert_eq!(a.status, Some(500));
    }

    #[tokio::test(start_paused = true)]
    async fn settled_entry_absorbs_duplicates_during_grace_period() {
        let registry = InFlightRegistry::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));

        let call = |registry: InFlightRegistry, calls: Arc<AtomicUsize>| async move {
            registry
                .begin_or_join(sig("/models"), move || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(json!(n)) }
                })
                .await
        };

        assert_eq!(call(registry.clone(), calls.clone()).await.expect("ok"), json!(0));

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(call(registry.clone(), calls.clone()).await.expect("ok"), json!(0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!registry.contains(&sig("/models")));
        assert_eq!(call(registry.clone(), calls.clone()).await.expect("ok"), json!(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn producer_completes_after_callers_give_up() {
        let registry = InFlightRegistry::new(Duration::from_secs(5));
        let finished = Arc::new(AtomicUsize::new(0));

        let finished_clone = finished.clone();
        let waiting = registry.begin_or_join(sig("/slow"), move || async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            finished_clone.fetch_add(1, Ordering::SeqCst);
            Ok(json!("done"))
        });
        let gave_up = tokio::time::timeout(Duration::from_millis(100), waiting).await;
        assert!(gave_up.is_err());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        let joined = registry
            .begin_or_join(sig("/slow"), || async { Ok(json!("fresh")) })
            .await
            .expect("settled outcome");
        assert_eq!(joined, json!("done"));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_producer_fails_joiners_and_is_evicted() {
        let registry = InFlightRegistry::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        let err = registry
            .begin_or_join(sig("/models"), move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                async move {
                    if calls_clone.load(Ordering::SeqCst) == 1 {
                        panic!("transport bug");
                    }
                    Ok(json!("unreachable"))
                }
            })
            .await
            .expect_err("panic surfaces as an error");
        assert_eq!(err.code, "task_aborted");

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!registry.contains(&sig("/models")));
        let calls_clone = calls.clone();
        let value = registry
            .begin_or_join(sig("/models"), move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!("recovered")) }
            })
            .await
            .expect("fresh producer runs");
        assert_eq!(value, json!("recovered"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn settled_entry_older_than_max_age_is_not_joined() {
        let registry = InFlightRegistry::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));

        let call = |registry: InFlightRegistry, calls: Arc<AtomicUsize>| async move {
            registry
                .begin_or_join_fresh(sig("/models"), Some(Duration::from_secs(1)), move || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(json!(n)) }
                })
                .await
        };

        assert_eq!(call(registry.clone(), calls.clone()).await.expect("ok"), json!(0));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(call(registry.clone(), calls.clone()).await.expect("ok"), json!(0));

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(call(registry.clone(), calls.clone()).await.expect("ok"), json!(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // The replacement keeps its own grace period.
        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert!(registry.contains(&sig("/models")));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!registry.contains(&sig("/models")));
    }

    #[tokio::test(start_paused = true)]
    async fn forget_settled_leaves_running_producers_joinable() {
        let registry = InFlightRegistry::new(Duration::from_secs(5));
        registry
            .begin_or_join(sig("/done"), || async { Ok(json!("done")) })
            .await
            .expect("settles");

        let release = Arc::new(Notify::new());
        let waiting = {
            let registry = registry.clone();
            let release = release.clone();
            tokio::spawn(async move {
                registry
                    .begin_or_join(sig("/running"), move || async move {
                        release.notified().await;
                        Ok(json!("running"))
                    })
                    .await
            })
        };
        while !registry.contains(&sig("/running")) {
            tokio::task::yield_now().await;
        }

        assert!(!registry.forget_settled(&sig("/running")));
        assert!(registry.forget_settled(&sig("/done")));
        assert!(!registry.contains(&sig("/done")));

        registry
            .begin_or_join(sig("/done"), || async { Ok(json!("again")) })
            .await
            .expect("settles again");
        registry.clear_settled();
        assert!(!registry.contains(&sig("/done")));
        assert!(registry.contains(&sig("/running")));

        release.notify_one();
        let value = waiting.await.expect("join").expect("running result");
        assert_eq!(value, json!("running"));
    }

    #[tokio::test]
    async fn distinct_signatures_do_not_coalesce() {
        let registry = InFlightRegistry::default();
        let a = registry
            .begin_or_join(sig("/a"), || async { Ok(json!("a")) })
            .await
            .expect("a");
        let b = registry
            .begin_or_join(sig("/b"), || async { Ok(json!("b")) })
            .await
            .expect("b");
        assert_eq!((a, b), (json!("a"), json!("b")));
        assert_eq!(registry.len(), 2);

        registry.clear();
        assert!(registry.is_empty());
    }
}
