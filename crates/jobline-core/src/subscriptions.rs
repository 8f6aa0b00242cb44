//! Handler registry used by the live update channel to fan out events.

use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, PoisonError, RwLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::warn;

use crate::{
    error::HandlerError,
    types::{ConnectionState, InboundEvent},
};

pub type EventHandler = Arc<dyn Fn(&InboundEvent) -> Result<(), HandlerError> + Send + Sync>;
pub type StateHandler = Arc<dyn Fn(ConnectionState) -> Result<(), HandlerError> + Send + Sync>;

/// Outcome of one fan-out pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Handlers that returned `Ok`.
    pub delivered: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    event_handlers: RwLock<HashMap<String, Vec<(u64, EventHandler)>>>,
    state_handlers: RwLock<Vec<(u64, StateHandler)>>,
}

/// Event-type keyed handler sets plus a separate set of state-change handlers.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events whose type equals `event_type`.
    pub fn on<F>(&self, event_type: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&InboundEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        let id = self.next_id();
        self.inner
            .event_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event_type.clone())
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            registry: Arc::downgrade(&self.inner),
            key: SubscriptionKey::Event { event_type, id },
        }
    }

    /// Register `handler` for connection state transitions.
    pub fn on_state_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ConnectionState) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner
            .state_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));

        Subscription {
            registry: Arc::downgrade(&self.inner),
            key: SubscriptionKey::State { id },
        }
    }

    /// Invoke every handler currently registered for the event's type, once each.
    ///
    /// Handlers run outside the registry lock, so they may (un)subscribe freely.
    pub fn dispatch_event(&self, event: &InboundEvent) -> DeliveryReport {
        let handlers: Vec<EventHandler> = self
            .inner
            .event_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.event_type)
            .map(|handlers| handlers.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        let mut report = DeliveryReport::default();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(event_type = %event.event_type, error = %err, "event handler failed");
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(event_type = %event.event_type, "event handler panicked");
                }
            }
        }
        report
    }

    /// Invoke every state-change handler with `state`.
    pub fn notify_state(&self, state: ConnectionState) -> DeliveryReport {
        let handlers: Vec<StateHandler> = self
            .inner
            .state_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, h)| h.clone())
            .collect();

        let mut report = DeliveryReport::default();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(state))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(%state, error = %err, "state handler failed");
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(%state, "state handler panicked");
                }
            }
        }
        report
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        self.inner
            .event_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .map_or(0, Vec::len)
    }

    pub fn state_handler_count(&self) -> usize {
        self.inner
            .state_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
enum SubscriptionKey {
    Event { event_type: String, id: u64 },
    State { id: u64 },
}

/// Capability to remove exactly one registered handler.
///
/// Dropping the handle leaves the handler registered.
#[derive(Debug)]
pub struct Subscription {
    registry: Weak<RegistryInner>,
    key: SubscriptionKey,
}

impl Subscription {
    /// Remove the handler. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };

        match self.key {
            SubscriptionKey::Event { event_type, id } => {
                let mut handlers = registry
                    .event_handlers
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                let Some(list) = handlers.get_mut(&event_type) else {
                    return false;
                };
                let before = list.len();
                list.retain(|(handler_id, _)| *handler_id != id);
                let removed = list.len() != before;
                if list.is_empty() {
                    handlers.remove(&event_type);
                }
                removed
            }
            SubscriptionKey::State { id } => {
                let mut handlers = registry
                    .state_handlers
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                let before = handlers.len();
                handlers.retain(|(handler_id, _)| *handler_id != id);
                handlers.len() != before
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use serde_json::json;

    use super::*;

    fn event(event_type: &str) -> InboundEvent {
        InboundEvent {
            event_type: event_type.to_owned(),
            timestamp: "2024-05-01T10:00:00Z".to_owned(),
            payload: json!({ "job_id": "j1" }),
        }
    }

    fn counter(registry: &SubscriptionRegistry, event_type: &str) -> (Arc<AtomicUsize>, Subscription) {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let sub = registry.on(event_type, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (hits, sub)
    }

    #[test]
    fn delivers_only_to_matching_event_type() {
        let registry = SubscriptionRegistry::new();
        let (progress, _a) = counter(&registry, "job_progress");
        let (status, _b) = counter(&registry, "job_status");

        let report = registry.dispatch_event(&event("job_progress"));

        assert_eq!(report, DeliveryReport { delivered: 1, failed: 0 });
        assert_eq!(progress.load(Ordering::SeqCst), 1);
        assert_eq!(status.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_removes_exactly_one_handler() {
        let registry = SubscriptionRegistry::new();
        let (first, first_sub) = counter(&registry, "job_progress");
        let (second, _second_sub) = counter(&registry, "job_progress");

        registry.dispatch_event(&event("job_progress"));
        assert!(first_sub.unsubscribe());
        registry.dispatch_event(&event("job_progress"));

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
        assert_eq!(registry.handler_count("job_progress"), 1);
    }

    #[test]
    fn same_closure_registered_twice_is_removed_once() {
        let registry = SubscriptionRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let make = |hits: Arc<AtomicUsize>| {
            move |_: &InboundEvent| -> Result<(), HandlerError> {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        };
        let sub = registry.on("model_state", make(hits.clone()));
        let _other = registry.on("model_state", make(hits.clone()));

        assert!(sub.unsubscribe());
        registry.dispatch_event(&event("model_state"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_and_panicking_handlers_do_not_block_others() {
        let registry = SubscriptionRegistry::new();
        let _err = registry.on("job_status", |_| Err("handler exploded".into()));
        let _panic = registry.on("job_status", |_| panic!("handler panicked"));
        let (healthy, _ok) = counter(&registry, "job_status");

        let report = registry.dispatch_event(&event("job_status"));

        assert_eq!(report, DeliveryReport { delivered: 1, failed: 2 });
        assert_eq!(healthy.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn state_handlers_receive_transitions() {
        let registry = SubscriptionRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let sub = registry.on_state_change(move |state| {
            seen_clone.lock().expect("lock").push(state);
            Ok(())
        });

        registry.notify_state(ConnectionState::Connecting);
        registry.notify_state(ConnectionState::Connected);
        assert_eq!(registry.state_handler_count(), 1);
        assert!(sub.unsubscribe());
        registry.notify_state(ConnectionState::Disconnected);

        assert_eq!(
            *seen.lock().expect("lock"),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert_eq!(registry.state_handler_count(), 0);
    }

    #[test]
    fn handlers_may_unsubscribe_during_delivery() {
        let registry = SubscriptionRegistry::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_clone = slot.clone();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();

        let sub = registry.on("job_progress", move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = slot_clone.lock().expect("lock").take() {
                sub.unsubscribe();
            }
            Ok(())
        });
        *slot.lock().expect("lock") = Some(sub);

        registry.dispatch_event(&event("job_progress"));
        registry.dispatch_event(&event("job_progress"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_after_registry_dropped_is_harmless() {
        let registry = SubscriptionRegistry::new();
        let (_, sub) = counter(&registry, "pong");
        drop(registry);
        assert!(!sub.unsubscribe());
    }
}
