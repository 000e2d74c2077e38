//! Server event fan-out.
//!
//! Listeners register per event name or globally. A dispatch delivers to the
//! named listeners in registration order, then to the global listeners. Each
//! listener is isolated: an error or panic is logged and delivery continues.
//!
//! Asynchronous dispatch runs on a bounded pool: at most `pool_size` fan-outs
//! execute at once, each on the blocking thread pool so a slow listener never
//! stalls the read loop.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::bridge::protocol::Event;

/// Receives server events.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event) -> anyhow::Result<()>;
}

impl<F> EventListener for F
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        self(event)
    }
}

/// Handle returned by registration, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Clone)]
struct Registration {
    id: SubscriptionId,
    listener: Arc<dyn EventListener>,
}

#[derive(Default)]
struct Registry {
    by_event: HashMap<String, Vec<Registration>>,
    global: Vec<Registration>,
}

/// Listener identity is the allocation, not the vtable.
fn same_listener(a: &Arc<dyn EventListener>, b: &Arc<dyn EventListener>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

pub struct EventDispatcher {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
    permits: Arc<Semaphore>,
}

impl EventDispatcher {
    pub fn new(pool_size: usize) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            next_id: AtomicU64::new(1),
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(|poisoned| {
            tracing::error!("Listener registry lock poisoned - recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(|poisoned| {
            tracing::error!("Listener registry lock poisoned - recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a listener for one event name.
    ///
    /// Registering the same listener twice for the same name returns the
    /// existing subscription.
    pub fn register_listener(
        &self,
        event_name: impl Into<String>,
        listener: Arc<dyn EventListener>,
    ) -> SubscriptionId {
        let event_name = event_name.into();
        let mut registry = self.write();
        let entries = registry.by_event.entry(event_name.clone()).or_default();

        if let Some(existing) = entries
            .iter()
            .find(|r| same_listener(&r.listener, &listener))
        {
            tracing::debug!(event = %event_name, id = %existing.id, "Listener already registered");
            return existing.id;
        }

        let id = self.allocate_id();
        entries.push(Registration { id, listener });
        tracing::debug!(event = %event_name, %id, "Registered listener");
        id
    }

    /// Register a listener that receives every event.
    pub fn register_global_listener(&self, listener: Arc<dyn EventListener>) -> SubscriptionId {
        let mut registry = self.write();

        if let Some(existing) = registry
            .global
            .iter()
            .find(|r| same_listener(&r.listener, &listener))
        {
            return existing.id;
        }

        let id = self.allocate_id();
        registry.global.push(Registration { id, listener });
        tracing::debug!(%id, "Registered global listener");
        id
    }

    pub fn unregister_listener(&self, event_name: &str, listener: &Arc<dyn EventListener>) -> bool {
        let mut registry = self.write();
        let Some(entries) = registry.by_event.get_mut(event_name) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|r| !same_listener(&r.listener, listener));
        let removed = entries.len() != before;
        if entries.is_empty() {
            registry.by_event.remove(event_name);
        }
        removed
    }

    pub fn unregister_global_listener(&self, listener: &Arc<dyn EventListener>) -> bool {
        let mut registry = self.write();
        let before = registry.global.len();
        registry
            .global
            .retain(|r| !same_listener(&r.listener, listener));
        registry.global.len() != before
    }

    /// Remove a registration by id, wherever it lives.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.write();

        let before = registry.global.len();
        registry.global.retain(|r| r.id != id);
        if registry.global.len() != before {
            return true;
        }

        let mut removed = false;
        registry.by_event.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|r| r.id != id);
            removed |= entries.len() != before;
            !entries.is_empty()
        });
        removed
    }

    pub fn clear_all_listeners(&self) {
        let mut registry = self.write();
        registry.by_event.clear();
        registry.global.clear();
    }

    pub fn listener_count(&self, event_name: &str) -> usize {
        self.read().by_event.get(event_name).map_or(0, Vec::len)
    }

    pub fn global_listener_count(&self) -> usize {
        self.read().global.len()
    }

    /// Named plus global registrations.
    pub fn total_listener_count(&self) -> usize {
        let registry = self.read();
        registry.by_event.values().map(Vec::len).sum::<usize>() + registry.global.len()
    }

    /// Listeners for `event_name` in delivery order.
    fn snapshot(&self, event_name: &str) -> Vec<Registration> {
        let registry = self.read();
        registry
            .by_event
            .get(event_name)
            .into_iter()
            .flatten()
            .chain(registry.global.iter())
            .cloned()
            .collect()
    }

    /// Fan out asynchronously on the dispatch pool.
    ///
    /// Listeners are captured at call time. Must be called from within a
    /// tokio runtime.
    pub fn dispatch_event(&self, event: Event) -> JoinHandle<()> {
        let targets = self.snapshot(&event.name);
        let permits = Arc::clone(&self.permits);

        tokio::spawn(async move {
            if targets.is_empty() {
                tracing::trace!(event = %event.name, "No listeners for event");
                return;
            }
            let Ok(permit) = permits.acquire_owned().await else {
                tracing::debug!(event = %event.name, "Dispatcher closed, dropping event");
                return;
            };
            let result = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                deliver(&targets, &event);
            })
            .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "Event fan-out task failed");
            }
        })
    }

    /// Fan out on the calling thread. Returns the number of listeners that
    /// handled the event without error.
    pub fn dispatch_event_sync(&self, event: &Event) -> usize {
        deliver(&self.snapshot(&event.name), event)
    }

    /// Stop accepting asynchronous dispatches. Queued fan-outs are dropped.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

fn deliver(targets: &[Registration], event: &Event) -> usize {
    let mut delivered = 0;
    for registration in targets {
        match catch_unwind(AssertUnwindSafe(|| registration.listener.on_event(event))) {
            Ok(Ok(())) => delivered += 1,
            Ok(Err(e)) => {
                tracing::warn!(
                    event = %event.name,
                    subscription = %registration.id,
                    error = %e,
                    "Event listener failed"
                );
            }
            Err(_) => {
                tracing::error!(
                    event = %event.name,
                    subscription = %registration.id,
                    "Event listener panicked"
                );
            }
        }
    }
    delivered
}
