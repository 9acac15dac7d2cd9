use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

type Listener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

/// Process-wide "authentication invalidated" channel.
///
/// The endpoint client publishes when a request fails authentication and a
/// token refresh cannot recover; the session holder listens and signs out.
#[derive(Clone, Default)]
pub struct AuthEventBus {
    registry: Arc<Mutex<Registry>>,
}

impl AuthEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> Subscription {
        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.listeners.push((id, Arc::new(listener)));
        Subscription {
            registry: Arc::downgrade(&self.registry),
            id,
        }
    }

    /// Call every listener in registration order. A panicking listener is
    /// logged and skipped. Returns how many listeners ran to completion.
    pub fn publish(&self) -> usize {
        let listeners: Vec<(u64, Listener)> = self.registry.lock().listeners.clone();
        tracing::info!(listeners = listeners.len(), "publishing auth invalidation");
        let mut completed = 0;
        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener())) {
                Ok(()) => completed += 1,
                Err(_) => tracing::error!(listener = id, "auth listener panicked"),
            }
        }
        completed
    }

    pub fn listener_count(&self) -> usize {
        self.registry.lock().listeners.len()
    }
}

/// Handle returned by [`AuthEventBus::subscribe`].
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    id: u64,
}

impl Subscription {
    /// Remove this listener. Calling it again does nothing.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .listeners
                .retain(|(id, _)| *id != self.id);
        }
    }
}
