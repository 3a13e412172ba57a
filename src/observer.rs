//! Observer surface: named events with JSON payloads.
//!
//! The orchestrator publishes its own lifecycle events here and republishes
//! events from any plugin or cache that is itself [`Observable`], under the
//! namespace `<lowercased identity>:<event name>`.

use crate::errors::panic_message;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

/// A single published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub payload: Value,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Callback invoked for each matching event.
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Listener attached to an observable component; receives `(event name, payload)`.
pub type Listener = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Capability of components that emit their own events.
pub trait Observable: Send + Sync {
    /// Attach a listener that receives every event the component emits.
    fn add_listener(&self, listener: Listener);
}

/// Minimal emitter that plugins and caches can embed to become [`Observable`].
#[derive(Default, Clone)]
pub struct Emitter {
    listeners: Arc<RwLock<Vec<Listener>>>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, name: &str, payload: Value) {
        let listeners = match self.listeners.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for listener in listeners {
            listener(name, &payload);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }
}

impl Observable for Emitter {
    fn add_listener(&self, listener: Listener) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[derive(Default)]
struct Subscriptions {
    by_name: HashMap<String, Vec<Handler>>,
    all: Vec<Handler>,
}

/// The orchestrator's own event surface.
#[derive(Clone, Default)]
pub struct ObserverSurface {
    subscriptions: Arc<RwLock<Subscriptions>>,
}

impl ObserverSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events with exactly this name.
    pub fn subscribe<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        if let Ok(mut subs) = self.subscriptions.write() {
            subs.by_name
                .entry(name.into())
                .or_default()
                .push(Arc::new(handler));
        }
    }

    /// Subscribe to every event.
    pub fn subscribe_all<F>(&self, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        if let Ok(mut subs) = self.subscriptions.write() {
            subs.all.push(Arc::new(handler));
        }
    }

    /// Deliver `event` to its subscribers. A panicking handler is logged and skipped.
    pub fn publish(&self, event: Event) {
        // Handlers are cloned out so a handler may subscribe without deadlocking.
        let handlers: Vec<Handler> = {
            let Ok(subs) = self.subscriptions.read() else {
                return;
            };
            subs.by_name
                .get(&event.name)
                .into_iter()
                .flatten()
                .chain(subs.all.iter())
                .cloned()
                .collect()
        };
        for handler in handlers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                tracing::warn!(
                    event = %event.name,
                    error = %panic_message(payload),
                    "Event handler panicked"
                );
            }
        }
    }

    pub fn emit(&self, name: impl Into<String>, payload: Value) {
        self.publish(Event::new(name, payload));
    }

    /// Republish every event of `source` as `<lowercased identity>:<event>`.
    pub fn proxy(&self, identity: &str, source: &dyn Observable) {
        let namespace = identity.to_lowercase();
        let surface = self.clone();
        source.add_listener(Arc::new(move |event: &str, payload: &Value| {
            surface.emit(format!("{}:{}", namespace, event), payload.clone());
        }));
    }
}

impl std::fmt::Debug for ObserverSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (named, all) = self
            .subscriptions
            .read()
            .map(|s| (s.by_name.values().map(Vec::len).sum::<usize>(), s.all.len()))
            .unwrap_or_default();
        f.debug_struct("ObserverSurface")
            .field("named_handlers", &named)
            .field("catch_all_handlers", &all)
            .finish()
    }
}
