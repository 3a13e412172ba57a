//! The plugin capability contract and the closure-backed implementation.

use crate::errors::ActionError;
use crate::observer::{Emitter, Observable};
use crate::record::{Patch, RecordView};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Owned copy of the run objects taken when a plugin is dispatched.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub target: Value,
    pub context: Value,
}

impl Snapshot {
    pub fn new(target: Value, context: Value) -> Self {
        Self { target, context }
    }

    pub fn view(&self) -> RecordView<'_> {
        RecordView::new(&self.target, &self.context)
    }
}

/// An enrichment unit gated by a readiness predicate.
///
/// `ready` must be pure: the scheduler calls it repeatedly against the
/// current record. `run` proposes field writes; it never mutates the record
/// itself. Returning an error or panicking both count as a failed action.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Identity used for caching, conflict weighting and event namespacing.
    fn identity(&self) -> &str;

    fn tier(&self) -> i32 {
        0
    }

    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn ready(&self, record: RecordView<'_>) -> bool;

    async fn run(&self, snapshot: Snapshot) -> Result<Patch, ActionError>;

    /// Event source whose events should be republished by the orchestrator.
    fn observable(&self) -> Option<&dyn Observable> {
        None
    }
}

pub type Predicate = Arc<dyn Fn(RecordView<'_>) -> bool + Send + Sync>;

pub type ActionFuture = Pin<Box<dyn Future<Output = Result<Patch, ActionError>> + Send>>;

pub type Action = Arc<dyn Fn(Snapshot) -> ActionFuture + Send + Sync>;

/// A plugin assembled from a predicate closure and an async action closure.
pub struct FnPlugin {
    identity: String,
    predicate: Predicate,
    action: Action,
    emitter: Option<Emitter>,
}

impl FnPlugin {
    pub fn new<P, A, Fut>(identity: impl Into<String>, predicate: P, action: A) -> Self
    where
        P: Fn(RecordView<'_>) -> bool + Send + Sync + 'static,
        A: Fn(Snapshot) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Patch, ActionError>> + Send + 'static,
    {
        Self {
            identity: identity.into(),
            predicate: Arc::new(predicate),
            action: Arc::new(move |snapshot| Box::pin(action(snapshot))),
            emitter: None,
        }
    }

    /// Expose `emitter` so its events are republished under this plugin's namespace.
    pub fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = Some(emitter);
        self
    }
}

#[async_trait]
impl Plugin for FnPlugin {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn ready(&self, record: RecordView<'_>) -> bool {
        (self.predicate)(record)
    }

    async fn run(&self, snapshot: Snapshot) -> Result<Patch, ActionError> {
        // Invoked inside the future so a panicking closure is caught with the task.
        let action = self.action.clone();
        action(snapshot).await
    }

    fn observable(&self) -> Option<&dyn Observable> {
        self.emitter.as_ref().map(|e| e as &dyn Observable)
    }
}

impl std::fmt::Debug for FnPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnPlugin")
            .field("identity", &self.identity)
            .field("observable", &self.emitter.is_some())
            .finish()
    }
}
