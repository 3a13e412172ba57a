//! The orchestrator: configuration API and run entry points.
//!
//! ```no_run
//! use leader::{Orchestrator, Patch};
//! use serde_json::json;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut leader = Orchestrator::new();
//! leader
//!     .when("domain", |r| r.has("email"), |s| async move {
//!         let email = s.view().str_field("email").unwrap_or_default().to_string();
//!         let domain = email.split('@').nth(1).unwrap_or_default().to_string();
//!         Ok(Patch::new().set("domain", domain))
//!     })?
//!     .when("crunchbase", |r| r.has("domain"), |s| async move {
//!         let domain = s.view().str_field("domain").unwrap_or_default().to_string();
//!         Ok(Patch::new().set(
//!             "company.crunchbase",
//!             format!("http://www.crunchbase.com/search?query={}", domain),
//!         ))
//!     })?;
//!
//! let outcome = leader
//!     .run(json!({ "email": "ilya@segment.io" }), json!({}))?
//!     .wait()
//!     .await?;
//! assert_eq!(outcome.target["domain"], "segment.io");
//! # Ok(())
//! # }
//! ```

use crate::cache::ResultCache;
use crate::config::OrchestratorConfig;
use crate::conflict::{ConflictResolver, LastWriterWins};
use crate::errors::{ActionError, ConfigurationError, RunError};
use crate::observer::{Event, ObserverSurface};
use crate::record::{Patch, RecordView, kind_of};
use crate::registry::{FnPlugin, Plugin, PluginDescriptor, PluginRegistry, Snapshot};
use crate::scheduler::{Finalizer, RunContext, RunOutcome, Scheduler};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, debug};
use uuid::Uuid;

/// Configures plugins once and runs them against any number of records.
pub struct Orchestrator {
    registry: PluginRegistry,
    resolver: Arc<dyn ConflictResolver>,
    cache: Option<Arc<dyn ResultCache>>,
    concurrency: Option<usize>,
    config: OrchestratorConfig,
    observer: ObserverSurface,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            registry: PluginRegistry::new(),
            resolver: Arc::new(LastWriterWins),
            cache: None,
            concurrency: None,
            config: OrchestratorConfig::default(),
            observer: ObserverSurface::new(),
        }
    }

    /// Build from configuration. Weights in the config install a weighted resolver.
    pub fn with_config(config: OrchestratorConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let mut orchestrator = Self::new();
        if let Some(resolver) = config.resolver()? {
            orchestrator.resolver = Arc::new(resolver);
        }
        orchestrator.concurrency = config.concurrency;
        orchestrator.config = config;
        Ok(orchestrator)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn observer(&self) -> &ObserverSurface {
        &self.observer
    }

    /// Register a descriptor.
    ///
    /// Tier and timeout overrides from `[plugins.<identity>]` in the config
    /// take precedence over the descriptor's own values.
    pub fn register(&mut self, descriptor: PluginDescriptor) -> Result<&mut Self, ConfigurationError> {
        let mut descriptor = descriptor;
        if let Some(overrides) = self.config.plugin_override(descriptor.identity()) {
            if let Some(tier) = overrides.tier {
                descriptor = descriptor.with_tier(tier);
            }
            if let Some(timeout) = overrides.timeout() {
                descriptor = descriptor.with_timeout(timeout);
            }
        }

        let plugin = descriptor.plugin().clone();
        self.registry.register(descriptor)?;
        if let Some(source) = plugin.observable() {
            self.observer.proxy(plugin.identity(), source);
        }
        debug!(plugin = plugin.identity(), total = self.registry.len(), "Registered plugin");
        Ok(self)
    }

    /// Register a plugin implementation with its own tier and timeout.
    pub fn use_plugin<P>(&mut self, plugin: P) -> Result<&mut Self, ConfigurationError>
    where
        P: Plugin + 'static,
    {
        self.register(PluginDescriptor::new(Arc::new(plugin)))
    }

    /// Register a predicate/action pair at tier 0 with no timeout.
    pub fn when<P, A, Fut>(
        &mut self,
        identity: impl Into<String>,
        predicate: P,
        action: A,
    ) -> Result<&mut Self, ConfigurationError>
    where
        P: Fn(RecordView<'_>) -> bool + Send + Sync + 'static,
        A: Fn(Snapshot) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Patch, ActionError>> + Send + 'static,
    {
        self.when_with(identity, predicate, action, 0, None)
    }

    /// Register a predicate/action pair with an explicit tier and optional timeout.
    pub fn when_with<P, A, Fut>(
        &mut self,
        identity: impl Into<String>,
        predicate: P,
        action: A,
        tier: i32,
        timeout: Option<Duration>,
    ) -> Result<&mut Self, ConfigurationError>
    where
        P: Fn(RecordView<'_>) -> bool + Send + Sync + 'static,
        A: Fn(Snapshot) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Patch, ActionError>> + Send + 'static,
    {
        let mut descriptor =
            PluginDescriptor::new(Arc::new(FnPlugin::new(identity, predicate, action))).with_tier(tier);
        if let Some(timeout) = timeout {
            descriptor = descriptor.with_timeout(timeout);
        }
        self.register(descriptor)
    }

    /// Cap the number of plugins in flight per run.
    pub fn set_concurrency_limit(&mut self, limit: usize) -> Result<&mut Self, ConfigurationError> {
        if limit == 0 {
            return Err(ConfigurationError::ZeroConcurrency);
        }
        self.concurrency = Some(limit);
        Ok(self)
    }

    pub fn set_conflict_resolver<R>(&mut self, resolver: R) -> &mut Self
    where
        R: ConflictResolver + 'static,
    {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Install a cache; its events are republished under `cache:`.
    pub fn set_cache<C>(&mut self, cache: Arc<C>) -> &mut Self
    where
        C: ResultCache + 'static,
    {
        if let Some(source) = cache.observable() {
            self.observer.proxy("cache", source);
        }
        self.cache = Some(cache as Arc<dyn ResultCache>);
        self
    }

    pub fn subscribe<F>(&self, name: impl Into<String>, handler: F) -> &Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.observer.subscribe(name, handler);
        self
    }

    pub fn subscribe_all<F>(&self, handler: F) -> &Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.observer.subscribe_all(handler);
        self
    }

    /// Start a run on the current tokio runtime.
    pub fn run(&self, target: Value, context: Value) -> Result<RunHandle, ConfigurationError> {
        self.spawn(target, context, None)
    }

    /// Start a run and invoke `callback(error, target, context)` exactly once when it ends.
    pub fn run_with_callback<F>(
        &self,
        target: Value,
        context: Value,
        callback: F,
    ) -> Result<RunHandle, ConfigurationError>
    where
        F: FnOnce(Option<RunError>, Value, Value) + Send + 'static,
    {
        let finalizer: Finalizer = Box::new(move |outcome: &RunOutcome| {
            callback(
                outcome.error.clone(),
                outcome.target.clone(),
                outcome.context.clone(),
            )
        });
        self.spawn(target, context, Some(finalizer))
    }

    fn spawn(
        &self,
        target: Value,
        context: Value,
        finalizer: Option<Finalizer>,
    ) -> Result<RunHandle, ConfigurationError> {
        for (field, value) in [("target", &target), ("context", &context)] {
            if !value.is_object() {
                return Err(ConfigurationError::NotAnObject {
                    field,
                    kind: kind_of(value).to_string(),
                });
            }
        }

        let plugins: Arc<[PluginDescriptor]> = self.registry.ordered().to_vec().into();
        let id = Uuid::new_v4();
        let ctx = RunContext::new(id, target, context, plugins.len());
        let scheduler = Scheduler::new(plugins, self.resolver.clone(), self.observer.clone())
            .with_cache(self.cache.clone())
            .with_concurrency(self.concurrency)
            .with_max_time(self.config.max_time());

        let cancel = Arc::new(Notify::new());
        let span = tracing::info_span!("run", run_id = %id);
        let task = tokio::spawn(scheduler.run(ctx, cancel.clone(), finalizer).instrument(span));

        Ok(RunHandle { id, cancel, task })
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("cache", &self.cache.is_some())
            .field("concurrency", &self.concurrency)
            .field("max_time", &self.config.max_time())
            .finish()
    }
}

/// Handle to an in-progress run.
#[derive(Debug)]
pub struct RunHandle {
    id: Uuid,
    cancel: Arc<Notify>,
    task: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stop the run; it finalizes with [`RunError::Cancelled`] unless it already finished.
    pub fn cancel(&self) {
        self.cancel.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run's outcome.
    pub async fn wait(self) -> Result<RunOutcome, JoinError> {
        self.task.await
    }
}
