//! The scheduling core.
//!
//! A run is driven by a single control loop that owns the [`RunContext`].
//! Each iteration performs one scheduling pass and then waits for exactly
//! one event: a dispatched unit reporting back, the global deadline, or a
//! cancellation request.
//!
//! ```text
//! INIT -> SCHEDULING <-> EXECUTING -> DRAINING -> COMPLETE
//!                  \________ TIMEOUT / CANCELLED ________/
//! ```
//!
//! A scheduling pass walks pending plugins in tier-then-registration order,
//! evaluates their predicates against the current record, and admits ready
//! ones up to the concurrency limit. All tiers are considered in the same
//! pass; tiers only order admission. The run reaches its fixpoint when a pass
//! admits nothing while nothing is in flight.

mod dispatch;
pub mod state;

pub use state::{PluginOutcome, PluginReport, RunContext, RunOutcome, RunReport, RunState};

use crate::cache::ResultCache;
use crate::conflict::ConflictResolver;
use crate::conflict::MergeSummary;
use crate::errors::{ActionError, RunError, panic_message};
use crate::observer::ObserverSurface;
use crate::record::{Patch, RecordView};
use crate::registry::PluginDescriptor;
use dispatch::{Completion, DispatchOutcome};
use serde_json::json;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Invoked once with the finished run.
pub type Finalizer = Box<dyn FnOnce(&RunOutcome) + Send>;

/// Everything a run needs, captured from the orchestrator when the run starts.
#[derive(Clone)]
pub struct Scheduler {
    plugins: Arc<[PluginDescriptor]>,
    resolver: Arc<dyn ConflictResolver>,
    cache: Option<Arc<dyn ResultCache>>,
    concurrency: Option<usize>,
    max_time: Option<Duration>,
    observer: ObserverSurface,
}

impl Scheduler {
    pub fn new(
        plugins: Arc<[PluginDescriptor]>,
        resolver: Arc<dyn ConflictResolver>,
        observer: ObserverSurface,
    ) -> Self {
        Self {
            plugins,
            resolver,
            cache: None,
            concurrency: None,
            max_time: None,
            observer,
        }
    }

    pub fn with_cache(mut self, cache: Option<Arc<dyn ResultCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_concurrency(mut self, limit: Option<usize>) -> Self {
        self.concurrency = limit;
        self
    }

    pub fn with_max_time(mut self, max_time: Option<Duration>) -> Self {
        self.max_time = max_time;
        self
    }

    /// Drive `ctx` to completion. The finalizer, if any, runs exactly once.
    pub async fn run(
        self,
        mut ctx: RunContext,
        cancel: Arc<Notify>,
        finalizer: Option<Finalizer>,
    ) -> RunOutcome {
        let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();
        let deadline = self.max_time.map(|limit| Instant::now() + limit);

        info!(
            run_id = %ctx.id,
            plugins = self.plugins.len(),
            concurrency = ?self.concurrency,
            max_time = ?self.max_time,
            "Run started"
        );
        self.emit("run:start", &ctx, json!({ "plugins": self.plugins.len() }));

        let (state, terminal) = loop {
            self.schedule_pass(&mut ctx, &tx);

            if ctx.running.is_empty() {
                ctx.state = RunState::Draining;
                break (RunState::Complete, None);
            }

            ctx.state = RunState::Executing;
            tokio::select! {
                Some(completion) = rx.recv() => self.handle_completion(&mut ctx, completion, &tx),
                _ = wait_until(deadline) => {
                    let max_time = self.max_time.unwrap_or_default();
                    warn!(run_id = %ctx.id, ?max_time, running = ctx.running.len(), "Run deadline elapsed");
                    break (RunState::TimedOut, Some(RunError::Deadline { max_time }));
                }
                _ = cancel.notified() => {
                    info!(run_id = %ctx.id, "Run cancelled");
                    break (RunState::Cancelled, Some(RunError::Cancelled));
                }
            }
        };

        // Anything still attached belongs to an abandoned run.
        if state != RunState::Complete {
            let aborted = ctx.abort_in_flight();
            debug!(run_id = %ctx.id, aborted, "Aborted in-flight tasks");
        }
        drop(rx);

        let plugins = self
            .plugins
            .iter()
            .map(|d| (d.identity().to_string(), d.tier()));
        let Some(outcome) = ctx.finalize(state, terminal, plugins) else {
            unreachable!("the control loop finalizes a run once");
        };

        let event = match state {
            RunState::TimedOut => "run:deadline",
            RunState::Cancelled => "run:cancelled",
            _ => "run:complete",
        };
        self.observer.emit(
            event,
            json!({
                "run": outcome.report.run_id,
                "error": outcome.error.as_ref().map(|e| e.to_string()),
                "duration_ms": outcome.report.duration.as_millis() as u64,
            }),
        );
        info!(
            run_id = %outcome.report.run_id,
            state = %state,
            error = ?outcome.error,
            "Run finished"
        );

        if let Some(finalize) = finalizer {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| finalize(&outcome))) {
                warn!(
                    run_id = %outcome.report.run_id,
                    error = %panic_message(payload),
                    "Run callback panicked"
                );
            }
        }
        outcome
    }

    /// Evaluate pending predicates and dispatch the ready ones. Returns the number admitted.
    fn schedule_pass(&self, ctx: &mut RunContext, tx: &mpsc::UnboundedSender<Completion>) -> usize {
        ctx.state = RunState::Scheduling;
        let capacity = self
            .concurrency
            .map(|limit| limit.saturating_sub(ctx.running.len()));

        let mut ready = Vec::new();
        let mut broken = Vec::new();
        {
            let view = RecordView::new(&ctx.target, &ctx.context);
            for &index in &ctx.pending {
                if capacity.is_some_and(|c| ready.len() >= c) {
                    break;
                }
                let descriptor = &self.plugins[index];
                match catch_unwind(AssertUnwindSafe(|| descriptor.is_ready(view))) {
                    Ok(true) => ready.push(index),
                    Ok(false) => {}
                    Err(payload) => broken.push((index, panic_message(payload))),
                }
            }
        }

        for (index, message) in broken {
            self.fail(ctx, index, RunError::Action {
                plugin: self.plugins[index].identity().to_string(),
                source: ActionError::Panicked {
                    message: format!("predicate: {}", message),
                },
            });
        }

        for &index in &ready {
            if ctx.admit(index) {
                self.dispatch(ctx, index, tx);
            }
        }

        if !ready.is_empty() {
            debug!(
                run_id = %ctx.id,
                admitted = ready.len(),
                running = ctx.running.len(),
                pending = ctx.pending.len(),
                "Scheduling pass"
            );
        }
        ready.len()
    }

    fn dispatch(&self, ctx: &mut RunContext, index: usize, tx: &mpsc::UnboundedSender<Completion>) {
        let descriptor = &self.plugins[index];
        match &self.cache {
            Some(cache) => {
                let handles = dispatch::spawn_lookup(
                    index,
                    descriptor.identity().to_string(),
                    cache.clone(),
                    descriptor.timeout(),
                    ctx.snapshot(),
                    tx.clone(),
                );
                for handle in handles {
                    ctx.track(handle);
                }
            }
            None => self.start_action(ctx, index, tx),
        }
    }

    fn start_action(&self, ctx: &mut RunContext, index: usize, tx: &mpsc::UnboundedSender<Completion>) {
        let descriptor = &self.plugins[index];
        debug!(run_id = %ctx.id, plugin = descriptor.identity(), tier = descriptor.tier(), "Starting plugin");
        self.emit(
            "plugin:start",
            ctx,
            json!({ "plugin": descriptor.identity(), "tier": descriptor.tier() }),
        );
        let handles = dispatch::spawn_action(
            index,
            descriptor.plugin().clone(),
            descriptor.timeout(),
            ctx.snapshot(),
            tx.clone(),
        );
        for handle in handles {
            ctx.track(handle);
        }
    }

    fn handle_completion(
        &self,
        ctx: &mut RunContext,
        completion: Completion,
        tx: &mpsc::UnboundedSender<Completion>,
    ) {
        let Completion { index, outcome } = completion;
        if !ctx.running.contains(&index) {
            debug!(run_id = %ctx.id, index, "Discarding completion for plugin not in flight");
            return;
        }
        let identity = self.plugins[index].identity().to_string();

        match outcome {
            DispatchOutcome::CacheMiss => self.start_action(ctx, index, tx),
            DispatchOutcome::CacheFailed(message) => {
                warn!(run_id = %ctx.id, plugin = %identity, error = %message, "Cache lookup failed");
                self.emit(
                    "cache:error",
                    ctx,
                    json!({ "plugin": identity, "operation": "get", "error": message }),
                );
                self.start_action(ctx, index, tx);
            }
            DispatchOutcome::Cached(patch) => {
                let merge = self.merge(ctx, &identity, patch);
                debug!(run_id = %ctx.id, plugin = %identity, applied = merge.applied, "Served from cache");
                self.emit("plugin:cached", ctx, json!({ "plugin": identity, "merge": merge }));
                self.check_resolver(ctx, &identity, &merge);
                ctx.resolve(index, PluginOutcome::Cached { merge });
            }
            DispatchOutcome::Finished(Ok(patch)) => {
                let merge = self.merge(ctx, &identity, patch.clone());
                debug!(
                    run_id = %ctx.id,
                    plugin = %identity,
                    applied = merge.applied,
                    rejected = merge.rejected,
                    "Plugin completed"
                );
                self.emit("plugin:done", ctx, json!({ "plugin": identity, "merge": merge }));
                self.check_resolver(ctx, &identity, &merge);
                ctx.resolve(index, PluginOutcome::Completed { merge });
                self.store(ctx, identity, patch);
            }
            DispatchOutcome::Finished(Err(source)) => {
                self.fail(ctx, index, RunError::Action { plugin: identity, source });
            }
            DispatchOutcome::TimedOut(timeout) => {
                self.fail(ctx, index, RunError::PluginTimeout { plugin: identity, timeout });
            }
        }
    }

    fn merge(&self, ctx: &mut RunContext, identity: &str, patch: Patch) -> MergeSummary {
        let RunContext {
            ledger,
            target,
            context,
            ..
        } = ctx;
        ledger.merge(identity, patch, target, context, self.resolver.as_ref())
    }

    /// A resolver panic during a merge counts against the plugin whose writes were merged.
    /// Its fields were still applied, so the plugin keeps its outcome.
    fn check_resolver(&self, ctx: &mut RunContext, identity: &str, merge: &MergeSummary) {
        let Some(message) = &merge.resolver_panic else {
            return;
        };
        let error = RunError::Action {
            plugin: identity.to_string(),
            source: ActionError::Panicked {
                message: format!("resolver: {}", message),
            },
        };
        warn!(run_id = %ctx.id, plugin = identity, error = %error, "Conflict resolver panicked");
        self.emit("plugin:error", ctx, json!({ "plugin": identity, "error": error.to_string() }));
        ctx.record_error(error);
    }

    /// Record a plugin failure without stopping its siblings.
    fn fail(&self, ctx: &mut RunContext, index: usize, error: RunError) {
        let identity = self.plugins[index].identity();
        let outcome = match &error {
            RunError::PluginTimeout { timeout, .. } => PluginOutcome::TimedOut {
                timeout_ms: timeout.as_millis() as u64,
            },
            other => PluginOutcome::Failed {
                error: other.to_string(),
            },
        };
        let event = if matches!(error, RunError::PluginTimeout { .. }) {
            "plugin:timeout"
        } else {
            "plugin:error"
        };

        warn!(run_id = %ctx.id, plugin = identity, error = %error, "Plugin failed");
        self.emit(event, ctx, json!({ "plugin": identity, "error": error.to_string() }));
        ctx.resolve(index, outcome);
        ctx.record_error(error);
    }

    /// Best-effort write-back of a plugin's result.
    fn store(&self, ctx: &RunContext, identity: String, patch: Patch) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let snapshot = ctx.snapshot();
        let observer = self.observer.clone();
        let run_id = ctx.id;
        tokio::spawn(async move {
            if let Err(err) = cache.set(&identity, &snapshot, &patch).await {
                warn!(run_id = %run_id, plugin = %identity, error = %err, "Cache write failed");
                observer.emit(
                    "cache:error",
                    json!({ "run": run_id, "plugin": identity, "operation": "set", "error": err.to_string() }),
                );
            }
        });
    }

    fn emit(&self, name: &str, ctx: &RunContext, mut payload: serde_json::Value) {
        if let Some(map) = payload.as_object_mut() {
            map.insert("run".to_string(), json!(ctx.id));
        }
        self.observer.emit(name, payload);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
