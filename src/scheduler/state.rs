//! Per-run state: the pending/running/done sets, the first recorded error,
//! and the report handed back when the run finishes.

use crate::conflict::{ConflictLedger, MergeSummary};
use crate::errors::RunError;
use crate::record::Scope;
use crate::registry::{INPUT_PRODUCER, Snapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Init,
    /// Evaluating predicates and admitting plugins
    Scheduling,
    /// Waiting for in-flight plugins
    Executing,
    /// Fixpoint reached, finalizing
    Draining,
    Complete,
    /// Global deadline elapsed
    TimedOut,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::TimedOut | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Scheduling => "scheduling",
            Self::Executing => "executing",
            Self::Draining => "draining",
            Self::Complete => "complete",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happened to one plugin during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PluginOutcome {
    /// Predicate never became true
    #[default]
    NeverReady,
    /// Still in flight when the run ended early
    Interrupted,
    Completed { merge: MergeSummary },
    /// Served from the cache; the action did not run
    Cached { merge: MergeSummary },
    Failed { error: String },
    TimedOut { timeout_ms: u64 },
}

impl PluginOutcome {
    /// Whether the plugin's fields made it into the record.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Cached { .. })
    }
}

/// Per-plugin entry in a [`RunReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginReport {
    pub identity: String,
    pub tier: i32,
    #[serde(flatten)]
    pub outcome: PluginOutcome,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub state: RunState,
    /// Plugins in scheduling order
    pub plugins: Vec<PluginReport>,
    /// Number of resolver decisions taken
    pub conflicts: usize,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl RunReport {
    pub fn plugin(&self, identity: &str) -> Option<&PluginReport> {
        self.plugins.iter().find(|p| p.identity == identity)
    }

    pub fn count(&self, predicate: impl Fn(&PluginOutcome) -> bool) -> usize {
        self.plugins.iter().filter(|p| predicate(&p.outcome)).count()
    }
}

/// The result of a run: the one reported error plus best-effort state.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub error: Option<RunError>,
    pub target: Value,
    pub context: Value,
    pub report: RunReport,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Ephemeral state for one invocation of the scheduler.
#[derive(Debug)]
pub struct RunContext {
    pub id: Uuid,
    pub target: Value,
    pub context: Value,
    /// Plugin indices not yet admitted, in scheduling order
    pub pending: BTreeSet<usize>,
    pub running: HashSet<usize>,
    pub done: HashSet<usize>,
    pub outcomes: Vec<PluginOutcome>,
    pub ledger: ConflictLedger,
    pub state: RunState,
    first_error: Option<RunError>,
    finished: bool,
    conflicts: usize,
    started: Instant,
    in_flight: Vec<AbortHandle>,
}

impl RunContext {
    pub fn new(id: Uuid, target: Value, context: Value, plugin_count: usize) -> Self {
        let mut ledger = ConflictLedger::new();
        ledger.seed(Scope::Target, &target, INPUT_PRODUCER);
        ledger.seed(Scope::Context, &context, INPUT_PRODUCER);

        Self {
            id,
            target,
            context,
            pending: (0..plugin_count).collect(),
            running: HashSet::new(),
            done: HashSet::new(),
            outcomes: vec![PluginOutcome::NeverReady; plugin_count],
            ledger,
            state: RunState::Init,
            first_error: None,
            finished: false,
            conflicts: 0,
            started: Instant::now(),
            in_flight: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.target.clone(), self.context.clone())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Move a pending plugin to running.
    pub fn admit(&mut self, index: usize) -> bool {
        if self.pending.remove(&index) {
            self.running.insert(index);
            true
        } else {
            false
        }
    }

    /// Move a plugin to done, from either running or pending.
    pub fn resolve(&mut self, index: usize, outcome: PluginOutcome) {
        self.running.remove(&index);
        self.pending.remove(&index);
        self.done.insert(index);
        if let PluginOutcome::Completed { merge } | PluginOutcome::Cached { merge } = &outcome {
            self.conflicts += merge.conflicts.len();
        }
        if let Some(slot) = self.outcomes.get_mut(index) {
            *slot = outcome;
        }
    }

    /// Keep the first error; later ones are dropped.
    pub fn record_error(&mut self, error: RunError) -> bool {
        if self.first_error.is_none() {
            self.first_error = Some(error);
            true
        } else {
            false
        }
    }

    pub fn first_error(&self) -> Option<&RunError> {
        self.first_error.as_ref()
    }

    pub fn track(&mut self, handle: AbortHandle) {
        self.in_flight.retain(|h| !h.is_finished());
        self.in_flight.push(handle);
    }

    /// Abort every task still attached to this run.
    pub fn abort_in_flight(&mut self) -> usize {
        let mut aborted = 0;
        for handle in self.in_flight.drain(..) {
            if !handle.is_finished() {
                handle.abort();
                aborted += 1;
            }
        }
        aborted
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Close the run. Returns `None` if it was already finalized.
    ///
    /// A terminal `error` (deadline, cancel) supersedes any recorded plugin error.
    pub fn finalize(
        &mut self,
        state: RunState,
        terminal: Option<RunError>,
        plugins: impl Iterator<Item = (String, i32)>,
    ) -> Option<RunOutcome> {
        if self.finished {
            return None;
        }
        self.finished = true;
        self.state = state;

        for &index in &self.running {
            if let Some(slot) = self.outcomes.get_mut(index) {
                *slot = PluginOutcome::Interrupted;
            }
        }

        let report = RunReport {
            run_id: self.id,
            state,
            plugins: plugins
                .zip(self.outcomes.iter().cloned())
                .map(|((identity, tier), outcome)| PluginReport {
                    identity,
                    tier,
                    outcome,
                })
                .collect(),
            conflicts: self.conflicts,
            duration: self.elapsed(),
        };

        Some(RunOutcome {
            error: terminal.or_else(|| self.first_error.take()),
            target: std::mem::take(&mut self.target),
            context: std::mem::take(&mut self.context),
            report,
        })
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
