//! Predicate-gated plugin orchestration.
//!
//! Plugins are registered with a readiness predicate over a shared record.
//! A run keeps evaluating predicates, dispatching ready plugins concurrently,
//! and merging their proposed writes until no pending plugin is ready and
//! nothing is in flight.
//!
//! ## Architecture
//!
//! 1. **Registry** - validated plugin descriptors in tier/registration order
//! 2. **Scheduler** - the per-run control loop, timeouts and deadline
//! 3. **Conflict** - ledger and resolvers for competing field writes
//! 4. **Cache** - optional skip-execution cache
//! 5. **Observer** - lifecycle events and namespaced plugin events

pub mod cache;
pub mod config;
pub mod conflict;
pub mod errors;
pub mod leader;
pub mod observer;
pub mod record;
pub mod registry;
pub mod scheduler;
pub mod telemetry;

pub use cache::{CacheLookup, MemoryCache, ResultCache};
pub use config::{OrchestratorConfig, PluginOverride};
pub use conflict::{ConflictResolver, LastWriterWins, Resolution, WeightedResolver, Winner};
pub use errors::{ActionError, CacheError, ConfigurationError, RunError};
pub use leader::{Orchestrator, RunHandle};
pub use observer::{Emitter, Event, Observable, ObserverSurface};
pub use record::{FieldKey, FieldWrite, Patch, RecordView, Scope};
pub use registry::{FnPlugin, Plugin, PluginDescriptor, PluginRegistry, Snapshot};
pub use scheduler::{PluginOutcome, PluginReport, RunOutcome, RunReport, RunState};
