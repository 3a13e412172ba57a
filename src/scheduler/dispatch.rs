//! Spawning of cache lookups and plugin actions.
//!
//! Every dispatched unit runs in its own tokio task, watched by a second
//! task that applies the plugin's timeout and reports back to the control
//! loop with a [`Completion`]. Panics surface as `JoinError`s and are turned
//! into failures. On an action timeout the action task is detached and keeps
//! running, but nothing reads its result any more; a timed-out lookup is
//! aborted and counts as a failed lookup.

use crate::cache::{CacheLookup, ResultCache};
use crate::errors::{ActionError, CacheError, panic_message};
use crate::record::Patch;
use crate::registry::{Plugin, Snapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::{AbortHandle, JoinError};
use tracing::Instrument;

/// Result of one dispatched unit, addressed by plugin index.
#[derive(Debug)]
pub(crate) struct Completion {
    pub index: usize,
    pub outcome: DispatchOutcome,
}

#[derive(Debug)]
pub(crate) enum DispatchOutcome {
    /// The cache supplied the plugin's fields
    Cached(Patch),
    CacheMiss,
    /// The cache lookup failed, panicked or timed out; treated as a miss
    CacheFailed(String),
    Finished(Result<Patch, ActionError>),
    TimedOut(Duration),
}

impl DispatchOutcome {
    fn from_action(joined: Result<Result<Patch, ActionError>, JoinError>) -> Self {
        match joined {
            Ok(result) => Self::Finished(result),
            Err(err) if err.is_panic() => Self::Finished(Err(ActionError::Panicked {
                message: panic_message(err.into_panic()),
            })),
            Err(_) => Self::Finished(Err(ActionError::failed("action task was cancelled"))),
        }
    }

    fn from_lookup(joined: Result<Result<CacheLookup, CacheError>, JoinError>) -> Self {
        match joined {
            Ok(Ok(CacheLookup::Hit(patch))) => Self::Cached(patch),
            Ok(Ok(CacheLookup::Miss)) => Self::CacheMiss,
            Ok(Err(err)) => Self::CacheFailed(err.to_string()),
            Err(err) if err.is_panic() => {
                Self::CacheFailed(format!("lookup panicked: {}", panic_message(err.into_panic())))
            }
            Err(_) => Self::CacheFailed("lookup task was cancelled".to_string()),
        }
    }
}

/// Ask the cache for `identity`'s result, bounded by the plugin's `timeout`.
///
/// Returns abort handles for the lookup and for its watcher.
pub(crate) fn spawn_lookup(
    index: usize,
    identity: String,
    cache: Arc<dyn ResultCache>,
    timeout: Option<Duration>,
    snapshot: Snapshot,
    tx: UnboundedSender<Completion>,
) -> [AbortHandle; 2] {
    let span = tracing::debug_span!("cache_lookup", plugin = %identity);
    let lookup = tokio::spawn(async move { cache.get(&identity, &snapshot).await }.instrument(span));
    let lookup_handle = lookup.abort_handle();

    let watcher = tokio::spawn(async move {
        let outcome = match timeout {
            Some(limit) => {
                let abort = lookup.abort_handle();
                match tokio::time::timeout(limit, lookup).await {
                    Ok(joined) => DispatchOutcome::from_lookup(joined),
                    Err(_) => {
                        abort.abort();
                        DispatchOutcome::CacheFailed(format!(
                            "lookup did not complete within {:?}",
                            limit
                        ))
                    }
                }
            }
            None => DispatchOutcome::from_lookup(lookup.await),
        };
        // The loop may already be gone; late results are dropped.
        let _ = tx.send(Completion { index, outcome });
    });

    [lookup_handle, watcher.abort_handle()]
}

/// Run a plugin action, optionally bounded by `timeout`.
///
/// Returns abort handles for the action and for its watcher.
pub(crate) fn spawn_action(
    index: usize,
    plugin: Arc<dyn Plugin>,
    timeout: Option<Duration>,
    snapshot: Snapshot,
    tx: UnboundedSender<Completion>,
) -> [AbortHandle; 2] {
    let span = tracing::debug_span!("plugin", plugin = %plugin.identity());
    let action = tokio::spawn(async move { plugin.run(snapshot).await }.instrument(span));
    let action_handle = action.abort_handle();

    let watcher = tokio::spawn(async move {
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, action).await {
                Ok(joined) => DispatchOutcome::from_action(joined),
                Err(_) => DispatchOutcome::TimedOut(limit),
            },
            None => DispatchOutcome::from_action(action.await),
        };
        let _ = tx.send(Completion { index, outcome });
    });

    [action_handle, watcher.abort_handle()]
}
