//! Typed error hierarchy for the orchestrator.
//!
//! - `ConfigurationError`: rejected registrations and settings, returned synchronously
//! - `ActionError`: a single plugin failed; recorded, never fatal to the run
//! - `RunError`: the one error a finished run reports
//! - `CacheError`: cache collaborator failures, never surfaced in a run result

use std::any::Any;
use std::time::Duration;
use thiserror::Error;

/// Errors from the configuration API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("Plugin identity must not be empty")]
    EmptyIdentity,

    #[error("Plugin identity '{0}' is reserved")]
    ReservedIdentity(String),

    #[error("Plugin '{0}' is already registered")]
    DuplicateIdentity(String),

    #[error("Plugin '{identity}' has a zero timeout")]
    ZeroTimeout { identity: String },

    #[error("Concurrency limit must be at least 1")]
    ZeroConcurrency,

    #[error("Run {field} must be a JSON object, got {kind}")]
    NotAnObject { field: &'static str, kind: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors produced by a plugin action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("{message}")]
    Failed { message: String },

    #[error("action panicked: {message}")]
    Panicked { message: String },
}

impl ActionError {
    /// Create a failure with the given message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ActionError {
    fn from(err: anyhow::Error) -> Self {
        Self::failed(format!("{:#}", err))
    }
}

/// The error reported once a run finishes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("Plugin '{plugin}' failed: {source}")]
    Action {
        plugin: String,
        #[source]
        source: ActionError,
    },

    #[error("Plugin '{plugin}' did not complete within {timeout:?}")]
    PluginTimeout { plugin: String, timeout: Duration },

    #[error("Run exceeded its deadline of {max_time:?}")]
    Deadline { max_time: Duration },

    #[error("Run was cancelled")]
    Cancelled,
}

impl RunError {
    /// Identity of the plugin responsible, if the error came from one.
    pub fn plugin(&self) -> Option<&str> {
        match self {
            Self::Action { plugin, .. } | Self::PluginTimeout { plugin, .. } => Some(plugin),
            Self::Deadline { .. } | Self::Cancelled => None,
        }
    }

    /// Whether the error forced early finalization of the run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deadline { .. } | Self::Cancelled)
    }
}

/// Errors from a cache collaborator.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
