//! Plugin registry.
//!
//! Holds validated plugin descriptors in scheduling order: tier ascending,
//! then registration order. The registry has no behaviour beyond validation
//! and ordering; the scheduler reads it on every pass.

mod plugin;

pub use plugin::{Action, ActionFuture, FnPlugin, Plugin, Predicate, Snapshot};

use crate::errors::ConfigurationError;
use crate::record::RecordView;
use std::sync::Arc;
use std::time::Duration;

/// Producer name attributed to fields already present when a run starts.
pub const INPUT_PRODUCER: &str = "input";

/// A registered plugin with its scheduling parameters.
#[derive(Clone)]
pub struct PluginDescriptor {
    plugin: Arc<dyn Plugin>,
    tier: i32,
    timeout: Option<Duration>,
    sequence: usize,
}

impl PluginDescriptor {
    /// Wrap a plugin, taking its own tier and timeout as defaults.
    pub fn new(plugin: Arc<dyn Plugin>) -> Self {
        let tier = plugin.tier();
        let timeout = plugin.timeout();
        Self {
            plugin,
            tier,
            timeout,
            sequence: 0,
        }
    }

    pub fn with_tier(mut self, tier: i32) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn identity(&self) -> &str {
        self.plugin.identity()
    }

    pub fn tier(&self) -> i32 {
        self.tier
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Position in registration order.
    pub fn sequence(&self) -> usize {
        self.sequence
    }

    pub fn plugin(&self) -> &Arc<dyn Plugin> {
        &self.plugin
    }

    pub fn is_ready(&self, record: RecordView<'_>) -> bool {
        self.plugin.ready(record)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        let identity = self.identity();
        if identity.trim().is_empty() {
            return Err(ConfigurationError::EmptyIdentity);
        }
        if identity.eq_ignore_ascii_case(INPUT_PRODUCER) {
            return Err(ConfigurationError::ReservedIdentity(identity.to_string()));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigurationError::ZeroTimeout {
                identity: identity.to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("identity", &self.identity())
            .field("tier", &self.tier)
            .field("timeout", &self.timeout)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Ordered collection of plugin descriptors.
#[derive(Debug, Default, Clone)]
pub struct PluginRegistry {
    descriptors: Vec<PluginDescriptor>,
    next_sequence: usize,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add a descriptor, keeping scheduling order.
    pub fn register(&mut self, mut descriptor: PluginDescriptor) -> Result<(), ConfigurationError> {
        descriptor.validate()?;
        if self.contains(descriptor.identity()) {
            return Err(ConfigurationError::DuplicateIdentity(
                descriptor.identity().to_string(),
            ));
        }

        descriptor.sequence = self.next_sequence;
        self.next_sequence += 1;

        // Insert after every descriptor that sorts before or level with it.
        let position = self
            .descriptors
            .partition_point(|d| (d.tier, d.sequence) <= (descriptor.tier, descriptor.sequence));
        self.descriptors.insert(position, descriptor);
        Ok(())
    }

    /// Identities compare case-insensitively since event namespaces are lowercased.
    pub fn contains(&self, identity: &str) -> bool {
        self.descriptors
            .iter()
            .any(|d| d.identity().eq_ignore_ascii_case(identity))
    }

    pub fn get(&self, identity: &str) -> Option<&PluginDescriptor> {
        self.descriptors.iter().find(|d| d.identity() == identity)
    }

    /// Descriptors in scheduling order.
    pub fn ordered(&self) -> &[PluginDescriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
