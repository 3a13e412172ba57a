//! Conflict resolution for competing writes to the same field.
//!
//! Every write a plugin proposes is merged through a [`ConflictLedger`],
//! which remembers the currently-applied value of each field and which
//! plugin produced it. When a different plugin later writes the same field,
//! the configured [`ConflictResolver`] picks the winner. The winner becomes
//! the new baseline; earlier decisions are never revisited.
//!
//! Resolution order follows completion order of concurrently running
//! plugins, so it is not deterministic across runs. Use a
//! [`WeightedResolver`] when a field must end up with a specific producer's
//! value regardless of timing.

mod weighted;

pub use weighted::WeightedResolver;

use crate::errors::panic_message;
use crate::record::{FieldKey, FieldWrite, Patch, RecordView, Scope, flatten_write, set_path};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Which of two competing writes is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Existing,
    Candidate,
}

/// A past decision for one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub existing: FieldWrite,
    pub candidate: FieldWrite,
    pub winner: Winner,
}

impl Resolution {
    pub fn winning_write(&self) -> &FieldWrite {
        match self.winner {
            Winner::Existing => &self.existing,
            Winner::Candidate => &self.candidate,
        }
    }
}

/// Policy deciding between an applied write and a new one from another plugin.
pub trait ConflictResolver: Send + Sync {
    fn resolve(
        &self,
        key: &FieldKey,
        existing: &FieldWrite,
        candidate: &FieldWrite,
        prior: &[Resolution],
        record: RecordView<'_>,
    ) -> Winner;
}

impl<F> ConflictResolver for F
where
    F: Fn(&FieldKey, &FieldWrite, &FieldWrite, &[Resolution], RecordView<'_>) -> Winner
        + Send
        + Sync,
{
    fn resolve(
        &self,
        key: &FieldKey,
        existing: &FieldWrite,
        candidate: &FieldWrite,
        prior: &[Resolution],
        record: RecordView<'_>,
    ) -> Winner {
        self(key, existing, candidate, prior, record)
    }
}

/// Default policy: the newest write always wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriterWins;

impl ConflictResolver for LastWriterWins {
    fn resolve(
        &self,
        _key: &FieldKey,
        _existing: &FieldWrite,
        _candidate: &FieldWrite,
        _prior: &[Resolution],
        _record: RecordView<'_>,
    ) -> Winner {
        Winner::Candidate
    }
}

/// Bookkeeping for one field during a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRecord {
    pub applied: FieldWrite,
    pub resolutions: Vec<Resolution>,
}

/// What happened to a merged patch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    /// Writes committed to the record
    pub applied: usize,
    /// Writes discarded because an existing value won
    pub rejected: usize,
    /// Applied fields the resolver was consulted about
    pub conflicts: Vec<String>,
    /// Set when the resolver panicked; the candidate was kept
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver_panic: Option<String>,
}

/// Per-run record of applied field writes.
#[derive(Debug, Default)]
pub struct ConflictLedger {
    records: HashMap<FieldKey, ConflictRecord>,
}

impl ConflictLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attribute every leaf field already present in `value` to `producer`.
    pub fn seed(&mut self, scope: Scope, value: &Value, producer: &str) {
        let Some(map) = value.as_object() else {
            return;
        };
        for (field, current) in map {
            let key = FieldKey {
                scope,
                path: field.clone(),
            };
            for (leaf, value) in flatten_write(key, current.clone()) {
                self.records.insert(
                    leaf,
                    ConflictRecord {
                        applied: FieldWrite::new(producer, value),
                        resolutions: Vec::new(),
                    },
                );
            }
        }
    }

    /// Merge `patch` from `producer` into the run objects.
    ///
    /// Object values are merged leaf by leaf. A leaf conflicts with every
    /// applied write from another producer at the same path, above it, or
    /// below it; the candidate is applied only if it wins all of them.
    pub fn merge(
        &mut self,
        producer: &str,
        patch: Patch,
        target: &mut Value,
        context: &mut Value,
        resolver: &dyn ConflictResolver,
    ) -> MergeSummary {
        let mut summary = MergeSummary::default();
        for (key, value) in patch {
            for (leaf, value) in flatten_write(key, value) {
                self.merge_leaf(producer, leaf, value, target, context, resolver, &mut summary);
            }
        }
        summary
    }

    #[allow(clippy::too_many_arguments)]
    fn merge_leaf(
        &mut self,
        producer: &str,
        key: FieldKey,
        value: Value,
        target: &mut Value,
        context: &mut Value,
        resolver: &dyn ConflictResolver,
        summary: &mut MergeSummary,
    ) {
        let candidate = FieldWrite::new(producer, value);
        let mut overlapping: Vec<FieldKey> = self
            .records
            .keys()
            .filter(|existing| existing.overlaps(&key))
            .cloned()
            .collect();
        overlapping.sort();

        for existing_key in &overlapping {
            let Some(record) = self.records.get_mut(existing_key) else {
                continue;
            };
            if record.applied.producer == producer {
                continue;
            }

            let decision = catch_unwind(AssertUnwindSafe(|| {
                resolver.resolve(
                    &key,
                    &record.applied,
                    &candidate,
                    &record.resolutions,
                    RecordView::new(target, context),
                )
            }));
            let winner = match decision {
                Ok(winner) => winner,
                Err(payload) => {
                    if summary.resolver_panic.is_none() {
                        summary.resolver_panic = Some(panic_message(payload));
                    }
                    Winner::Candidate
                }
            };

            summary.conflicts.push(existing_key.to_string());
            record.resolutions.push(Resolution {
                existing: record.applied.clone(),
                candidate: candidate.clone(),
                winner,
            });
            if winner == Winner::Existing {
                summary.rejected += 1;
                return;
            }
        }

        // The applied leaf replaces whatever sat above or below it.
        let mut history = Vec::new();
        for existing_key in overlapping {
            if let Some(record) = self.records.remove(&existing_key) {
                if existing_key == key {
                    history = record.resolutions;
                }
            }
        }

        let root = match key.scope {
            Scope::Target => target,
            Scope::Context => context,
        };
        set_path(root, &key.path, candidate.value.clone());
        self.records.insert(
            key,
            ConflictRecord {
                applied: candidate,
                resolutions: history,
            },
        );
        summary.applied += 1;
    }

    pub fn get(&self, key: &FieldKey) -> Option<&ConflictRecord> {
        self.records.get(key)
    }

    /// Producer of the value currently applied at `key`.
    pub fn producer_of(&self, key: &FieldKey) -> Option<&str> {
        self.records.get(key).map(|r| r.applied.producer.as_str())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
