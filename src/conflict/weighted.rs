//! Static per-field weighting of producers.

use super::{ConflictResolver, Resolution, Winner};
use crate::record::{FieldKey, FieldWrite, RecordView};
use std::collections::HashMap;

/// Resolver that prefers the producer with the higher weight for a field.
///
/// The existing write is kept only when its weight is strictly greater than
/// the candidate's. Unknown producers weigh 0, fields without weights fall
/// back to the candidate.
#[derive(Debug, Clone, Default)]
pub struct WeightedResolver {
    weights: HashMap<FieldKey, HashMap<String, f64>>,
}

impl WeightedResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the weight of `producer` for `key`.
    pub fn weight(mut self, key: FieldKey, producer: impl Into<String>, weight: f64) -> Self {
        self.weights
            .entry(key)
            .or_default()
            .insert(producer.into(), weight);
        self
    }

    /// Build from `field key → producer → weight` tables, as loaded from config.
    pub fn from_table(table: &HashMap<String, HashMap<String, f64>>) -> Result<Self, String> {
        let mut weights = HashMap::new();
        for (field, producers) in table {
            let key: FieldKey = field.parse()?;
            weights.insert(key, producers.clone());
        }
        Ok(Self { weights })
    }

    pub fn weight_of(&self, key: &FieldKey, producer: &str) -> Option<f64> {
        self.weights.get(key)?.get(producer).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

impl ConflictResolver for WeightedResolver {
    fn resolve(
        &self,
        key: &FieldKey,
        existing: &FieldWrite,
        candidate: &FieldWrite,
        _prior: &[Resolution],
        _record: RecordView<'_>,
    ) -> Winner {
        let Some(field_weights) = self.weights.get(key) else {
            return Winner::Candidate;
        };
        let existing_weight = field_weights.get(&existing.producer).copied().unwrap_or(0.0);
        let candidate_weight = field_weights.get(&candidate.producer).copied().unwrap_or(0.0);

        if existing_weight > candidate_weight {
            Winner::Existing
        } else {
            Winner::Candidate
        }
    }
}
