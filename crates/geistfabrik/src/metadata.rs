//! Metadata inference: pluggable per-note derived attributes, plus the
//! statistical analyser over inferred values.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::models::Note;
use crate::vault_context::{ContextError, VaultContext};

/// Metadata values for one note. JSON-representable by construction.
pub type MetadataMap = serde_json::Map<String, Value>;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata key '{key}' provided by both '{first}' and '{second}'")]
    KeyConflict {
        key: String,
        first: String,
        second: String,
    },

    #[error("duplicate metadata module '{0}'")]
    DuplicateModule(String),
}

/// A user-supplied inference unit. Each module derives a set of uniquely
/// named attributes for a note.
pub trait MetadataModule: Send + Sync {
    fn name(&self) -> &str;
    fn infer(&self, note: &Note, ctx: &VaultContext) -> anyhow::Result<MetadataMap>;
}

/// Holds the registered metadata modules and runs them over notes.
///
/// One module failing affects only its own contribution: the failure is
/// logged and the remaining modules still run. Key collisions between
/// modules (or with the built-in attributes) are a hard error.
#[derive(Default)]
pub struct MetadataLoader {
    modules: Vec<Arc<dyn MetadataModule>>,
}

impl MetadataLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: Arc<dyn MetadataModule>) -> Result<(), MetadataError> {
        if self.modules.iter().any(|m| m.name() == module.name()) {
            return Err(MetadataError::DuplicateModule(module.name().to_string()));
        }
        self.modules.push(module);
        Ok(())
    }

    pub fn module_names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    /// Run every module on a note and merge the results into `base`.
    ///
    /// Returns the names of modules that failed. `base` holds the built-in
    /// attributes, so module keys may not shadow them either.
    pub fn infer_all(
        &self,
        note: &Note,
        ctx: &VaultContext,
        base: &mut MetadataMap,
    ) -> Result<Vec<String>, MetadataError> {
        let mut key_owner: HashMap<String, String> = base
            .keys()
            .map(|k| (k.clone(), "built-in".to_string()))
            .collect();
        let mut failed = Vec::new();

        for module in &self.modules {
            let inferred = match module.infer(note, ctx) {
                Ok(inferred) => inferred,
                Err(e) => {
                    tracing::error!(
                        module = module.name(),
                        note = %note.path,
                        error = %e,
                        "metadata module failed"
                    );
                    failed.push(module.name().to_string());
                    continue;
                }
            };

            for (key, value) in inferred {
                if let Some(first) = key_owner.get(&key) {
                    return Err(MetadataError::KeyConflict {
                        key,
                        first: first.clone(),
                        second: module.name().to_string(),
                    });
                }
                key_owner.insert(key.clone(), module.name().to_string());
                base.insert(key, value);
            }
        }

        Ok(failed)
    }
}

/// Percentile summary of a numeric metadata key across the vault.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Percentiles {
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
}

/// Statistical operations over metadata values across the vault:
/// percentiles, outliers, comparisons, and per-note profiles.
pub struct MetadataAnalyser<'a> {
    ctx: &'a VaultContext,
}

impl<'a> MetadataAnalyser<'a> {
    pub fn new(ctx: &'a VaultContext) -> Self {
        Self { ctx }
    }

    fn numeric_values(&self, key: &str) -> Result<Vec<(String, f64)>, ContextError> {
        let mut values = Vec::new();
        for note in self.ctx.notes()? {
            let metadata = self.ctx.metadata(&note)?;
            if let Some(value) = metadata.get(key).and_then(Value::as_f64) {
                values.push((note.path.clone(), value));
            }
        }
        Ok(values)
    }

    /// Percentiles (p10/p25/p50/p75/p90) for a numeric metadata key.
    /// All-zero when no note carries a numeric value for the key.
    pub fn distribution(&self, key: &str) -> Result<Percentiles, ContextError> {
        let mut values: Vec<f64> = self
            .numeric_values(key)?
            .into_iter()
            .map(|(_, v)| v)
            .collect();

        if values.is_empty() {
            return Ok(Percentiles {
                p10: 0.0,
                p25: 0.0,
                p50: 0.0,
                p75: 0.0,
                p90: 0.0,
            });
        }

        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Ok(Percentiles {
            p10: percentile(&values, 10.0),
            p25: percentile(&values, 25.0),
            p50: percentile(&values, 50.0),
            p75: percentile(&values, 75.0),
            p90: percentile(&values, 90.0),
        })
    }

    /// Notes whose value for `key` lies more than `threshold` standard
    /// deviations from the mean.
    pub fn outliers(&self, key: &str, threshold: f64) -> Result<Vec<Note>, ContextError> {
        let values = self.numeric_values(key)?;
        if values.is_empty() {
            return Ok(vec![]);
        }

        let n = values.len() as f64;
        let mean = values.iter().map(|(_, v)| v).sum::<f64>() / n;
        let variance = values.iter().map(|(_, v)| (v - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();

        if std_dev < 1e-10 {
            return Ok(vec![]);
        }

        let outlier_paths: std::collections::HashSet<&String> = values
            .iter()
            .filter(|(_, v)| ((v - mean) / std_dev).abs() > threshold)
            .map(|(path, _)| path)
            .collect();

        Ok(self
            .ctx
            .notes()?
            .into_iter()
            .filter(|note| outlier_paths.contains(&note.path))
            .collect())
    }

    /// Ratios `a / b` for the given numeric metadata keys.
    pub fn compare_notes(
        &self,
        a: &Note,
        b: &Note,
        keys: &[&str],
    ) -> Result<HashMap<String, f64>, ContextError> {
        let metadata_a = self.ctx.metadata(a)?;
        let metadata_b = self.ctx.metadata(b)?;

        let mut ratios = HashMap::new();
        for key in keys {
            let (Some(value_a), Some(value_b)) = (
                metadata_a.get(*key).and_then(Value::as_f64),
                metadata_b.get(*key).and_then(Value::as_f64),
            ) else {
                continue;
            };
            let ratio = if value_b != 0.0 {
                value_a / value_b
            } else {
                f64::INFINITY
            };
            ratios.insert((*key).to_string(), ratio);
        }
        Ok(ratios)
    }

    /// Qualitative profile: each numeric key rated high / moderate / low
    /// against the vault-wide p75 / p25 bounds.
    pub fn profile(&self, note: &Note) -> Result<HashMap<String, &'static str>, ContextError> {
        let metadata = self.ctx.metadata(note)?;
        let mut profile = HashMap::new();

        for (key, value) in &metadata {
            let Some(value) = value.as_f64() else {
                continue;
            };
            let dist = self.distribution(key)?;
            let level = if value >= dist.p75 {
                "high"
            } else if value <= dist.p25 {
                "low"
            } else {
                "moderate"
            };
            profile.insert(key.clone(), level);
        }

        Ok(profile)
    }
}

/// Linear-interpolated percentile over sorted values.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }

    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    if low == high {
        return sorted[low];
    }
    let weight = rank - low as f64;
    sorted[low] * (1.0 - weight) + sorted[high] * weight
}
