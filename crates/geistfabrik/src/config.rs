//! Configuration value object consumed by the core.
//!
//! External collaborators own config file loading; the core only defines
//! the recognised options and their defaults. Everything derives
//! `Deserialize` so a YAML or TOML loader can populate it directly.

use std::collections::HashMap;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

/// Default per-geist execution timeout in seconds.
pub const DEFAULT_GEIST_TIMEOUT: u64 = 5;

/// Default number of failures before a geist is auto-disabled.
pub const DEFAULT_MAX_GEIST_FAILURES: u32 = 3;

/// Default cosine similarity threshold for the novelty and diversity filters.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.85;

/// Default number of days of history checked by the novelty filter.
pub const DEFAULT_NOVELTY_WINDOW_DAYS: i64 = 60;

/// Default suggestion length bounds enforced by the quality filter.
pub const DEFAULT_MIN_SUGGESTION_LENGTH: usize = 10;
pub const DEFAULT_MAX_SUGGESTION_LENGTH: usize = 2000;

/// Top-level configuration for one invocation of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Wall-clock limit per geist invocation, in seconds
    pub timeout_seconds: u64,
    /// Consecutive failures before a geist is auto-disabled
    pub max_failures: u32,
    /// Which vector search backend the session uses
    pub vector_backend: VectorBackendKind,
    pub date_collection: DateCollectionConfig,
    pub filter: FilterConfig,
    /// Geists executed first, in this order; the rest follow in sorted id order
    pub default_geist_order: Vec<String>,
    /// Per-default-geist enable map; missing ids default to enabled
    pub enabled_geists: HashMap<String, bool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout_seconds: DEFAULT_GEIST_TIMEOUT,
            max_failures: DEFAULT_MAX_GEIST_FAILURES,
            vector_backend: VectorBackendKind::InMemory,
            date_collection: DateCollectionConfig::default(),
            filter: FilterConfig::default(),
            default_geist_order: Vec::new(),
            enabled_geists: HashMap::new(),
        }
    }
}

/// Vector backend selection. There is no dynamic switching mid-session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorBackendKind {
    #[serde(rename = "in-memory")]
    InMemory,
    #[serde(rename = "indexed")]
    Indexed,
}

/// Date-collection splitting options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DateCollectionConfig {
    pub enabled: bool,
    /// Minimum number of H2 headings before a file can be a collection
    pub min_sections: usize,
    /// Minimum fraction of H2 headings that must parse as dates
    pub threshold: f64,
    /// Glob patterns of files eligible for splitting; empty means all
    pub include: Vec<String>,
    /// Glob patterns of files never split
    pub exclude: Vec<String>,
}

impl Default for DateCollectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_sections: 2,
            threshold: 0.5,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl DateCollectionConfig {
    /// Compile the include/exclude globs into a matcher for the sync loop.
    pub fn matcher(&self) -> Result<DateCollectionMatcher, globset::Error> {
        let build = |patterns: &[String]| -> Result<Option<GlobSet>, globset::Error> {
            if patterns.is_empty() {
                return Ok(None);
            }
            let mut builder = GlobSetBuilder::new();
            for pattern in patterns {
                builder.add(Glob::new(pattern)?);
            }
            Ok(Some(builder.build()?))
        };

        Ok(DateCollectionMatcher {
            include: build(&self.include)?,
            exclude: build(&self.exclude)?,
        })
    }
}

/// Compiled include/exclude globs for date-collection eligibility.
#[derive(Debug)]
pub struct DateCollectionMatcher {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl DateCollectionMatcher {
    /// Whether a vault-relative path may be split.
    pub fn allows(&self, rel_path: &str) -> bool {
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(rel_path) {
                return false;
            }
        }
        match &self.include {
            Some(include) => include.is_match(rel_path),
            None => true,
        }
    }
}

/// Filter pipeline stages, applied in the configured order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterStage {
    Boundary,
    Novelty,
    Diversity,
    Quality,
}

/// How the novelty filter compares new suggestions to history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoveltyMethod {
    #[serde(rename = "embedding_similarity")]
    EmbeddingSimilarity,
    #[serde(rename = "text_match")]
    TextMatch,
}

/// Suggestion filter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub stages: Vec<FilterStage>,
    pub boundary_enabled: bool,
    pub novelty_enabled: bool,
    pub novelty_method: NoveltyMethod,
    pub novelty_threshold: f32,
    pub novelty_window_days: i64,
    pub diversity_enabled: bool,
    pub diversity_threshold: f32,
    pub quality_enabled: bool,
    pub min_length: usize,
    pub max_length: usize,
    pub check_repetition: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            stages: vec![
                FilterStage::Boundary,
                FilterStage::Novelty,
                FilterStage::Diversity,
                FilterStage::Quality,
            ],
            boundary_enabled: true,
            novelty_enabled: true,
            novelty_method: NoveltyMethod::EmbeddingSimilarity,
            novelty_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            novelty_window_days: DEFAULT_NOVELTY_WINDOW_DAYS,
            diversity_enabled: true,
            diversity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            quality_enabled: true,
            min_length: DEFAULT_MIN_SUGGESTION_LENGTH,
            max_length: DEFAULT_MAX_SUGGESTION_LENGTH,
            check_repetition: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.timeout_seconds, 5);
        assert_eq!(config.max_failures, 3);
        assert_eq!(config.vector_backend, VectorBackendKind::InMemory);
        assert!(config.date_collection.enabled);
        assert_eq!(config.date_collection.min_sections, 2);
        assert_eq!(config.date_collection.threshold, 0.5);
        assert_eq!(config.filter.stages.len(), 4);
        assert_eq!(config.filter.novelty_window_days, 60);
        assert_eq!(config.filter.novelty_threshold, 0.85);
        assert_eq!(config.filter.min_length, 10);
        assert_eq!(config.filter.max_length, 2000);
    }

    #[test]
    fn config_deserializes_from_yaml() {
        let yaml = "
timeout_seconds: 10
vector_backend: indexed
date_collection:
  enabled: false
filter:
  stages: [boundary, quality]
  novelty_method: text_match
enabled_geists:
  columbo: false
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.timeout_seconds, 10);
        assert_eq!(config.max_failures, 3);
        assert_eq!(config.vector_backend, VectorBackendKind::Indexed);
        assert!(!config.date_collection.enabled);
        assert_eq!(
            config.filter.stages,
            vec![FilterStage::Boundary, FilterStage::Quality]
        );
        assert_eq!(config.filter.novelty_method, NoveltyMethod::TextMatch);
        assert_eq!(config.enabled_geists.get("columbo"), Some(&false));
    }

    #[test]
    fn matcher_applies_include_and_exclude() {
        let config = DateCollectionConfig {
            include: vec!["journals/**".to_string()],
            exclude: vec!["journals/private/**".to_string()],
            ..Default::default()
        };
        let matcher = config.matcher().unwrap();

        assert!(matcher.allows("journals/Work.md"));
        assert!(!matcher.allows("journals/private/Secrets.md"));
        assert!(!matcher.allows("notes/Other.md"));
    }

    #[test]
    fn empty_globs_allow_everything() {
        let matcher = DateCollectionConfig::default().matcher().unwrap();
        assert!(matcher.allows("anything.md"));
    }
}
