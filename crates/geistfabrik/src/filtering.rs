//! Suggestion filtering pipeline.
//!
//! Four stages, applied in configured order, each individually togglable:
//! boundary (references must resolve), novelty (not too similar to recent
//! history), diversity (no near-duplicates within the batch), and quality
//! (length and structure checks). A deterministic sampler picks the final
//! output.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use rand::SeedableRng;
use rand::rngs::StdRng;
use semantic_embeddings::cosine_similarity;
use thiserror::Error;

use crate::config::{FilterConfig, FilterStage, NoveltyMethod};
use crate::embeddings::{EmbeddingError, TextEmbedder};
use crate::models::{Suggestion, virtual_note_parts};
use crate::vault::Db;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error("vector error: {0}")]
    Vector(String),
}

pub type Result<T> = std::result::Result<T, FilterError>;

/// How the final selector treats the filtered batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// Sample down to the requested count when the batch is larger
    Default,
    /// Return everything that survived filtering
    Full,
}

/// Filters suggestions through boundary, novelty, diversity, and quality
/// checks. Stages are order-preserving and never grow their input.
pub struct SuggestionFilter {
    db: Db,
    embedder: Arc<dyn TextEmbedder>,
    config: FilterConfig,
}

impl SuggestionFilter {
    pub fn new(db: Db, embedder: Arc<dyn TextEmbedder>, config: FilterConfig) -> Self {
        Self {
            db,
            embedder,
            config,
        }
    }

    /// Apply all configured stages in sequence.
    pub fn filter_all(
        &self,
        suggestions: Vec<Suggestion>,
        session_date: NaiveDate,
    ) -> Result<Vec<Suggestion>> {
        let mut filtered = suggestions;
        for stage in &self.config.stages {
            let before = filtered.len();
            filtered = match stage {
                FilterStage::Boundary => self.filter_boundary(filtered)?,
                FilterStage::Novelty => self.filter_novelty(filtered, session_date)?,
                FilterStage::Diversity => self.filter_diversity(filtered)?,
                FilterStage::Quality => self.filter_quality(filtered),
            };
            tracing::debug!(?stage, before, after = filtered.len(), "filter stage");
        }
        Ok(filtered)
    }

    /// Drop suggestions referencing notes that don't exist.
    ///
    /// A reference is valid when it matches a stored path, a stored title,
    /// or a virtual note's obsidian link (`<stem>#<heading>`).
    pub fn filter_boundary(&self, suggestions: Vec<Suggestion>) -> Result<Vec<Suggestion>> {
        if !self.config.boundary_enabled {
            return Ok(suggestions);
        }

        let mut valid: HashSet<String> = HashSet::new();
        {
            let conn = self.db.lock().unwrap();
            let mut stmt = conn.prepare("SELECT path, title FROM notes")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (path, title) = row?;
                if let Some((source, _)) = virtual_note_parts(&path) {
                    valid.insert(format!(
                        "{}#{}",
                        crate::models::file_stem(source),
                        title
                    ));
                }
                valid.insert(path);
                valid.insert(title);
            }
        }

        Ok(suggestions
            .into_iter()
            .filter(|suggestion| {
                let ok = suggestion
                    .notes
                    .iter()
                    .all(|reference| valid.contains(reference));
                if !ok {
                    tracing::debug!(
                        geist_id = %suggestion.geist_id,
                        "dropping suggestion with unresolved note reference"
                    );
                }
                ok
            })
            .collect())
    }

    /// Drop suggestions too similar to those emitted inside the novelty
    /// window, by embedding similarity or exact text match.
    pub fn filter_novelty(
        &self,
        suggestions: Vec<Suggestion>,
        session_date: NaiveDate,
    ) -> Result<Vec<Suggestion>> {
        if !self.config.novelty_enabled {
            return Ok(suggestions);
        }

        let cutoff = session_date - Duration::days(self.config.novelty_window_days);
        let recent_texts: Vec<String> = {
            let conn = self.db.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT DISTINCT suggestion_text FROM session_suggestions
                 WHERE session_date >= ?1",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![cutoff.format("%Y-%m-%d").to_string()],
                |row| row.get::<_, String>(0),
            )?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        if recent_texts.is_empty() {
            return Ok(suggestions);
        }

        match self.config.novelty_method {
            NoveltyMethod::TextMatch => {
                let recent: HashSet<&str> = recent_texts.iter().map(String::as_str).collect();
                Ok(suggestions
                    .into_iter()
                    .filter(|s| !recent.contains(s.text.as_str()))
                    .collect())
            }
            NoveltyMethod::EmbeddingSimilarity => {
                let recent_embeddings = self.embedder.encode_batch(&recent_texts)?;
                let texts: Vec<String> = suggestions.iter().map(|s| s.text.clone()).collect();
                let new_embeddings = self.embedder.encode_batch(&texts)?;

                let mut kept = Vec::with_capacity(suggestions.len());
                for (suggestion, embedding) in suggestions.into_iter().zip(new_embeddings) {
                    let mut novel = true;
                    for recent in &recent_embeddings {
                        let similarity = cosine_similarity(&embedding, recent)
                            .map_err(|e| FilterError::Vector(e.to_string()))?;
                        if similarity >= self.config.novelty_threshold {
                            novel = false;
                            break;
                        }
                    }
                    if novel {
                        kept.push(suggestion);
                    }
                }
                Ok(kept)
            }
        }
    }

    /// Within the batch, keep the first of any pair of suggestions whose
    /// semantic similarity reaches the threshold.
    pub fn filter_diversity(&self, suggestions: Vec<Suggestion>) -> Result<Vec<Suggestion>> {
        if !self.config.diversity_enabled || suggestions.is_empty() {
            return Ok(suggestions);
        }

        let texts: Vec<String> = suggestions.iter().map(|s| s.text.clone()).collect();
        let embeddings = self.embedder.encode_batch(&texts)?;

        let mut keep = vec![true; suggestions.len()];
        for i in 0..suggestions.len() {
            if !keep[i] {
                continue;
            }
            for j in i + 1..suggestions.len() {
                if !keep[j] {
                    continue;
                }
                let similarity = cosine_similarity(&embeddings[i], &embeddings[j])
                    .map_err(|e| FilterError::Vector(e.to_string()))?;
                if similarity >= self.config.diversity_threshold {
                    keep[j] = false;
                }
            }
        }

        Ok(suggestions
            .into_iter()
            .zip(keep)
            .filter_map(|(suggestion, kept)| kept.then_some(suggestion))
            .collect())
    }

    /// Enforce length bounds, reject batch repeats, and require a non-empty
    /// geist id and note list.
    pub fn filter_quality(&self, suggestions: Vec<Suggestion>) -> Vec<Suggestion> {
        if !self.config.quality_enabled {
            return suggestions;
        }

        let mut seen_texts: HashSet<String> = HashSet::new();
        suggestions
            .into_iter()
            .filter(|suggestion| {
                let text = suggestion.text.trim();
                if text.len() < self.config.min_length || text.len() > self.config.max_length {
                    return false;
                }
                if self.config.check_repetition && !seen_texts.insert(text.to_string()) {
                    return false;
                }
                !suggestion.geist_id.is_empty() && !suggestion.notes.is_empty()
            })
            .collect()
    }
}

/// Select the final output from a filtered batch.
///
/// `Full` mode returns everything; the default mode deterministically
/// samples `count` suggestions with a seeded RNG when the batch is larger.
pub fn select_suggestions(
    filtered: Vec<Suggestion>,
    mode: SelectionMode,
    count: usize,
    seed: u64,
) -> Vec<Suggestion> {
    match mode {
        SelectionMode::Full => filtered,
        SelectionMode::Default => {
            if filtered.len() <= count {
                return filtered;
            }
            let mut rng = StdRng::seed_from_u64(seed);
            rand::seq::index::sample(&mut rng, filtered.len(), count)
                .iter()
                .map(|i| filtered[i].clone())
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::test_support::HashingEmbedder;
    use crate::vault::Vault;
    use tempfile::TempDir;

    fn suggestion(text: &str, notes: &[&str], geist: &str) -> Suggestion {
        Suggestion::new(text, notes.iter().map(|n| n.to_string()).collect(), geist)
    }

    fn filter_over(vault: &Vault, config: FilterConfig) -> SuggestionFilter {
        SuggestionFilter::new(vault.db(), Arc::new(HashingEmbedder::new()), config)
    }

    fn vault_with_notes(dir: &TempDir, notes: &[(&str, &str)]) -> Vault {
        for (rel, content) in notes {
            crate::test_support::write_note(dir.path(), rel, content);
        }
        let vault = Vault::open(dir.path(), None, &Config::default()).unwrap();
        vault.sync(&Config::default()).unwrap();
        vault
    }

    #[test]
    fn boundary_drops_unknown_references() {
        let dir = TempDir::new().unwrap();
        let vault = vault_with_notes(&dir, &[("alpha.md", "# Alpha\nbody")]);
        let filter = filter_over(&vault, FilterConfig::default());

        let kept = filter
            .filter_boundary(vec![
                suggestion("Look at this pairing of ideas.", &["Alpha"], "g"),
                suggestion("Check the full path version.", &["alpha.md"], "g"),
                suggestion("This one points nowhere real.", &["Ghost"], "g"),
            ])
            .unwrap();

        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn boundary_accepts_virtual_obsidian_links() {
        let dir = TempDir::new().unwrap();
        let vault = vault_with_notes(
            &dir,
            &[(
                "Journal.md",
                "## 2025-01-15\nMorning words.\n## 2025-01-16\nEvening words.",
            )],
        );
        let filter = filter_over(&vault, FilterConfig::default());

        let kept = filter
            .filter_boundary(vec![suggestion(
                "Return to that journal morning.",
                &["Journal#2025-01-15"],
                "g",
            )])
            .unwrap();
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn novelty_drops_repeats_from_history() {
        let dir = TempDir::new().unwrap();
        let vault = vault_with_notes(&dir, &[("a.md", "body")]);
        let date = NaiveDate::from_ymd_opt(2025, 2, 15).unwrap();

        // History from 30 days ago, inside the 60-day window
        vault
            .record_suggestions(
                date - Duration::days(30),
                &[suggestion(
                    "Consider linking Alpha and Beta.",
                    &["Alpha"],
                    "old",
                )],
            )
            .unwrap();

        let filter = filter_over(&vault, FilterConfig::default());
        let kept = filter
            .filter_novelty(
                vec![
                    suggestion("Consider linking Alpha and Beta.", &["Alpha"], "new"),
                    suggestion("Something about entirely different topics.", &["Alpha"], "new"),
                ],
                date,
            )
            .unwrap();

        assert_eq!(kept.len(), 1);
        assert!(kept[0].text.contains("different topics"));
    }

    #[test]
    fn novelty_ignores_history_outside_window() {
        let dir = TempDir::new().unwrap();
        let vault = vault_with_notes(&dir, &[("a.md", "body")]);
        let date = NaiveDate::from_ymd_opt(2025, 2, 15).unwrap();

        vault
            .record_suggestions(
                date - Duration::days(90),
                &[suggestion("Consider linking Alpha and Beta.", &["Alpha"], "old")],
            )
            .unwrap();

        let filter = filter_over(&vault, FilterConfig::default());
        let kept = filter
            .filter_novelty(
                vec![suggestion("Consider linking Alpha and Beta.", &["Alpha"], "new")],
                date,
            )
            .unwrap();
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn text_match_novelty_uses_exact_equality() {
        let dir = TempDir::new().unwrap();
        let vault = vault_with_notes(&dir, &[("a.md", "body")]);
        let date = NaiveDate::from_ymd_opt(2025, 2, 15).unwrap();
        vault
            .record_suggestions(
                date - Duration::days(5),
                &[suggestion("Exactly this sentence.", &["a.md"], "old")],
            )
            .unwrap();

        let config = FilterConfig {
            novelty_method: NoveltyMethod::TextMatch,
            ..Default::default()
        };
        let filter = filter_over(&vault, config);
        let kept = filter
            .filter_novelty(
                vec![
                    suggestion("Exactly this sentence.", &["a.md"], "new"),
                    suggestion("Exactly this sentence, almost.", &["a.md"], "new"),
                ],
                date,
            )
            .unwrap();
        assert_eq!(kept.len(), 1);
        assert!(kept[0].text.ends_with("almost."));
    }

    #[test]
    fn diversity_keeps_first_of_similar_pair() {
        let dir = TempDir::new().unwrap();
        let vault = vault_with_notes(&dir, &[("a.md", "body")]);
        let filter = filter_over(&vault, FilterConfig::default());

        let kept = filter
            .filter_diversity(vec![
                suggestion("identical words here", &["a.md"], "g1"),
                suggestion("identical words here", &["a.md"], "g2"),
                suggestion("an utterly unrelated sentence", &["a.md"], "g3"),
            ])
            .unwrap();

        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].geist_id, "g1");
        assert_eq!(kept[1].geist_id, "g3");
    }

    #[test]
    fn quality_enforces_length_structure_and_repeats() {
        let dir = TempDir::new().unwrap();
        let vault = vault_with_notes(&dir, &[("a.md", "body")]);
        let filter = filter_over(&vault, FilterConfig::default());

        let long_text = "x".repeat(2001);
        let kept = filter.filter_quality(vec![
            suggestion("too short", &["a.md"], "g"),
            suggestion(&long_text, &["a.md"], "g"),
            suggestion("This one is fine and long enough.", &["a.md"], "g"),
            suggestion("This one is fine and long enough.", &["a.md"], "g"),
            suggestion("No geist id on this suggestion.", &["a.md"], ""),
            suggestion("No note references on this one at all.", &[], "g"),
        ]);

        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].text, "This one is fine and long enough.");
    }

    #[test]
    fn filter_all_never_grows_its_input() {
        let dir = TempDir::new().unwrap();
        let vault = vault_with_notes(&dir, &[("alpha.md", "# Alpha\nbody")]);
        let filter = filter_over(&vault, FilterConfig::default());
        let date = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();

        let batch = vec![
            suggestion("A suggestion about [[Alpha]] worth keeping.", &["Alpha"], "g"),
            suggestion("Mystery reference.", &["Ghost"], "g"),
        ];
        let input_len = batch.len();
        let output = filter.filter_all(batch, date).unwrap();
        assert!(output.len() <= input_len);
    }

    #[test]
    fn selection_full_returns_everything() {
        let batch: Vec<Suggestion> = (0..10)
            .map(|i| suggestion(&format!("Suggestion {i}"), &["a"], "g"))
            .collect();
        let selected = select_suggestions(batch.clone(), SelectionMode::Full, 3, 1);
        assert_eq!(selected.len(), 10);
    }

    #[test]
    fn selection_default_samples_deterministically() {
        let batch: Vec<Suggestion> = (0..10)
            .map(|i| suggestion(&format!("Suggestion {i}"), &["a"], "g"))
            .collect();

        let first = select_suggestions(batch.clone(), SelectionMode::Default, 3, 99);
        let second = select_suggestions(batch.clone(), SelectionMode::Default, 3, 99);
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);

        let small = select_suggestions(batch[..2].to_vec(), SelectionMode::Default, 3, 99);
        assert_eq!(small.len(), 2);
    }
}
