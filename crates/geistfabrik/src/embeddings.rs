//! Embedding computation: content-hashed semantic cache plus per-session
//! temporal features, fused into 387-dimensional session vectors.

use std::collections::HashMap;
use std::f32::consts::PI;
use std::path::Path;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{Connection, params};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::Note;
use crate::vault::{Db, Vault, format_timestamp};

/// Dimension of semantic embeddings from the sentence transformer.
pub const SEMANTIC_DIM: usize = semantic_embeddings::EMBEDDING_DIM;

/// Dimension of the temporal feature vector: note age, creation season,
/// session season.
pub const TEMPORAL_DIM: usize = 3;

/// Total dimension of combined semantic + temporal session vectors.
pub const TOTAL_DIM: usize = SEMANTIC_DIM + TEMPORAL_DIM;

/// Fixed combination weights. Semantic similarity dominates; the temporal
/// tail nudges neighbours toward contemporaneous notes.
pub const SEMANTIC_WEIGHT: f32 = 0.9;
pub const TEMPORAL_WEIGHT: f32 = 1.0 - SEMANTIC_WEIGHT;

/// Notes encoded per model call when filling cache misses.
const EMBED_BATCH_SIZE: usize = 8;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("embedding model error: {0}")]
    Model(String),

    #[error("model returned a {got}-dim vector for {path:?}, expected {expected}")]
    Dimension {
        path: String,
        got: usize,
        expected: usize,
    },
}

pub type Result<T> = std::result::Result<T, EmbeddingError>;

/// The opaque `text -> R^384` model boundary.
///
/// The production implementation wraps the local MiniLM model; tests plug
/// in deterministic fakes.
pub trait TextEmbedder: Send + Sync {
    /// Model name, part of the semantic cache key. Changing the model
    /// invalidates every cached vector.
    fn name(&self) -> &str;

    /// Encode a batch of texts into `SEMANTIC_DIM`-dimensional vectors.
    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Encode a single text.
    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.encode_batch(std::slice::from_ref(&text.to_string()))?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::Model("model produced no embedding".to_string()))
    }
}

/// Production embedder backed by the local all-MiniLM-L6-v2 model.
pub struct MiniLmEmbedder {
    inner: semantic_embeddings::SemanticEmbeddings,
}

impl MiniLmEmbedder {
    /// Load the model from a directory containing `config.json`,
    /// `tokenizer.json`, and `model.safetensors`.
    pub fn from_model_dir(model_dir: &Path) -> Result<Self> {
        let inner = semantic_embeddings::SemanticEmbeddings::new();
        inner
            .load_model_from_dir(model_dir)
            .map_err(|e| EmbeddingError::Model(e.to_string()))?;
        Ok(Self { inner })
    }
}

impl TextEmbedder for MiniLmEmbedder {
    fn name(&self) -> &str {
        semantic_embeddings::MODEL_NAME
    }

    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.inner
            .encode_batch(texts)
            .map_err(|e| EmbeddingError::Model(e.to_string()))
    }
}

/// SHA-256 hex digest of note content, the variable half of the cache key.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Cache key under which a semantic vector is stored.
pub fn cache_key(model_name: &str, content: &str) -> String {
    format!("{}:{}", model_name, content_hash(content))
}

/// Temporal features for a note at a given session date:
/// age in years, plus cyclical season encodings of the creation and
/// session days of year.
pub fn temporal_features(created: NaiveDateTime, session_date: NaiveDate) -> [f32; TEMPORAL_DIM] {
    let age_days = (session_date.and_time(chrono::NaiveTime::MIN) - created).num_days();
    let note_age = age_days as f32 / 365.0;

    let creation_doy = created.ordinal() as f32;
    let creation_season = (2.0 * PI * creation_doy / 365.0).sin();

    let session_doy = session_date.ordinal() as f32;
    let session_season = (2.0 * PI * session_doy / 365.0).sin();

    [note_age, creation_season, session_season]
}

/// Fuse a semantic vector with temporal features into one session vector.
pub fn fuse_embedding(semantic: &[f32], temporal: [f32; TEMPORAL_DIM]) -> Vec<f32> {
    let mut fused = Vec::with_capacity(semantic.len() + TEMPORAL_DIM);
    fused.extend(semantic.iter().map(|v| v * SEMANTIC_WEIGHT));
    fused.extend(temporal.iter().map(|v| v * TEMPORAL_WEIGHT));
    fused
}

/// Serialize a vector as raw little-endian f32 bytes.
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Decode a raw little-endian f32 blob back into a vector.
pub fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cache hit/miss tally for one `compute_embeddings` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddingStats {
    pub cached: usize,
    pub computed: usize,
}

/// A pipeline run for a given date, owning that day's session vectors.
pub struct Session {
    date: NaiveDate,
    session_id: i64,
    db: Db,
}

impl Session {
    /// Open the session for a date, creating its row on first use.
    /// Re-invoking on the same date reuses the same session id.
    pub fn new(date: NaiveDate, vault: &Vault) -> Result<Self> {
        let db = vault.db();
        let session_id = {
            let conn = db.lock().unwrap();
            get_or_create_session(&conn, date)?
        };
        Ok(Self {
            date,
            session_id,
            db,
        })
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn id(&self) -> i64 {
        self.session_id
    }

    /// Shared handle to the session's database.
    pub fn db(&self) -> Db {
        Db::clone(&self.db)
    }

    /// SHA-256 over the sorted sequence of `(path, modified)` pairs;
    /// detects vault drift between runs on the same date.
    pub fn vault_state_hash(notes: &[Note]) -> String {
        let mut sorted: Vec<&Note> = notes.iter().collect();
        sorted.sort_by(|a, b| a.path.cmp(&b.path));

        let mut hasher = Sha256::new();
        for note in sorted {
            hasher.update(note.path.as_bytes());
            hasher.update(format_timestamp(note.modified).as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Compute and store session vectors for all notes.
    ///
    /// Semantic vectors come from the content-hashed cache when available;
    /// only misses hit the model. Temporal features are recomputed every
    /// session. Existing rows for this session are replaced wholesale.
    pub fn compute_embeddings(
        &self,
        notes: &[Note],
        embedder: &dyn TextEmbedder,
    ) -> Result<EmbeddingStats> {
        let mut conn = self.db.lock().unwrap();
        let tx = conn.transaction()?;

        let vault_hash = Self::vault_state_hash(notes);
        tx.execute(
            "UPDATE sessions SET vault_state_hash = ?1 WHERE session_id = ?2",
            params![vault_hash, self.session_id],
        )?;

        tx.execute(
            "DELETE FROM session_embeddings WHERE session_id = ?1",
            params![self.session_id],
        )?;

        // Partition notes into cache hits and misses
        let mut semantic_by_path: HashMap<String, Vec<f32>> = HashMap::new();
        let mut misses: Vec<&Note> = Vec::new();

        {
            let mut stmt = tx.prepare(
                "SELECT embedding FROM embeddings WHERE note_path = ?1 AND model_version = ?2",
            )?;
            for note in notes {
                let key = cache_key(embedder.name(), &note.content);
                let cached: Option<Vec<u8>> = stmt
                    .query_map(params![note.path, key], |row| row.get(0))?
                    .next()
                    .transpose()?;
                match cached {
                    Some(blob) => {
                        semantic_by_path.insert(note.path.clone(), blob_to_vector(&blob));
                    }
                    None => misses.push(note),
                }
            }
        }

        let cached = semantic_by_path.len();
        let computed = misses.len();

        // Batch-encode the misses and refill the cache
        if !misses.is_empty() {
            let now = format_timestamp(Utc::now().naive_utc());
            let mut insert = tx.prepare(
                "INSERT OR REPLACE INTO embeddings (note_path, embedding, model_version, computed_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;

            for chunk in misses.chunks(EMBED_BATCH_SIZE) {
                let texts: Vec<String> = chunk.iter().map(|n| n.content.clone()).collect();
                let vectors = embedder.encode_batch(&texts)?;
                if vectors.len() != chunk.len() {
                    return Err(EmbeddingError::Model(format!(
                        "model returned {} vectors for {} texts",
                        vectors.len(),
                        chunk.len()
                    )));
                }

                for (note, vector) in chunk.iter().zip(vectors) {
                    if vector.len() != SEMANTIC_DIM {
                        return Err(EmbeddingError::Dimension {
                            path: note.path.clone(),
                            got: vector.len(),
                            expected: SEMANTIC_DIM,
                        });
                    }
                    insert.execute(params![
                        note.path,
                        vector_to_blob(&vector),
                        cache_key(embedder.name(), &note.content),
                        now,
                    ])?;
                    semantic_by_path.insert(note.path.clone(), vector);
                }
            }
        }

        // Fuse and store session vectors for every note
        {
            let mut insert = tx.prepare(
                "INSERT INTO session_embeddings (session_id, note_path, embedding)
                 VALUES (?1, ?2, ?3)",
            )?;
            for note in notes {
                let semantic = &semantic_by_path[&note.path];
                let temporal = temporal_features(note.created, self.date);
                let fused = fuse_embedding(semantic, temporal);
                insert.execute(params![self.session_id, note.path, vector_to_blob(&fused)])?;
            }
        }

        tx.commit()?;

        let stats = EmbeddingStats { cached, computed };
        let total = notes.len();
        let hit_rate = if total > 0 {
            cached as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        tracing::info!(cached, computed, total, hit_rate, "embedding cache");

        Ok(stats)
    }

    /// Session vector for one note, if present.
    pub fn get_embedding(&self, note_path: &str) -> Result<Option<Vec<f32>>> {
        let conn = self.db.lock().unwrap();
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT embedding FROM session_embeddings
                 WHERE session_id = ?1 AND note_path = ?2",
                params![self.session_id, note_path],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(blob.map(|b| blob_to_vector(&b)))
    }

    /// All session vectors, keyed by note path.
    pub fn all_embeddings(&self) -> Result<HashMap<String, Vec<f32>>> {
        let conn = self.db.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT note_path, embedding FROM session_embeddings WHERE session_id = ?1",
        )?;
        let rows = stmt.query_map(params![self.session_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut embeddings = HashMap::new();
        for row in rows {
            let (path, blob) = row?;
            embeddings.insert(path, blob_to_vector(&blob));
        }
        Ok(embeddings)
    }
}

fn get_or_create_session(conn: &Connection, date: NaiveDate) -> Result<i64> {
    let date_str = date.format("%Y-%m-%d").to_string();

    let existing: Option<i64> = conn
        .query_row(
            "SELECT session_id FROM sessions WHERE date = ?1",
            params![date_str],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    if let Some(session_id) = existing {
        return Ok(session_id);
    }

    conn.execute(
        "INSERT INTO sessions (date, created_at) VALUES (?1, ?2)",
        params![date_str, format_timestamp(Utc::now().naive_utc())],
    )?;
    Ok(conn.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    #[test]
    fn blob_roundtrip_preserves_floats() {
        let vector = vec![0.0_f32, 1.5, -2.25, f32::MIN_POSITIVE];
        let blob = vector_to_blob(&vector);
        assert_eq!(blob.len(), 16);
        assert_eq!(blob_to_vector(&blob), vector);
    }

    #[test]
    fn content_hash_is_stable_and_distinct() {
        assert_eq!(content_hash("hello"), content_hash("hello"));
        assert_ne!(content_hash("hello"), content_hash("world"));
        assert_eq!(content_hash("x").len(), 64);
    }

    #[test]
    fn cache_key_includes_model_name() {
        let key = cache_key("all-MiniLM-L6-v2", "text");
        assert!(key.starts_with("all-MiniLM-L6-v2:"));
        assert_ne!(key, cache_key("other-model", "text"));
    }

    #[test]
    fn temporal_features_encode_age_and_seasons() {
        let created = NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_time(NaiveTime::MIN);
        let session = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();

        let [age, creation_season, session_season] = temporal_features(created, session);
        assert!((age - 1.0).abs() < 0.01, "one year old, got {age}");
        // Same day of year, same season encoding
        assert!((creation_season - session_season).abs() < 1e-6);
    }

    #[test]
    fn fused_vectors_have_total_dim_and_scaled_parts() {
        let semantic = vec![1.0_f32; SEMANTIC_DIM];
        let fused = fuse_embedding(&semantic, [1.0, 0.5, -0.5]);

        assert_eq!(fused.len(), TOTAL_DIM);
        assert!((fused[0] - SEMANTIC_WEIGHT).abs() < 1e-6);
        assert!((fused[SEMANTIC_DIM] - TEMPORAL_WEIGHT).abs() < 1e-6);
        assert!((fused[SEMANTIC_DIM + 2] + 0.5 * TEMPORAL_WEIGHT).abs() < 1e-6);
    }
}
