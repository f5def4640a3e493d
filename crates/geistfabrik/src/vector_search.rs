//! Pluggable vector similarity search backends.
//!
//! Two implementations share one contract: an in-memory cosine scan and a
//! sqlite-vec `vec0` index. On identical session vectors they must agree
//! within a small numerical epsilon.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDate;
use rusqlite::params;
use semantic_embeddings::cosine_similarity;
use thiserror::Error;

use crate::embeddings::{TOTAL_DIM, blob_to_vector, vector_to_blob};
use crate::vault::Db;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("note not found in vector index: {0}")]
    NotFound(String),

    #[error("sqlite-vec extension unavailable: {0}")]
    ExtensionUnavailable(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("vector error: {0}")]
    Vector(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Contract shared by all vector search backends.
///
/// Cosine similarity is the canonical metric; scores lie in [-1, 1].
/// Missing paths are a `NotFound` error, never a silent zero.
pub trait VectorSearchBackend: Send + Sync {
    /// Load the session vectors for the given date. A date with no session
    /// yields an empty index.
    fn load_embeddings(&mut self, session_date: NaiveDate) -> Result<()>;

    /// Find the `k` notes most similar to the query vector, sorted by
    /// similarity descending.
    fn find_similar(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>>;

    /// Cosine similarity between two notes' session vectors.
    fn get_similarity(&self, path_a: &str, path_b: &str) -> Result<f32>;

    /// Session vector for a note.
    fn get_embedding(&self, path: &str) -> Result<Vec<f32>>;
}

/// Register the sqlite-vec extension for every subsequently opened
/// connection. Must run before the vault's connection is opened.
pub fn install_vector_extension() -> Result<()> {
    static INSTALLED: AtomicBool = AtomicBool::new(false);
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    // SAFETY: sqlite3_vec_init has the init-function signature
    // sqlite3_auto_extension expects; registration happens once, before any
    // connection that relies on it is opened.
    unsafe {
        let rc = rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute::<
            *const (),
            unsafe extern "C" fn(
                *mut rusqlite::ffi::sqlite3,
                *mut *mut std::os::raw::c_char,
                *const rusqlite::ffi::sqlite3_api_routines,
            ) -> std::os::raw::c_int,
        >(
            sqlite_vec::sqlite3_vec_init as *const ()
        )));
        if rc != rusqlite::ffi::SQLITE_OK {
            INSTALLED.store(false, Ordering::SeqCst);
            return Err(BackendError::ExtensionUnavailable(format!(
                "sqlite3_auto_extension returned {rc}"
            )));
        }
    }
    Ok(())
}

fn session_id_for_date(
    conn: &rusqlite::Connection,
    session_date: NaiveDate,
) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT session_id FROM sessions WHERE date = ?1",
        params![session_date.format("%Y-%m-%d").to_string()],
        |row| row.get(0),
    )
    .map(Some)
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    })
}

/// In-memory vector search over a linear cosine scan.
///
/// Loads all session vectors eagerly; fast enough for small and medium
/// vaults, and the reference behaviour the indexed backend must match.
pub struct InMemoryVectorBackend {
    db: Db,
    embeddings: HashMap<String, Vec<f32>>,
}

impl InMemoryVectorBackend {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            embeddings: HashMap::new(),
        }
    }

    /// Number of vectors currently loaded.
    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

impl VectorSearchBackend for InMemoryVectorBackend {
    fn load_embeddings(&mut self, session_date: NaiveDate) -> Result<()> {
        self.embeddings.clear();

        let conn = self.db.lock().unwrap();
        let Some(session_id) = session_id_for_date(&conn, session_date)? else {
            return Ok(());
        };

        let mut stmt = conn.prepare(
            "SELECT note_path, embedding FROM session_embeddings WHERE session_id = ?1",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        for row in rows {
            let (path, blob) = row?;
            self.embeddings.insert(path, blob_to_vector(&blob));
        }
        Ok(())
    }

    fn find_similar(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        let mut similarities: Vec<(String, f32)> = self
            .embeddings
            .iter()
            .map(|(path, embedding)| {
                cosine_similarity(query, embedding)
                    .map(|sim| (path.clone(), sim))
                    .map_err(|e| BackendError::Vector(e.to_string()))
            })
            .collect::<Result<_>>()?;

        similarities.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        similarities.truncate(k);
        Ok(similarities)
    }

    fn get_similarity(&self, path_a: &str, path_b: &str) -> Result<f32> {
        let a = self
            .embeddings
            .get(path_a)
            .ok_or_else(|| BackendError::NotFound(path_a.to_string()))?;
        let b = self
            .embeddings
            .get(path_b)
            .ok_or_else(|| BackendError::NotFound(path_b.to_string()))?;
        cosine_similarity(a, b).map_err(|e| BackendError::Vector(e.to_string()))
    }

    fn get_embedding(&self, path: &str) -> Result<Vec<f32>> {
        self.embeddings
            .get(path)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(path.to_string()))
    }
}

/// Vector search through the sqlite-vec `vec0` virtual table.
///
/// Vectors are addressed by an integer id with a persistent path mapping
/// table; `find_similar` runs a cosine-distance MATCH query and converts
/// distances back to similarities.
pub struct SqliteVecBackend {
    db: Db,
    dim: usize,
    path_to_id: Mutex<HashMap<String, i64>>,
    id_to_path: Mutex<HashMap<i64, String>>,
}

impl SqliteVecBackend {
    /// Create the backend, setting up the virtual table.
    ///
    /// Fails with `ExtensionUnavailable` when the connection cannot see the
    /// sqlite-vec extension.
    pub fn new(db: Db) -> Result<Self> {
        Self::with_dim(db, TOTAL_DIM)
    }

    pub fn with_dim(db: Db, dim: usize) -> Result<Self> {
        {
            let conn = db.lock().unwrap();
            conn.query_row("SELECT vec_version()", [], |_| Ok(()))
                .map_err(|e| BackendError::ExtensionUnavailable(e.to_string()))?;

            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS vec_path_mapping (
                     vec_id INTEGER PRIMARY KEY AUTOINCREMENT,
                     note_path TEXT NOT NULL UNIQUE
                 );",
            )?;
            conn.execute_batch(&format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS vec_search USING vec0(
                     embedding float[{dim}] distance_metric=cosine
                 );"
            ))?;
        }

        Ok(Self {
            db,
            dim,
            path_to_id: Mutex::new(HashMap::new()),
            id_to_path: Mutex::new(HashMap::new()),
        })
    }

    fn get_or_create_vec_id(&self, conn: &rusqlite::Connection, path: &str) -> Result<i64> {
        if let Some(id) = self.path_to_id.lock().unwrap().get(path) {
            return Ok(*id);
        }

        let existing: Option<i64> = conn
            .query_row(
                "SELECT vec_id FROM vec_path_mapping WHERE note_path = ?1",
                params![path],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let vec_id = match existing {
            Some(id) => id,
            None => {
                conn.execute(
                    "INSERT INTO vec_path_mapping (note_path) VALUES (?1)",
                    params![path],
                )?;
                conn.last_insert_rowid()
            }
        };

        self.path_to_id
            .lock()
            .unwrap()
            .insert(path.to_string(), vec_id);
        self.id_to_path
            .lock()
            .unwrap()
            .insert(vec_id, path.to_string());
        Ok(vec_id)
    }

    fn path_for_vec_id(&self, conn: &rusqlite::Connection, vec_id: i64) -> Result<String> {
        if let Some(path) = self.id_to_path.lock().unwrap().get(&vec_id) {
            return Ok(path.clone());
        }

        let path: String = conn
            .query_row(
                "SELECT note_path FROM vec_path_mapping WHERE vec_id = ?1",
                params![vec_id],
                |row| row.get(0),
            )
            .map_err(|_| BackendError::NotFound(format!("vec_id {vec_id}")))?;

        self.path_to_id
            .lock()
            .unwrap()
            .insert(path.clone(), vec_id);
        self.id_to_path.lock().unwrap().insert(vec_id, path.clone());
        Ok(path)
    }

    fn vec_id_for_path(&self, conn: &rusqlite::Connection, path: &str) -> Result<i64> {
        if let Some(id) = self.path_to_id.lock().unwrap().get(path) {
            return Ok(*id);
        }

        let vec_id: i64 = conn
            .query_row(
                "SELECT vec_id FROM vec_path_mapping WHERE note_path = ?1",
                params![path],
                |row| row.get(0),
            )
            .map_err(|_| BackendError::NotFound(path.to_string()))?;

        self.path_to_id
            .lock()
            .unwrap()
            .insert(path.to_string(), vec_id);
        self.id_to_path
            .lock()
            .unwrap()
            .insert(vec_id, path.to_string());
        Ok(vec_id)
    }
}

impl VectorSearchBackend for SqliteVecBackend {
    fn load_embeddings(&mut self, session_date: NaiveDate) -> Result<()> {
        let conn = self.db.lock().unwrap();

        self.path_to_id.lock().unwrap().clear();
        self.id_to_path.lock().unwrap().clear();
        conn.execute("DELETE FROM vec_search", [])?;

        let Some(session_id) = session_id_for_date(&conn, session_date)? else {
            return Ok(());
        };

        let rows: Vec<(String, Vec<u8>)> = {
            let mut stmt = conn.prepare(
                "SELECT note_path, embedding FROM session_embeddings WHERE session_id = ?1",
            )?;
            let mapped = stmt.query_map(params![session_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            mapped.collect::<rusqlite::Result<_>>()?
        };

        let mut insert =
            conn.prepare("INSERT INTO vec_search (rowid, embedding) VALUES (?1, ?2)")?;
        for (path, blob) in rows {
            let vector = blob_to_vector(&blob);
            if vector.len() != self.dim {
                return Err(BackendError::Vector(format!(
                    "stored vector for {} has dim {}, index expects {}",
                    path,
                    vector.len(),
                    self.dim
                )));
            }
            let vec_id = self.get_or_create_vec_id(&conn, &path)?;
            insert.execute(params![vec_id, blob])?;
        }

        Ok(())
    }

    fn find_similar(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        let conn = self.db.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT rowid, distance FROM vec_search
             WHERE embedding MATCH ?1
             ORDER BY distance
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![vector_to_blob(query), k as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (vec_id, distance) = row?;
            // sqlite-vec reports cosine distance (1 - cosine similarity)
            let similarity = 1.0 - distance as f32;
            match self.path_for_vec_id(&conn, vec_id) {
                Ok(path) => results.push((path, similarity)),
                Err(BackendError::NotFound(_)) => continue,
                Err(other) => return Err(other),
            }
        }
        Ok(results)
    }

    fn get_similarity(&self, path_a: &str, path_b: &str) -> Result<f32> {
        let a = self.get_embedding(path_a)?;
        let b = self.get_embedding(path_b)?;
        cosine_similarity(&a, &b).map_err(|e| BackendError::Vector(e.to_string()))
    }

    fn get_embedding(&self, path: &str) -> Result<Vec<f32>> {
        let conn = self.db.lock().unwrap();
        let vec_id = self.vec_id_for_path(&conn, path)?;

        let blob: Vec<u8> = conn
            .query_row(
                "SELECT embedding FROM vec_search WHERE rowid = ?1",
                params![vec_id],
                |row| row.get(0),
            )
            .map_err(|_| BackendError::NotFound(path.to_string()))?;

        Ok(blob_to_vector(&blob))
    }
}
