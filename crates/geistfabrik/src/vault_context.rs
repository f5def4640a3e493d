//! VaultContext: the memoised, session-scoped analytic surface geists see.
//!
//! Wraps a vault and session with semantic search, graph operations,
//! metadata access, and deterministic randomness. All caches live for one
//! session and are guarded by mutexes so the context can be shared with the
//! worker thread that enforces geist timeouts.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{Datelike, NaiveDate};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rusqlite::params;
use semantic_embeddings::cosine_similarity;
use thiserror::Error;

use crate::embeddings::{EmbeddingError, Session};
use crate::function_registry::{FunctionArg, FunctionRegistry, FunctionValue, RegistryError, VaultFn};
use crate::metadata::{MetadataError, MetadataLoader, MetadataMap};
use crate::models::{Link, Note};
use crate::vault::{Vault, VaultError};
use crate::vector_search::{BackendError, VectorSearchBackend};

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("vector error: {0}")]
    Vector(String),
}

pub type Result<T> = std::result::Result<T, ContextError>;

/// Rich execution context for geists.
pub struct VaultContext {
    vault: Arc<Vault>,
    session: Session,
    backend: Box<dyn VectorSearchBackend>,
    seed: u64,
    rng: Mutex<StdRng>,
    registry: Mutex<FunctionRegistry>,
    metadata_loader: Option<MetadataLoader>,

    notes_cache: Mutex<Option<Arc<Vec<Note>>>>,
    neighbour_cache: Mutex<HashMap<(String, usize), Vec<(Note, f32)>>>,
    similarity_cache: Mutex<HashMap<(String, String), f32>>,
    backlink_cache: Mutex<HashMap<String, Vec<Note>>>,
    outgoing_cache: Mutex<HashMap<String, Vec<Note>>>,
    graph_cache: Mutex<HashMap<String, Vec<Note>>>,
    metadata_cache: Mutex<HashMap<String, MetadataMap>>,
}

impl VaultContext {
    /// Build the context for a session, loading the backend's vectors.
    ///
    /// When `seed` is `None` it derives from the session date as
    /// `YYYYMMDD`, so the same vault on the same date produces identical
    /// outputs.
    pub fn new(
        vault: Arc<Vault>,
        session: Session,
        mut backend: Box<dyn VectorSearchBackend>,
        seed: Option<u64>,
        registry: FunctionRegistry,
        metadata_loader: Option<MetadataLoader>,
    ) -> Result<Self> {
        backend.load_embeddings(session.date())?;
        let seed = seed.unwrap_or_else(|| date_seed(session.date()));

        Ok(Self {
            vault,
            session,
            backend,
            seed,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            registry: Mutex::new(registry),
            metadata_loader,
            notes_cache: Mutex::new(None),
            neighbour_cache: Mutex::new(HashMap::new()),
            similarity_cache: Mutex::new(HashMap::new()),
            backlink_cache: Mutex::new(HashMap::new()),
            outgoing_cache: Mutex::new(HashMap::new()),
            graph_cache: Mutex::new(HashMap::new()),
            metadata_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_date(&self) -> NaiveDate {
        self.session.date()
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    // --- Direct vault access ---

    /// All notes in the vault. Loaded once per session.
    pub fn notes(&self) -> Result<Vec<Note>> {
        Ok(self.notes_arc()?.as_ref().clone())
    }

    fn notes_arc(&self) -> Result<Arc<Vec<Note>>> {
        let mut cache = self.notes_cache.lock().unwrap();
        if let Some(notes) = cache.as_ref() {
            return Ok(Arc::clone(notes));
        }
        let notes = Arc::new(self.vault.all_notes()?);
        *cache = Some(Arc::clone(&notes));
        Ok(notes)
    }

    /// Exact-path lookup.
    pub fn get_note(&self, path: &str) -> Result<Option<Note>> {
        Ok(self.vault.get_note(path)?)
    }

    // --- Semantic search ---

    /// Up to `k` notes most similar to `note`, excluding itself.
    pub fn neighbours(&self, note: &Note, k: usize) -> Result<Vec<Note>> {
        Ok(self
            .neighbours_with_scores(note, k)?
            .into_iter()
            .map(|(neighbour, _)| neighbour)
            .collect())
    }

    /// Like `neighbours`, returning the cosine score alongside each note so
    /// callers don't re-pay the similarity cost.
    pub fn neighbours_with_scores(&self, note: &Note, k: usize) -> Result<Vec<(Note, f32)>> {
        let key = (note.path.clone(), k);
        if let Some(hit) = self.neighbour_cache.lock().unwrap().get(&key) {
            return Ok(hit.clone());
        }

        let query = match self.backend.get_embedding(&note.path) {
            Ok(query) => query,
            // A note without a session vector has no neighbours
            Err(BackendError::NotFound(_)) => {
                self.neighbour_cache.lock().unwrap().insert(key, vec![]);
                return Ok(vec![]);
            }
            Err(e) => return Err(e.into()),
        };

        let hits = self.backend.find_similar(&query, k + 1)?;
        let mut result = Vec::with_capacity(k);
        for (path, score) in hits {
            if path == note.path {
                continue;
            }
            if result.len() >= k {
                break;
            }
            if let Some(neighbour) = self.get_note(&path)? {
                result.push((neighbour, score));
            }
        }

        self.neighbour_cache
            .lock()
            .unwrap()
            .insert(key, result.clone());
        Ok(result)
    }

    /// Cosine similarity of two notes' session vectors. Cached by the
    /// unordered pair of paths.
    pub fn similarity(&self, a: &Note, b: &Note) -> Result<f32> {
        let key = if a.path <= b.path {
            (a.path.clone(), b.path.clone())
        } else {
            (b.path.clone(), a.path.clone())
        };

        if let Some(cached) = self.similarity_cache.lock().unwrap().get(&key) {
            return Ok(*cached);
        }

        let similarity = self.backend.get_similarity(&a.path, &b.path)?;
        self.similarity_cache
            .lock()
            .unwrap()
            .insert(key, similarity);
        Ok(similarity)
    }

    // --- Graph operations ---

    /// Notes whose stored link target matches this note's path, its path
    /// without extension, or its title.
    pub fn backlinks(&self, note: &Note) -> Result<Vec<Note>> {
        if let Some(cached) = self.backlink_cache.lock().unwrap().get(&note.path) {
            return Ok(cached.clone());
        }

        let sources: Vec<String> = {
            let db = self.vault.db();
            let conn = db.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT DISTINCT source_path FROM links
                 WHERE target = ?1 OR target = ?2 OR target = ?3
                 ORDER BY source_path",
            )?;
            let rows = stmt.query_map(
                params![note.path, path_without_extension(&note.path), note.title],
                |row| row.get::<_, String>(0),
            )?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut result = Vec::new();
        for source in sources {
            if let Some(source_note) = self.get_note(&source)? {
                result.push(source_note);
            }
        }

        self.backlink_cache
            .lock()
            .unwrap()
            .insert(note.path.clone(), result.clone());
        Ok(result)
    }

    /// Resolve this note's outgoing links to notes, deduplicated by path,
    /// source order preserved. Unresolvable targets are dropped.
    pub fn outgoing_links(&self, note: &Note) -> Result<Vec<Note>> {
        if let Some(cached) = self.outgoing_cache.lock().unwrap().get(&note.path) {
            return Ok(cached.clone());
        }

        let mut seen = HashSet::new();
        let mut result = Vec::new();
        for link in &note.links {
            if let Some(target) = self.vault.resolve_link_target(&link.target)? {
                if seen.insert(target.path.clone()) {
                    result.push(target);
                }
            }
        }

        self.outgoing_cache
            .lock()
            .unwrap()
            .insert(note.path.clone(), result.clone());
        Ok(result)
    }

    /// Union of backlinks and outgoing links (the link graph treated as
    /// undirected), deduplicated by path.
    pub fn graph_neighbors(&self, note: &Note) -> Result<Vec<Note>> {
        if let Some(cached) = self.graph_cache.lock().unwrap().get(&note.path) {
            return Ok(cached.clone());
        }

        let mut seen = HashSet::new();
        let mut result = Vec::new();
        for neighbour in self
            .backlinks(note)?
            .into_iter()
            .chain(self.outgoing_links(note)?)
        {
            if seen.insert(neighbour.path.clone()) {
                result.push(neighbour);
            }
        }

        self.graph_cache
            .lock()
            .unwrap()
            .insert(note.path.clone(), result.clone());
        Ok(result)
    }

    /// Notes with no outgoing links and no incoming resolved links, most
    /// recently modified first.
    pub fn orphans(&self, k: Option<usize>) -> Result<Vec<Note>> {
        let paths: Vec<String> = {
            let db = self.vault.db();
            let conn = db.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT n.path FROM notes n
                 WHERE NOT EXISTS (
                         SELECT 1 FROM links l WHERE l.source_path = n.path)
                   AND NOT EXISTS (
                         SELECT 1 FROM links l
                          WHERE l.target = n.path
                             OR l.target || '.md' = n.path
                             OR l.target = n.title)
                 ORDER BY n.modified DESC
                 LIMIT ?1",
            )?;
            let limit = k.map(|k| k as i64).unwrap_or(-1);
            let rows = stmt.query_map(params![limit], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        self.notes_for_paths(&paths)
    }

    /// Most-linked-to notes, by incoming resolved link count descending.
    pub fn hubs(&self, k: usize) -> Result<Vec<Note>> {
        let paths: Vec<String> = {
            let db = self.vault.db();
            let conn = db.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT n.path FROM links l
                 JOIN notes n
                   ON l.target = n.path
                   OR l.target || '.md' = n.path
                   OR l.target = n.title
                 GROUP BY n.path
                 ORDER BY COUNT(*) DESC, n.path
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![k as i64], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        self.notes_for_paths(&paths)
    }

    /// Top-`k` note pairs with the highest similarity and no direct link in
    /// either direction.
    pub fn unlinked_pairs(&self, k: usize) -> Result<Vec<(Note, Note)>> {
        let notes = self.notes_arc()?;

        let mut embeddings: HashMap<&str, Vec<f32>> = HashMap::new();
        for note in notes.iter() {
            match self.backend.get_embedding(&note.path) {
                Ok(embedding) => {
                    embeddings.insert(note.path.as_str(), embedding);
                }
                Err(BackendError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
        for i in 0..notes.len() {
            let Some(embedding_a) = embeddings.get(notes[i].path.as_str()) else {
                continue;
            };
            for j in i + 1..notes.len() {
                let Some(embedding_b) = embeddings.get(notes[j].path.as_str()) else {
                    continue;
                };
                if !self.links_between(&notes[i], &notes[j]).is_empty() {
                    continue;
                }
                let sim = cosine_similarity(embedding_a, embedding_b)
                    .map_err(|e| ContextError::Vector(e.to_string()))?;
                pairs.push((i, j, sim));
            }
        }

        pairs.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        Ok(pairs
            .into_iter()
            .take(k)
            .map(|(i, j, _)| (notes[i].clone(), notes[j].clone()))
            .collect())
    }

    /// All links between two notes, in either direction, matching targets
    /// against path, path without extension, and title.
    pub fn links_between(&self, a: &Note, b: &Note) -> Vec<Link> {
        let matches = |target: &str, note: &Note| {
            target == note.path
                || target == path_without_extension(&note.path)
                || target == note.title
        };

        let mut links: Vec<Link> = a
            .links
            .iter()
            .filter(|link| matches(&link.target, b))
            .cloned()
            .collect();
        links.extend(
            b.links
                .iter()
                .filter(|link| matches(&link.target, a))
                .cloned(),
        );
        links
    }

    // --- Temporal queries ---

    /// Least recently modified notes.
    pub fn old_notes(&self, k: usize) -> Result<Vec<Note>> {
        self.notes_by_modified(k, "ASC")
    }

    /// Most recently modified notes.
    pub fn recent_notes(&self, k: usize) -> Result<Vec<Note>> {
        self.notes_by_modified(k, "DESC")
    }

    fn notes_by_modified(&self, k: usize, order: &str) -> Result<Vec<Note>> {
        let paths: Vec<String> = {
            let db = self.vault.db();
            let conn = db.lock().unwrap();
            let mut stmt = conn.prepare(&format!(
                "SELECT path FROM notes ORDER BY modified {order}, path LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![k as i64], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        self.notes_for_paths(&paths)
    }

    /// Resolve stored paths to notes in one batch through the session's
    /// notes cache, preserving input order.
    fn notes_for_paths(&self, paths: &[String]) -> Result<Vec<Note>> {
        let notes = self.notes_arc()?;
        let by_path: HashMap<&str, &Note> =
            notes.iter().map(|note| (note.path.as_str(), note)).collect();
        Ok(paths
            .iter()
            .filter_map(|path| by_path.get(path.as_str()).map(|note| (*note).clone()))
            .collect())
    }

    // --- Metadata ---

    /// Built-in attributes plus the output of registered metadata modules.
    /// Cached per note for the session's lifetime.
    pub fn metadata(&self, note: &Note) -> Result<MetadataMap> {
        if let Some(cached) = self.metadata_cache.lock().unwrap().get(&note.path) {
            return Ok(cached.clone());
        }

        let mut map = MetadataMap::new();
        map.insert(
            "word_count".to_string(),
            serde_json::Value::from(note.content.split_whitespace().count()),
        );
        map.insert(
            "link_count".to_string(),
            serde_json::Value::from(note.links.len()),
        );
        map.insert(
            "tag_count".to_string(),
            serde_json::Value::from(note.tags.len()),
        );
        // Age measured against the session date keeps runs reproducible
        let age_days = (self.session.date() - note.created.date()).num_days();
        map.insert("age_days".to_string(), serde_json::Value::from(age_days));

        if let Some(loader) = &self.metadata_loader {
            loader.infer_all(note, self, &mut map)?;
        }

        self.metadata_cache
            .lock()
            .unwrap()
            .insert(note.path.clone(), map.clone());
        Ok(map)
    }

    // --- Deterministic sampling ---

    /// Deterministically sample `k` items using the session RNG. The RNG
    /// advances, so consecutive calls at one session date differ while two
    /// runs at the same date produce the same sequence.
    pub fn sample<T: Clone>(&self, items: &[T], k: usize) -> Vec<T> {
        if k >= items.len() {
            return items.to_vec();
        }
        let mut rng = self.rng.lock().unwrap();
        rand::seq::index::sample(&mut *rng, items.len(), k)
            .iter()
            .map(|i| items[i].clone())
            .collect()
    }

    /// Sample `k` random notes.
    pub fn random_notes(&self, k: usize) -> Result<Vec<Note>> {
        let notes = self.notes()?;
        Ok(self.sample(&notes, k))
    }

    // --- Host functions ---

    /// Register a vault function for this session.
    pub fn register_function(&self, name: &str, function: VaultFn) -> Result<()> {
        self.registry.lock().unwrap().register(name, function)?;
        Ok(())
    }

    /// Call a registered vault function by name.
    pub fn call_function(&self, name: &str, args: &[FunctionArg]) -> Result<FunctionValue> {
        let function = {
            let registry = self.registry.lock().unwrap();
            registry
                .get(name)
                .ok_or_else(|| RegistryError::Unknown(name.to_string()))?
            // guard dropped here so functions may recurse into call_function
        };
        Ok(function(self, args)?)
    }

    /// Sorted names of all registered functions.
    pub fn function_names(&self) -> Vec<String> {
        self.registry.lock().unwrap().names()
    }

    /// Drop all session caches. For tests.
    pub fn clear_caches(&self) {
        *self.notes_cache.lock().unwrap() = None;
        self.neighbour_cache.lock().unwrap().clear();
        self.similarity_cache.lock().unwrap().clear();
        self.backlink_cache.lock().unwrap().clear();
        self.outgoing_cache.lock().unwrap().clear();
        self.graph_cache.lock().unwrap().clear();
        self.metadata_cache.lock().unwrap().clear();
    }
}

/// Seed derived from a session date: 2025-01-15 -> 20250115.
fn date_seed(date: NaiveDate) -> u64 {
    date.year() as u64 * 10_000 + date.month() as u64 * 100 + date.day() as u64
}

fn path_without_extension(path: &str) -> String {
    match path.rsplit_once('.') {
        Some((stem, _)) => stem.to_string(),
        None => path.to_string(),
    }
}
