//! Vault: raw note data access and incremental SQLite sync.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{Connection, params};
use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;

use crate::config::{Config, VectorBackendKind};
use crate::date_collection::{is_date_collection, split_date_collection_note};
use crate::markdown::parse_markdown;
use crate::models::{Link, Note, Suggestion, virtual_note_parts};
use crate::schema::init_db;
use crate::vector_search::{BackendError, install_vector_extension};

/// Tolerance for file modification time comparison, absorbing filesystem
/// clock noise across sync runs.
const MTIME_TOLERANCE: f64 = 0.01;

/// Shared handle to the vault database connection.
///
/// The mutex lets a read-only `VaultContext` cross into the worker thread
/// that enforces geist timeouts.
pub type Db = Arc<Mutex<Connection>>;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault path does not exist: {0}")]
    MissingRoot(PathBuf),

    #[error("vault path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid date-collection glob: {0}")]
    Glob(#[from] globset::Error),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, VaultError>;

/// Raw vault data access and SQLite sync.
pub struct Vault {
    root: PathBuf,
    db: Db,
}

impl Vault {
    /// Open a vault directory with its database.
    ///
    /// A `None` database path uses an in-memory database. When the config
    /// selects the indexed vector backend, the sqlite-vec extension is
    /// registered before the connection opens, so backend construction can
    /// fail fast if the extension is unavailable.
    pub fn open(
        vault_path: impl AsRef<Path>,
        db_path: Option<&Path>,
        config: &Config,
    ) -> Result<Self> {
        let root = vault_path.as_ref().to_path_buf();
        if !root.exists() {
            return Err(VaultError::MissingRoot(root));
        }
        if !root.is_dir() {
            return Err(VaultError::NotADirectory(root));
        }

        if config.vector_backend == VectorBackendKind::Indexed {
            install_vector_extension()?;
        }

        if let Some(path) = db_path {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = init_db(db_path)?;
        Ok(Self {
            root,
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// The vault root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shared handle to the underlying database.
    pub fn db(&self) -> Db {
        Arc::clone(&self.db)
    }

    /// Incrementally update the database with changed files.
    ///
    /// Returns the number of files processed (new or modified). Files whose
    /// stored mtime matches within tolerance are skipped; files that
    /// disappeared from the walk are deleted (cascading to links and tags).
    /// Date-collection files are split into virtual notes instead of being
    /// stored whole.
    pub fn sync(&self, config: &Config) -> Result<usize> {
        let matcher = config.date_collection.matcher()?;
        let files = self.markdown_files();

        let mut conn = self.db.lock().unwrap();
        let tx = conn.transaction()?;
        let mut processed = 0usize;

        // Stored paths and mtimes, with virtual rows grouped by source file
        let mut stored_mtimes: HashMap<String, f64> = HashMap::new();
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        {
            let mut stmt = tx.prepare("SELECT path, file_mtime FROM notes")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?;
            for row in rows {
                let (path, mtime) = row?;
                if let Some((source, _)) = virtual_note_parts(&path) {
                    children.entry(source.to_string()).or_default().push(path.clone());
                }
                stored_mtimes.insert(path, mtime);
            }
        }

        // Paths that must survive the vanish sweep at the end
        let mut keep: HashSet<String> = HashSet::new();

        for (rel_path, abs_path) in &files {
            let metadata = match fs::metadata(abs_path) {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::warn!(file = %rel_path, error = %e, "skipping unreadable file");
                    keep_stored_rows(&mut keep, &children, rel_path);
                    continue;
                }
            };
            let file_mtime = mtime_seconds(&metadata);

            let known_mtime = stored_mtimes
                .get(rel_path.as_str())
                .or_else(|| children.get(rel_path.as_str()).and_then(|paths| {
                    paths.first().and_then(|p| stored_mtimes.get(p))
                }));
            if let Some(prev) = known_mtime {
                if (prev - file_mtime).abs() < MTIME_TOLERANCE {
                    // Unchanged: its stored rows (regular or virtual) stay
                    keep_stored_rows(&mut keep, &children, rel_path);
                    continue;
                }
            }

            let content = match fs::read_to_string(abs_path) {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!(file = %rel_path, error = %e, "skipping file");
                    keep_stored_rows(&mut keep, &children, rel_path);
                    continue;
                }
            };

            let modified = system_to_naive(metadata.modified()?);
            let created = metadata
                .created()
                .map(system_to_naive)
                .unwrap_or(modified);

            let split = config.date_collection.enabled
                && matcher.allows(rel_path)
                && is_date_collection(
                    &content,
                    config.date_collection.min_sections,
                    config.date_collection.threshold,
                );

            if split {
                let virtual_notes = split_date_collection_note(rel_path, &content, modified);
                for note in &virtual_notes {
                    upsert_note(&tx, note, file_mtime)?;
                    keep.insert(note.path.clone());
                }
                tracing::debug!(file = %rel_path, entries = virtual_notes.len(), "split date-collection");
            } else {
                let parsed = parse_markdown(rel_path, &content);
                let note = Note::regular(
                    rel_path.clone(),
                    parsed.title,
                    parsed.content,
                    parsed.links,
                    parsed.tags,
                    created,
                    modified,
                );
                upsert_note(&tx, &note, file_mtime)?;
                keep.insert(note.path);
            }

            processed += 1;
        }

        // Remove rows whose file (or source file) no longer exists
        for path in stored_mtimes.keys() {
            if !keep.contains(path) {
                tx.execute("DELETE FROM notes WHERE path = ?1", params![path])?;
            }
        }

        tx.commit()?;
        tracing::info!(processed, total_files = files.len(), "vault sync complete");
        Ok(processed)
    }

    /// All markdown files under the vault root, as (relative, absolute) pairs.
    ///
    /// Hidden directories are traversed like any other; excluding them is a
    /// collaborator concern.
    fn markdown_files(&self) -> Vec<(String, PathBuf)> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "walk error");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let rel = match path.strip_prefix(&self.root) {
                Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };
            files.push((rel, path.to_path_buf()));
        }
        files.sort();
        files
    }

    /// Load all notes from the database in one batched pass.
    pub fn all_notes(&self) -> Result<Vec<Note>> {
        let conn = self.db.lock().unwrap();

        let mut links_by_path: HashMap<String, Vec<Link>> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT source_path, target, display_text, is_embed, block_ref
                 FROM links ORDER BY rowid",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    Link {
                        target: row.get(1)?,
                        display_text: row.get(2)?,
                        is_embed: row.get::<_, i64>(3)? != 0,
                        block_ref: row.get(4)?,
                    },
                ))
            })?;
            for row in rows {
                let (source, link) = row?;
                links_by_path.entry(source).or_default().push(link);
            }
        }

        let mut tags_by_path: HashMap<String, Vec<String>> = HashMap::new();
        {
            let mut stmt =
                conn.prepare("SELECT note_path, tag FROM tags ORDER BY note_path, tag")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (path, tag) = row?;
                tags_by_path.entry(path).or_default().push(tag);
            }
        }

        let mut stmt = conn.prepare(
            "SELECT path, title, content, created, modified FROM notes ORDER BY path",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut notes = Vec::new();
        for row in rows {
            let (path, title, content, created, modified) = row?;
            let links = links_by_path.remove(&path).unwrap_or_default();
            let tags = tags_by_path.remove(&path).unwrap_or_default();
            notes.push(assemble_note(path, title, content, &created, &modified, links, tags)?);
        }

        Ok(notes)
    }

    /// Retrieve a specific note by path.
    pub fn get_note(&self, path: &str) -> Result<Option<Note>> {
        let conn = self.db.lock().unwrap();
        self.get_note_locked(&conn, path)
    }

    fn get_note_locked(&self, conn: &Connection, path: &str) -> Result<Option<Note>> {
        let mut stmt = conn.prepare(
            "SELECT path, title, content, created, modified FROM notes WHERE path = ?1",
        )?;
        let mut rows = stmt.query(params![path])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let path: String = row.get(0)?;
        let title: String = row.get(1)?;
        let content: String = row.get(2)?;
        let created: String = row.get(3)?;
        let modified: String = row.get(4)?;

        let mut link_stmt = conn.prepare(
            "SELECT target, display_text, is_embed, block_ref
             FROM links WHERE source_path = ?1 ORDER BY rowid",
        )?;
        let links = link_stmt
            .query_map(params![path], |row| {
                Ok(Link {
                    target: row.get(0)?,
                    display_text: row.get(1)?,
                    is_embed: row.get::<_, i64>(2)? != 0,
                    block_ref: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut tag_stmt =
            conn.prepare("SELECT tag FROM tags WHERE note_path = ?1 ORDER BY tag")?;
        let tags = tag_stmt
            .query_map(params![path], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Some(assemble_note(
            path, title, content, &created, &modified, links, tags,
        )?))
    }

    /// Resolve a wiki-link target to a note.
    ///
    /// Targets may reference notes by exact path, path without the `.md`
    /// extension, or title, tried in that order. Title matches are resolved
    /// in path order, so duplicate titles resolve deterministically to the
    /// first path.
    pub fn resolve_link_target(&self, target: &str) -> Result<Option<Note>> {
        let conn = self.db.lock().unwrap();

        if let Some(note) = self.get_note_locked(&conn, target)? {
            return Ok(Some(note));
        }

        if !target.ends_with(".md") {
            if let Some(note) = self.get_note_locked(&conn, &format!("{target}.md"))? {
                return Ok(Some(note));
            }
        }

        let mut stmt =
            conn.prepare("SELECT path FROM notes WHERE title = ?1 ORDER BY path LIMIT 1")?;
        let path: Option<String> = stmt
            .query_map(params![target], |row| row.get(0))?
            .next()
            .transpose()?;

        match path {
            Some(path) => self.get_note_locked(&conn, &path),
            None => Ok(None),
        }
    }

    /// Number of notes currently stored.
    pub fn note_count(&self) -> Result<usize> {
        let conn = self.db.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Record suggestions into history for novelty filtering.
    ///
    /// Block ids are derived from the geist id and a content hash, matching
    /// what the journal writer embeds in the output document.
    pub fn record_suggestions(
        &self,
        session_date: NaiveDate,
        suggestions: &[Suggestion],
    ) -> Result<()> {
        let conn = self.db.lock().unwrap();
        let now = Utc::now().naive_utc();
        for suggestion in suggestions {
            let block_id = suggestion_block_id(&suggestion.geist_id, &suggestion.text);
            conn.execute(
                "INSERT OR REPLACE INTO session_suggestions
                 (session_date, geist_id, suggestion_text, block_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    session_date.format("%Y-%m-%d").to_string(),
                    suggestion.geist_id,
                    suggestion.text,
                    block_id,
                    format_timestamp(now),
                ],
            )?;
        }
        Ok(())
    }
}

/// Mark a file's stored rows (the regular row or its virtual children) as
/// surviving the vanish sweep.
fn keep_stored_rows(
    keep: &mut HashSet<String>,
    children: &HashMap<String, Vec<String>>,
    rel_path: &str,
) {
    keep.insert(rel_path.to_string());
    if let Some(paths) = children.get(rel_path) {
        keep.extend(paths.iter().cloned());
    }
}

/// Stable block id for one recorded suggestion.
pub fn suggestion_block_id(geist_id: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(geist_id.as_bytes());
    hasher.update(b"\x00");
    hasher.update(text.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", geist_id, &digest[..12])
}

fn upsert_note(conn: &Connection, note: &Note, file_mtime: f64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO notes (path, title, content, created, modified, file_mtime)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            note.path,
            note.title,
            note.content,
            format_timestamp(note.created),
            format_timestamp(note.modified),
            file_mtime,
        ],
    )?;

    conn.execute("DELETE FROM links WHERE source_path = ?1", params![note.path])?;
    conn.execute("DELETE FROM tags WHERE note_path = ?1", params![note.path])?;

    let mut link_stmt = conn.prepare_cached(
        "INSERT INTO links (source_path, target, display_text, is_embed, block_ref)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for link in &note.links {
        link_stmt.execute(params![
            note.path,
            link.target,
            link.display_text,
            link.is_embed as i64,
            link.block_ref,
        ])?;
    }

    let mut tag_stmt =
        conn.prepare_cached("INSERT INTO tags (note_path, tag) VALUES (?1, ?2)")?;
    for tag in &note.tags {
        tag_stmt.execute(params![note.path, tag])?;
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn assemble_note(
    path: String,
    title: String,
    content: String,
    created: &str,
    modified: &str,
    links: Vec<Link>,
    tags: Vec<String>,
) -> rusqlite::Result<Note> {
    let created = parse_timestamp(created)?;
    let modified = parse_timestamp(modified)?;

    let note = match virtual_note_parts(&path) {
        Some((source, entry_date)) => Note {
            path: path.clone(),
            title,
            content,
            links,
            tags,
            created,
            modified,
            is_virtual: true,
            source_file: Some(source.to_string()),
            entry_date: Some(entry_date),
        },
        None => Note::regular(path, title, content, links, tags, created, modified),
    };

    Ok(note)
}

/// ISO-8601 with microseconds; lexicographic order matches temporal order.
pub fn format_timestamp(timestamp: NaiveDateTime) -> String {
    timestamp.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

fn parse_timestamp(text: &str) -> rusqlite::Result<NaiveDateTime> {
    text.parse().map_err(|e: chrono::ParseError| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn mtime_seconds(metadata: &fs::Metadata) -> f64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn system_to_naive(time: SystemTime) -> NaiveDateTime {
    DateTime::<Utc>::from(time).naive_utc()
}
