//! SQLite schema and database initialisation.

use std::path::Path;

use rusqlite::Connection;

/// Schema version for migrations.
/// Version 3: removed the unused normalized `suggestions` tables in favour
/// of the denormalized `session_suggestions` design.
pub const SCHEMA_VERSION: i32 = 3;

const SCHEMA_SQL: &str = "
-- Notes table
CREATE TABLE IF NOT EXISTS notes (
    path TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    created TEXT NOT NULL,
    modified TEXT NOT NULL,
    file_mtime REAL NOT NULL  -- For incremental sync
);

CREATE INDEX IF NOT EXISTS idx_notes_modified ON notes(modified);
CREATE INDEX IF NOT EXISTS idx_notes_title ON notes(title);

-- Links table
CREATE TABLE IF NOT EXISTS links (
    source_path TEXT NOT NULL,
    target TEXT NOT NULL,
    display_text TEXT,
    is_embed INTEGER NOT NULL DEFAULT 0,
    block_ref TEXT,
    FOREIGN KEY (source_path) REFERENCES notes(path) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_links_source ON links(source_path);
CREATE INDEX IF NOT EXISTS idx_links_target ON links(target);
CREATE INDEX IF NOT EXISTS idx_links_target_source ON links(target, source_path);

-- Tags table
CREATE TABLE IF NOT EXISTS tags (
    note_path TEXT NOT NULL,
    tag TEXT NOT NULL,
    FOREIGN KEY (note_path) REFERENCES notes(path) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_tags_note ON tags(note_path);
CREATE INDEX IF NOT EXISTS idx_tags_tag ON tags(tag);

-- Embeddings table (content-keyed semantic cache)
CREATE TABLE IF NOT EXISTS embeddings (
    note_path TEXT PRIMARY KEY,
    embedding BLOB NOT NULL,
    model_version TEXT NOT NULL,
    computed_at TEXT NOT NULL,
    FOREIGN KEY (note_path) REFERENCES notes(path) ON DELETE CASCADE
);

-- Sessions table (for temporal tracking)
CREATE TABLE IF NOT EXISTS sessions (
    session_id INTEGER PRIMARY KEY AUTOINCREMENT,
    date TEXT NOT NULL UNIQUE,
    vault_state_hash TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_date ON sessions(date);

-- Session embeddings table (temporal embeddings)
CREATE TABLE IF NOT EXISTS session_embeddings (
    session_id INTEGER NOT NULL,
    note_path TEXT NOT NULL,
    embedding BLOB NOT NULL,
    FOREIGN KEY (session_id) REFERENCES sessions(session_id) ON DELETE CASCADE,
    FOREIGN KEY (note_path) REFERENCES notes(path) ON DELETE CASCADE,
    PRIMARY KEY (session_id, note_path)
);

CREATE INDEX IF NOT EXISTS idx_session_embeddings_path ON session_embeddings(note_path);

-- Session suggestions (for novelty filtering and history tracking)
CREATE TABLE IF NOT EXISTS session_suggestions (
    session_date TEXT NOT NULL,
    geist_id TEXT NOT NULL,
    suggestion_text TEXT NOT NULL,
    block_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (session_date, block_id)
);

CREATE INDEX IF NOT EXISTS idx_session_suggestions_date ON session_suggestions(session_date);
CREATE INDEX IF NOT EXISTS idx_session_suggestions_geist ON session_suggestions(geist_id);
";

/// Initialize a database with the schema.
///
/// A `None` path yields an in-memory database. Foreign keys are enabled on
/// the connection; `PRAGMA user_version` records the schema version.
pub fn init_db(db_path: Option<&Path>) -> rusqlite::Result<Connection> {
    let conn = match db_path {
        Some(path) => Connection::open(path)?,
        None => Connection::open_in_memory()?,
    };

    conn.pragma_update(None, "foreign_keys", true)?;
    conn.execute_batch(SCHEMA_SQL)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

    Ok(conn)
}

/// Read the schema version recorded in the database.
pub fn schema_version(conn: &Connection) -> rusqlite::Result<i32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_all_tables() {
        let conn = init_db(None).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('notes', 'links', 'tags', 'embeddings', 'sessions',
                  'session_embeddings', 'session_suggestions')",
                [],
                |row| row.get(0),
            )
            .unwrap();

        assert_eq!(count, 7);
    }

    #[test]
    fn schema_version_is_recorded() {
        let conn = init_db(None).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn foreign_keys_are_enabled() {
        let conn = init_db(None).unwrap();
        let enabled: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(enabled, 1);
    }

    #[test]
    fn deleting_a_note_cascades_to_links_and_tags() {
        let conn = init_db(None).unwrap();
        conn.execute(
            "INSERT INTO notes (path, title, content, created, modified, file_mtime)
             VALUES ('a.md', 'A', '', '2025-01-01T00:00:00', '2025-01-01T00:00:00', 0.0)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO links (source_path, target) VALUES ('a.md', 'b')",
            [],
        )
        .unwrap();
        conn.execute("INSERT INTO tags (note_path, tag) VALUES ('a.md', 't')", [])
            .unwrap();

        conn.execute("DELETE FROM notes WHERE path = 'a.md'", [])
            .unwrap();

        let links: i64 = conn
            .query_row("SELECT COUNT(*) FROM links", [], |row| row.get(0))
            .unwrap();
        let tags: i64 = conn
            .query_row("SELECT COUNT(*) FROM tags", [], |row| row.get(0))
            .unwrap();
        assert_eq!(links, 0);
        assert_eq!(tags, 0);
    }
}
