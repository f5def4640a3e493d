//! Core data structures: notes, suggestions, and virtual-note identity.

use std::hash::{Hash, Hasher};
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

pub use wiki_links::Link;

/// Immutable representation of a vault note.
///
/// Regular notes correspond to files on disk. Virtual notes are dated
/// sections carved out of a journal-style file; they carry a synthetic path
/// of the form `<source_file>/<ISO date>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    /// Relative path in vault; the unique identifier
    pub path: String,
    /// Note title. For virtual notes this is the original heading text.
    pub title: String,
    /// Markdown content (frontmatter removed; for virtual notes, the section body)
    pub content: String,
    /// Outgoing [[links]], in source order
    pub links: Vec<Link>,
    /// Tags found in the note, sorted and unique, without the leading '#'
    pub tags: Vec<String>,
    /// Creation time. For virtual notes, midnight of the entry date.
    pub created: NaiveDateTime,
    /// Last modification time of the backing file
    pub modified: NaiveDateTime,
    /// True for notes synthesised from a date-collection file
    pub is_virtual: bool,
    /// Path of the journal file a virtual note was split from
    pub source_file: Option<String>,
    /// Entry date of a virtual note
    pub entry_date: Option<NaiveDate>,
}

impl Note {
    /// Build a regular (file-backed) note.
    #[allow(clippy::too_many_arguments)]
    pub fn regular(
        path: String,
        title: String,
        content: String,
        links: Vec<Link>,
        tags: Vec<String>,
        created: NaiveDateTime,
        modified: NaiveDateTime,
    ) -> Self {
        Self {
            path,
            title,
            content,
            links,
            tags,
            created,
            modified,
            is_virtual: false,
            source_file: None,
            entry_date: None,
        }
    }

    /// Build a virtual note for one dated entry of a journal file.
    pub fn virtual_entry(
        source_file: String,
        entry_date: NaiveDate,
        title: String,
        content: String,
        links: Vec<Link>,
        tags: Vec<String>,
        modified: NaiveDateTime,
    ) -> Self {
        Self {
            path: format!("{}/{}", source_file, entry_date.format("%Y-%m-%d")),
            title,
            content,
            links,
            tags,
            created: entry_date.and_time(NaiveTime::MIN),
            modified,
            is_virtual: true,
            source_file: Some(source_file),
            entry_date: Some(entry_date),
        }
    }

    /// The string a suggestion must place inside `[[...]]` so the link
    /// resolves in Obsidian.
    ///
    /// Regular notes link by title. Virtual notes link through a heading
    /// anchor on their source file: `<stem>#<original heading>`.
    pub fn obsidian_link(&self) -> String {
        match &self.source_file {
            Some(source) if self.is_virtual => {
                format!("{}#{}", file_stem(source), self.title)
            }
            _ => self.title.clone(),
        }
    }
}

// Notes are identified by path: two Note values for the same file are the
// same note even when their contents differ.
impl PartialEq for Note {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for Note {}

impl Hash for Note {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

/// A geist-generated provocation.
///
/// Immutable once created; the filtering pipeline drops whole suggestions
/// rather than editing them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    /// 1-2 sentence suggestion text
    pub text: String,
    /// Referenced notes, as `obsidian_link` strings
    pub notes: Vec<String>,
    /// Identifier of the creating geist
    pub geist_id: String,
    /// Optional suggested note title
    pub title: Option<String>,
}

impl Suggestion {
    pub fn new(
        text: impl Into<String>,
        notes: Vec<String>,
        geist_id: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            notes,
            geist_id: geist_id.into(),
            title: None,
        }
    }
}

/// Split a stored note path into `(source_file, entry_date)` when it has the
/// virtual-note shape `<source_file>/<YYYY-MM-DD>`.
///
/// Regular paths in subdirectories don't match because their final segment
/// is a filename, not an ISO date.
pub fn virtual_note_parts(path: &str) -> Option<(&str, NaiveDate)> {
    let (source, date_part) = path.rsplit_once('/')?;
    if source.is_empty() {
        return None;
    }
    let entry_date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;
    Some((source, entry_date))
}

/// Filename stem of a vault-relative path: "journals/Work Journal.md" -> "Work Journal".
pub fn file_stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}
