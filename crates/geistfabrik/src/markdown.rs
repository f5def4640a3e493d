//! Markdown parsing for vault notes: frontmatter, title, links, and tags.

use std::collections::{BTreeSet, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;
use wiki_links::{Link, parse_wiki_links};

use crate::models::file_stem;

/// Inline tags: #tag, including nested tags like #parent/child
static TAG_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"#([A-Za-z0-9_/-]+)").unwrap());

/// Frontmatter as key-value pairs.
pub type Frontmatter = HashMap<String, serde_yaml::Value>;

/// Result of parsing one markdown file.
#[derive(Debug, Clone)]
pub struct ParsedNote {
    pub title: String,
    /// Content with the frontmatter block removed
    pub content: String,
    pub links: Vec<Link>,
    pub tags: Vec<String>,
}

/// Extract YAML frontmatter and the remaining content.
///
/// Frontmatter must start on the first line with `---` and be closed by
/// another `---` line. Malformed or non-mapping YAML is treated as absent
/// and the original text is returned unchanged.
pub fn parse_frontmatter(content: &str) -> (Option<Frontmatter>, String) {
    let mut lines = content.lines();
    match lines.next() {
        Some(first) if first.trim() == "---" => {}
        _ => return (None, content.to_string()),
    }

    let all_lines: Vec<&str> = content.lines().collect();
    let closing = all_lines
        .iter()
        .skip(1)
        .position(|line| line.trim() == "---")
        .map(|idx| idx + 1);

    let Some(end_idx) = closing else {
        // No closing delimiter, treat entire content as body
        return (None, content.to_string());
    };

    let yaml_text = all_lines[1..end_idx].join("\n");
    let remaining = all_lines[end_idx + 1..].join("\n");

    if yaml_text.trim().is_empty() {
        return (None, remaining);
    }

    match serde_yaml::from_str::<Frontmatter>(&yaml_text) {
        Ok(frontmatter) if !frontmatter.is_empty() => (Some(frontmatter), remaining),
        Ok(_) => (None, remaining),
        // Invalid YAML: the fence was not frontmatter after all
        Err(_) => (None, content.to_string()),
    }
}

/// Extract the note title: frontmatter `title` -> first H1 -> filename stem.
pub fn extract_title(path: &str, frontmatter: Option<&Frontmatter>, content: &str) -> String {
    if let Some(value) = frontmatter.and_then(|fm| fm.get("title")) {
        if let Some(title) = yaml_value_to_string(value) {
            return title;
        }
    }

    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("# ") {
            return rest.trim().to_string();
        }
    }

    file_stem(path)
}

/// Extract tags from content and frontmatter.
///
/// Frontmatter `tags` may be a single string or a sequence. Inline tags are
/// `#` followed by `[A-Za-z0-9_/-]+`. The result is sorted and unique, with
/// no leading `#`.
pub fn extract_tags(content: &str, frontmatter: Option<&Frontmatter>) -> Vec<String> {
    let mut tags = BTreeSet::new();

    if let Some(value) = frontmatter.and_then(|fm| fm.get("tags")) {
        match value {
            serde_yaml::Value::String(tag) => {
                let tag = tag.trim();
                if !tag.is_empty() {
                    tags.insert(tag.to_string());
                }
            }
            serde_yaml::Value::Sequence(items) => {
                for item in items {
                    if let Some(tag) = yaml_value_to_string(item) {
                        let tag = tag.trim().to_string();
                        if !tag.is_empty() {
                            tags.insert(tag);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    for capture in TAG_PATTERN.captures_iter(content) {
        tags.insert(capture[1].to_string());
    }

    tags.into_iter().collect()
}

/// Parse a markdown file into structured data.
///
/// Links and inline tags are scanned over the raw text, so frontmatter
/// removal never hides a reference the author wrote.
pub fn parse_markdown(path: &str, content: &str) -> ParsedNote {
    let (frontmatter, clean_content) = parse_frontmatter(content);
    let title = extract_title(path, frontmatter.as_ref(), &clean_content);
    let links = parse_wiki_links(content);
    let tags = extract_tags(content, frontmatter.as_ref());

    ParsedNote {
        title,
        content: clean_content,
        links,
        tags,
    }
}

fn yaml_value_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
