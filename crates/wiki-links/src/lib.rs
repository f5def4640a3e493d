//! Parser for Obsidian-style wiki links
//!
//! Supports:
//! - Basic links: `[[Note]]`
//! - Display text: `[[Note|Display Text]]`
//! - Heading anchors: `[[Note#Heading]]` (the anchor is stripped from the target)
//! - Block references: `[[Note#^block-id]]` and `[[Note^block-id]]`
//! - Embeds: `![[Note]]`
//! - Paths: `[[folder/Note]]`

use serde::{Deserialize, Serialize};

/// A link from one note to another, as written in the source text.
///
/// The `target` is whatever the author wrote between the brackets, minus
/// any heading anchor or block reference. Resolution to an actual note
/// (by path, path + `.md`, or title) happens at a higher layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link {
    /// Target note path or title, anchors stripped: "folder/Note"
    pub target: String,
    /// Display text if the link carried a `|alias`: "my custom text"
    pub display_text: Option<String>,
    /// Whether this is a transclusion (`![[...]]`)
    pub is_embed: bool,
    /// Block reference ID if present: "block-123"
    pub block_ref: Option<String>,
}

impl Link {
    /// Returns the display text if present, otherwise the target.
    pub fn display(&self) -> &str {
        self.display_text.as_deref().unwrap_or(&self.target)
    }
}

/// Parse all wiki links from markdown content.
///
/// Links with an empty or whitespace-only target (e.g. `[[]]` or `[[#^ref]]`)
/// are dropped.
pub fn parse_wiki_links(content: &str) -> Vec<Link> {
    let mut links = Vec::new();
    let mut rest = content;

    while let Some(open) = rest.find("[[") {
        // A `!` hugging the opening brackets marks a transclusion
        let is_embed = rest[..open].ends_with('!');
        let body = &rest[open + 2..];

        match closing_offset(body) {
            Some(close) => {
                links.extend(parse_link_content(&body[..close], is_embed));
                rest = &body[close + 2..];
            }
            // Unbalanced opener: step past it and keep scanning, so an
            // inner link such as `[[a [[b]]` still surfaces `b`
            None => rest = body,
        }
    }

    links
}

/// Byte offset of the `]]` that closes an already-opened link, honouring
/// nested `[[` pairs. None when the brackets never balance.
fn closing_offset(body: &str) -> Option<usize> {
    let mut depth = 1usize;
    let mut cursor = 0usize;

    loop {
        let close = body[cursor..].find("]]")?;
        let open = body[cursor..].find("[[");

        match open {
            Some(open) if open < close => {
                depth += 1;
                cursor += open + 2;
            }
            _ => {
                depth -= 1;
                if depth == 0 {
                    return Some(cursor + close);
                }
                cursor += close + 2;
            }
        }
    }
}

/// Parse the content inside `[[ ]]` into a Link.
fn parse_link_content(content: &str, is_embed: bool) -> Option<Link> {
    // Split by | for display text
    let (target_part, display_text) = match content.find('|') {
        Some(pipe_pos) => {
            let display = content[pipe_pos + 1..].trim();
            let display = (!display.is_empty()).then(|| display.to_string());
            (&content[..pipe_pos], display)
        }
        None => (content, None),
    };

    let target_part = target_part.trim();

    // Block reference comes after ^, with or without a leading #
    let (target_part, block_ref) = match target_part.find('^') {
        Some(caret_pos) => {
            let block = target_part[caret_pos + 1..].trim();
            let before = target_part[..caret_pos].trim_end_matches('#');
            (before, (!block.is_empty()).then(|| block.to_string()))
        }
        None => (target_part, None),
    };

    // Heading anchors are not stored; the target identifies the whole note
    let target = match target_part.find('#') {
        Some(hash_pos) => target_part[..hash_pos].trim(),
        None => target_part.trim(),
    };

    if target.is_empty() {
        return None;
    }

    Some(Link {
        target: target.to_string(),
        display_text,
        is_embed,
        block_ref,
    })
}

/// Extract all unique link targets from wiki links in content, in first-seen order.
pub fn extract_link_targets(content: &str) -> Vec<String> {
    let links = parse_wiki_links(content);
    let mut seen = std::collections::HashSet::new();
    let mut result = Vec::new();

    for link in links {
        if seen.insert(link.target.clone()) {
            result.push(link.target);
        }
    }

    result
}
