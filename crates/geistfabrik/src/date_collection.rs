//! Date-collection note detection and splitting.
//!
//! Journal files with multiple date-based H2 entries are split into virtual
//! note entries during vault synchronization.
//!
//! Known limitation: `##` lines inside fenced code blocks still count as
//! headings for both detection and splitting.

use chrono::{NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::markdown::{extract_tags, parse_frontmatter};
use crate::models::Note;

type DateParser = fn(&Captures) -> Option<NaiveDate>;

/// Recognised H2 date-heading forms, tried in order.
static DATE_PATTERNS: Lazy<Vec<(Regex, DateParser)>> = Lazy::new(|| {
    vec![
        // ISO date: 2025-01-15
        (
            Regex::new(r"^##\s+(\d{4})-(\d{2})-(\d{2})\s*$").unwrap(),
            parse_ymd as DateParser,
        ),
        // US format: 01/15/2025
        (
            Regex::new(r"^##\s+(\d{2})/(\d{2})/(\d{4})\s*$").unwrap(),
            parse_us as DateParser,
        ),
        // EU format: 15.01.2025
        (
            Regex::new(r"^##\s+(\d{2})\.(\d{2})\.(\d{4})\s*$").unwrap(),
            parse_eu as DateParser,
        ),
        // Long format with weekday: Wednesday, January 15, 2025
        (
            Regex::new(
                r"(?i)^##\s+(?:Monday|Tuesday|Wednesday|Thursday|Friday|Saturday|Sunday),?\s+([A-Za-z]+)\s+(\d{1,2}),?\s+(\d{4})\s*$",
            )
            .unwrap(),
            parse_long as DateParser,
        ),
        // Long format: January 15, 2025
        (
            Regex::new(r"(?i)^##\s+([A-Za-z]+)\s+(\d{1,2}),?\s+(\d{4})\s*$").unwrap(),
            parse_long as DateParser,
        ),
        // Year Month Day format: 2022 August 8
        (
            Regex::new(r"(?i)^##\s+(\d{4})\s+([A-Za-z]+)\s+(\d{1,2})\s*$").unwrap(),
            parse_year_month_day as DateParser,
        ),
        // ISO datetime: 2025-01-15T09:00:00
        (
            Regex::new(r"^##\s+(\d{4})-(\d{2})-(\d{2})T\d{2}:\d{2}:\d{2}\s*$").unwrap(),
            parse_ymd as DateParser,
        ),
    ]
});

fn parse_ymd(caps: &Captures) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
    )
}

fn parse_us(caps: &Captures) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(
        caps[3].parse().ok()?,
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
    )
}

fn parse_eu(caps: &Captures) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(
        caps[3].parse().ok()?,
        caps[2].parse().ok()?,
        caps[1].parse().ok()?,
    )
}

fn parse_long(caps: &Captures) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(
        caps[3].parse().ok()?,
        month_number(&caps[1])?,
        caps[2].parse().ok()?,
    )
}

fn parse_year_month_day(caps: &Captures) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(
        caps[1].parse().ok()?,
        month_number(&caps[2])?,
        caps[3].parse().ok()?,
    )
}

fn month_number(name: &str) -> Option<u32> {
    match name.to_ascii_lowercase().as_str() {
        "january" => Some(1),
        "february" => Some(2),
        "march" => Some(3),
        "april" => Some(4),
        "may" => Some(5),
        "june" => Some(6),
        "july" => Some(7),
        "august" => Some(8),
        "september" => Some(9),
        "october" => Some(10),
        "november" => Some(11),
        "december" => Some(12),
        _ => None,
    }
}

/// A date-based section extracted from a journal file.
#[derive(Debug, Clone)]
pub struct DateSection {
    /// Original heading line, `##` included
    pub heading: String,
    /// Parsed date from the heading
    pub entry_date: NaiveDate,
    /// Content from this heading to the next date heading (or EOF)
    pub content: String,
    /// 1-indexed line number of the heading
    pub start_line: usize,
    /// 1-indexed line number where the section ends
    pub end_line: usize,
}

/// Parse a date from an H2 heading line, if it matches a recognised form.
///
/// Calendar-invalid dates (e.g. `2025-02-30`) are logged and rejected.
pub fn parse_date_heading(heading: &str) -> Option<NaiveDate> {
    let heading = heading.trim();

    for (pattern, parser) in DATE_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(heading) {
            let parsed = parser(&caps);
            if parsed.is_none() {
                tracing::warn!(heading, "invalid date in heading");
            }
            return parsed;
        }
    }

    None
}

/// Extract H2 headings and their 1-indexed line numbers.
pub fn extract_h2_headings(content: &str) -> Vec<(String, usize)> {
    content
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            let stripped = line.trim();
            if stripped.starts_with("## ") && !stripped.starts_with("### ") {
                Some((stripped.to_string(), idx + 1))
            } else {
                None
            }
        })
        .collect()
}

/// Detect whether a file contains date-based entries.
///
/// A file is a date-collection when it has at least `min_sections` H2
/// headings and at least `threshold` of them parse as dates.
pub fn is_date_collection(content: &str, min_sections: usize, threshold: f64) -> bool {
    let headings = extract_h2_headings(content);

    if headings.len() < min_sections {
        return false;
    }

    let date_count = headings
        .iter()
        .filter(|(heading, _)| parse_date_heading(heading).is_some())
        .count();

    date_count as f64 >= headings.len() as f64 * threshold
}

/// Split content into date-based sections. Sections with whitespace-only
/// bodies are skipped.
pub fn split_by_date_headings(content: &str) -> Vec<DateSection> {
    let lines: Vec<&str> = content.lines().collect();

    // (heading, 1-indexed line, 0-indexed line, date)
    let date_headings: Vec<(String, usize, usize, NaiveDate)> = extract_h2_headings(content)
        .into_iter()
        .filter_map(|(heading, line_num)| {
            parse_date_heading(&heading).map(|date| (heading, line_num, line_num - 1, date))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (heading, line_num, heading_idx, entry_date)) in date_headings.iter().enumerate() {
        let end_idx = if i + 1 < date_headings.len() {
            date_headings[i + 1].2
        } else {
            lines.len()
        };

        let section_content = lines[heading_idx + 1..end_idx].join("\n");
        let section_content = section_content.trim();

        if section_content.is_empty() {
            tracing::debug!(date = %entry_date, "skipping empty section");
            continue;
        }

        sections.push(DateSection {
            heading: heading.clone(),
            entry_date: *entry_date,
            content: section_content.to_string(),
            start_line: *line_num,
            end_line: end_idx,
        });
    }

    sections
}

/// Split a journal file into virtual note entries, one per distinct date.
///
/// Sections that resolve to the same calendar date are merged in source
/// order with a blank-line separator; the first heading's text becomes the
/// virtual note's title (verbatim, so heading-anchor links resolve).
pub fn split_date_collection_note(
    file_path: &str,
    content: &str,
    file_modified: NaiveDateTime,
) -> Vec<Note> {
    let (frontmatter, clean_content) = parse_frontmatter(content);

    let sections = split_by_date_headings(&clean_content);
    if sections.is_empty() {
        tracing::debug!(file = file_path, "no valid date sections found");
        return vec![];
    }

    // Merge duplicate dates, keeping the first heading text per date.
    // Iteration over dates stays sorted for stable output.
    let mut merged: std::collections::BTreeMap<NaiveDate, Vec<String>> =
        std::collections::BTreeMap::new();
    let mut original_headings: std::collections::HashMap<NaiveDate, String> =
        std::collections::HashMap::new();

    for section in sections {
        original_headings
            .entry(section.entry_date)
            .or_insert_with(|| section.heading.trim_start_matches('#').trim().to_string());
        merged.entry(section.entry_date).or_default().push(section.content);
    }

    merged
        .into_iter()
        .map(|(entry_date, bodies)| {
            let merged_content = bodies.join("\n\n");
            let links = wiki_links::parse_wiki_links(&merged_content);
            let tags = extract_tags(&merged_content, frontmatter.as_ref());
            let title = original_headings[&entry_date].clone();

            Note::virtual_entry(
                file_path.to_string(),
                entry_date,
                title,
                merged_content,
                links,
                tags,
                file_modified,
            )
        })
        .collect()
}
