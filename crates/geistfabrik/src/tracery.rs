//! Tracery-style grammar engine for declarative geists.
//!
//! Supports recursive `#symbol#` expansion with dot-chained modifiers,
//! `$vault.name(...)` host-function calls, and deterministic seeded
//! selection of rules.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::executor::Geist;
use crate::function_registry::FunctionArg;
use crate::models::Suggestion;
use crate::vault_context::VaultContext;

/// Maximum recursion depth for symbol expansion.
const MAX_DEPTH: usize = 50;

static SYMBOL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"#([^#]+)#").unwrap());
static VAULT_CALL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$vault\.([a-zA-Z_][a-zA-Z0-9_]*)\(([^)]*)\)").unwrap());
static NOTE_REF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\[([^\]]+)\]\]").unwrap());

#[derive(Debug, Error)]
pub enum GrammarError {
    #[error("expansion exceeded max depth ({0})")]
    MaxDepth(usize),

    #[error("invalid grammar document: {0}")]
    InvalidDocument(String),

    #[error("I/O error reading grammar: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Grammar: symbol name -> list of expansion rules.
pub type Grammar = HashMap<String, Vec<String>>;

/// Seeded symbol-expansion engine with host-function support.
pub struct TraceryEngine {
    grammar: Grammar,
    rng: Mutex<StdRng>,
}

impl TraceryEngine {
    pub fn new(grammar: Grammar, seed: u64) -> Self {
        Self {
            grammar,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Expand a template: `#symbol#` references are replaced by a randomly
    /// chosen rule (recursively expanded), then `$vault.fn(...)` calls are
    /// resolved against the context's function registry.
    pub fn expand(&self, ctx: Option<&VaultContext>, text: &str) -> Result<String, GrammarError> {
        self.expand_at_depth(ctx, text, 0)
    }

    fn expand_at_depth(
        &self,
        ctx: Option<&VaultContext>,
        text: &str,
        depth: usize,
    ) -> Result<String, GrammarError> {
        if depth > MAX_DEPTH {
            return Err(GrammarError::MaxDepth(MAX_DEPTH));
        }

        let mut expanded = String::with_capacity(text.len());
        let mut last_end = 0;
        for caps in SYMBOL_RE.captures_iter(text) {
            let whole = caps.get(0).expect("capture 0 always present");
            expanded.push_str(&text[last_end..whole.start()]);
            expanded.push_str(&self.expand_symbol(ctx, &caps[1], depth + 1)?);
            last_end = whole.end();
        }
        expanded.push_str(&text[last_end..]);

        Ok(self.expand_vault_calls(ctx, &expanded))
    }

    /// Expand one `symbol.mod1.mod2` reference.
    ///
    /// Unknown symbols are returned untouched (brackets included) so the
    /// wrapper's placeholder scan can see them.
    fn expand_symbol(
        &self,
        ctx: Option<&VaultContext>,
        reference: &str,
        depth: usize,
    ) -> Result<String, GrammarError> {
        let mut parts = reference.split('.');
        let symbol = parts.next().unwrap_or(reference);

        let Some(rules) = self.grammar.get(symbol) else {
            return Ok(format!("#{reference}#"));
        };
        if rules.is_empty() {
            return Ok(String::new());
        }

        let choice = {
            let mut rng = self.rng.lock().unwrap();
            rng.random_range(0..rules.len())
        };

        let mut expanded = self.expand_at_depth(ctx, &rules[choice], depth)?;
        for modifier in parts {
            expanded = apply_modifier(&expanded, modifier);
        }
        Ok(expanded)
    }

    /// Resolve `$vault.name(args)` calls. Errors are inlined into the text
    /// rather than aborting the expansion.
    fn expand_vault_calls(&self, ctx: Option<&VaultContext>, text: &str) -> String {
        let Some(ctx) = ctx else {
            return text.to_string();
        };

        VAULT_CALL_RE
            .replace_all(text, |caps: &regex::Captures| {
                let name = &caps[1];
                let args_str = caps[2].trim();
                let args: Vec<FunctionArg> = if args_str.is_empty() {
                    vec![]
                } else {
                    args_str.split(',').map(FunctionArg::parse).collect()
                };

                match ctx.call_function(name, &args) {
                    Ok(value) => value.render(),
                    Err(e) => format!("[Error calling {name}: {e}]"),
                }
            })
            .into_owned()
    }
}

/// Apply one modifier to expanded text. Unknown modifiers are ignored.
fn apply_modifier(text: &str, modifier: &str) -> String {
    match modifier {
        "capitalize" => capitalize(text),
        "capitalizeAll" => text
            .split(' ')
            .map(capitalize)
            .collect::<Vec<_>>()
            .join(" "),
        "s" => pluralize(text),
        "ed" => past_tense(text),
        "a" => with_article(text),
        _ => text.to_string(),
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn split_last_word(text: &str) -> (&str, &str) {
    match text.rfind(' ') {
        Some(pos) => (&text[..pos + 1], &text[pos + 1..]),
        None => ("", text),
    }
}

fn pluralize(text: &str) -> String {
    const IRREGULAR: &[(&str, &str)] = &[
        ("man", "men"),
        ("woman", "women"),
        ("child", "children"),
        ("person", "people"),
        ("foot", "feet"),
        ("tooth", "teeth"),
        ("mouse", "mice"),
        ("goose", "geese"),
    ];

    let (head, word) = split_last_word(text);
    if let Some((_, plural)) = IRREGULAR
        .iter()
        .find(|(singular, _)| *singular == word.to_lowercase())
    {
        return format!("{head}{plural}");
    }

    let lower = word.to_lowercase();
    if let Some(stem) = word.strip_suffix('y') {
        let before = stem.chars().last();
        if before.is_some_and(|c| !"aeiou".contains(c.to_ascii_lowercase())) {
            return format!("{head}{stem}ies");
        }
    }
    if lower.ends_with('s')
        || lower.ends_with('x')
        || lower.ends_with('z')
        || lower.ends_with("ch")
        || lower.ends_with("sh")
    {
        return format!("{text}es");
    }
    format!("{text}s")
}

fn past_tense(text: &str) -> String {
    const IRREGULAR: &[(&str, &str)] = &[
        ("go", "went"),
        ("run", "ran"),
        ("eat", "ate"),
        ("see", "saw"),
        ("take", "took"),
        ("make", "made"),
        ("come", "came"),
        ("find", "found"),
    ];

    let (head, word) = split_last_word(text);
    if let Some((_, past)) = IRREGULAR
        .iter()
        .find(|(present, _)| *present == word.to_lowercase())
    {
        return format!("{head}{past}");
    }

    if word.ends_with('e') {
        return format!("{text}d");
    }
    if let Some(stem) = word.strip_suffix('y') {
        let before = stem.chars().last();
        if before.is_some_and(|c| !"aeiou".contains(c.to_ascii_lowercase())) {
            return format!("{head}{stem}ied");
        }
    }
    format!("{text}ed")
}

fn with_article(text: &str) -> String {
    let vowel_start = text
        .chars()
        .next()
        .is_some_and(|c| "aeiouAEIOU".contains(c));
    if vowel_start {
        format!("an {text}")
    } else {
        format!("a {text}")
    }
}

/// Tell-tale artefacts of a placeholder that expanded to nothing: doubled
/// spaces or a dangling space before punctuation.
fn looks_incomplete(text: &str) -> bool {
    text.contains("  ") || text.contains(" .") || text.contains(" ,")
}

/// Declarative grammar-geist document.
///
/// The current form uses `kind: grammar` with a `grammar` map; the legacy
/// `type: geist-tracery` / `tracery` spelling is still accepted.
#[derive(Debug, Deserialize)]
struct GrammarDoc {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default, rename = "type")]
    legacy_type: Option<String>,
    id: String,
    #[serde(default)]
    count: Option<usize>,
    #[serde(default)]
    grammar: Option<Grammar>,
    #[serde(default)]
    tracery: Option<Grammar>,
}

/// A geist defined by a grammar document.
pub struct TraceryGeist {
    id: String,
    engine: TraceryEngine,
    count: usize,
}

impl TraceryGeist {
    pub fn new(id: impl Into<String>, grammar: Grammar, count: usize, seed: u64) -> Self {
        Self {
            id: id.into(),
            engine: TraceryEngine::new(grammar, seed),
            count,
        }
    }

    /// Parse a grammar geist from YAML text.
    pub fn from_yaml_str(yaml: &str, seed: u64) -> Result<Self, GrammarError> {
        let doc: GrammarDoc = serde_yaml::from_str(yaml)?;

        let is_grammar = doc.kind.as_deref() == Some("grammar")
            || doc.legacy_type.as_deref() == Some("geist-tracery");
        if !is_grammar {
            return Err(GrammarError::InvalidDocument(format!(
                "not a grammar geist: kind={:?} type={:?}",
                doc.kind, doc.legacy_type
            )));
        }

        let grammar = doc.grammar.or(doc.tracery).ok_or_else(|| {
            GrammarError::InvalidDocument(format!("geist '{}' has no grammar table", doc.id))
        })?;

        Ok(Self::new(doc.id, grammar, doc.count.unwrap_or(1), seed))
    }

    /// Load a grammar geist from a YAML file.
    pub fn from_yaml_file(path: &Path, seed: u64) -> Result<Self, GrammarError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml, seed)
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

impl Geist for TraceryGeist {
    fn id(&self) -> &str {
        &self.id
    }

    /// Expand `#origin#` `count` times; each expansion becomes one
    /// suggestion whose note references are the `[[...]]` targets found in
    /// the expanded text. Expansions with placeholder artefacts are
    /// discarded; failed expansions are logged and skipped.
    fn suggest(&self, vault: &VaultContext) -> anyhow::Result<Vec<Suggestion>> {
        let mut suggestions = Vec::with_capacity(self.count);

        for _ in 0..self.count {
            let text = match self.engine.expand(Some(vault), "#origin#") {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(geist_id = %self.id, error = %e, "grammar expansion failed");
                    continue;
                }
            };

            if looks_incomplete(&text) {
                tracing::debug!(geist_id = %self.id, text, "discarding incomplete expansion");
                continue;
            }

            let mut seen = std::collections::HashSet::new();
            let notes: Vec<String> = NOTE_REF_RE
                .captures_iter(&text)
                .map(|caps| caps[1].to_string())
                .filter(|reference| seen.insert(reference.clone()))
                .collect();

            suggestions.push(Suggestion::new(text, notes, self.id.clone()));
        }

        Ok(suggestions)
    }
}
