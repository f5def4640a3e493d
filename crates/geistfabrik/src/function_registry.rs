//! Host-function registry: named, vault-aware callables exposed to code
//! geists directly and to grammar geists through `$vault.name(...)`.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::models::Note;
use crate::vault_context::VaultContext;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("function '{0}' is already registered")]
    Duplicate(String),

    #[error("function '{0}' is not registered")]
    Unknown(String),

    #[error("invalid argument for '{name}': {message}")]
    InvalidArgument { name: String, message: String },

    #[error("error calling '{name}': {message}")]
    CallFailed { name: String, message: String },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// A parsed argument to a host function. Grammar geists pass comma-separated
/// tokens; numeric-looking tokens arrive as integers, quoted tokens as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionArg {
    Int(i64),
    Text(String),
}

impl FunctionArg {
    /// Parse a raw token: integers stay integers, surrounding quotes are
    /// stripped from everything else.
    pub fn parse(token: &str) -> Self {
        let token = token.trim();
        if let Ok(value) = token.parse::<i64>() {
            return FunctionArg::Int(value);
        }
        let unquoted = token
            .strip_prefix('"')
            .and_then(|t| t.strip_suffix('"'))
            .or_else(|| token.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')))
            .unwrap_or(token);
        FunctionArg::Text(unquoted.to_string())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FunctionArg::Int(value) => Some(*value),
            FunctionArg::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FunctionArg::Text(value) => Some(value),
            FunctionArg::Int(_) => None,
        }
    }
}

/// Result of a host-function call.
#[derive(Debug, Clone)]
pub enum FunctionValue {
    /// A list of notes; rendered as wiki-link phrases in grammar output
    Notes(Vec<Note>),
    Text(String),
    Count(usize),
}

impl FunctionValue {
    /// Render the value for inline use in expanded grammar text.
    ///
    /// Note lists become `[[obsidian_link]]` phrases: one link plain, two
    /// joined by "and", three or more in Oxford style.
    pub fn render(&self) -> String {
        match self {
            FunctionValue::Text(text) => text.clone(),
            FunctionValue::Count(count) => count.to_string(),
            FunctionValue::Notes(notes) => {
                let links: Vec<String> = notes
                    .iter()
                    .map(|note| format!("[[{}]]", note.obsidian_link()))
                    .collect();
                match links.len() {
                    0 => String::new(),
                    1 => links[0].clone(),
                    2 => format!("{} and {}", links[0], links[1]),
                    _ => format!(
                        "{}, and {}",
                        links[..links.len() - 1].join(", "),
                        links[links.len() - 1]
                    ),
                }
            }
        }
    }
}

/// A registered host function. The first parameter is always the
/// `VaultContext` for the running session.
pub type VaultFn = Arc<dyn Fn(&VaultContext, &[FunctionArg]) -> Result<FunctionValue> + Send + Sync>;

/// Name -> callable map with duplicate prevention.
pub struct FunctionRegistry {
    functions: HashMap<String, VaultFn>,
}

impl FunctionRegistry {
    /// An empty registry, for tests and minimal embeddings of the engine.
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// A registry pre-populated with the built-in vault functions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_builtins();
        registry
    }

    fn register_builtins(&mut self) {
        // The map starts empty, so built-in names can't collide.
        let mut builtin = |name: &str, f: VaultFn| {
            self.functions.insert(name.to_string(), f);
        };

        builtin(
            "sample_notes",
            Arc::new(|ctx, args| {
                let k = arg_k("sample_notes", args, 0, 5)?;
                let notes = ctx.notes().map_err(call_failed("sample_notes"))?;
                Ok(FunctionValue::Notes(ctx.sample(&notes, k)))
            }),
        );

        builtin(
            "old_notes",
            Arc::new(|ctx, args| {
                let k = arg_k("old_notes", args, 0, 5)?;
                let notes = ctx.old_notes(k).map_err(call_failed("old_notes"))?;
                Ok(FunctionValue::Notes(notes))
            }),
        );

        builtin(
            "recent_notes",
            Arc::new(|ctx, args| {
                let k = arg_k("recent_notes", args, 0, 5)?;
                let notes = ctx.recent_notes(k).map_err(call_failed("recent_notes"))?;
                Ok(FunctionValue::Notes(notes))
            }),
        );

        builtin(
            "orphans",
            Arc::new(|ctx, args| {
                let k = arg_k("orphans", args, 0, 5)?;
                let notes = ctx.orphans(Some(k)).map_err(call_failed("orphans"))?;
                Ok(FunctionValue::Notes(notes))
            }),
        );

        builtin(
            "hubs",
            Arc::new(|ctx, args| {
                let k = arg_k("hubs", args, 0, 5)?;
                let notes = ctx.hubs(k).map_err(call_failed("hubs"))?;
                Ok(FunctionValue::Notes(notes))
            }),
        );

        builtin(
            "neighbors",
            Arc::new(|ctx, args| {
                let target = args
                    .first()
                    .and_then(FunctionArg::as_text)
                    .ok_or_else(|| RegistryError::InvalidArgument {
                        name: "neighbors".to_string(),
                        message: "expected a note title or path".to_string(),
                    })?;
                let k = arg_k("neighbors", args, 1, 5)?;

                let note = ctx.get_note(target).map_err(call_failed("neighbors"))?;
                match note {
                    Some(note) => {
                        let neighbours =
                            ctx.neighbours(&note, k).map_err(call_failed("neighbors"))?;
                        Ok(FunctionValue::Notes(neighbours))
                    }
                    None => Ok(FunctionValue::Notes(vec![])),
                }
            }),
        );
    }

    /// Register a function under a unique name.
    pub fn register(&mut self, name: &str, function: VaultFn) -> Result<()> {
        if self.functions.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.functions.insert(name.to_string(), function);
        tracing::debug!(name, "registered vault function");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<VaultFn> {
        self.functions.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// All registered function names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn arg_k(name: &str, args: &[FunctionArg], index: usize, default: usize) -> Result<usize> {
    match args.get(index) {
        None => Ok(default),
        Some(FunctionArg::Int(value)) if *value >= 0 => Ok(*value as usize),
        Some(other) => Err(RegistryError::InvalidArgument {
            name: name.to_string(),
            message: format!("expected a non-negative count, got {other:?}"),
        }),
    }
}

fn call_failed<E: std::fmt::Display>(name: &'static str) -> impl Fn(E) -> RegistryError {
    move |e| RegistryError::CallFailed {
        name: name.to_string(),
        message: e.to_string(),
    }
}
