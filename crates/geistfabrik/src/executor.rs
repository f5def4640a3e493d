//! Geist execution: loading, timeouts, failure policy, and the execution log.

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::config::Config;
use crate::models::Suggestion;
use crate::tracery::TraceryGeist;
use crate::vault_context::VaultContext;

/// A unit of analytic behaviour: given the vault context, produce
/// suggestions. Geists are read-only against the persistent store; that is
/// what makes abandoning a timed-out invocation safe.
pub trait Geist: Send + Sync {
    fn id(&self) -> &str;
    fn suggest(&self, vault: &VaultContext) -> anyhow::Result<Vec<Suggestion>>;
}

/// A code geist built from a plain function or closure.
pub struct FnGeist<F> {
    id: String,
    func: F,
}

impl<F> FnGeist<F>
where
    F: Fn(&VaultContext) -> anyhow::Result<Vec<Suggestion>> + Send + Sync,
{
    pub fn new(id: impl Into<String>, func: F) -> Self {
        Self {
            id: id.into(),
            func,
        }
    }
}

impl<F> Geist for FnGeist<F>
where
    F: Fn(&VaultContext) -> anyhow::Result<Vec<Suggestion>> + Send + Sync,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn suggest(&self, vault: &VaultContext) -> anyhow::Result<Vec<Suggestion>> {
        (self.func)(vault)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeistKind {
    Code,
    Grammar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    Error,
    Timeout,
    LoadError,
    Skipped,
    Disabled,
}

/// One entry in the structured execution log.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub geist_id: String,
    pub status: ExecutionStatus,
    pub detail: Option<String>,
    pub suggestion_count: usize,
    pub failure_count: u32,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("unknown geist: {0}")]
    UnknownGeist(String),
}

struct GeistSlot {
    geist: Arc<dyn Geist>,
    kind: GeistKind,
    failure_count: u32,
    enabled: bool,
}

/// Loads geists, runs them under a wall-clock timeout, and tracks the
/// failure policy: a geist that fails `max_failures` times is disabled for
/// the rest of the run and short-circuits to empty output.
pub struct GeistExecutor {
    timeout: Duration,
    max_failures: u32,
    geists: HashMap<String, GeistSlot>,
    log: Vec<ExecutionRecord>,
}

impl GeistExecutor {
    pub fn new(config: &Config) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_seconds),
            max_failures: config.max_failures,
            geists: HashMap::new(),
            log: Vec::new(),
        }
    }

    /// Register a statically linked code geist.
    ///
    /// Duplicate ids are a load error: logged, excluded, never fatal.
    pub fn register_code_geist<F>(&mut self, id: &str, func: F)
    where
        F: Fn(&VaultContext) -> anyhow::Result<Vec<Suggestion>> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnGeist::new(id, func)), GeistKind::Code);
    }

    /// Register any geist implementation.
    pub fn register(&mut self, geist: Arc<dyn Geist>, kind: GeistKind) {
        let id = geist.id().to_string();
        if self.geists.contains_key(&id) {
            tracing::warn!(geist_id = %id, "duplicate geist id");
            self.log.push(ExecutionRecord {
                geist_id: id.clone(),
                status: ExecutionStatus::LoadError,
                detail: Some(format!("duplicate geist id: {id}")),
                suggestion_count: 0,
                failure_count: 0,
            });
            return;
        }
        self.geists.insert(
            id,
            GeistSlot {
                geist,
                kind,
                failure_count: 0,
                enabled: true,
            },
        );
    }

    /// Discover and load grammar geists from the default and user
    /// directories. The default directory honours the per-geist enable map;
    /// file stems are geist ids; load failures are logged and skipped.
    pub fn load_grammar_geists(
        &mut self,
        default_dir: Option<&Path>,
        user_dir: Option<&Path>,
        config: &Config,
        seed: u64,
    ) {
        if let Some(dir) = default_dir {
            self.load_grammar_dir(dir, Some(&config.enabled_geists), seed);
        }
        if let Some(dir) = user_dir {
            self.load_grammar_dir(dir, None, seed);
        }
    }

    fn load_grammar_dir(
        &mut self,
        dir: &Path,
        enabled: Option<&HashMap<String, bool>>,
        seed: u64,
    ) {
        if !dir.exists() {
            return;
        }

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "cannot read geist directory");
                return;
            }
        };

        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        paths.sort();

        for path in paths {
            let geist_id = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();

            if let Some(enabled) = enabled {
                if !enabled.get(&geist_id).copied().unwrap_or(true) {
                    tracing::debug!(geist_id, "default geist disabled by config");
                    continue;
                }
            }

            match TraceryGeist::from_yaml_file(&path, seed) {
                Ok(geist) => self.register(Arc::new(geist), GeistKind::Grammar),
                Err(e) => {
                    tracing::warn!(geist_id, error = %e, "failed to load grammar geist");
                    self.log.push(ExecutionRecord {
                        geist_id,
                        status: ExecutionStatus::LoadError,
                        detail: Some(e.to_string()),
                        suggestion_count: 0,
                        failure_count: 0,
                    });
                }
            }
        }
    }

    /// Execute one geist with timeout and error handling.
    ///
    /// Returns empty output on timeout, panic, or error; those also count
    /// toward the failure policy. Disabled geists short-circuit without
    /// invoking the callable.
    pub fn execute_geist(
        &mut self,
        geist_id: &str,
        ctx: &Arc<VaultContext>,
    ) -> Result<Vec<Suggestion>, ExecutorError> {
        let slot = self
            .geists
            .get(geist_id)
            .ok_or_else(|| ExecutorError::UnknownGeist(geist_id.to_string()))?;

        if !slot.enabled {
            self.log.push(ExecutionRecord {
                geist_id: geist_id.to_string(),
                status: ExecutionStatus::Skipped,
                detail: Some("disabled".to_string()),
                suggestion_count: 0,
                failure_count: slot.failure_count,
            });
            return Ok(vec![]);
        }

        let outcome = run_with_timeout(Arc::clone(&slot.geist), Arc::clone(ctx), self.timeout);

        match outcome {
            Outcome::Completed(Ok(suggestions)) => {
                self.log.push(ExecutionRecord {
                    geist_id: geist_id.to_string(),
                    status: ExecutionStatus::Success,
                    detail: None,
                    suggestion_count: suggestions.len(),
                    failure_count: 0,
                });
                Ok(suggestions)
            }
            Outcome::Completed(Err(error)) => {
                self.handle_failure(geist_id, ExecutionStatus::Error, format!("{error:#}"));
                Ok(vec![])
            }
            Outcome::Panicked(message) => {
                self.handle_failure(
                    geist_id,
                    ExecutionStatus::Error,
                    format!("panic: {message}"),
                );
                Ok(vec![])
            }
            Outcome::TimedOut => {
                self.handle_failure(
                    geist_id,
                    ExecutionStatus::Timeout,
                    format!("exceeded {}s timeout", self.timeout.as_secs_f64()),
                );
                Ok(vec![])
            }
        }
    }

    /// Execute every geist: config-defined order first, then the remaining
    /// geists in sorted id order.
    pub fn execute_all(
        &mut self,
        ctx: &Arc<VaultContext>,
        order: &[String],
    ) -> BTreeMap<String, Vec<Suggestion>> {
        let mut sequence: Vec<String> = Vec::new();
        for id in order {
            if self.geists.contains_key(id) {
                sequence.push(id.clone());
            }
        }
        let mut rest: Vec<String> = self
            .geists
            .keys()
            .filter(|id| !sequence.contains(*id))
            .cloned()
            .collect();
        rest.sort();
        sequence.extend(rest);

        let mut results = BTreeMap::new();
        for id in sequence {
            // ids come from the map, so UnknownGeist cannot occur here
            if let Ok(suggestions) = self.execute_geist(&id, ctx) {
                results.insert(id, suggestions);
            }
        }
        results
    }

    fn handle_failure(&mut self, geist_id: &str, status: ExecutionStatus, detail: String) {
        let Some(slot) = self.geists.get_mut(geist_id) else {
            return;
        };
        slot.failure_count += 1;
        let failure_count = slot.failure_count;

        tracing::warn!(geist_id, ?status, failure_count, detail, "geist failed");
        self.log.push(ExecutionRecord {
            geist_id: geist_id.to_string(),
            status,
            detail: Some(detail),
            suggestion_count: 0,
            failure_count,
        });

        if failure_count >= self.max_failures {
            slot.enabled = false;
            self.log.push(ExecutionRecord {
                geist_id: geist_id.to_string(),
                status: ExecutionStatus::Disabled,
                detail: Some(format!("exceeded {} failures", self.max_failures)),
                suggestion_count: 0,
                failure_count,
            });
        }
    }

    pub fn geist_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.geists.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn enabled_geists(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .geists
            .iter()
            .filter(|(_, slot)| slot.enabled)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_enabled(&self, geist_id: &str) -> Option<bool> {
        self.geists.get(geist_id).map(|slot| slot.enabled)
    }

    pub fn failure_count(&self, geist_id: &str) -> Option<u32> {
        self.geists.get(geist_id).map(|slot| slot.failure_count)
    }

    pub fn kind(&self, geist_id: &str) -> Option<GeistKind> {
        self.geists.get(geist_id).map(|slot| slot.kind)
    }

    pub fn execution_log(&self) -> &[ExecutionRecord] {
        &self.log
    }
}

enum Outcome {
    Completed(anyhow::Result<Vec<Suggestion>>),
    Panicked(String),
    TimedOut,
}

/// Run a geist on a worker thread, waiting up to `timeout`.
///
/// On elapse the worker is abandoned: geists are read-only against the
/// store, so nothing it does afterwards can corrupt the run, and its
/// thread dies with the process at the latest.
fn run_with_timeout(geist: Arc<dyn Geist>, ctx: Arc<VaultContext>, timeout: Duration) -> Outcome {
    let (tx, rx) = mpsc::channel();
    let id = geist.id().to_string();

    let spawned = thread::Builder::new()
        .name(format!("geist-{id}"))
        .spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(|| geist.suggest(&ctx)));
            let _ = tx.send(result);
        });

    if let Err(e) = spawned {
        return Outcome::Completed(Err(anyhow::anyhow!("failed to spawn worker: {e}")));
    }

    match rx.recv_timeout(timeout) {
        Ok(Ok(result)) => Outcome::Completed(result),
        Ok(Err(panic)) => Outcome::Panicked(panic_message(panic.as_ref())),
        Err(_) => Outcome::TimedOut,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::embeddings::Session;
    use crate::function_registry::FunctionRegistry;
    use crate::test_support::{HashingEmbedder, write_note};
    use crate::vault::Vault;
    use crate::vector_search::InMemoryVectorBackend;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn quick_config() -> Config {
        Config {
            timeout_seconds: 1,
            ..Default::default()
        }
    }

    fn build_ctx(dir: &TempDir) -> Arc<VaultContext> {
        let vault = Arc::new(Vault::open(dir.path(), None, &Config::default()).unwrap());
        vault.sync(&Config::default()).unwrap();
        let session = Session::new(NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(), &vault).unwrap();
        let notes = vault.all_notes().unwrap();
        session
            .compute_embeddings(&notes, &HashingEmbedder::new())
            .unwrap();
        let backend = Box::new(InMemoryVectorBackend::new(vault.db()));
        Arc::new(
            VaultContext::new(
                vault,
                session,
                backend,
                None,
                FunctionRegistry::with_builtins(),
                None,
            )
            .unwrap(),
        )
    }

    #[test]
    fn successful_geist_returns_suggestions() {
        let dir = TempDir::new().unwrap();
        write_note(dir.path(), "a.md", "# Alpha\nbody");
        let ctx = build_ctx(&dir);

        let mut executor = GeistExecutor::new(&quick_config());
        executor.register_code_geist("greeter", |ctx| {
            let notes = ctx.notes()?;
            Ok(notes
                .iter()
                .map(|n| {
                    Suggestion::new(
                        format!("Revisit [[{}]] today.", n.obsidian_link()),
                        vec![n.obsidian_link()],
                        "greeter",
                    )
                })
                .collect())
        });

        let suggestions = executor.execute_geist("greeter", &ctx).unwrap();
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].notes, vec!["Alpha".to_string()]);

        let log = executor.execution_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, ExecutionStatus::Success);
        assert_eq!(log[0].suggestion_count, 1);
    }

    #[test]
    fn erroring_geist_yields_empty_and_counts_failure() {
        let dir = TempDir::new().unwrap();
        write_note(dir.path(), "a.md", "body");
        let ctx = build_ctx(&dir);

        let mut executor = GeistExecutor::new(&quick_config());
        executor.register_code_geist("broken", |_| anyhow::bail!("deliberate failure"));

        let suggestions = executor.execute_geist("broken", &ctx).unwrap();
        assert!(suggestions.is_empty());
        assert_eq!(executor.failure_count("broken"), Some(1));
        assert_eq!(executor.is_enabled("broken"), Some(true));
    }

    #[test]
    fn panicking_geist_is_contained() {
        let dir = TempDir::new().unwrap();
        write_note(dir.path(), "a.md", "body");
        let ctx = build_ctx(&dir);

        let mut executor = GeistExecutor::new(&quick_config());
        executor.register_code_geist("panicky", |_| panic!("boom"));

        let suggestions = executor.execute_geist("panicky", &ctx).unwrap();
        assert!(suggestions.is_empty());

        let record = executor
            .execution_log()
            .iter()
            .find(|r| r.geist_id == "panicky")
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Error);
        assert!(record.detail.as_deref().unwrap().contains("boom"));
    }

    #[test]
    fn timeout_then_auto_disable_after_max_failures() {
        let dir = TempDir::new().unwrap();
        write_note(dir.path(), "a.md", "body");
        let ctx = build_ctx(&dir);

        let config = Config {
            timeout_seconds: 1,
            max_failures: 3,
            ..Default::default()
        };
        let mut executor = GeistExecutor::new(&config);
        executor.register_code_geist("spinner", |_| {
            loop {
                std::thread::sleep(Duration::from_millis(50));
            }
        });

        for expected_failures in 1..=3 {
            let started = std::time::Instant::now();
            let suggestions = executor.execute_geist("spinner", &ctx).unwrap();
            assert!(suggestions.is_empty());
            assert!(started.elapsed() < Duration::from_secs(2));
            assert_eq!(executor.failure_count("spinner"), Some(expected_failures));
        }
        assert_eq!(executor.is_enabled("spinner"), Some(false));

        // Fourth call short-circuits without running the callable
        let started = std::time::Instant::now();
        let suggestions = executor.execute_geist("spinner", &ctx).unwrap();
        assert!(suggestions.is_empty());
        assert!(started.elapsed() < Duration::from_millis(100));

        let last = executor.execution_log().last().unwrap();
        assert_eq!(last.status, ExecutionStatus::Skipped);
    }

    #[test]
    fn duplicate_ids_are_load_errors_not_panics() {
        let mut executor = GeistExecutor::new(&quick_config());
        executor.register_code_geist("twin", |_| Ok(vec![]));
        executor.register_code_geist("twin", |_| Ok(vec![]));

        assert_eq!(executor.geist_ids(), vec!["twin".to_string()]);
        let record = executor.execution_log().last().unwrap();
        assert_eq!(record.status, ExecutionStatus::LoadError);
    }

    #[test]
    fn unknown_geist_is_an_error() {
        let dir = TempDir::new().unwrap();
        write_note(dir.path(), "a.md", "body");
        let ctx = build_ctx(&dir);

        let mut executor = GeistExecutor::new(&quick_config());
        assert!(matches!(
            executor.execute_geist("ghost", &ctx),
            Err(ExecutorError::UnknownGeist(_))
        ));
    }

    #[test]
    fn execute_all_runs_config_order_then_sorted() {
        let dir = TempDir::new().unwrap();
        write_note(dir.path(), "a.md", "body");
        let ctx = build_ctx(&dir);

        let mut executor = GeistExecutor::new(&quick_config());
        for id in ["zeta", "alpha", "mid"] {
            let id_owned = id.to_string();
            executor.register_code_geist(id, move |_| {
                Ok(vec![Suggestion::new(
                    format!("From {id_owned}: revisit something."),
                    vec!["x".to_string()],
                    id_owned.clone(),
                )])
            });
        }

        let order = vec!["zeta".to_string()];
        let results = executor.execute_all(&ctx, &order);
        assert_eq!(results.len(), 3);

        let executed: Vec<&str> = executor
            .execution_log()
            .iter()
            .map(|r| r.geist_id.as_str())
            .collect();
        assert_eq!(executed, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn large_outputs_are_not_truncated() {
        let dir = TempDir::new().unwrap();
        write_note(dir.path(), "a.md", "body");
        let ctx = build_ctx(&dir);

        let mut executor = GeistExecutor::new(&quick_config());
        executor.register_code_geist("prolific", |_| {
            Ok((0..1000)
                .map(|i| {
                    Suggestion::new(
                        format!("Suggestion number {i} with enough text."),
                        vec!["a".to_string()],
                        "prolific",
                    )
                })
                .collect())
        });

        let suggestions = executor.execute_geist("prolific", &ctx).unwrap();
        assert_eq!(suggestions.len(), 1000);
    }
}
