//! End-to-end pipeline tests: sync -> session -> context -> geists ->
//! filters -> final selection, with the deterministic test embedder.

mod common;

use std::sync::Arc;

use chrono::NaiveDate;
use common::{HashingEmbedder, write_note};
use geistfabrik::config::VectorBackendKind;
use geistfabrik::embeddings::Session;
use geistfabrik::filtering::{SelectionMode, SuggestionFilter, select_suggestions};
use geistfabrik::function_registry::FunctionRegistry;
use geistfabrik::models::Suggestion;
use geistfabrik::tracery::TraceryGeist;
use geistfabrik::vault::Vault;
use geistfabrik::vault_context::VaultContext;
use geistfabrik::vector_search::{
    BackendError, InMemoryVectorBackend, SqliteVecBackend, VectorSearchBackend,
};
use geistfabrik::{Config, GeistExecutor, GeistKind};
use tempfile::TempDir;

fn session_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
}

/// Honour RUST_LOG when debugging a failing pipeline test.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn build_context(dir: &TempDir) -> Arc<VaultContext> {
    let vault = Arc::new(Vault::open(dir.path(), None, &Config::default()).unwrap());
    vault.sync(&Config::default()).unwrap();

    let session = Session::new(session_date(), &vault).unwrap();
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
fn two_note_similarity_scenario() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    write_note(dir.path(), "note1.md", "AI and machine learning");
    write_note(dir.path(), "note2.md", "Cooking with vegetables");
    let ctx = build_context(&dir);

    let note1 = ctx.get_note("note1.md").unwrap().unwrap();
    let note2 = ctx.get_note("note2.md").unwrap().unwrap();

    let neighbours = ctx.neighbours(&note1, 1).unwrap();
    assert_eq!(neighbours.len(), 1);
    assert_eq!(neighbours[0].path, "note2.md");

    let similarity = ctx.similarity(&note1, &note2).unwrap();
    assert!(similarity < 0.5, "unrelated notes scored {similarity}");
}

#[test]
fn empty_vault_runs_cleanly_end_to_end() {
    let dir = TempDir::new().unwrap();
    let vault = Arc::new(Vault::open(dir.path(), None, &Config::default()).unwrap());
    assert_eq!(vault.sync(&Config::default()).unwrap(), 0);

    let session = Session::new(session_date(), &vault).unwrap();
    let stats = session
        .compute_embeddings(&[], &HashingEmbedder::new())
        .unwrap();
    assert_eq!(stats.cached + stats.computed, 0);

    let backend = Box::new(InMemoryVectorBackend::new(vault.db()));
    let ctx = Arc::new(
        VaultContext::new(
            Arc::clone(&vault),
            session,
            backend,
            None,
            FunctionRegistry::with_builtins(),
            None,
        )
        .unwrap(),
    );
    assert!(ctx.notes().unwrap().is_empty());

    let mut executor = GeistExecutor::new(&Config::default());
    executor.register_code_geist("sampler", |ctx| {
        Ok(ctx
            .random_notes(3)?
            .iter()
            .map(|n| {
                Suggestion::new(
                    format!("Revisit [[{}]] sometime soon.", n.obsidian_link()),
                    vec![n.obsidian_link()],
                    "sampler",
                )
            })
            .collect())
    });
    let results = executor.execute_all(&ctx, &[]);
    assert!(results["sampler"].is_empty());

    let filter = SuggestionFilter::new(
        vault.db(),
        Arc::new(HashingEmbedder::new()),
        Default::default(),
    );
    let filtered = filter.filter_all(vec![], session_date()).unwrap();
    assert!(filtered.is_empty());
}

#[test]
fn session_reuses_id_and_cache_across_runs() {
    let dir = TempDir::new().unwrap();
    write_note(dir.path(), "a.md", "first note text");
    write_note(dir.path(), "b.md", "second note text");

    let vault = Arc::new(Vault::open(dir.path(), None, &Config::default()).unwrap());
    vault.sync(&Config::default()).unwrap();
    let notes = vault.all_notes().unwrap();
    let embedder = HashingEmbedder::new();

    let session1 = Session::new(session_date(), &vault).unwrap();
    let stats1 = session1.compute_embeddings(&notes, &embedder).unwrap();
    assert_eq!(stats1.computed, 2);
    assert_eq!(stats1.cached, 0);

    // Same date, new session object: same id, all hits
    let session2 = Session::new(session_date(), &vault).unwrap();
    assert_eq!(session1.id(), session2.id());
    let stats2 = session2.compute_embeddings(&notes, &embedder).unwrap();
    assert_eq!(stats2.cached, 2);
    assert_eq!(stats2.computed, 0);

    // Changing content invalidates that note's cache entry. The pause puts
    // the new mtime safely past the sync tolerance.
    std::thread::sleep(std::time::Duration::from_millis(50));
    write_note(dir.path(), "a.md", "completely rewritten text");
    vault.sync(&Config::default()).unwrap();
    let notes = vault.all_notes().unwrap();
    let stats3 = session2.compute_embeddings(&notes, &embedder).unwrap();
    assert_eq!(stats3.computed, 1);
    assert_eq!(stats3.cached, 1);
}

#[test]
fn grammar_geist_with_host_function_is_deterministic() {
    let dir = TempDir::new().unwrap();
    write_note(dir.path(), "alpha.md", "# Alpha\nfirst");
    write_note(dir.path(), "beta.md", "# Beta\nsecond");
    write_note(dir.path(), "gamma.md", "# Gamma\nthird");

    let yaml = "
kind: grammar
id: revisiter
grammar:
  origin:
    - \"Revisit $vault.sample_notes(1) with fresh eyes.\"
";

    let run = || {
        let ctx = build_context(&dir);
        let mut executor = GeistExecutor::new(&Config::default());
        executor.register(
            Arc::new(TraceryGeist::from_yaml_str(yaml, ctx.seed()).unwrap()),
            GeistKind::Grammar,
        );
        executor.execute_all(&ctx, &[])["revisiter"].clone()
    };

    let first = run();
    let second = run();
    assert_eq!(first, second, "same date must give identical output");

    assert_eq!(first.len(), 1);
    let suggestion = &first[0];
    assert!(suggestion.text.starts_with("Revisit [["));
    assert_eq!(suggestion.notes.len(), 1);
    let titles = ["Alpha", "Beta", "Gamma"];
    assert!(titles.contains(&suggestion.notes[0].as_str()));
    assert!(suggestion.text.contains(&format!("[[{}]]", suggestion.notes[0])));
}

#[test]
fn full_pipeline_is_deterministic_across_runs() {
    let dir = TempDir::new().unwrap();
    for i in 0..6 {
        write_note(
            dir.path(),
            &format!("note{i}.md"),
            &format!("# Note {i}\nBody text for note number {i} with [[note{}]].", (i + 1) % 6),
        );
    }

    let run = || {
        let vault = Arc::new(Vault::open(dir.path(), None, &Config::default()).unwrap());
        vault.sync(&Config::default()).unwrap();
        let session = Session::new(session_date(), &vault).unwrap();
        let notes = vault.all_notes().unwrap();
        session
            .compute_embeddings(&notes, &HashingEmbedder::new())
            .unwrap();
        let backend = Box::new(InMemoryVectorBackend::new(vault.db()));
        let ctx = Arc::new(
            VaultContext::new(
                Arc::clone(&vault),
                session,
                backend,
                None,
                FunctionRegistry::with_builtins(),
                None,
            )
            .unwrap(),
        );

        let mut executor = GeistExecutor::new(&Config::default());
        executor.register_code_geist("wanderer", |ctx| {
            Ok(ctx
                .random_notes(3)?
                .iter()
                .map(|n| {
                    Suggestion::new(
                        format!("What would change if you rewrote [[{}]]?", n.obsidian_link()),
                        vec![n.obsidian_link()],
                        "wanderer",
                    )
                })
                .collect())
        });
        executor.register_code_geist("connector", |ctx| {
            Ok(ctx
                .unlinked_pairs(2)?
                .iter()
                .map(|(a, b)| {
                    Suggestion::new(
                        format!(
                            "[[{}]] and [[{}]] are close but unlinked.",
                            a.obsidian_link(),
                            b.obsidian_link()
                        ),
                        vec![a.obsidian_link(), b.obsidian_link()],
                        "connector",
                    )
                })
                .collect())
        });

        let results = executor.execute_all(&ctx, &[]);
        let mut batch: Vec<Suggestion> = Vec::new();
        for suggestions in results.values() {
            batch.extend(suggestions.clone());
        }

        let filter = SuggestionFilter::new(
            vault.db(),
            Arc::new(HashingEmbedder::new()),
            Default::default(),
        );
        let filtered = filter.filter_all(batch, session_date()).unwrap();
        select_suggestions(filtered, SelectionMode::Default, 3, ctx.seed())
    };

    let first = run();
    let second = run();
    assert_eq!(first, second);
    assert!(!first.is_empty());
    assert!(first.len() <= 3);
}

#[test]
fn suggestions_reference_only_obsidian_links() {
    let dir = TempDir::new().unwrap();
    write_note(
        dir.path(),
        "Journal.md",
        "## 2025-01-10\nWorked on [[Project X]].\n## 2025-01-11\nMore of the same.",
    );
    write_note(dir.path(), "Project X.md", "# Project X\nDetails.");
    let ctx = build_context(&dir);

    let notes = ctx.notes().unwrap();
    let links: Vec<String> = notes.iter().map(|n| n.obsidian_link()).collect();

    let mut executor = GeistExecutor::new(&Config::default());
    executor.register_code_geist("lister", |ctx| {
        Ok(ctx
            .notes()?
            .iter()
            .map(|n| {
                Suggestion::new(
                    format!("Take another look at [[{}]] today.", n.obsidian_link()),
                    vec![n.obsidian_link()],
                    "lister",
                )
            })
            .collect())
    });

    let results = executor.execute_all(&ctx, &[]);
    for suggestion in &results["lister"] {
        for reference in &suggestion.notes {
            assert!(
                links.contains(reference),
                "reference {reference:?} is not an obsidian_link"
            );
        }
        // No duplicate references within one suggestion
        let unique: std::collections::HashSet<&String> = suggestion.notes.iter().collect();
        assert_eq!(unique.len(), suggestion.notes.len());
    }
}

#[test]
fn vector_backends_agree_within_epsilon() {
    let dir = TempDir::new().unwrap();
    // Growing shared-word prefixes give every pair a distinct similarity,
    // so the two backends' rankings can't diverge on ties.
    for i in 0..8 {
        let shared: Vec<String> = (0..=i).map(|j| format!("common{j}")).collect();
        write_note(
            dir.path(),
            &format!("n{i}.md"),
            &format!("{} unique{i}", shared.join(" ")),
        );
    }

    let config = Config {
        vector_backend: VectorBackendKind::Indexed,
        ..Default::default()
    };
    let vault = match Vault::open(dir.path(), None, &config) {
        Ok(vault) => Arc::new(vault),
        Err(e) => {
            eprintln!("skipping parity test, extension install failed: {e}");
            return;
        }
    };
    vault.sync(&config).unwrap();
    let session = Session::new(session_date(), &vault).unwrap();
    let notes = vault.all_notes().unwrap();
    session
        .compute_embeddings(&notes, &HashingEmbedder::new())
        .unwrap();

    let mut in_memory = InMemoryVectorBackend::new(vault.db());
    in_memory.load_embeddings(session_date()).unwrap();

    let mut indexed = match SqliteVecBackend::new(vault.db()) {
        Ok(backend) => backend,
        Err(BackendError::ExtensionUnavailable(reason)) => {
            eprintln!("skipping parity test, sqlite-vec unavailable: {reason}");
            return;
        }
        Err(e) => panic!("backend construction failed: {e}"),
    };
    indexed.load_embeddings(session_date()).unwrap();

    const EPSILON: f32 = 1e-5;
    for note in &notes {
        let query = in_memory.get_embedding(&note.path).unwrap();

        let scan_hits = in_memory.find_similar(&query, 4).unwrap();
        let index_hits = indexed.find_similar(&query, 4).unwrap();
        assert_eq!(scan_hits.len(), index_hits.len());
        for ((scan_path, scan_score), (index_path, index_score)) in
            scan_hits.iter().zip(index_hits.iter())
        {
            assert_eq!(scan_path, index_path, "ranking diverged for {}", note.path);
            assert!(
                (scan_score - index_score).abs() < EPSILON,
                "score diverged for {scan_path}: {scan_score} vs {index_score}"
            );
        }

        for other in &notes {
            let scan_sim = in_memory.get_similarity(&note.path, &other.path).unwrap();
            let index_sim = indexed.get_similarity(&note.path, &other.path).unwrap();
            assert!((scan_sim - index_sim).abs() < EPSILON);
        }
    }
}
