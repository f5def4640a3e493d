//! GeistFabrik: a divergence engine for Obsidian-style Markdown vaults.
//!
//! The pipeline syncs a vault of Markdown files into SQLite, derives
//! per-session text+temporal embeddings, hands a memoised [`VaultContext`]
//! to a library of small analytic geists, and trims their suggestions
//! through a four-stage filter before the journal writer takes over.
//!
//! Layering, bottom to top: schema/store, markdown parsing,
//! date-collection splitting, vault sync, embedding cache + session,
//! vector backends, vault context, geist execution (code and grammar),
//! and the suggestion filter pipeline. Each layer consumes only the
//! layers below it.

pub mod config;
pub mod date_collection;
pub mod embeddings;
pub mod executor;
pub mod filtering;
pub mod function_registry;
pub mod markdown;
pub mod metadata;
pub mod models;
pub mod schema;
pub mod tracery;
pub mod vault;
pub mod vault_context;
pub mod vector_search;

#[cfg(test)]
mod test_support;

pub use config::{Config, DateCollectionConfig, FilterConfig, VectorBackendKind};
pub use embeddings::{
    EmbeddingStats, MiniLmEmbedder, SEMANTIC_DIM, Session, TEMPORAL_DIM, TOTAL_DIM, TextEmbedder,
};
pub use executor::{ExecutionRecord, ExecutionStatus, Geist, GeistExecutor, GeistKind};
pub use filtering::{SelectionMode, SuggestionFilter, select_suggestions};
pub use function_registry::{FunctionArg, FunctionRegistry, FunctionValue};
pub use metadata::{MetadataAnalyser, MetadataLoader, MetadataModule};
pub use models::{Link, Note, Suggestion};
pub use tracery::{TraceryEngine, TraceryGeist};
pub use vault::Vault;
pub use vault_context::VaultContext;
pub use vector_search::{
    InMemoryVectorBackend, SqliteVecBackend, VectorSearchBackend, install_vector_extension,
};
