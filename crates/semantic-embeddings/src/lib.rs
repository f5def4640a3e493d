//! Semantic sentence embeddings for note content.
//!
//! Wraps the all-MiniLM-L6-v2 sentence transformer, run locally through
//! candle. Texts are tokenized, mean-pooled over real tokens, and
//! L2-normalised, so cosine similarity between two embeddings reduces to
//! a dot product.

mod embedding;
mod model;

// Re-export for external use
pub use embedding::{cosine_similarity, find_most_similar};
use model::ModelManager;

/// Embedding dimension for all-MiniLM-L6-v2.
/// Determined by the model architecture's hidden size.
pub const EMBEDDING_DIM: usize = 384;

/// Name of the bundled sentence-transformer model. Part of the cache key
/// used by consumers, so changing the model invalidates cached vectors.
pub const MODEL_NAME: &str = "all-MiniLM-L6-v2";

/// Type alias for an embedding vector.
pub type Embedding = Vec<f32>;

/// Semantic embedding generator for text content.
///
/// # Example
/// ```ignore
/// use semantic_embeddings::SemanticEmbeddings;
/// use std::path::Path;
///
/// let embeddings = SemanticEmbeddings::new();
/// embeddings.load_model_from_dir(Path::new("models/all-MiniLM-L6-v2"))?;
///
/// let vector = embeddings.encode("Hello world")?;
/// assert_eq!(vector.len(), semantic_embeddings::EMBEDDING_DIM);
/// ```
pub struct SemanticEmbeddings {
    model: ModelManager,
}

impl SemanticEmbeddings {
    /// Create a new instance. Call `load_model_from_dir()` before encoding.
    pub fn new() -> Self {
        Self {
            model: ModelManager::new(),
        }
    }

    /// Load model from a directory containing the usual sentence-transformers
    /// export layout.
    ///
    /// # Expected files
    /// - `config.json` - Model configuration
    /// - `tokenizer.json` - Tokenizer configuration
    /// - `model.safetensors` - Model weights
    pub fn load_model_from_dir(&self, model_dir: &std::path::Path) -> anyhow::Result<()> {
        use std::fs;

        let config_path = model_dir.join("config.json");
        let tokenizer_path = model_dir.join("tokenizer.json");
        let weights_path = model_dir.join("model.safetensors");

        let config_json = fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", config_path.display(), e))?;

        let tokenizer_json = fs::read_to_string(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", tokenizer_path.display(), e))?;

        let model_weights = fs::read(&weights_path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", weights_path.display(), e))?;

        self.model
            .load_model(&config_json, &tokenizer_json, &model_weights)
    }

    /// Load model from data already in memory (safetensors format weights).
    pub fn load_model(
        &self,
        config_json: &str,
        tokenizer_json: &str,
        model_weights: &[u8],
    ) -> anyhow::Result<()> {
        self.model
            .load_model(config_json, tokenizer_json, model_weights)
    }

    /// Whether a model has been loaded.
    pub fn is_loaded(&self) -> bool {
        self.model.is_loaded()
    }

    /// Encode a single text into a 384-dimensional embedding vector.
    pub fn encode(&self, text: &str) -> anyhow::Result<Embedding> {
        self.model.encode_single(text)
    }

    /// Encode multiple texts in one forward pass (more efficient than
    /// repeated `encode()` calls).
    pub fn encode_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Embedding>> {
        self.model.encode_batch(texts)
    }
}

impl Default for SemanticEmbeddings {
    fn default() -> Self {
        Self::new()
    }
}
