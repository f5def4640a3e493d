use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config};
use std::sync::Mutex;
use tokenizers::Tokenizer;

/// Handles loading and inference with the sentence transformer model.
///
/// The model is loaded lazily into a mutex-guarded slot so a shared
/// reference can be handed to callers before the weights are available.
pub struct ModelManager {
    state: Mutex<Option<ModelState>>,
}

struct ModelState {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl ModelManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }

    /// Load the model from its serialized parts.
    ///
    /// # Arguments
    /// * `config_json` - JSON string containing the BERT config
    /// * `tokenizer_json` - JSON string containing the tokenizer definition
    /// * `model_weights` - Model weights in safetensors format
    pub fn load_model(
        &self,
        config_json: &str,
        tokenizer_json: &str,
        model_weights: &[u8],
    ) -> Result<()> {
        let mut state_guard = self.state.lock().unwrap();

        if state_guard.is_some() {
            return Ok(()); // Already loaded
        }

        // CPU inference only; the vault pipeline is a single local process
        let device = Device::Cpu;

        let tokenizer = Tokenizer::from_bytes(tokenizer_json.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;

        let config: Config =
            serde_json::from_str(config_json).context("Failed to parse config.json")?;

        let vb =
            VarBuilder::from_buffered_safetensors(model_weights.to_vec(), DType::F32, &device)?;
        let model = BertModel::load(vb, &config)?;

        *state_guard = Some(ModelState {
            model,
            tokenizer,
            device,
        });

        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }

    /// Encode a single text into an embedding vector.
    pub fn encode_single(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.encode_batch(std::slice::from_ref(&text.to_string()))?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Model produced no embedding"))
    }

    /// Encode multiple texts in one padded batch.
    pub fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let state_guard = self.state.lock().unwrap();
        let state = state_guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Model not loaded. Call load_model() first."))?;

        let encodings: Vec<_> = texts
            .iter()
            .map(|text| {
                state
                    .tokenizer
                    .encode(text.as_str(), true)
                    .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))
            })
            .collect::<Result<Vec<_>>>()?;

        // Pad every sequence to the longest in the batch. The attention mask
        // marks real tokens as 1 and padding as 0, which keeps padding out of
        // the mean pooling below.
        let max_len = encodings.iter().map(|e| e.len()).max().unwrap_or(0);

        let mut all_token_ids = Vec::with_capacity(encodings.len());
        let mut all_masks = Vec::with_capacity(encodings.len());

        for encoding in &encodings {
            let mut tokens: Vec<u32> = encoding.get_ids().to_vec();
            let mut mask: Vec<u32> = encoding.get_attention_mask().to_vec();
            tokens.resize(max_len, 0); // PAD token
            mask.resize(max_len, 0);
            all_token_ids.push(tokens);
            all_masks.push(mask);
        }

        // Masks stay U32 here: BertModel requires an integer dtype before it
        // converts internally via get_extended_attention_mask().
        let token_ids = Tensor::new(all_token_ids, &state.device)?;
        let attention_mask = Tensor::new(all_masks, &state.device)?;

        // token_type_ids = None, single-sequence inputs
        let output = state.model.forward(&token_ids, &attention_mask, None)?;

        let attention_mask_f32 = attention_mask.to_dtype(DType::F32)?;
        let pooled = mean_pool(&output, &attention_mask_f32)?;
        let normalized = l2_normalize(&pooled)?;

        let mut vectors = Vec::with_capacity(texts.len());
        for i in 0..texts.len() {
            let row: Vec<f32> = normalized
                .get(i)?
                .to_vec1()
                .context("Failed to convert tensor to vec")?;
            vectors.push(row);
        }

        Ok(vectors)
    }
}

impl Default for ModelManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Mean pooling: average token embeddings weighted by the attention mask.
///
/// Mean pooling over all tokens captures sentence meaning better than the
/// [CLS] token alone; masked weighting keeps padding out of the average.
/// See: https://www.sbert.net/docs/usage/computing_sentence_embeddings.html
fn mean_pool(token_embeddings: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    // token_embeddings: [batch, seq_len, hidden], attention_mask: [batch, seq_len]
    let dims = token_embeddings.dims();
    let mask_expanded = attention_mask
        .unsqueeze(2)?
        .broadcast_as((dims[0], dims[1], dims[2]))?
        .to_dtype(DType::F32)?;

    let sum_embeddings = token_embeddings.mul(&mask_expanded)?.sum(1)?;
    let sum_mask = mask_expanded.sum(1)?;

    // Clamp guards against an all-padding row dividing by zero
    let sum_mask = sum_mask.clamp(1e-9, f64::MAX)?;

    Ok(sum_embeddings.broadcast_div(&sum_mask)?)
}

/// Project embeddings onto the unit hypersphere (L2 normalization), so
/// cosine similarity becomes a plain dot product downstream.
fn l2_normalize(embeddings: &Tensor) -> Result<Tensor> {
    let norm = embeddings
        .sqr()?
        .sum_keepdim(embeddings.dims().len() - 1)?
        .sqrt()?;

    embeddings
        .broadcast_div(&norm)
        .context("Normalization failed")
}
