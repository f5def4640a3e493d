//! Shared fixtures for the integration suites: a deterministic embedder
//! and vault file helpers. Not every suite uses every item.
#![allow(dead_code)]

use std::fs;
use std::path::Path;

use geistfabrik::embeddings::{Result, SEMANTIC_DIM, TextEmbedder};

/// Deterministic bag-of-words embedder.
///
/// Each lowercase token is hashed onto one of the `SEMANTIC_DIM` axes and
/// counted; the vector is then L2-normalised. Texts with disjoint
/// vocabulary come out (near-)orthogonal, texts sharing words come out
/// similar, and empty text yields the zero vector. Keeps the suites
/// independent of the MiniLM model files.
pub struct HashingEmbedder {
    name: String,
}

impl HashingEmbedder {
    pub fn new() -> Self {
        Self {
            name: "hashing-test-embedder".to_string(),
        }
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; SEMANTIC_DIM];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let axis = (fnv1a(token.to_lowercase().as_bytes()) as usize) % SEMANTIC_DIM;
            vector[axis] += 1.0;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl TextEmbedder for HashingEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed(text)).collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Write a note file under a vault root, creating parent directories.
pub fn write_note(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create note parent dir");
    }
    fs::write(path, content).expect("write note file");
}
