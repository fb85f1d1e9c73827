//! qntx-embedding
//!
//! The contract the Match Evaluator (C5) and Watcher Engine (C9) use to
//! reach the external embedding-model runtime, plus the float-vector wire
//! format consumed by the external vector index (§4.C4, §6).

use std::fmt;

use async_trait::async_trait;

/// A unit-length (in practice, provider-dependent) float vector. Dimension
/// is fixed by the provider that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding(pub Vec<f32>);

impl Embedding {
    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    /// Little-endian IEEE-754 binary32 array, `dimension * 4` bytes — the
    /// wire format the external vector index expects (§6).
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * 4);
        for f in &self.0 {
            out.extend_from_slice(&f.to_le_bytes());
        }
        out
    }

    /// Rejects any input whose length is not a multiple of 4 (§6).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EmbeddingError> {
        if bytes.len() % 4 != 0 {
            return Err(EmbeddingError::InvalidBlob {
                len: bytes.len(),
            });
        }
        let values = bytes
            .chunks_exact(4)
            .map(|chunk| {
                let arr: [u8; 4] = chunk.try_into().expect("chunks_exact(4) yields 4 bytes");
                f32::from_le_bytes(arr)
            })
            .collect();
        Ok(Embedding(values))
    }
}

/// Cosine similarity in `[-1, 1]`. Defined to return 0 for any zero-norm
/// input (§4.C4) rather than dividing by zero.
pub fn compute_similarity(a: &Embedding, b: &Embedding) -> f32 {
    let len = a.0.len().min(b.0.len());
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for i in 0..len {
        dot += a.0[i] * b.0[i];
        norm_a += a.0[i] * a.0[i];
        norm_b += b.0[i] * b.0[i];
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// The provider failed or is unavailable (§7 EmbeddingError).
#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    Unavailable,
    GenerationFailed { message: String },
    InvalidBlob { len: usize },
}

impl fmt::Display for EmbeddingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbeddingError::Unavailable => write!(f, "embedding provider unavailable"),
            EmbeddingError::GenerationFailed { message } => {
                write!(f, "embedding generation failed: {message}")
            }
            EmbeddingError::InvalidBlob { len } => {
                write!(f, "embedding blob length {len} is not a multiple of 4")
            }
        }
    }
}

impl std::error::Error for EmbeddingError {}

/// A single ranked result from [`VectorSearcher::search`].
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub source_id: String,
    pub similarity: f32,
}

/// The external embedding-model runtime, as seen by this engine. Out of
/// scope per spec.md §1 — treated as an opaque collaborator.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn generate(&self, text: &str) -> Result<Embedding, EmbeddingError>;
}

/// Optional companion searcher over an external vector index (§4.C4). Not
/// every deployment has one; the engine falls back to a full structural or
/// newest-first scan when it's absent (§4.C9 historical back-query).
#[async_trait]
pub trait VectorSearcher: Send + Sync {
    async fn search(
        &self,
        query_blob: &[u8],
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<SearchHit>, EmbeddingError>;
}
