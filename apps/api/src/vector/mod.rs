//! Vector index for resume chunks, keyed by the owning `ResumeVectorRef`.
//!
//! Each ingested resume gets a fresh ref; all of its chunks live and die
//! together under that ref. Replacing a resume mints a new ref and evicts the
//! superseded chunk set, so retrieval can never mix content from two uploads.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier for one ingested resume's chunk set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeVectorRef(Uuid);

impl ResumeVectorRef {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ResumeVectorRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResumeVectorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One bounded segment of resume text with its embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeChunk {
    pub chunk_id: Uuid,
    pub owner: ResumeVectorRef,
    pub text: String,
    pub embedding: Vec<f32>,
    pub ordinal: usize,
}

/// A retrieval hit: chunk plus cosine similarity against the query vector.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: ResumeChunk,
    pub score: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn put(&self, chunks: Vec<ResumeChunk>) -> anyhow::Result<()>;

    /// Returns up to `k` chunks owned by `owner`, ranked by cosine similarity
    /// to `vector` (ties broken by ordinal for determinism).
    async fn query(
        &self,
        owner: ResumeVectorRef,
        vector: &[f32],
        k: usize,
    ) -> anyhow::Result<Vec<ScoredChunk>>;

    /// Evicts every chunk owned by `owner`.
    async fn delete_owner(&self, owner: ResumeVectorRef) -> anyhow::Result<()>;

    async fn chunk_count(&self, owner: ResumeVectorRef) -> anyhow::Result<usize>;
}

/// In-process vector index. The storage engine behind retrieval is a thin
/// collaborator; a `HashMap` behind a `RwLock` is sufficient for the
/// one-resume-per-conversation working set.
#[derive(Default)]
pub struct MemoryVectorStore {
    inner: RwLock<HashMap<ResumeVectorRef, Vec<ResumeChunk>>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn put(&self, chunks: Vec<ResumeChunk>) -> anyhow::Result<()> {
        let mut inner = self.inner.write().expect("vector store lock poisoned");
        for chunk in chunks {
            inner.entry(chunk.owner).or_default().push(chunk);
        }
        Ok(())
    }

    async fn query(
        &self,
        owner: ResumeVectorRef,
        vector: &[f32],
        k: usize,
    ) -> anyhow::Result<Vec<ScoredChunk>> {
        let inner = self.inner.read().expect("vector store lock poisoned");
        let Some(chunks) = inner.get(&owner) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<ScoredChunk> = chunks
            .iter()
            .map(|chunk| ScoredChunk {
                score: cosine_similarity(&chunk.embedding, vector),
                chunk: chunk.clone(),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk.ordinal.cmp(&b.chunk.ordinal))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn delete_owner(&self, owner: ResumeVectorRef) -> anyhow::Result<()> {
        let mut inner = self.inner.write().expect("vector store lock poisoned");
        inner.remove(&owner);
        Ok(())
    }

    async fn chunk_count(&self, owner: ResumeVectorRef) -> anyhow::Result<usize> {
        let inner = self.inner.read().expect("vector store lock poisoned");
        Ok(inner.get(&owner).map(Vec::len).unwrap_or(0))
    }
}

/// Cosine similarity; 0.0 for mismatched or zero-magnitude vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
