//! Resume ingestion pipeline — document bytes to retrievable chunks.
//!
//! Flow: extract text → chunk on natural breaks → embed each chunk → persist
//! under a fresh `ResumeVectorRef` → evict the superseded ref.
//!
//! Re-ingesting byte-identical content is a cheap no-op: the content
//! fingerprint is checked before any parsing or embedding happens.

pub mod chunker;

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::conversation::state::ResumeRecord;
use crate::embedding::{EmbedError, Embedder};
use crate::vector::{ResumeChunk, ResumeVectorRef, VectorStore};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("document has no extractable text")]
    EmptyDocument,

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbedError),

    #[error("vector store failure: {0}")]
    Store(#[source] anyhow::Error),

    #[error("ingestion timed out")]
    Timeout,

    #[error("ingestion task failed: {0}")]
    Internal(String),
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub record: ResumeRecord,
    pub chunk_count: usize,
    /// True when the byte-identical prior ingestion was kept as-is.
    pub reused: bool,
}

#[async_trait]
pub trait ResumeIngestor: Send + Sync {
    /// Ingests `bytes` for a conversation. `prior` is the resume currently
    /// bound to the conversation, if any; a successful ingest replaces it and
    /// evicts its chunks.
    async fn ingest(
        &self,
        user_id: &str,
        prior: Option<&ResumeRecord>,
        bytes: &[u8],
    ) -> Result<IngestOutcome, IngestError>;

    /// Evicts the chunk set behind a resume record. Called when a
    /// conversation is reset or forcibly terminated.
    async fn discard(&self, _record: &ResumeRecord) -> Result<(), IngestError> {
        Ok(())
    }
}

/// Production ingestor: PDF text extraction via `pdf-extract`, then the
/// chunk/embed/persist pipeline.
pub struct PdfIngestor {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
}

impl PdfIngestor {
    pub fn new(embedder: Arc<dyn Embedder>, vectors: Arc<dyn VectorStore>) -> Self {
        Self { embedder, vectors }
    }

    /// Chunks, embeds, and persists already-extracted text under a fresh ref,
    /// then evicts the prior ref. `document` is the raw upload, kept on the
    /// record for the eventual email attachment.
    async fn index_text(
        &self,
        user_id: &str,
        prior: Option<&ResumeRecord>,
        fingerprint: String,
        document: Vec<u8>,
        text: &str,
    ) -> Result<IngestOutcome, IngestError> {
        let pieces = chunker::chunk_text(text);
        if pieces.is_empty() {
            return Err(IngestError::EmptyDocument);
        }

        let vector_ref = ResumeVectorRef::new();
        let mut chunks = Vec::with_capacity(pieces.len());
        for (ordinal, piece) in pieces.into_iter().enumerate() {
            let embedding = self.embedder.embed(&piece).await?;
            chunks.push(ResumeChunk {
                chunk_id: Uuid::new_v4(),
                owner: vector_ref,
                text: piece,
                embedding,
                ordinal,
            });
        }

        let chunk_count = chunks.len();
        self.vectors.put(chunks).await.map_err(IngestError::Store)?;

        // The new chunk set is queryable; now the superseded one goes away.
        if let Some(prior) = prior {
            self.vectors
                .delete_owner(prior.vector_ref)
                .await
                .map_err(IngestError::Store)?;
            info!(
                "Replaced resume {} with {} for user {}",
                prior.vector_ref, vector_ref, user_id
            );
        }

        info!("Ingested {chunk_count} resume chunks for user {user_id}");
        Ok(IngestOutcome {
            record: ResumeRecord {
                vector_ref,
                fingerprint,
                document,
            },
            chunk_count,
            reused: false,
        })
    }
}

#[async_trait]
impl ResumeIngestor for PdfIngestor {
    async fn ingest(
        &self,
        user_id: &str,
        prior: Option<&ResumeRecord>,
        bytes: &[u8],
    ) -> Result<IngestOutcome, IngestError> {
        if bytes.is_empty() {
            return Err(IngestError::EmptyDocument);
        }

        let fingerprint = content_fingerprint(bytes);

        // Byte-identical re-upload: keep the existing chunk set.
        if let Some(prior) = prior {
            if prior.fingerprint == fingerprint {
                let count = self
                    .vectors
                    .chunk_count(prior.vector_ref)
                    .await
                    .map_err(IngestError::Store)?;
                if count > 0 {
                    info!("Resume re-upload for user {user_id} matched fingerprint; keeping {count} chunks");
                    return Ok(IngestOutcome {
                        record: prior.clone(),
                        chunk_count: count,
                        reused: true,
                    });
                }
            }
        }

        if !bytes.starts_with(b"%PDF") {
            return Err(IngestError::UnsupportedFormat(
                "not a PDF document".to_string(),
            ));
        }

        let data = bytes.to_vec();
        let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&data))
            .await
            .map_err(|e| {
                if e.is_panic() {
                    warn!("PDF parser panicked for user {user_id}");
                    IngestError::UnsupportedFormat("document could not be parsed".to_string())
                } else {
                    IngestError::Internal(e.to_string())
                }
            })?
            .map_err(|e| IngestError::UnsupportedFormat(e.to_string()))?;

        if text.trim().is_empty() {
            return Err(IngestError::EmptyDocument);
        }

        self.index_text(user_id, prior, fingerprint, bytes.to_vec(), &text)
            .await
    }

    async fn discard(&self, record: &ResumeRecord) -> Result<(), IngestError> {
        self.vectors
            .delete_owner(record.vector_ref)
            .await
            .map_err(IngestError::Store)
    }
}

/// Hex SHA-256 of the raw document bytes.
pub fn content_fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
