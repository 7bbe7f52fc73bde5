//! Retrieval-augmented email generation.
//!
//! Flow: query from SUBJECT slot → embed → top-K chunk retrieval →
//! concatenated grounding context → completion model → well-formedness check.
//!
//! Recipient and subject come from validated slots, never from generated
//! text, so the model can't silently alter delivery-critical fields.
//! Repeated calls may produce different prose; the draft is either
//! well-formed or the call fails.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::conversation::extractor::is_valid_email;
use crate::conversation::slots::FilledSlots;
use crate::conversation::state::ResumeRecord;
use crate::embedding::{EmbedError, Embedder};
use crate::generation::prompts::{build_email_prompt, EMAIL_SYSTEM};
use crate::llm_client::prompts::PROSE_ONLY_SYSTEM;
use crate::llm_client::{CompletionModel, LlmError};
use crate::vector::VectorStore;

/// Fixed retrieval breadth. Beyond this, extra chunks add noise, not signal.
pub const RETRIEVAL_TOP_K: usize = 4;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("no resume chunks available for retrieval")]
    InsufficientContext,

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbedError),

    #[error("retrieval failed: {0}")]
    Retrieval(#[source] anyhow::Error),

    #[error("completion failed: {0}")]
    Llm(#[from] LlmError),

    #[error("generated draft was malformed: {0}")]
    MalformedDraft(String),

    #[error("generation timed out")]
    Timeout,
}

/// The generated email, consumed immediately by dispatch; never persisted
/// beyond the send attempt.
#[derive(Debug, Clone, Serialize)]
pub struct EmailDraft {
    pub conversation: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub attachment: Option<EmailAttachment>,
}

/// The candidate's resume, sent along with the drafted body.
#[derive(Debug, Clone, Serialize)]
pub struct EmailAttachment {
    pub filename: String,
    pub content: Vec<u8>,
}

#[async_trait]
pub trait EmailGenerator: Send + Sync {
    async fn generate(
        &self,
        user_id: &str,
        slots: &FilledSlots,
        resume: &ResumeRecord,
    ) -> Result<EmailDraft, GenerateError>;
}

/// Production generator: embeddings + vector retrieval + completion model.
pub struct RagEmailGenerator {
    llm: Arc<dyn CompletionModel>,
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    sender_name: String,
}

impl RagEmailGenerator {
    pub fn new(
        llm: Arc<dyn CompletionModel>,
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
        sender_name: String,
    ) -> Self {
        Self {
            llm,
            embedder,
            vectors,
            sender_name,
        }
    }
}

#[async_trait]
impl EmailGenerator for RagEmailGenerator {
    async fn generate(
        &self,
        user_id: &str,
        slots: &FilledSlots,
        resume: &ResumeRecord,
    ) -> Result<EmailDraft, GenerateError> {
        let query = format!("job application for {}", slots.subject);
        let query_vector = self.embedder.embed(&query).await?;

        let hits = self
            .vectors
            .query(resume.vector_ref, &query_vector, RETRIEVAL_TOP_K)
            .await
            .map_err(GenerateError::Retrieval)?;
        if hits.is_empty() {
            return Err(GenerateError::InsufficientContext);
        }

        info!(
            "Retrieved {} chunks for user {} (subject: {})",
            hits.len(),
            user_id,
            slots.subject
        );

        let resume_context = hits
            .iter()
            .map(|h| h.chunk.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");

        let prompt = build_email_prompt(&slots.subject, &resume_context, &self.sender_name);
        let system = format!("{EMAIL_SYSTEM}\n\n{PROSE_ONLY_SYSTEM}");
        let body = self.llm.complete(&prompt, &system).await?;

        build_draft(user_id, slots, resume, body)
    }
}

/// Assembles and validates the final draft. Subject and recipient are copied
/// from slots here and nowhere else; the resume document rides along as the
/// attachment.
fn build_draft(
    user_id: &str,
    slots: &FilledSlots,
    resume: &ResumeRecord,
    body: String,
) -> Result<EmailDraft, GenerateError> {
    let body = body.trim().to_string();
    if body.is_empty() {
        return Err(GenerateError::MalformedDraft("empty body".to_string()));
    }
    if slots.subject.trim().is_empty() {
        return Err(GenerateError::MalformedDraft("empty subject".to_string()));
    }
    if !is_valid_email(&slots.email) {
        return Err(GenerateError::MalformedDraft(format!(
            "invalid recipient: {}",
            slots.email
        )));
    }

    let attachment = if resume.document.is_empty() {
        None
    } else {
        Some(EmailAttachment {
            filename: "resume.pdf".to_string(),
            content: resume.document.clone(),
        })
    };

    Ok(EmailDraft {
        conversation: user_id.to_string(),
        recipient: slots.email.clone(),
        subject: slots.subject.clone(),
        body,
        attachment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::{MemoryVectorStore, ResumeChunk};
    use uuid::Uuid;

    struct StubEmbedder;

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
            let len = text.chars().count() as f32;
            Ok(vec![len, 1.0])
        }
    }

    struct StubModel {
        reply: String,
    }

    #[async_trait]
    impl CompletionModel for StubModel {
        async fn complete(&self, _prompt: &str, _system: &str) -> Result<String, LlmError> {
            Ok(self.reply.clone())
        }
    }

    fn slots() -> FilledSlots {
        FilledSlots {
            email: "hr@acme.com".to_string(),
            subject: "Backend Role".to_string(),
        }
    }

    fn generator_with(reply: &str, vectors: Arc<MemoryVectorStore>) -> RagEmailGenerator {
        RagEmailGenerator::new(
            Arc::new(StubModel {
                reply: reply.to_string(),
            }),
            Arc::new(StubEmbedder),
            vectors,
            "Ada Lovelace".to_string(),
        )
    }

    fn record_for(vector_ref: crate::vector::ResumeVectorRef) -> ResumeRecord {
        ResumeRecord {
            vector_ref,
            fingerprint: "fp".to_string(),
            document: b"%PDF-1.4 resume bytes".to_vec(),
        }
    }

    async fn seeded_record(vectors: &MemoryVectorStore) -> ResumeRecord {
        let owner = crate::vector::ResumeVectorRef::new();
        vectors
            .put(vec![ResumeChunk {
                chunk_id: Uuid::new_v4(),
                owner,
                text: "Built backend services in Rust.".to_string(),
                embedding: vec![30.0, 1.0],
                ordinal: 0,
            }])
            .await
            .unwrap();
        record_for(owner)
    }

    #[tokio::test]
    async fn test_generate_produces_well_formed_draft() {
        let vectors = Arc::new(MemoryVectorStore::new());
        let record = seeded_record(&vectors).await;
        let generator = generator_with("Dear Hiring Manager, I am excited...", vectors);

        let draft = generator.generate("u1", &slots(), &record).await.unwrap();

        assert_eq!(draft.recipient, "hr@acme.com");
        assert_eq!(draft.subject, "Backend Role");
        assert!(draft.body.starts_with("Dear Hiring Manager"));
        assert_eq!(draft.conversation, "u1");
    }

    #[tokio::test]
    async fn test_draft_carries_resume_attachment() {
        let vectors = Arc::new(MemoryVectorStore::new());
        let record = seeded_record(&vectors).await;
        let generator = generator_with("Dear Hiring Manager, hello.", vectors);

        let draft = generator.generate("u1", &slots(), &record).await.unwrap();

        let attachment = draft.attachment.unwrap();
        assert_eq!(attachment.filename, "resume.pdf");
        assert_eq!(attachment.content, record.document);
    }

    #[tokio::test]
    async fn test_no_chunks_is_insufficient_context() {
        let vectors = Arc::new(MemoryVectorStore::new());
        let generator = generator_with("body", vectors);

        let record = record_for(crate::vector::ResumeVectorRef::new());
        let result = generator.generate("u1", &slots(), &record).await;
        assert!(matches!(result, Err(GenerateError::InsufficientContext)));
    }

    #[tokio::test]
    async fn test_blank_model_output_is_malformed() {
        let vectors = Arc::new(MemoryVectorStore::new());
        let record = seeded_record(&vectors).await;
        let generator = generator_with("   \n  ", vectors);

        let result = generator.generate("u1", &slots(), &record).await;
        assert!(matches!(result, Err(GenerateError::MalformedDraft(_))));
    }

    #[test]
    fn test_subject_and_recipient_come_from_slots() {
        let record = record_for(crate::vector::ResumeVectorRef::new());
        let draft = build_draft(
            "u1",
            &slots(),
            &record,
            "Subject: HIJACKED\nDear someone".to_string(),
        )
        .unwrap();
        // Whatever the model emits, delivery fields stay slot-sourced.
        assert_eq!(draft.subject, "Backend Role");
        assert_eq!(draft.recipient, "hr@acme.com");
    }

    #[test]
    fn test_invalid_recipient_fails_closed() {
        let bad = FilledSlots {
            email: "not-an-email".to_string(),
            subject: "Role".to_string(),
        };
        let record = record_for(crate::vector::ResumeVectorRef::new());
        let result = build_draft("u1", &bad, &record, "body".to_string());
        assert!(matches!(result, Err(GenerateError::MalformedDraft(_))));
    }
}
