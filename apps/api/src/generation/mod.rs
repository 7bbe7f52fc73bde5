// Retrieval-augmented email generation.
// All model calls go through llm_client; no direct API calls here.

pub mod generator;
pub mod prompts;

pub use generator::{EmailAttachment, EmailDraft, EmailGenerator, GenerateError, RagEmailGenerator};
