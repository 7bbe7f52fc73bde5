use serde::{Deserialize, Serialize};

/// The pieces of information a conversation must collect before an email can
/// be generated and sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotName {
    Email,
    Subject,
    Resume,
}

impl SlotName {
    /// Human-readable label used when prompting the user for what's missing.
    pub fn label(&self) -> &'static str {
        match self {
            SlotName::Email => "the recipient's email address",
            SlotName::Subject => "the email subject",
            SlotName::Resume => "your resume/CV as a PDF attachment",
        }
    }
}

/// Free-text slots collected from the user. A `None` means "never mentioned",
/// never "explicitly empty"; the mediator relies on that distinction. The
/// resume slot is tracked separately on `ConversationState` because it is
/// filled by ingestion, not by text extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotMap {
    pub email: Option<String>,
    pub subject: Option<String>,
}

impl SlotMap {
    /// Returns both values when every text slot is filled.
    pub fn filled(&self) -> Option<FilledSlots> {
        match (&self.email, &self.subject) {
            (Some(email), Some(subject)) => Some(FilledSlots {
                email: email.clone(),
                subject: subject.clone(),
            }),
            _ => None,
        }
    }
}

/// A complete, validated slot set. Recipient and subject flow into the draft
/// from here and only from here, never from generated text.
#[derive(Debug, Clone, PartialEq)]
pub struct FilledSlots {
    pub email: String,
    pub subject: String,
}
