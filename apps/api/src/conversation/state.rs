use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conversation::slots::{SlotMap, SlotName};
use crate::dispatch::DispatchReceipt;
use crate::vector::ResumeVectorRef;

/// Where a conversation currently sits in its lifecycle.
///
/// `Completed` and `Failed` are terminal: a terminal conversation accepts a
/// fresh start only by explicit reset, never by further slot mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    AwaitingInput,
    ResumeProcessing,
    Generating,
    Sending,
    Completed,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }
}

/// The ingested resume bound to a conversation. The fingerprint (content
/// hash) lets a re-upload of identical bytes skip re-ingestion. The raw
/// document bytes ride along (base64 in the persisted JSON) so the final
/// email can carry the resume as an attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub vector_ref: ResumeVectorRef,
    pub fingerprint: String,
    #[serde(with = "base64_bytes", default)]
    pub document: Vec<u8>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Per-user mutable conversation state. One instance per stable channel
/// address; persisted through the `ConversationStore` and mutated only via
/// its optimistic read-modify-write commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub user_id: String,
    pub phase: Phase,
    pub slots: SlotMap,
    /// Set at most once per lifecycle; re-ingestion replaces (never appends)
    /// the prior reference.
    pub resume: Option<ResumeRecord>,
    /// Per-slot retry counters, used to escalate prompts after repeated
    /// extraction failures.
    #[serde(default)]
    pub attempts: HashMap<SlotName, u32>,
    /// Present exactly when one send has been dispatched for this lifecycle.
    pub dispatch_receipt: Option<DispatchReceipt>,
    pub last_updated: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            phase: Phase::AwaitingInput,
            slots: SlotMap::default(),
            resume: None,
            attempts: HashMap::new(),
            dispatch_receipt: None,
            last_updated: Utc::now(),
        }
    }

    /// Required slots minus filled slots minus resume presence, in prompt
    /// order.
    pub fn missing_slots(&self) -> Vec<SlotName> {
        let mut missing = Vec::new();
        if self.slots.email.is_none() {
            missing.push(SlotName::Email);
        }
        if self.slots.subject.is_none() {
            missing.push(SlotName::Subject);
        }
        if self.resume.is_none() {
            missing.push(SlotName::Resume);
        }
        missing
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    /// Bumps and returns the retry counter for a slot.
    pub fn record_attempt(&mut self, slot: SlotName) -> u32 {
        let count = self.attempts.entry(slot).or_insert(0);
        *count += 1;
        *count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_awaits_input_with_everything_missing() {
        let state = ConversationState::new("whatsapp:+15551234567");
        assert_eq!(state.phase, Phase::AwaitingInput);
        assert_eq!(
            state.missing_slots(),
            vec![SlotName::Email, SlotName::Subject, SlotName::Resume]
        );
        assert!(state.dispatch_receipt.is_none());
    }

    #[test]
    fn test_missing_slots_shrinks_as_slots_fill() {
        let mut state = ConversationState::new("u1");
        state.slots.email = Some("a@b.com".to_string());
        assert_eq!(
            state.missing_slots(),
            vec![SlotName::Subject, SlotName::Resume]
        );

        state.slots.subject = Some("Backend Role".to_string());
        state.resume = Some(ResumeRecord {
            vector_ref: ResumeVectorRef::new(),
            fingerprint: "abc".to_string(),
            document: b"%PDF-1.4".to_vec(),
        });
        assert!(state.missing_slots().is_empty());
    }

    #[test]
    fn test_resume_document_round_trips_as_base64() {
        let mut state = ConversationState::new("u1");
        state.resume = Some(ResumeRecord {
            vector_ref: ResumeVectorRef::new(),
            fingerprint: "abc".to_string(),
            document: vec![0x25, 0x50, 0x44, 0x46, 0x00, 0xff],
        });
        let json = serde_json::to_string(&state).unwrap();
        // Binary content is stored as a string, not a number array.
        assert!(json.contains("\"document\":\""));
        let back: ConversationState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.resume.unwrap().document, vec![0x25, 0x50, 0x44, 0x46, 0x00, 0xff]);
    }

    #[test]
    fn test_record_attempt_increments_per_slot() {
        let mut state = ConversationState::new("u1");
        assert_eq!(state.record_attempt(SlotName::Email), 1);
        assert_eq!(state.record_attempt(SlotName::Email), 2);
        assert_eq!(state.record_attempt(SlotName::Subject), 1);
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let mut state = ConversationState::new("u1");
        state.slots.email = Some("a@b.com".to_string());
        state.record_attempt(SlotName::Email);
        let json = serde_json::to_string(&state).unwrap();
        let back: ConversationState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.user_id, "u1");
        assert_eq!(back.slots, state.slots);
        assert_eq!(back.attempts.get(&SlotName::Email), Some(&1));
    }

    #[test]
    fn test_terminal_phases() {
        assert!(Phase::Completed.is_terminal());
        assert!(Phase::Failed.is_terminal());
        assert!(!Phase::Sending.is_terminal());
        assert!(!Phase::AwaitingInput.is_terminal());
    }
}
