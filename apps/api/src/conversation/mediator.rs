//! Mediator — the state machine binding extraction, ingestion, generation,
//! and dispatch together.
//!
//! One inbound message triggers exactly one transition pass and exactly one
//! outbound reply. All next-step decisions are deterministic functions of
//! `ConversationState` plus extracted entities; model calls never drive
//! control flow.
//!
//! Concurrency: per-user serialization happens entirely through the store's
//! optimistic commit. No lock is held across an external call: the mediator
//! commits a phase marker first, performs the slow work, then commits the
//! result. The compare-and-swap into `Sending` is the dispatch gate: only
//! the writer that wins it may call the mail collaborator, so a duplicated
//! trigger observes the advanced phase and no-ops.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{error, info, warn};

use crate::conversation::extractor::{self, EmailExtraction};
use crate::conversation::replies;
use crate::conversation::slots::SlotName;
use crate::conversation::state::{ConversationState, Phase};
use crate::conversation::store::{ConversationStore, StoreError, Versioned};
use crate::dispatch::{DispatchError, MailSubmitter};
use crate::generation::{EmailGenerator, GenerateError};
use crate::ingestion::{IngestError, ResumeIngestor};

/// Bounded optimistic-commit retries per transition.
const COMMIT_RETRIES: u32 = 5;

/// Messages that start a fresh conversation after a terminal phase.
const RESET_KEYWORDS: &[&str] = &["reset", "restart", "start over", "new request"];

/// One inbound event from the channel gateway.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub user_id: String,
    pub text: Option<String>,
    pub attachment: Option<Bytes>,
}

/// The single outbound reply produced for a turn.
#[derive(Debug, Clone)]
pub struct OutboundReply {
    pub user_id: String,
    pub text: String,
}

enum Commit {
    Applied(Versioned<ConversationState>),
    /// The mutation's phase precondition no longer held; another writer
    /// owns the conversation right now.
    Skipped(Versioned<ConversationState>),
}

pub struct Mediator {
    store: Arc<dyn ConversationStore>,
    ingestor: Arc<dyn ResumeIngestor>,
    generator: Arc<dyn EmailGenerator>,
    mailer: Arc<dyn MailSubmitter>,
    /// Bound on any single external call (ingestion, generation, dispatch).
    external_timeout: Duration,
}

impl Mediator {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        ingestor: Arc<dyn ResumeIngestor>,
        generator: Arc<dyn EmailGenerator>,
        mailer: Arc<dyn MailSubmitter>,
        external_timeout: Duration,
    ) -> Self {
        Self {
            store,
            ingestor,
            generator,
            mailer,
            external_timeout,
        }
    }

    /// Handles one inbound message end to end. Never fails outward: store
    /// outages degrade to an apologetic reply so the turn still produces
    /// exactly one outbound message.
    pub async fn handle_turn(&self, msg: InboundMessage) -> OutboundReply {
        let text = match self.run_turn(&msg).await {
            Ok(text) => text,
            Err(e) => {
                error!("Turn failed for {}: {e}", msg.user_id);
                replies::unavailable()
            }
        };
        OutboundReply {
            user_id: msg.user_id,
            text,
        }
    }

    /// Forcibly terminates an abandoned conversation. A conversation already
    /// in `Sending` belongs to the dispatch writer and is left alone, so no
    /// partial send can follow a forced termination. Returns whether a
    /// transition happened.
    pub async fn fail_conversation(&self, user_id: &str) -> Result<bool, StoreError> {
        let commit = self
            .commit_mutation(user_id, |state| {
                if state.phase.is_terminal() || state.phase == Phase::Sending {
                    return false;
                }
                state.phase = Phase::Failed;
                true
            })
            .await?;
        match commit {
            Commit::Applied(v) => {
                info!("Forced conversation {} to failed", user_id);
                if let Some(record) = &v.value.resume {
                    if let Err(e) = self.ingestor.discard(record).await {
                        warn!("Failed to discard resume chunks for {user_id}: {e}");
                    }
                }
                Ok(true)
            }
            Commit::Skipped(_) => Ok(false),
        }
    }

    async fn run_turn(&self, msg: &InboundMessage) -> Result<String, StoreError> {
        let snapshot = self.store.load(&msg.user_id).await?;

        // Terminal conversations accept a fresh start only by explicit reset.
        if snapshot.value.phase.is_terminal() {
            if is_reset(msg.text.as_deref()) {
                return self.reset_conversation(&msg.user_id).await;
            }
            return Ok(replies::terminal_hint());
        }

        // A redelivery or double-send while another task is mid-pipeline.
        if snapshot.value.phase != Phase::AwaitingInput {
            return Ok(replies::in_progress());
        }

        // Step 1: merge extracted entities. Slot merge always precedes
        // attachment processing; last-message-wins per slot within a turn.
        let extraction = msg
            .text
            .as_deref()
            .map(extractor::extract)
            .unwrap_or_default();

        let merged = self
            .commit_mutation(&msg.user_id, |state| {
                if state.phase != Phase::AwaitingInput {
                    return false;
                }
                if let EmailExtraction::Found(email) = &extraction.email {
                    state.slots.email = Some(email.clone());
                }
                if let Some(subject) = &extraction.subject {
                    state.slots.subject = Some(subject.clone());
                }
                if matches!(extraction.email, EmailExtraction::Invalid(_)) {
                    state.record_attempt(SlotName::Email);
                }
                true
            })
            .await?;
        let mut current = match merged {
            Commit::Applied(v) => v,
            Commit::Skipped(v) => return Ok(reply_for_phase(v.value.phase)),
        };

        // An invalid email halts the turn with a specific correction prompt.
        if let EmailExtraction::Invalid(candidate) = &extraction.email {
            let attempts = current
                .value
                .attempts
                .get(&SlotName::Email)
                .copied()
                .unwrap_or(1);
            return Ok(replies::invalid_email_prompt(candidate, attempts));
        }

        // Step 2: attachment processing.
        let mut ingest_note = None;
        if let Some(bytes) = &msg.attachment {
            match self.process_attachment(&msg.user_id, bytes).await? {
                AttachmentResult::Ingested { state, note } => {
                    current = state;
                    ingest_note = Some(note);
                }
                AttachmentResult::Reply(text) => return Ok(text),
            }
        }

        // Step 3: completeness. Prompt names exactly what's still missing.
        let missing = current.value.missing_slots();
        if !missing.is_empty() {
            let prompt = replies::missing_slots_prompt(&missing);
            return Ok(match ingest_note {
                Some(note) => format!("{note}\n\n{prompt}"),
                None => prompt,
            });
        }

        // Step 4: generate and dispatch.
        self.generate_and_dispatch(&msg.user_id).await
    }

    async fn reset_conversation(&self, user_id: &str) -> Result<String, StoreError> {
        let prior = self.store.load(user_id).await?.value.resume;
        self.commit_mutation(user_id, |state| {
            *state = ConversationState::new(state.user_id.clone());
            true
        })
        .await?;
        info!("Reset conversation for {user_id}");
        // The superseded lifecycle's chunks are no longer reachable; evict.
        if let Some(record) = &prior {
            if let Err(e) = self.ingestor.discard(record).await {
                warn!("Failed to discard resume chunks for {user_id}: {e}");
            }
        }
        Ok(replies::reset_confirmation())
    }

    async fn process_attachment(
        &self,
        user_id: &str,
        bytes: &Bytes,
    ) -> Result<AttachmentResult, StoreError> {
        // Mark the phase before the slow work so duplicate deliveries
        // observe it and no-op.
        let marked = self
            .commit_mutation(user_id, |state| {
                if state.phase != Phase::AwaitingInput {
                    return false;
                }
                state.phase = Phase::ResumeProcessing;
                true
            })
            .await?;
        let marked = match marked {
            Commit::Applied(v) => v,
            Commit::Skipped(v) => return Ok(AttachmentResult::Reply(reply_for_phase(v.value.phase))),
        };

        // Ingestion runs on its own task so a deadline doesn't cancel it
        // mid-index; a timed-out run is reaped below once it finishes.
        let prior = marked.value.resume.clone();
        let ingestor = self.ingestor.clone();
        let task_user = user_id.to_string();
        let task_bytes = bytes.clone();
        let mut ingest_task = tokio::spawn(async move {
            ingestor
                .ingest(&task_user, prior.as_ref(), &task_bytes)
                .await
        });

        let outcome = match tokio::time::timeout(self.external_timeout, &mut ingest_task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(IngestError::Internal(format!("ingestion task failed: {e}"))),
            Err(_) => {
                // The run may still index chunks after the deadline; nothing
                // will ever reference them, so evict once it settles.
                let ingestor = self.ingestor.clone();
                let reap_user = user_id.to_string();
                tokio::spawn(async move {
                    if let Ok(Ok(outcome)) = ingest_task.await {
                        if let Err(e) = ingestor.discard(&outcome.record).await {
                            warn!("Failed to discard orphaned resume chunks for {reap_user}: {e}");
                        }
                    }
                });
                Err(IngestError::Timeout)
            }
        };

        match outcome {
            Ok(outcome) => {
                let record = outcome.record.clone();
                let committed = self
                    .commit_mutation(user_id, move |state| {
                        if state.phase != Phase::ResumeProcessing {
                            return false;
                        }
                        state.phase = Phase::AwaitingInput;
                        state.resume = Some(record.clone());
                        true
                    })
                    .await?;
                match committed {
                    Commit::Applied(v) => Ok(AttachmentResult::Ingested {
                        state: v,
                        note: replies::resume_received(outcome.chunk_count),
                    }),
                    Commit::Skipped(v) => {
                        // The conversation was taken over while we indexed;
                        // the fresh chunks are unreachable.
                        if let Err(e) = self.ingestor.discard(&outcome.record).await {
                            warn!("Failed to discard orphaned resume chunks for {user_id}: {e}");
                        }
                        Ok(AttachmentResult::Reply(reply_for_phase(v.value.phase)))
                    }
                }
            }
            Err(err) => {
                // Recoverable: back to awaiting input with the specific
                // reason, slots untouched.
                warn!("Ingestion failed for {user_id}: {err}");
                self.commit_mutation(user_id, |state| {
                    if state.phase != Phase::ResumeProcessing {
                        return false;
                    }
                    state.phase = Phase::AwaitingInput;
                    true
                })
                .await?;
                Ok(AttachmentResult::Reply(replies::ingestion_failure_prompt(&err)))
            }
        }
    }

    async fn generate_and_dispatch(&self, user_id: &str) -> Result<String, StoreError> {
        // Claim the generation phase. Losing the claim means another writer
        // already owns the completion path.
        let claimed = self
            .commit_mutation(user_id, |state| {
                if state.phase != Phase::AwaitingInput || !state.missing_slots().is_empty() {
                    return false;
                }
                state.phase = Phase::Generating;
                true
            })
            .await?;
        let current = match claimed {
            Commit::Applied(v) => v,
            Commit::Skipped(v) => return Ok(reply_for_phase(v.value.phase)),
        };

        // Both guaranteed by the claim's completeness precondition.
        let (Some(slots), Some(resume)) =
            (current.value.slots.filled(), current.value.resume.as_ref())
        else {
            return Ok(replies::unavailable());
        };

        let draft = match tokio::time::timeout(
            self.external_timeout,
            self.generator.generate(user_id, &slots, resume),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GenerateError::Timeout),
        };

        let draft = match draft {
            Ok(draft) => draft,
            Err(GenerateError::InsufficientContext) => {
                // Recoverable only by re-ingestion: drop the dangling ref and
                // ask for the attachment again.
                warn!("No retrievable chunks for {user_id}; requesting re-ingestion");
                let recovered = self
                    .commit_mutation(user_id, |state| {
                        if state.phase != Phase::Generating {
                            return false;
                        }
                        state.phase = Phase::AwaitingInput;
                        state.resume = None;
                        true
                    })
                    .await?;
                return Ok(match recovered {
                    Commit::Applied(_) => replies::reattach_prompt(),
                    Commit::Skipped(v) => reply_for_phase(v.value.phase),
                });
            }
            Err(err) => {
                warn!("Generation failed for {user_id}: {err}");
                self.fail_from(user_id, Phase::Generating).await?;
                return Ok(replies::terminal_failure());
            }
        };

        // Dispatch gate: the CAS into Sending is the exclusivity boundary.
        // Only this writer, having won the commit, may call the mail
        // collaborator; a duplicate trigger sees the advanced phase.
        let gate = self
            .commit_mutation(user_id, |state| {
                if state.phase != Phase::Generating || state.dispatch_receipt.is_some() {
                    return false;
                }
                state.phase = Phase::Sending;
                true
            })
            .await?;
        if let Commit::Skipped(v) = gate {
            return Ok(reply_for_phase(v.value.phase));
        }

        let delivery = match tokio::time::timeout(
            self.external_timeout,
            self.mailer.deliver(&draft),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout),
        };

        match delivery {
            Ok(receipt) => {
                info!(
                    "Dispatched email {} to {} for {user_id}",
                    receipt.message_id, draft.recipient
                );
                self.commit_mutation(user_id, move |state| {
                    if state.phase != Phase::Sending {
                        return false;
                    }
                    state.phase = Phase::Completed;
                    state.dispatch_receipt = Some(receipt.clone());
                    true
                })
                .await?;
                Ok(replies::confirmation(&draft.recipient))
            }
            Err(err) => {
                error!("Dispatch failed for {user_id}: {err}");
                self.fail_from(user_id, Phase::Sending).await?;
                Ok(replies::terminal_failure())
            }
        }
    }

    async fn fail_from(&self, user_id: &str, expected: Phase) -> Result<(), StoreError> {
        self.commit_mutation(user_id, move |state| {
            if state.phase != expected {
                return false;
            }
            state.phase = Phase::Failed;
            true
        })
        .await?;
        Ok(())
    }

    /// Optimistic read-modify-write: load, apply the pure mutation, commit
    /// against the read version; retry on conflict. The mutation returns
    /// false to signal its precondition no longer holds.
    async fn commit_mutation<F>(&self, user_id: &str, mutate: F) -> Result<Commit, StoreError>
    where
        F: Fn(&mut ConversationState) -> bool,
    {
        for _ in 0..COMMIT_RETRIES {
            let loaded = self.store.load(user_id).await?;
            let mut next = loaded.value.clone();
            if !mutate(&mut next) {
                return Ok(Commit::Skipped(loaded));
            }
            next.touch();
            match self.store.commit(loaded.version, &next).await {
                Ok(version) => {
                    return Ok(Commit::Applied(Versioned {
                        value: next,
                        version,
                    }))
                }
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Conflict(user_id.to_string()))
    }
}

enum AttachmentResult {
    Ingested {
        state: Versioned<ConversationState>,
        note: String,
    },
    Reply(String),
}

fn reply_for_phase(phase: Phase) -> String {
    if phase.is_terminal() {
        replies::terminal_hint()
    } else {
        replies::in_progress()
    }
}

fn is_reset(text: Option<&str>) -> bool {
    let Some(text) = text else {
        return false;
    };
    let normalized = text.trim().to_lowercase();
    RESET_KEYWORDS
        .iter()
        .any(|k| normalized == *k || normalized.starts_with(&format!("{k} ")))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use chrono::Utc;

    use super::*;
    use crate::conversation::slots::FilledSlots;
    use crate::conversation::state::ResumeRecord;
    use crate::conversation::store::MemoryConversationStore;
    use crate::dispatch::DispatchReceipt;
    use crate::generation::{EmailAttachment, EmailDraft};
    use crate::ingestion::{content_fingerprint, IngestOutcome};
    use crate::vector::ResumeVectorRef;

    enum IngestMode {
        Ok,
        Empty,
        Unsupported,
    }

    struct StubIngestor {
        mode: IngestMode,
        calls: AtomicUsize,
        discarded: Mutex<Vec<ResumeVectorRef>>,
    }

    impl StubIngestor {
        fn new(mode: IngestMode) -> Self {
            Self {
                mode,
                calls: AtomicUsize::new(0),
                discarded: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ResumeIngestor for StubIngestor {
        async fn ingest(
            &self,
            _user_id: &str,
            prior: Option<&ResumeRecord>,
            bytes: &[u8],
        ) -> Result<IngestOutcome, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                IngestMode::Ok => {
                    if let Some(old) = prior {
                        self.discarded.lock().unwrap().push(old.vector_ref);
                    }
                    Ok(IngestOutcome {
                        record: ResumeRecord {
                            vector_ref: ResumeVectorRef::new(),
                            fingerprint: content_fingerprint(bytes),
                            document: bytes.to_vec(),
                        },
                        chunk_count: 3,
                        reused: false,
                    })
                }
                IngestMode::Empty => Err(IngestError::EmptyDocument),
                IngestMode::Unsupported => {
                    Err(IngestError::UnsupportedFormat("text/plain".to_string()))
                }
            }
        }

        async fn discard(&self, record: &ResumeRecord) -> Result<(), IngestError> {
            self.discarded.lock().unwrap().push(record.vector_ref);
            Ok(())
        }
    }

    use async_trait::async_trait;

    enum GenerateMode {
        Ok,
        Insufficient,
        Fail,
    }

    struct StubGenerator {
        mode: GenerateMode,
        calls: AtomicUsize,
    }

    impl StubGenerator {
        fn new(mode: GenerateMode) -> Self {
            Self {
                mode,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmailGenerator for StubGenerator {
        async fn generate(
            &self,
            user_id: &str,
            slots: &FilledSlots,
            resume: &ResumeRecord,
        ) -> Result<EmailDraft, GenerateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                GenerateMode::Ok => Ok(EmailDraft {
                    conversation: user_id.to_string(),
                    recipient: slots.email.clone(),
                    subject: slots.subject.clone(),
                    body: "Dear hiring team, ...".to_string(),
                    attachment: Some(EmailAttachment {
                        filename: "resume.pdf".to_string(),
                        content: resume.document.clone(),
                    }),
                }),
                GenerateMode::Insufficient => Err(GenerateError::InsufficientContext),
                GenerateMode::Fail => {
                    Err(GenerateError::Llm(crate::llm_client::LlmError::EmptyContent))
                }
            }
        }
    }

    struct StubMailer {
        fail: bool,
        calls: AtomicUsize,
        delivered: Mutex<Vec<EmailDraft>>,
    }

    impl StubMailer {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                calls: AtomicUsize::new(0),
                delivered: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MailSubmitter for StubMailer {
        async fn deliver(&self, draft: &EmailDraft) -> Result<DispatchReceipt, DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.delivered.lock().unwrap().push(draft.clone());
            if self.fail {
                Err(DispatchError::Api {
                    status: 500,
                    message: "upstream down".to_string(),
                })
            } else {
                Ok(DispatchReceipt {
                    message_id: "msg-1".to_string(),
                    dispatched_at: Utc::now(),
                })
            }
        }
    }

    struct Harness {
        mediator: Mediator,
        store: Arc<MemoryConversationStore>,
        ingestor: Arc<StubIngestor>,
        generator: Arc<StubGenerator>,
        mailer: Arc<StubMailer>,
    }

    fn harness(ingest: IngestMode, generate: GenerateMode, mail_fails: bool) -> Harness {
        let store = Arc::new(MemoryConversationStore::new());
        let ingestor = Arc::new(StubIngestor::new(ingest));
        let generator = Arc::new(StubGenerator::new(generate));
        let mailer = Arc::new(StubMailer::new(mail_fails));
        let mediator = Mediator::new(
            store.clone(),
            ingestor.clone(),
            generator.clone(),
            mailer.clone(),
            Duration::from_secs(5),
        );
        Harness {
            mediator,
            store,
            ingestor,
            generator,
            mailer,
        }
    }

    fn text_msg(user: &str, text: &str) -> InboundMessage {
        InboundMessage {
            user_id: user.to_string(),
            text: Some(text.to_string()),
            attachment: None,
        }
    }

    fn attachment_msg(user: &str, bytes: &[u8]) -> InboundMessage {
        InboundMessage {
            user_id: user.to_string(),
            text: None,
            attachment: Some(Bytes::copy_from_slice(bytes)),
        }
    }

    async fn phase_of(h: &Harness, user: &str) -> Phase {
        h.store.load(user).await.unwrap().value.phase
    }

    #[tokio::test]
    async fn test_greeting_prompts_for_all_three_items() {
        let h = harness(IngestMode::Ok, GenerateMode::Ok, false);
        let reply = h.mediator.handle_turn(text_msg("u1", "Hi")).await;
        assert!(reply.text.contains("email address"));
        assert!(reply.text.contains("subject"));
        assert!(reply.text.contains("resume"));
        assert_eq!(phase_of(&h, "u1").await, Phase::AwaitingInput);
    }

    #[tokio::test]
    async fn test_happy_path_completes_with_one_send() {
        let h = harness(IngestMode::Ok, GenerateMode::Ok, false);
        h.mediator.handle_turn(text_msg("u1", "Hi")).await;
        let reply = h
            .mediator
            .handle_turn(text_msg(
                "u1",
                "Please email me@example.com, subject Backend Role",
            ))
            .await;
        assert!(reply.text.contains("resume"));

        let reply = h.mediator.handle_turn(attachment_msg("u1", b"%PDF-1.4")).await;
        assert!(reply.text.contains("me@example.com"));
        assert_eq!(phase_of(&h, "u1").await, Phase::Completed);
        assert_eq!(h.mailer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 1);

        // The uploaded resume rides along to delivery as the attachment.
        let delivered = h.mailer.delivered.lock().unwrap();
        let attachment = delivered[0].attachment.as_ref().unwrap();
        assert_eq!(attachment.filename, "resume.pdf");
        assert_eq!(attachment.content, b"%PDF-1.4");
        drop(delivered);

        let state = h.store.load("u1").await.unwrap().value;
        assert!(state.dispatch_receipt.is_some());
    }

    #[tokio::test]
    async fn test_attachment_first_then_slots_completes() {
        let h = harness(IngestMode::Ok, GenerateMode::Ok, false);
        let reply = h.mediator.handle_turn(attachment_msg("u1", b"%PDF-1.4")).await;
        assert!(reply.text.contains("email address"));
        assert!(!reply.text.contains("resume/CV"));

        let reply = h
            .mediator
            .handle_turn(text_msg("u1", "send to hr@corp.io, subject \"SRE Role\""))
            .await;
        assert!(reply.text.contains("hr@corp.io"));
        assert_eq!(phase_of(&h, "u1").await, Phase::Completed);
    }

    #[tokio::test]
    async fn test_invalid_email_never_enters_slots() {
        let h = harness(IngestMode::Ok, GenerateMode::Ok, false);
        let reply = h.mediator.handle_turn(text_msg("u1", "email is foo@bar")).await;
        assert!(reply.text.contains("foo@bar"));
        let state = h.store.load("u1").await.unwrap().value;
        assert!(state.slots.email.is_none());
        assert_eq!(state.phase, Phase::AwaitingInput);
    }

    #[tokio::test]
    async fn test_invalid_then_corrected_email() {
        let h = harness(IngestMode::Ok, GenerateMode::Ok, false);
        h.mediator.handle_turn(text_msg("u1", "email is foo@bar")).await;
        h.mediator
            .handle_turn(text_msg("u1", "sorry, foo@bar.com"))
            .await;
        let state = h.store.load("u1").await.unwrap().value;
        assert_eq!(state.slots.email.as_deref(), Some("foo@bar.com"));
    }

    #[tokio::test]
    async fn test_failed_ingestion_leaves_slots_intact() {
        let h = harness(IngestMode::Empty, GenerateMode::Ok, false);
        h.mediator
            .handle_turn(text_msg("u1", "hr@corp.io, subject Backend Role"))
            .await;
        let mut msg = attachment_msg("u1", b"%PDF-1.4");
        msg.text = Some("here it is".to_string());
        let reply = h.mediator.handle_turn(msg).await;
        assert!(reply.text.contains("couldn't find any text"));

        let state = h.store.load("u1").await.unwrap().value;
        assert_eq!(state.phase, Phase::AwaitingInput);
        assert_eq!(state.slots.email.as_deref(), Some("hr@corp.io"));
        assert!(state.resume.is_none());
    }

    #[tokio::test]
    async fn test_reingestion_replaces_resume_record() {
        let h = harness(IngestMode::Ok, GenerateMode::Ok, false);
        h.mediator.handle_turn(attachment_msg("u1", b"%PDF-1 one")).await;
        let first = h.store.load("u1").await.unwrap().value.resume.unwrap();

        h.mediator.handle_turn(attachment_msg("u1", b"%PDF-1 two")).await;
        let second = h.store.load("u1").await.unwrap().value.resume.unwrap();

        assert_ne!(first.vector_ref, second.vector_ref);
        assert!(h
            .ingestor
            .discarded
            .lock()
            .unwrap()
            .contains(&first.vector_ref));
    }

    #[tokio::test]
    async fn test_concurrent_completion_triggers_send_once() {
        let h = harness(IngestMode::Ok, GenerateMode::Ok, false);
        h.mediator.handle_turn(attachment_msg("u1", b"%PDF-1.4")).await;

        let msg = text_msg("u1", "hr@corp.io, subject Backend Role");
        let (a, b) = tokio::join!(
            h.mediator.handle_turn(msg.clone()),
            h.mediator.handle_turn(msg.clone()),
        );
        assert_eq!(h.mailer.calls.load(Ordering::SeqCst), 1);
        let confirmations = [&a, &b]
            .iter()
            .filter(|r| r.text.contains("hr@corp.io"))
            .count();
        assert_eq!(confirmations, 1);
        assert_eq!(phase_of(&h, "u1").await, Phase::Completed);
    }

    #[tokio::test]
    async fn test_redelivery_after_completion_does_not_resend() {
        let h = harness(IngestMode::Ok, GenerateMode::Ok, false);
        h.mediator.handle_turn(attachment_msg("u1", b"%PDF-1.4")).await;
        let msg = text_msg("u1", "hr@corp.io, subject Backend Role");
        h.mediator.handle_turn(msg.clone()).await;
        let reply = h.mediator.handle_turn(msg).await;

        assert_eq!(h.mailer.calls.load(Ordering::SeqCst), 1);
        assert!(!reply.text.contains("sent"));
    }

    #[tokio::test]
    async fn test_generation_failure_is_terminal_until_reset() {
        let h = harness(IngestMode::Ok, GenerateMode::Fail, false);
        h.mediator.handle_turn(attachment_msg("u1", b"%PDF-1.4")).await;
        let reply = h
            .mediator
            .handle_turn(text_msg("u1", "hr@corp.io, subject Backend Role"))
            .await;
        assert!(reply.text.contains("couldn't finish"));
        assert_eq!(phase_of(&h, "u1").await, Phase::Failed);
        assert_eq!(h.mailer.calls.load(Ordering::SeqCst), 0);

        // Further slot messages bounce off the terminal state.
        h.mediator
            .handle_turn(text_msg("u1", "other@corp.io"))
            .await;
        let state = h.store.load("u1").await.unwrap().value;
        assert_eq!(state.slots.email.as_deref(), Some("hr@corp.io"));

        let reply = h.mediator.handle_turn(text_msg("u1", "reset")).await;
        assert!(reply.text.to_lowercase().contains("fresh"));
        assert_eq!(phase_of(&h, "u1").await, Phase::AwaitingInput);
        let state = h.store.load("u1").await.unwrap().value;
        assert!(state.slots.email.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_failure_fails_without_receipt() {
        let h = harness(IngestMode::Ok, GenerateMode::Ok, true);
        h.mediator.handle_turn(attachment_msg("u1", b"%PDF-1.4")).await;
        let reply = h
            .mediator
            .handle_turn(text_msg("u1", "hr@corp.io, subject Backend Role"))
            .await;
        assert!(reply.text.contains("couldn't finish"));

        let state = h.store.load("u1").await.unwrap().value;
        assert_eq!(state.phase, Phase::Failed);
        assert!(state.dispatch_receipt.is_none());
    }

    #[tokio::test]
    async fn test_insufficient_context_asks_for_reattachment() {
        let h = harness(IngestMode::Ok, GenerateMode::Insufficient, false);
        h.mediator.handle_turn(attachment_msg("u1", b"%PDF-1.4")).await;
        let reply = h
            .mediator
            .handle_turn(text_msg("u1", "hr@corp.io, subject Backend Role"))
            .await;
        assert!(reply.text.contains("attach"));

        let state = h.store.load("u1").await.unwrap().value;
        assert_eq!(state.phase, Phase::AwaitingInput);
        assert!(state.resume.is_none());
        assert_eq!(state.slots.email.as_deref(), Some("hr@corp.io"));
    }

    #[tokio::test]
    async fn test_reset_after_completion_discards_chunks() {
        let h = harness(IngestMode::Ok, GenerateMode::Ok, false);
        h.mediator.handle_turn(attachment_msg("u1", b"%PDF-1.4")).await;
        let record = h.store.load("u1").await.unwrap().value.resume.unwrap();
        h.mediator
            .handle_turn(text_msg("u1", "hr@corp.io, subject Backend Role"))
            .await;
        assert_eq!(phase_of(&h, "u1").await, Phase::Completed);

        h.mediator.handle_turn(text_msg("u1", "start over")).await;
        assert_eq!(phase_of(&h, "u1").await, Phase::AwaitingInput);
        assert!(h
            .ingestor
            .discarded
            .lock()
            .unwrap()
            .contains(&record.vector_ref));
    }

    #[tokio::test]
    async fn test_non_reset_message_after_completion_gets_hint() {
        let h = harness(IngestMode::Ok, GenerateMode::Ok, false);
        h.mediator.handle_turn(attachment_msg("u1", b"%PDF-1.4")).await;
        h.mediator
            .handle_turn(text_msg("u1", "hr@corp.io, subject Backend Role"))
            .await;
        let reply = h.mediator.handle_turn(text_msg("u1", "thanks!")).await;
        assert!(reply.text.contains("restart"));
        assert_eq!(phase_of(&h, "u1").await, Phase::Completed);
    }

    #[tokio::test]
    async fn test_subject_last_write_wins() {
        let h = harness(IngestMode::Ok, GenerateMode::Ok, false);
        h.mediator
            .handle_turn(text_msg("u1", "subject Data Engineer"))
            .await;
        h.mediator
            .handle_turn(text_msg("u1", "actually subject Platform Engineer"))
            .await;
        let state = h.store.load("u1").await.unwrap().value;
        assert_eq!(state.slots.subject.as_deref(), Some("Platform Engineer"));
    }

    #[tokio::test]
    async fn test_fail_conversation_skips_terminal_and_sending() {
        let h = harness(IngestMode::Ok, GenerateMode::Ok, false);
        h.mediator.handle_turn(text_msg("u1", "Hi")).await;
        assert!(h.mediator.fail_conversation("u1").await.unwrap());
        assert_eq!(phase_of(&h, "u1").await, Phase::Failed);

        // Already terminal, nothing to do.
        assert!(!h.mediator.fail_conversation("u1").await.unwrap());
    }

    /// Ingestor that blocks until released, for racing forced termination
    /// and deadlines against an in-flight run.
    struct GatedIngestor {
        release: tokio::sync::Notify,
        produced: Mutex<Vec<ResumeVectorRef>>,
        discarded: Mutex<Vec<ResumeVectorRef>>,
    }

    impl GatedIngestor {
        fn new() -> Self {
            Self {
                release: tokio::sync::Notify::new(),
                produced: Mutex::new(Vec::new()),
                discarded: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ResumeIngestor for GatedIngestor {
        async fn ingest(
            &self,
            _user_id: &str,
            _prior: Option<&ResumeRecord>,
            bytes: &[u8],
        ) -> Result<IngestOutcome, IngestError> {
            self.release.notified().await;
            let record = ResumeRecord {
                vector_ref: ResumeVectorRef::new(),
                fingerprint: content_fingerprint(bytes),
                document: bytes.to_vec(),
            };
            self.produced.lock().unwrap().push(record.vector_ref);
            Ok(IngestOutcome {
                record,
                chunk_count: 2,
                reused: false,
            })
        }

        async fn discard(&self, record: &ResumeRecord) -> Result<(), IngestError> {
            self.discarded.lock().unwrap().push(record.vector_ref);
            Ok(())
        }
    }

    struct GatedGenerator {
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl EmailGenerator for GatedGenerator {
        async fn generate(
            &self,
            _user_id: &str,
            _slots: &FilledSlots,
            _resume: &ResumeRecord,
        ) -> Result<EmailDraft, GenerateError> {
            self.release.notified().await;
            Err(GenerateError::InsufficientContext)
        }
    }

    async fn wait_for_phase(store: &MemoryConversationStore, user: &str, phase: Phase) {
        for _ in 0..500 {
            if store.load(user).await.unwrap().value.phase == phase {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("conversation never reached {phase:?}");
    }

    #[tokio::test]
    async fn test_forced_failure_mid_ingest_evicts_fresh_chunks() {
        let store = Arc::new(MemoryConversationStore::new());
        let ingestor = Arc::new(GatedIngestor::new());
        let mediator = Arc::new(Mediator::new(
            store.clone(),
            ingestor.clone(),
            Arc::new(StubGenerator::new(GenerateMode::Ok)),
            Arc::new(StubMailer::new(false)),
            Duration::from_secs(5),
        ));

        let m = mediator.clone();
        let turn =
            tokio::spawn(async move { m.handle_turn(attachment_msg("u1", b"%PDF-1.4")).await });
        wait_for_phase(&store, "u1", Phase::ResumeProcessing).await;

        // Session abandonment lands while the indexing is still running.
        assert!(mediator.fail_conversation("u1").await.unwrap());
        ingestor.release.notify_one();

        let reply = turn.await.unwrap();
        assert!(reply.text.contains("restart"));
        assert_eq!(store.load("u1").await.unwrap().value.phase, Phase::Failed);

        // The chunks indexed after the takeover are unreachable and evicted.
        let produced = ingestor.produced.lock().unwrap().clone();
        assert_eq!(produced.len(), 1);
        assert!(ingestor.discarded.lock().unwrap().contains(&produced[0]));
    }

    #[tokio::test]
    async fn test_timed_out_ingest_is_reaped() {
        let store = Arc::new(MemoryConversationStore::new());
        let ingestor = Arc::new(GatedIngestor::new());
        let mediator = Mediator::new(
            store.clone(),
            ingestor.clone(),
            Arc::new(StubGenerator::new(GenerateMode::Ok)),
            Arc::new(StubMailer::new(false)),
            Duration::from_millis(20),
        );

        let reply = mediator.handle_turn(attachment_msg("u1", b"%PDF-1.4")).await;
        assert!(reply.text.contains("ran into a problem"));
        assert_eq!(
            store.load("u1").await.unwrap().value.phase,
            Phase::AwaitingInput
        );

        // The run finishes after the deadline; its chunks get evicted.
        ingestor.release.notify_one();
        for _ in 0..500 {
            if !ingestor.discarded.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let produced = ingestor.produced.lock().unwrap().clone();
        assert_eq!(produced.len(), 1);
        assert_eq!(ingestor.discarded.lock().unwrap().clone(), produced);
    }

    #[tokio::test]
    async fn test_forced_failure_mid_generation_gets_terminal_hint() {
        let store = Arc::new(MemoryConversationStore::new());
        let generator = Arc::new(GatedGenerator {
            release: tokio::sync::Notify::new(),
        });
        let mediator = Arc::new(Mediator::new(
            store.clone(),
            Arc::new(StubIngestor::new(IngestMode::Ok)),
            generator.clone(),
            Arc::new(StubMailer::new(false)),
            Duration::from_secs(5),
        ));

        mediator
            .handle_turn(attachment_msg("u1", b"%PDF-1.4"))
            .await;
        let m = mediator.clone();
        let turn = tokio::spawn(async move {
            m.handle_turn(text_msg("u1", "hr@corp.io, subject Backend Role"))
                .await
        });
        wait_for_phase(&store, "u1", Phase::Generating).await;

        assert!(mediator.fail_conversation("u1").await.unwrap());
        generator.release.notify_one();

        // The losing writer reports the terminal state, not a re-attachment
        // request the failed conversation could never act on.
        let reply = turn.await.unwrap();
        assert!(reply.text.contains("restart"));
        assert!(!reply.text.contains("attach"));
        assert_eq!(store.load("u1").await.unwrap().value.phase, Phase::Failed);
    }

    #[tokio::test]
    async fn test_users_are_independent() {
        let h = harness(IngestMode::Ok, GenerateMode::Ok, false);
        h.mediator
            .handle_turn(text_msg("u1", "hr@corp.io, subject Backend Role"))
            .await;
        let reply = h.mediator.handle_turn(text_msg("u2", "Hi")).await;
        assert!(reply.text.contains("email address"));
        let state = h.store.load("u2").await.unwrap().value;
        assert!(state.slots.email.is_none());
    }
}
