//! Outbound reply text. Every mediator turn produces exactly one of these.
//! Recoverable failures become specific re-prompts; raw technical detail
//! never reaches the user.

use crate::conversation::slots::SlotName;
use crate::ingestion::IngestError;

/// Attempts at which the email correction prompt escalates with an example.
const EMAIL_HINT_AFTER_ATTEMPTS: u32 = 2;

/// Prompt naming exactly the still-missing items, never a generic
/// "please provide more info".
pub fn missing_slots_prompt(missing: &[SlotName]) -> String {
    let mut lines = vec!["📝 To send your application email I still need:".to_string()];
    for (i, slot) in missing.iter().enumerate() {
        lines.push(format!("{}. {}", i + 1, slot.label()));
    }
    lines.push("You can send these in any order.".to_string());
    lines.join("\n")
}

pub fn invalid_email_prompt(candidate: &str, attempts: u32) -> String {
    if attempts >= EMAIL_HINT_AFTER_ATTEMPTS {
        format!(
            "❌ \"{candidate}\" still doesn't look like a valid email address. \
             It should look like recruiter@company.com — please check for typos."
        )
    } else {
        format!(
            "❌ \"{candidate}\" doesn't look like a valid email address. \
             Could you double-check the recipient's address?"
        )
    }
}

/// Recoverable ingestion failure: the specific reason, plus a re-prompt for
/// a new attachment.
pub fn ingestion_failure_prompt(err: &IngestError) -> String {
    let reason = match err {
        IngestError::EmptyDocument => "I couldn't find any text in that document",
        IngestError::UnsupportedFormat(_) => "I couldn't read that document as a PDF",
        _ => "I ran into a problem processing that document",
    };
    format!("📎 {reason}. Please attach your resume/CV as a PDF and try again.")
}

pub fn resume_received(chunk_count: usize) -> String {
    format!("📄 Got your resume! Indexed {chunk_count} sections for drafting.")
}

/// The indexed resume went away (for example the vector index restarted);
/// only a fresh attachment can recover this.
pub fn reattach_prompt() -> String {
    "📎 I lost the indexed copy of your resume. Please attach it again and \
     I'll pick up where we left off."
        .to_string()
}

pub fn confirmation(recipient: &str) -> String {
    format!("✅ Your application email was sent to {recipient}!")
}

pub fn terminal_failure() -> String {
    "❌ Sorry, I couldn't finish sending your email. This request can't be \
     resumed. Send \"restart\" to begin a new one."
        .to_string()
}

pub fn in_progress() -> String {
    "⏳ I'm already working on your email. Hang tight, you'll get a \
     confirmation shortly."
        .to_string()
}

pub fn terminal_hint() -> String {
    "This conversation is finished. Send \"restart\" to begin a new \
     application email."
        .to_string()
}

pub fn reset_confirmation() -> String {
    "🔄 Starting fresh! Send me the recipient's email address, the subject, \
     and your resume PDF."
        .to_string()
}

pub fn unavailable() -> String {
    "Sorry, I hit a temporary problem handling that message. Please try \
     again in a moment."
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_prompt_names_each_missing_slot() {
        let prompt =
            missing_slots_prompt(&[SlotName::Email, SlotName::Subject, SlotName::Resume]);
        assert!(prompt.contains("email address"));
        assert!(prompt.contains("subject"));
        assert!(prompt.contains("resume"));
    }

    #[test]
    fn test_missing_prompt_omits_filled_slots() {
        let prompt = missing_slots_prompt(&[SlotName::Resume]);
        assert!(prompt.contains("resume"));
        assert!(!prompt.contains("email address"));
        assert!(!prompt.contains("subject"));
    }

    #[test]
    fn test_invalid_email_prompt_quotes_the_candidate() {
        let prompt = invalid_email_prompt("foo@bar", 1);
        assert!(prompt.contains("foo@bar"));
        assert!(prompt.to_lowercase().contains("email"));
    }

    #[test]
    fn test_invalid_email_prompt_escalates_with_example() {
        let prompt = invalid_email_prompt("foo@bar", 2);
        assert!(prompt.contains("recruiter@company.com"));
    }

    #[test]
    fn test_ingestion_prompts_are_specific() {
        let empty = ingestion_failure_prompt(&IngestError::EmptyDocument);
        let bad = ingestion_failure_prompt(&IngestError::UnsupportedFormat("oops".into()));
        assert!(empty.contains("any text"));
        assert!(bad.contains("as a PDF"));
        assert_ne!(empty, bad);
    }
}
