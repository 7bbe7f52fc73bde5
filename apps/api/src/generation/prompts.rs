/// System prompt for the email-body generation call.
pub const EMAIL_SYSTEM: &str = "You are an expert at writing personalized job \
    application emails. You analyze resume content, pick out the skills and \
    experiences most relevant to the target position, and write a \
    professional, personable email that highlights the candidate's strengths. \
    Keep the email concise (250-350 words), lead with genuine interest in the \
    position, close politely with a call to action, and invite the reader to \
    review the attached resume.";

/// Prompt template for the generation call. Placeholders: `{subject}`,
/// `{resume_context}`, `{sender_name}`.
pub const EMAIL_PROMPT_TEMPLATE: &str = "\
Write a job application email for the position described by this subject \
line: {subject}

{grounding_instruction}

RESUME CONTENT (retrieved excerpts from the candidate's resume):
{resume_context}

Requirements:
- Open with a greeting to the hiring manager and a sentence of genuine \
enthusiasm for the position.
- Highlight the 3-4 most relevant skills or experiences from the resume \
content, each tied to the position.
- Mention that the resume is attached.
- Sign off professionally as {sender_name}.
- Output the email body only: no subject line, no recipient address, no \
headers, no markdown.";

/// Fills the generation template.
pub fn build_email_prompt(subject: &str, resume_context: &str, sender_name: &str) -> String {
    EMAIL_PROMPT_TEMPLATE
        .replace(
            "{grounding_instruction}",
            crate::llm_client::prompts::GROUNDING_INSTRUCTION,
        )
        .replace("{subject}", subject)
        .replace("{resume_context}", resume_context)
        .replace("{sender_name}", sender_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_placeholders_are_filled() {
        let prompt = build_email_prompt("Backend Role", "Built things.", "Ada Lovelace");
        assert!(prompt.contains("Backend Role"));
        assert!(prompt.contains("Built things."));
        assert!(prompt.contains("Ada Lovelace"));
        assert!(!prompt.contains("{subject}"));
        assert!(!prompt.contains("{resume_context}"));
        assert!(!prompt.contains("{sender_name}"));
        assert!(!prompt.contains("{grounding_instruction}"));
    }
}
