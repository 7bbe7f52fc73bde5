// Cross-cutting prompt fragments. Each service that makes LLM calls keeps its
// own prompts.rs alongside it; this file holds the shared pieces.

/// System fragment shared by every generation call: the model writes prose
/// only, and never invents delivery-critical fields.
pub const PROSE_ONLY_SYSTEM: &str = "You write plain-text email bodies only. \
    Do NOT include a subject line, recipient address, or any email headers in \
    your output. Do NOT use markdown formatting. Do NOT include placeholders \
    such as [Company Name]. Do NOT include notes or instructions to yourself \
    in the final output.";

/// Instruction keeping generated claims grounded in the supplied resume
/// content.
pub const GROUNDING_INSTRUCTION: &str = "\
    Every skill, project, and experience you mention must come from the \
    RESUME CONTENT provided. Do NOT infer, interpolate, or invent details. \
    If the resume does not support a claim, omit it entirely.";
