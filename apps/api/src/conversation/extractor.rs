//! Entity extraction — turns one free-text message into candidate slot values.
//!
//! Extraction is deterministic and rule-based. A slot that is not mentioned
//! is absent, never defaulted; an email-shaped token that fails structural
//! validation is reported as invalid, never silently dropped, so the mediator
//! can re-prompt with a specific correction.

use std::sync::OnceLock;

use regex::Regex;

/// Outcome of email extraction for a single message.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum EmailExtraction {
    Found(String),
    /// An email-shaped token was present but failed validation.
    Invalid(String),
    #[default]
    Absent,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub email: EmailExtraction,
    pub subject: Option<String>,
}

fn email_candidate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\s,;]+@[^\s,;]+").expect("static regex"))
}

fn email_valid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)*\.[A-Za-z]{2,}$",
        )
        .expect("static regex")
    })
}

fn subject_quoted_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\bsubject(?:\s+line)?\s*(?:is|:|=|-)?\s*["'“](?P<s>[^"'”]+)["'”]"#)
            .expect("static regex")
    })
}

fn subject_plain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bsubject(?:\s+line)?\s*(?:is|:|=|-)?\s*(?P<s>[^,;\n]+)")
            .expect("static regex")
    })
}

fn subject_apply_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:apply(?:ing)?|application)\s+for\s+(?:the\s+)?(?P<s>[^,;.\n]+)")
            .expect("static regex")
    })
}

/// Structural address check applied before any value may enter state.
pub fn is_valid_email(candidate: &str) -> bool {
    let Some((local, _domain)) = candidate.split_once('@') else {
        return false;
    };
    if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return false;
    }
    email_valid_re().is_match(candidate)
}

/// Extracts zero or more of {EMAIL, SUBJECT} from free text.
pub fn extract(text: &str) -> Extraction {
    Extraction {
        email: extract_email(text),
        subject: extract_subject(text),
    }
}

fn extract_email(text: &str) -> EmailExtraction {
    let mut first_candidate: Option<String> = None;
    for m in email_candidate_re().find_iter(text) {
        let candidate = m
            .as_str()
            .trim_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | '?' | '(' | ')' | '<' | '>' | '"' | '\''));
        if candidate.is_empty() {
            continue;
        }
        if is_valid_email(candidate) {
            return EmailExtraction::Found(candidate.to_string());
        }
        first_candidate.get_or_insert_with(|| candidate.to_string());
    }
    match first_candidate {
        Some(candidate) => EmailExtraction::Invalid(candidate),
        None => EmailExtraction::Absent,
    }
}

fn extract_subject(text: &str) -> Option<String> {
    if let Some(caps) = subject_quoted_re().captures(text) {
        return clean_subject(&caps["s"]);
    }
    if let Some(caps) = subject_plain_re().captures(text) {
        return clean_subject(&caps["s"]);
    }
    if let Some(caps) = subject_apply_re().captures(text) {
        return clean_subject(&caps["s"]).map(|s| format!("Application for {s}"));
    }
    None
}

fn clean_subject(raw: &str) -> Option<String> {
    let cleaned = raw
        .trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '“' | '”'))
        .trim_end_matches(['.', '!'])
        .trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}
