//! Validation and normalization of submitted content.
//!
//! Every text field is truncated to its ceiling, stripped of control
//! characters and HTML-escaped. Escaping decodes existing entities first so
//! that cleaning an already clean value leaves it unchanged.

use domains::{CleanContent, DomainError, RawSubmission, Result};
use once_cell::sync::Lazy;
use regex::Regex;

pub const MAX_SUBJECT_LENGTH: usize = 140;
pub const MAX_EMAIL_LENGTH: usize = 254;
pub const MAX_BODY_LENGTH: usize = 6000;
pub const MAX_SIGNATURE_LENGTH: usize = 32;

pub const FIELD_SUBJECT: &str = "subject";
pub const FIELD_EMAIL: &str = "email";
pub const FIELD_BODY: &str = "content";
pub const FIELD_SIGNATURE: &str = "trip";

const REQUIRED_FIELDS: [&str; 4] = [FIELD_SUBJECT, FIELD_EMAIL, FIELD_BODY, FIELD_SIGNATURE];

static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^(([^<>()\[\]\\.,;:\s@"]+(\.[^<>()\[\]\\.,;:\s@"]+)*)|(".+"))@((\[[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}])|(([a-zA-Z\-0-9]+\.)+[a-zA-Z]{2,}))$"#,
    )
    .expect("email pattern is valid")
});

/// Per-field cleaning rules.
#[derive(Debug, Clone, Copy)]
struct FieldRules {
    max_chars: usize,
    keep_newlines: bool,
    strip_brackets: bool,
}

const SUBJECT_RULES: FieldRules = FieldRules { max_chars: MAX_SUBJECT_LENGTH, keep_newlines: false, strip_brackets: true };
const EMAIL_RULES: FieldRules = FieldRules { max_chars: MAX_EMAIL_LENGTH, keep_newlines: false, strip_brackets: false };
const BODY_RULES: FieldRules = FieldRules { max_chars: MAX_BODY_LENGTH, keep_newlines: true, strip_brackets: true };
const SIGNATURE_RULES: FieldRules = FieldRules { max_chars: MAX_SIGNATURE_LENGTH, keep_newlines: false, strip_brackets: false };

/// Validates a raw submission and returns its cleaned form.
///
/// The field set must be exactly `subject`, `email`, `content` and `trip`.
/// Over-long subject, email and body values are truncated to their ceiling
/// before validation; an over-long signature request is rejected.
pub fn sanitize(raw: &RawSubmission) -> Result<CleanContent> {
    if raw.len() != REQUIRED_FIELDS.len() {
        return Err(reject(format!(
            "Expected {} keys, got {}",
            REQUIRED_FIELDS.len(),
            raw.len()
        )));
    }
    if let Some(extra) = raw.keys().find(|k| !REQUIRED_FIELDS.contains(&k.as_str())) {
        return Err(reject(format!("Extraneous key {extra}")));
    }

    let field = |name: &str| raw.get(name).map(String::as_str).unwrap_or_default();

    let email_raw: String = field(FIELD_EMAIL).trim().chars().take(MAX_EMAIL_LENGTH).collect();
    if !email_raw.is_empty() && !EMAIL_PATTERN.is_match(&email_raw) {
        return Err(reject(format!("Invalid email: \"{email_raw}\"")));
    }

    let body = clean_body(field(FIELD_BODY));
    if body.is_empty() {
        return Err(reject("Empty Content".to_string()));
    }

    Ok(CleanContent {
        subject: clean_subject(field(FIELD_SUBJECT)),
        email: clean_email(&email_raw),
        body,
        signature_request: clean_signature_request(field(FIELD_SIGNATURE))?,
    })
}

pub fn clean_subject(raw: &str) -> String {
    clean_field(raw, SUBJECT_RULES)
}

pub fn clean_email(raw: &str) -> String {
    clean_field(raw, EMAIL_RULES)
}

pub fn clean_body(raw: &str) -> String {
    clean_field(raw, BODY_RULES)
}

/// Cleans a signature request (`name #secret` and friends).
///
/// Returns `None` for an empty request and rejects requests longer than
/// [`MAX_SIGNATURE_LENGTH`] characters.
pub fn clean_signature_request(raw: &str) -> Result<Option<String>> {
    let length = raw.trim().chars().count();
    if length > MAX_SIGNATURE_LENGTH {
        return Err(reject(format!(
            "Signature longer than {MAX_SIGNATURE_LENGTH} characters. Got: {length}"
        )));
    }
    let cleaned = clean_field(raw, SIGNATURE_RULES);
    Ok((!cleaned.is_empty()).then_some(cleaned))
}

fn reject(reason: String) -> DomainError {
    DomainError::Validation(reason)
}

fn clean_field(raw: &str, rules: FieldRules) -> String {
    let truncated: String = raw.chars().take(rules.max_chars).collect();
    let decoded = html_escape::decode_html_entities(&truncated);
    let filtered: String = decoded
        .chars()
        .filter(|c| keep_char(*c, rules))
        .collect();
    let encoded = html_escape::encode_safe(filtered.trim());
    truncate_encoded(&encoded, rules.max_chars).trim_end().to_string()
}

fn keep_char(c: char, rules: FieldRules) -> bool {
    if c.is_control() {
        return rules.keep_newlines && (c == '\n' || c == '\r');
    }
    !(rules.strip_brackets && matches!(c, '{' | '}' | '[' | ']'))
}

/// Cuts escaped text to `max_chars` without splitting an entity.
///
/// Every `&` in escaped text starts an entity, so a cut that leaves an `&`
/// without its closing `;` backs off to just before that `&`.
fn truncate_encoded(encoded: &str, max_chars: usize) -> &str {
    let end = match encoded.char_indices().nth(max_chars) {
        Some((idx, _)) => idx,
        None => return encoded,
    };
    let prefix = &encoded[..end];
    match prefix.rfind('&') {
        Some(amp) if !prefix[amp..].contains(';') => &prefix[..amp],
        _ => prefix,
    }
}
