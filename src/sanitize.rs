//! Text sanitizer and prompt-injection screen.
//!
//! Every text payload that is forwarded upstream goes through [`sanitize`].
//! [`contains_dangerous_patterns`] applies the same normalisation before
//! matching, so a trigger phrase with zero-width characters spliced into it
//! is still recognised.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{ChatMessage, ContentPart, MessageContent, Role};

/// Maximum number of characters (Unicode scalar values) kept per text payload.
pub const MAX_TEXT_CHARS: usize = 50_000;

/// Zero-width joiner. Kept in forwarded text because emoji sequences depend
/// on it; removed only from the copy that is screened.
const ZERO_WIDTH_JOINER: char = '\u{200D}';

/// Characters removed before text is forwarded or screened: NUL, soft
/// hyphen, zero-width space and non-joiner, LRM/RLM, word joiner, invisible
/// operators and the byte order mark.
fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{0000}'
            | '\u{00AD}'
            | '\u{200B}'..='\u{200C}'
            | '\u{200E}'..='\u{200F}'
            | '\u{2060}'..='\u{2064}'
            | '\u{FEFF}'
    )
}

static DANGEROUS_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        (
            "instruction_override",
            r"(?i)\b(?:ignore|disregard|forget)\s+(?:(?:all|any|the|your|of)\s+)*(?:previous|prior|above|earlier)\s+instructions\b",
        ),
        ("role_you_are_now", r"(?i)\byou\s+are\s+now\b"),
        ("role_act_as_if", r"(?i)\bact\s+as\s+if\b"),
        ("role_pretend", r"(?i)\bpretend\s+(?:to\s+be|you\s+are)\b"),
        // Line-anchored so `config = { system: 'x' }` in pasted code is not a hit.
        ("system_colon", r"(?im)^[ \t]*system\s*:"),
        ("system_bracket", r"(?im)^[ \t]*\[system\]"),
        ("system_tag", r"(?i)</?system>"),
    ]
    .into_iter()
    .map(|(name, pat)| (name, Regex::new(pat).unwrap()))
    .collect()
});

/// Strip invisible characters and clamp to [`MAX_TEXT_CHARS`].
///
/// Truncation is silent. Ordinary whitespace is preserved. The function is
/// idempotent: `sanitize(&sanitize(x)) == sanitize(x)`.
pub fn sanitize(text: &str) -> String {
    text.chars()
        .filter(|c| !is_invisible(*c))
        .take(MAX_TEXT_CHARS)
        .collect()
}

/// Returns the name of the first dangerous pattern found in `text`, if any.
pub fn first_dangerous_pattern(text: &str) -> Option<&'static str> {
    let normalized: String = sanitize(text)
        .chars()
        .filter(|c| *c != ZERO_WIDTH_JOINER)
        .collect();
    DANGEROUS_PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(&normalized))
        .map(|(name, _)| *name)
}

/// True when the normalised text contains an instruction-override,
/// role-manipulation or system-spoofing phrase.
pub fn contains_dangerous_patterns(text: &str) -> bool {
    first_dangerous_pattern(text).is_some()
}

/// A dangerous pattern found in a client-authored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectionHit {
    pub message_index: usize,
    pub pattern: &'static str,
}

/// Screen the text of every user message. Assistant turns are model output
/// replayed by the client and are not screened.
pub fn find_injection(messages: &[ChatMessage]) -> Option<InjectionHit> {
    messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::User)
        .find_map(|(message_index, m)| {
            let pattern = match &m.content {
                MessageContent::Text(text) => first_dangerous_pattern(text),
                MessageContent::Parts(parts) => parts.iter().find_map(|p| match p {
                    ContentPart::Text { text } => first_dangerous_pattern(text),
                    ContentPart::Image { .. } => None,
                }),
            }?;
            Some(InjectionHit {
                message_index,
                pattern,
            })
        })
}
