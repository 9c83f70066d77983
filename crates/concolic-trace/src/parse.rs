//! Line-oriented marker grammar.
//!
//! A marker occurrence is `[<context>] (enter|exit) <label> <ordinal>`,
//! where the bracketed context is optional and `<ordinal>` is the leading
//! decimal digits of its token. A line may carry several occurrences when
//! unbuffered writes interleave. Everything else is ordinary program output
//! and is skipped.

use crate::marker::{MarkerId, MarkerKind, Signature};

/// The interpreted form of one execution's trace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedTrace {
    /// Marker occurrences in trace order.
    pub markers: Vec<MarkerId>,
    /// Distinct markers in `markers`.
    pub signature: Signature,
    /// Lines that carried at least one marker.
    pub marker_lines: usize,
    /// Lines skipped as ordinary program output.
    pub other_lines: usize,
}

/// Parse a complete trace.
pub fn parse(text: &str) -> ParsedTrace {
    let mut parsed = ParsedTrace::default();
    for line in text.lines() {
        let found = scan_line(line);
        if found.is_empty() {
            parsed.other_lines += 1;
            continue;
        }
        parsed.marker_lines += 1;
        for marker in found {
            parsed.signature.insert(marker.clone());
            parsed.markers.push(marker);
        }
    }
    parsed
}

/// Parse a trace that may have been cut off (killed child).
///
/// A final line without a terminating newline may end mid-token
/// (`enter main 1` could be a truncated `enter main 12`), so it is dropped.
pub fn parse_partial(text: &str) -> ParsedTrace {
    if text.ends_with('\n') {
        return parse(text);
    }
    match text.rfind('\n') {
        Some(idx) => parse(&text[..=idx]),
        None => ParsedTrace::default(),
    }
}

/// Parse raw captured bytes.
///
/// Invalid UTF-8 is replaced rather than rejected, so a stray binary byte
/// only affects the token it sits in. `partial` marks output that may end
/// mid-line: a killed child or a capture cut at the byte cap.
pub fn parse_bytes(bytes: &[u8], partial: bool) -> ParsedTrace {
    let text = String::from_utf8_lossy(bytes);
    if partial {
        parse_partial(&text)
    } else {
        parse(&text)
    }
}

/// Extract every marker occurrence on a single line.
pub fn scan_line(line: &str) -> Vec<MarkerId> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mut found = Vec::new();
    let mut i = 0;

    while i + 2 < tokens.len() {
        let Some(kind) = MarkerKind::from_token(tokens[i]) else {
            i += 1;
            continue;
        };
        let Some(ordinal) = leading_ordinal(tokens[i + 2]) else {
            i += 1;
            continue;
        };
        let context = if i > 0 { bracket_context(tokens[i - 1]) } else { None };
        found.push(MarkerId::new(context, kind, tokens[i + 1], ordinal));
        i += 3;
    }

    found
}

/// `1`, `14\n");` and `3,` all yield their leading digits.
fn leading_ordinal(token: &str) -> Option<u32> {
    let end = token
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(idx, _)| idx)
        .unwrap_or(token.len());
    if end == 0 {
        return None;
    }
    token[..end].parse().ok()
}

/// `[count.c]` and `"[count.c]` (inside a source string literal) both yield `count.c`.
fn bracket_context(token: &str) -> Option<&str> {
    let body = token.strip_suffix(']')?;
    let open = body.rfind('[')?;
    let inner = &body[open + 1..];
    if inner.is_empty() || inner.contains(']') {
        None
    } else {
        Some(inner)
    }
}
