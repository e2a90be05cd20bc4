//! Best-effort extraction from an incomplete model response
//!
//! The buffer is walked with a small tolerant scanner: every value that is
//! syntactically closed is parsed strictly, every container that is still
//! open is descended into, and whatever fails is dropped silently. Objects
//! the scanner cannot walk (malformed keys, missing separators) fall back to
//! a regex capture of their remaining scalar fields.
//!
//! The tolerant value tree is then read with the same shape detection the
//! reconciler uses, so a partial snapshot and a final plan agree on keys.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::trace;

use crate::plan::PartialPlanSnapshot;
use crate::reconcile::snapshot_from_value;
use crate::repair::strip_code_fences;

/// `"key": value` where value is a complete string, or a number/literal
/// followed by a separator (a number at the end of the buffer may still grow).
static SCALAR_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"("(?:[^"\\]|\\.)+")\s*:\s*(?:("(?:[^"\\]|\\.)*")|(-?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?|true|false|null)\s*[,}\]])"#,
    )
    .expect("valid regex")
});

/// Extract whatever fields are already resolvable from `buffer`.
///
/// Returns `None` when no field at all could be resolved. Never fails.
pub fn extract_partial(buffer: &str) -> Option<PartialPlanSnapshot> {
    let body = strip_code_fences(buffer);
    let open = body.find('{')?;
    let span = scan_value(body.as_bytes(), open)?;
    let root = tolerant_value(body, span)?;

    let snapshot = snapshot_from_value(&root);
    (!snapshot.is_empty()).then_some(snapshot)
}

/// Result of feeding the current buffer to a [`PartialJsonExtractor`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionUpdate {
    /// Everything known so far, merged with earlier extractions
    pub snapshot: PartialPlanSnapshot,
    /// Whether anything changed since the previous update
    pub is_new: bool,
}

/// Stateful wrapper that keeps knowledge monotonic across calls.
#[derive(Debug, Default)]
pub struct PartialJsonExtractor {
    last: Option<PartialPlanSnapshot>,
}

impl PartialJsonExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-extract from the whole accumulated buffer.
    pub fn update(&mut self, buffer: &str) -> Option<ExtractionUpdate> {
        let Some(fresh) = extract_partial(buffer) else {
            return self.last.clone().map(|snapshot| ExtractionUpdate {
                snapshot,
                is_new: false,
            });
        };

        let (snapshot, is_new) = match self.last.take() {
            Some(previous) => {
                let merged = fresh.merged_over(&previous);
                let is_new = merged.has_new_information_since(&previous);
                (merged, is_new)
            }
            None => (fresh, true),
        };
        trace!(
            buffer_len = buffer.len(),
            fields = snapshot.known_field_count(),
            is_new,
            "Partial extraction"
        );

        self.last = Some(snapshot.clone());
        Some(ExtractionUpdate { snapshot, is_new })
    }

    pub fn latest(&self) -> Option<&PartialPlanSnapshot> {
        self.last.as_ref()
    }

    pub fn into_latest(self) -> Option<PartialPlanSnapshot> {
        self.last
    }
}

// ============================================================================
// Tolerant scanner
// ============================================================================

/// Byte range of one JSON value. `closed` is false when the buffer ended inside it.
///
/// All structural characters are ASCII, so byte offsets always fall on
/// UTF-8 boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
    closed: bool,
}

fn skip_whitespace(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

fn skip_separators(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && (bytes[i].is_ascii_whitespace() || bytes[i] == b',') {
        i += 1;
    }
    i
}

/// Scan the value starting at the first non-whitespace byte from `start`.
fn scan_value(bytes: &[u8], start: usize) -> Option<Span> {
    let start = skip_whitespace(bytes, start);
    let (end, closed) = match *bytes.get(start)? {
        b'"' => scan_string(bytes, start),
        b'{' | b'[' => scan_container(bytes, start),
        b',' | b':' | b'}' | b']' => return None,
        _ => scan_scalar(bytes, start),
    };
    Some(Span { start, end, closed })
}

fn scan_string(bytes: &[u8], start: usize) -> (usize, bool) {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return (i + 1, true),
            _ => i += 1,
        }
    }
    (bytes.len(), false)
}

fn scan_container(bytes: &[u8], start: usize) -> (usize, bool) {
    let mut depth = 0usize;
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                let (end, closed) = scan_string(bytes, i);
                if !closed {
                    break;
                }
                i = end;
                continue;
            }
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return (i + 1, true);
                }
            }
            _ => {}
        }
        i += 1;
    }
    (bytes.len(), false)
}

/// Numbers and literals are only closed once a separator follows them.
fn scan_scalar(bytes: &[u8], start: usize) -> (usize, bool) {
    let mut i = start;
    while i < bytes.len() && !matches!(bytes[i], b',' | b'}' | b']') && !bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    (i, i < bytes.len())
}

/// Walk `key: value` entries of the object opening at `open` until the
/// first unclosed or malformed entry. The unclosed entry is included.
fn object_entries(text: &str, open: usize) -> Vec<(String, Span)> {
    let bytes = text.as_bytes();
    let mut entries = Vec::new();
    let mut i = open + 1;

    loop {
        i = skip_separators(bytes, i);
        if bytes.get(i) != Some(&b'"') {
            break;
        }
        let (key_end, key_closed) = scan_string(bytes, i);
        if !key_closed {
            break;
        }
        let Ok(key) = serde_json::from_str::<String>(&text[i..key_end]) else {
            break;
        };
        i = skip_whitespace(bytes, key_end);
        if bytes.get(i) != Some(&b':') {
            break;
        }
        let Some(value) = scan_value(bytes, i + 1) else {
            break;
        };
        entries.push((key, value));
        if !value.closed {
            break;
        }
        i = value.end;
    }
    entries
}

fn array_elements(text: &str, open: usize) -> Vec<Span> {
    let bytes = text.as_bytes();
    let mut elements = Vec::new();
    let mut i = open + 1;

    loop {
        i = skip_separators(bytes, i);
        if matches!(bytes.get(i), None | Some(b']')) {
            break;
        }
        let Some(element) = scan_value(bytes, i) else {
            break;
        };
        elements.push(element);
        if !element.closed {
            break;
        }
        i = element.end;
    }
    elements
}

/// Strict parse when closed, recursive partial capture otherwise.
///
/// Unclosed strings and scalars resolve to nothing.
fn tolerant_value(text: &str, span: Span) -> Option<Value> {
    if span.closed {
        if let Ok(value) = serde_json::from_str(&text[span.start..span.end]) {
            return Some(value);
        }
    }
    match text.as_bytes()[span.start] {
        b'{' => partial_object(text, span.start).map(Value::Object),
        b'[' => Some(Value::Array(
            array_elements(text, span.start)
                .into_iter()
                .filter_map(|element| tolerant_value(text, element))
                .collect(),
        )),
        _ => None,
    }
}

/// Every field of the object at `open` that resolves. `None` if none do.
fn partial_object(text: &str, open: usize) -> Option<Map<String, Value>> {
    let mut fields = Map::new();
    for (key, span) in object_entries(text, open) {
        if let Some(value) = tolerant_value(text, span) {
            fields.insert(key, value);
        }
    }

    // Scalars past a point the scanner could not walk
    let (end, _) = scan_container(text.as_bytes(), open);
    let own_level = blank_nested(&text[open..end]);
    for caps in SCALAR_FIELD.captures_iter(&own_level) {
        let Ok(key) = serde_json::from_str::<String>(&caps[1]) else {
            continue;
        };
        if fields.contains_key(&key) {
            continue;
        }
        let raw = caps.get(2).or_else(|| caps.get(3)).map(|m| m.as_str());
        if let Some(value) = raw.and_then(|r| serde_json::from_str::<Value>(r).ok()) {
            fields.insert(key, value);
        }
    }

    (!fields.is_empty()).then_some(fields)
}

/// Replace everything nested inside the outermost container with spaces,
/// so field capture only sees the object's own keys.
fn blank_nested(object_text: &str) -> String {
    let mut out = String::with_capacity(object_text.len());
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for c in object_text.chars() {
        let depth_before = depth;
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else {
            match c {
                '"' => in_string = true,
                '{' | '[' => depth += 1,
                '}' | ']' => depth = depth.saturating_sub(1),
                _ => {}
            }
        }
        out.push(if depth_before > 1 || depth > 1 { ' ' } else { c });
    }
    out
}
