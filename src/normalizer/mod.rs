//! Four-stage response normalization pipeline with recovery fallbacks (§4.H).
//!
//! No direct teacher precedent — `tower-resilience` has no JSON
//! payload-shape handling — so this module is grounded on the domain
//! corpus's `serde_json::Value` traversal idiom and built in the teacher's
//! *style*: small single-purpose stage functions, a `NormalizeStage` trait
//! seam, explicit `Result`s instead of panics, one `#[cfg(test)] mod tests`
//! per concern.

pub mod shapes;

use std::sync::Arc;

use serde_json::Value;

pub use shapes::{ProviderShape, ShapeExtractor, ShapeRegistry};

const DEFAULT_MAX_CONTENT_LENGTH: usize = 100_000;
const MAX_EXTRACTION_DEPTH: usize = 3;

/// Whether the operation expects the normalized content to itself be JSON
/// (drives the Extract stage's reparse attempts and the Validate stage's
/// warning-on-parse-failure behavior).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationShape {
    PlainText,
    Json,
}

#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    pub max_content_length: usize,
    pub allow_raw_fallback: bool,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self { max_content_length: DEFAULT_MAX_CONTENT_LENGTH, allow_raw_fallback: true }
    }
}

/// Successful normalization result: canonical content plus any non-fatal
/// warnings accumulated along the way (§7: normalization warnings attach to
/// the result, they never get promoted to errors).
#[derive(Debug, Clone)]
pub struct NormalizedResponse {
    pub content: String,
    pub warnings: Vec<String>,
    pub fallback_used: Option<&'static str>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("normalization failed: no string content reachable in payload")]
pub struct NormalizationFailed;

pub struct ResponseNormalizer {
    registry: ShapeRegistry,
    config: NormalizerConfig,
}

impl Default for ResponseNormalizer {
    fn default() -> Self {
        Self { registry: ShapeRegistry::default(), config: NormalizerConfig::default() }
    }
}

impl ResponseNormalizer {
    pub fn new(registry: ShapeRegistry, config: NormalizerConfig) -> Self {
        Self { registry, config }
    }

    /// Runs Normalize -> Extract -> Validate -> Sanitize, falling back
    /// through `raw_extraction`, `json_recovery`, `partial_content` in
    /// priority order when an earlier stage fails, and finally attempting a
    /// longest-string recovery pass before giving up entirely.
    pub fn normalize(&self, payload: &Value, shape: ProviderShape, operation: OperationShape) -> Result<NormalizedResponse, NormalizationFailed> {
        let mut warnings = Vec::new();
        let mut fallback_used = None;

        let raw = match self.registry.extract(shape, payload).or_else(|| self.registry.extract_generic(payload)) {
            Some(s) => s,
            None => match self.raw_extraction(payload, 0) {
                Some(s) => {
                    fallback_used = Some("raw_extraction");
                    s
                }
                None => return self.recover_or_fail(payload),
            },
        };

        let extracted = if operation == OperationShape::Json {
            match self.extract_json(&raw) {
                Some(clean) => clean,
                None => {
                    if self.config.allow_raw_fallback {
                        fallback_used = fallback_used.or(Some("json_recovery"));
                        raw.clone()
                    } else {
                        return self.recover_or_fail(payload);
                    }
                }
            }
        } else {
            raw.clone()
        };

        let trimmed = extracted.trim();
        if trimmed.is_empty() {
            if let Some(partial) = self.raw_extraction(payload, 0).filter(|s| !s.trim().is_empty()) {
                warnings.push("accepted non-trivial partial content after empty extraction".to_string());
                return Ok(self.finish(partial, warnings, Some("partial_content")));
            }
            return self.recover_or_fail(payload);
        }

        if operation == OperationShape::Json {
            if serde_json::from_str::<Value>(trimmed).is_err() {
                warnings.push("JSON validation failed".to_string());
            }
        }

        Ok(self.finish(extracted, warnings, fallback_used))
    }

    fn finish(&self, content: String, warnings: Vec<String>, fallback_used: Option<&'static str>) -> NormalizedResponse {
        NormalizedResponse { content: sanitize(&content, self.config.max_content_length), warnings, fallback_used }
    }

    /// `raw_extraction` fallback: any string reachable within `MAX_EXTRACTION_DEPTH`.
    fn raw_extraction(&self, value: &Value, depth: usize) -> Option<String> {
        if depth > MAX_EXTRACTION_DEPTH {
            return None;
        }
        match value {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Object(map) => map.values().find_map(|v| self.raw_extraction(v, depth + 1)),
            Value::Array(items) => items.iter().find_map(|v| self.raw_extraction(v, depth + 1)),
            _ => None,
        }
    }

    /// Extract stage: direct parse, else outermost balanced block, else
    /// syntactic cleanup and reparse.
    fn extract_json(&self, raw: &str) -> Option<String> {
        if serde_json::from_str::<Value>(raw).is_ok() {
            return Some(raw.to_string());
        }
        if let Some(block) = extract_balanced_block(raw) {
            if serde_json::from_str::<Value>(&block).is_ok() {
                return Some(block);
            }
            let cleaned = clean_json_like(&block);
            if serde_json::from_str::<Value>(&cleaned).is_ok() {
                return Some(cleaned);
            }
        }
        let cleaned = clean_json_like(raw);
        if serde_json::from_str::<Value>(&cleaned).is_ok() {
            return Some(cleaned);
        }
        None
    }

    /// Final recovery pass: longest string field found anywhere in the
    /// payload; if none, the whole request fails.
    fn recover_or_fail(&self, payload: &Value) -> Result<NormalizedResponse, NormalizationFailed> {
        if let Some(longest) = longest_string_field(payload) {
            return Ok(NormalizedResponse {
                content: sanitize(&longest, self.config.max_content_length),
                warnings: vec!["recovered via longest-string-field fallback".to_string()],
                fallback_used: Some("longest_string_recovery"),
            });
        }
        Err(NormalizationFailed)
    }
}

fn longest_string_field(value: &Value) -> Option<String> {
    fn walk(value: &Value, best: &mut Option<String>) {
        match value {
            Value::String(s) => {
                if best.as_ref().map(|b| s.len() > b.len()).unwrap_or(true) && !s.is_empty() {
                    *best = Some(s.clone());
                }
            }
            Value::Object(map) => map.values().for_each(|v| walk(v, best)),
            Value::Array(items) => items.iter().for_each(|v| walk(v, best)),
            _ => {}
        }
    }
    let mut best = None;
    walk(value, &mut best);
    best
}

/// Extracts the outermost balanced `{...}` block from a string that may have
/// leading/trailing prose around a JSON object.
fn extract_balanced_block(s: &str) -> Option<String> {
    let start = s.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    for (i, ch) in s[start..].char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(s[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Cleans common "almost-JSON" artifacts: `//` and `/* */` comments, trailing
/// commas before `}`/`]`, and single-quoted strings normalized to double.
fn clean_json_like(s: &str) -> String {
    let without_line_comments: String = strip_line_comments(s);
    let without_block_comments = strip_block_comments(&without_line_comments);
    let without_trailing_commas = strip_trailing_commas(&without_block_comments);
    normalize_quotes(&without_trailing_commas)
}

fn strip_line_comments(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' && !in_string {
            in_string = true;
            out.push(c);
        } else if c == '"' && in_string {
            in_string = false;
            out.push(c);
        } else if !in_string && c == '/' && chars.peek() == Some(&'/') {
            while let Some(&next) = chars.peek() {
                if next == '\n' {
                    break;
                }
                chars.next();
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn strip_block_comments(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '/' && chars.peek() == Some(&'*') {
            chars.next();
            while let Some(next) = chars.next() {
                if next == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn strip_trailing_commas(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ',' {
            let mut lookahead = chars.clone();
            let mut only_whitespace = true;
            let mut closer_next = false;
            while let Some(&n) = lookahead.peek() {
                if n.is_whitespace() {
                    lookahead.next();
                } else if n == '}' || n == ']' {
                    closer_next = true;
                    break;
                } else {
                    only_whitespace = false;
                    break;
                }
            }
            if only_whitespace && closer_next {
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn normalize_quotes(s: &str) -> String {
    if !s.contains('\'') {
        return s.to_string();
    }
    // Only remaps single quotes that look like they delimit keys/values, leaving
    // literal double-quoted JSON strings untouched.
    let mut out = String::with_capacity(s.len());
    let mut in_double = false;
    for c in s.chars() {
        match c {
            '"' => {
                in_double = !in_double;
                out.push(c);
            }
            '\'' if !in_double => out.push('"'),
            _ => out.push(c),
        }
    }
    out
}

/// Sanitize stage: strips `<script>` blocks, `javascript:` URIs, `on*=`
/// handlers, normalizes line endings, collapses blank-line runs, truncates.
pub fn sanitize(input: &str, max_len: usize) -> String {
    let no_crlf = input.replace("\r\n", "\n").replace('\r', "\n");
    let no_scripts = strip_script_blocks(&no_crlf);
    let no_js_uris = strip_javascript_uris(&no_scripts);
    let no_handlers = strip_event_handlers(&no_js_uris);
    let collapsed = collapse_blank_lines(&no_handlers);
    truncate_chars(&collapsed, max_len)
}

fn strip_script_blocks(s: &str) -> String {
    let lower = s.to_lowercase();
    let mut out = String::with_capacity(s.len());
    let mut pos = 0;
    loop {
        match lower[pos..].find("<script") {
            None => {
                out.push_str(&s[pos..]);
                break;
            }
            Some(rel_start) => {
                let start = pos + rel_start;
                out.push_str(&s[pos..start]);
                match lower[start..].find("</script>") {
                    Some(rel_end) => pos = start + rel_end + "</script>".len(),
                    None => {
                        pos = s.len();
                        break;
                    }
                }
            }
        }
    }
    out
}

fn strip_javascript_uris(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let lower = s.to_lowercase();
    let mut pos = 0;
    loop {
        match lower[pos..].find("javascript:") {
            None => {
                out.push_str(&s[pos..]);
                break;
            }
            Some(rel) => {
                let start = pos + rel;
                out.push_str(&s[pos..start]);
                pos = start + "javascript:".len();
            }
        }
    }
    out
}

fn strip_event_handlers(s: &str) -> String {
    // Removes ` on<word>=...` attribute fragments (quoted or unquoted values),
    // the dominant attack shape for stored-XSS in untrusted provider payloads.
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < bytes.len() {
        if s[i..].to_lowercase().starts_with(" on") {
            let rest = &s[i + 1..];
            if let Some(eq_pos) = rest.find('=') {
                let name_part = &rest[..eq_pos];
                let is_handler = name_part.len() > 2
                    && name_part.as_bytes()[0..2].eq_ignore_ascii_case(b"on")
                    && name_part[2..].chars().all(|c| c.is_ascii_alphanumeric());
                if is_handler {
                    let after_eq = &rest[eq_pos + 1..];
                    let skip = if let Some(q) = after_eq.chars().next().filter(|c| *c == '"' || *c == '\'') {
                        after_eq[1..].find(q).map(|p| eq_pos + 1 + 1 + p + 1).unwrap_or(rest.len())
                    } else {
                        after_eq.find(char::is_whitespace).map(|p| eq_pos + 1 + p).unwrap_or(rest.len())
                    };
                    i += 1 + skip;
                    continue;
                }
            }
        }
        let ch_len = s[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1);
        out.push_str(&s[i..i + ch_len]);
        i += ch_len;
    }
    out
}

fn collapse_blank_lines(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut blank_run = 0;
    for line in s.split('\n') {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run <= 1 {
                out.push('\n');
            }
        } else {
            blank_run = 0;
            out.push_str(line);
            out.push('\n');
        }
    }
    if !s.ends_with('\n') && out.ends_with('\n') {
        out.pop();
    }
    out
}

fn truncate_chars(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    s.chars().take(max_len).collect()
}

#[allow(dead_code)]
pub(crate) fn shape_for_provider_tag(tag: &str) -> ProviderShape {
    match tag {
        "cerebras" => ProviderShape::Cerebras,
        "openai" => ProviderShape::OpenAi,
        _ => ProviderShape::Generic,
    }
}

pub type ProviderName = Arc<str>;
