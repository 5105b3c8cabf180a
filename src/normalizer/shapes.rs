//! Tagged-variant payload-shape discriminator (§9 "Dynamic dispatch over
//! provider shapes"): replaces duck-typed parsing with a `ProviderShape` tag
//! plus a per-variant extraction function, kept extensible via registration
//! so new shapes don't require touching the pipeline. No direct teacher
//! precedent (`tower-resilience` never parses JSON payload shapes); grounded
//! on the domain corpus's general `serde_json::Value` traversal idiom.

use std::collections::HashMap;
use serde_json::Value;

/// The closed set of shapes the spec names, plus the open `Generic` fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderShape {
    Cerebras,
    OpenAi,
    Generic,
}

impl ProviderShape {
    pub fn tag(&self) -> &'static str {
        match self {
            ProviderShape::Cerebras => "cerebras",
            ProviderShape::OpenAi => "openai",
            ProviderShape::Generic => "generic",
        }
    }
}

/// One shape's extraction rule: look for a string at the shape's preferred
/// locations, in priority order, without falling through to another shape.
pub trait ShapeExtractor: Send + Sync {
    fn extract(&self, payload: &Value) -> Option<String>;
}

fn as_nonempty_string(v: &Value) -> Option<String> {
    v.as_str().map(str::to_owned).filter(|s| !s.is_empty())
}

fn first_choice<'a>(payload: &'a Value) -> Option<&'a Value> {
    payload.get("choices").and_then(|c| c.as_array()).and_then(|arr| arr.first())
}

pub struct CerebrasExtractor;

impl ShapeExtractor for CerebrasExtractor {
    fn extract(&self, payload: &Value) -> Option<String> {
        if let Some(s) = payload.get("content").and_then(as_nonempty_string) {
            return Some(s);
        }
        if let Some(choice) = first_choice(payload) {
            if let Some(s) = choice.get("message").and_then(|m| m.get("content")).and_then(as_nonempty_string) {
                return Some(s);
            }
            if let Some(s) = choice.get("delta").and_then(|d| d.get("content")).and_then(as_nonempty_string) {
                return Some(s);
            }
            if let Some(s) = choice.get("text").and_then(as_nonempty_string) {
                return Some(s);
            }
        }
        None
    }
}

pub struct OpenAiExtractor;

impl ShapeExtractor for OpenAiExtractor {
    fn extract(&self, payload: &Value) -> Option<String> {
        if let Some(choice) = first_choice(payload) {
            if let Some(s) = choice.get("message").and_then(|m| m.get("content")).and_then(as_nonempty_string) {
                return Some(s);
            }
            if let Some(s) = choice.get("text").and_then(as_nonempty_string) {
                return Some(s);
            }
        }
        payload.get("data").and_then(as_nonempty_string)
    }
}

const GENERIC_TOP_LEVEL_KEYS: &[&str] =
    &["content", "text", "output", "result", "data", "message", "response", "generated_text"];

pub struct GenericExtractor;

impl ShapeExtractor for GenericExtractor {
    fn extract(&self, payload: &Value) -> Option<String> {
        for key in GENERIC_TOP_LEVEL_KEYS {
            if let Some(s) = payload.get(*key).and_then(as_nonempty_string) {
                return Some(s);
            }
        }
        if let Some(choice) = first_choice(payload) {
            for key in GENERIC_TOP_LEVEL_KEYS {
                if let Some(s) = choice.get(*key).and_then(as_nonempty_string) {
                    return Some(s);
                }
            }
        }
        None
    }
}

/// An extensible, name-keyed table of shape extractors. Unknown tags fall
/// back to `Generic`, as the spec's dispatch-table note requires.
pub struct ShapeRegistry {
    extractors: HashMap<&'static str, Box<dyn ShapeExtractor>>,
}

impl Default for ShapeRegistry {
    fn default() -> Self {
        let mut extractors: HashMap<&'static str, Box<dyn ShapeExtractor>> = HashMap::new();
        extractors.insert("cerebras", Box::new(CerebrasExtractor));
        extractors.insert("openai", Box::new(OpenAiExtractor));
        extractors.insert("generic", Box::new(GenericExtractor));
        Self { extractors }
    }
}

impl ShapeRegistry {
    pub fn register(&mut self, tag: &'static str, extractor: Box<dyn ShapeExtractor>) {
        self.extractors.insert(tag, extractor);
    }

    pub fn extract(&self, shape: ProviderShape, payload: &Value) -> Option<String> {
        self.extractors.get(shape.tag()).and_then(|e| e.extract(payload))
    }

    /// Generic extraction, used as the spec's "unknown tags fall back to
    /// generic" rule and by the recovery pass.
    pub fn extract_generic(&self, payload: &Value) -> Option<String> {
        self.extractors.get("generic").and_then(|e| e.extract(payload))
    }
}
