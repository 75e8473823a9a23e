//! Recovery of a JSON object from free-form language model text.
//!
//! Model output is untrusted: it may be clean JSON, JSON inside a markdown
//! code fence, JSON with unescaped newlines inside string values, or JSON
//! surrounded by prose. Each form gets its own decode strategy; strategies
//! run in order, every intermediate failure is swallowed, and only
//! exhaustion of the chain is an error.

use serde_json::{Map, Value};

use crate::error::PipelineError;

const ERROR_PREVIEW_CHARS: usize = 200;

/// Extracts a JSON object from raw model text.
pub fn json_object(raw: &str) -> Result<Map<String, Value>, PipelineError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(malformed("empty response text"));
    }

    if let Some(object) = parse_object(text) {
        return Ok(object);
    }

    let unfenced = strip_code_fence(text);
    if unfenced != text {
        if let Some(object) = parse_object(unfenced) {
            return Ok(object);
        }
    }

    let single_line = unfenced.replace('\r', "").replace('\n', " ");
    let single_line = single_line.trim();
    if single_line != unfenced {
        if let Some(object) = parse_object(single_line) {
            return Ok(object);
        }
    }

    if let Some(object) = decode_prefix_object(unfenced) {
        return Ok(object);
    }

    Err(malformed(&preview(text)))
}

fn parse_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) => Some(object),
        _ => None,
    }
}

/// Strips a leading ``` or ```json fence and the matching closing fence.
fn strip_code_fence(text: &str) -> &str {
    let body = if let Some(rest) = text.strip_prefix("```json") {
        rest
    } else if let Some(rest) = text.strip_prefix("```") {
        rest
    } else {
        return text;
    };
    match body.split_once("```") {
        Some((fenced, _)) => fenced.trim(),
        None => body.trim(),
    }
}

/// Decodes one JSON value starting at the earliest `{` or `[`, tolerating
/// trailing prose. Only an object is accepted.
fn decode_prefix_object(text: &str) -> Option<Map<String, Value>> {
    let start = [text.find('{'), text.find('[')]
        .into_iter()
        .flatten()
        .min()?;
    let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
    match stream.next() {
        Some(Ok(Value::Object(object))) => Some(object),
        _ => None,
    }
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(ERROR_PREVIEW_CHARS).collect();
    if out.len() < text.len() {
        out.push('…');
    }
    out
}

fn malformed(detail: &str) -> PipelineError {
    PipelineError::MalformedResponse {
        detail: detail.to_string(),
    }
}
