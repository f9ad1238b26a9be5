//! Request body construction and non-streaming response parsing.

use serde_json::{json, Map, Value};
use shared_types::BodyMode;

/// Sampling and prompt settings copied into every request body.
#[derive(Debug, Clone, Default)]
pub struct BodySettings {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Resolves `Auto` from the request path; never returns `Auto`.
pub fn resolve_body_mode(mode: BodyMode, request_path: &str) -> BodyMode {
    match mode {
        BodyMode::Chat | BodyMode::Completion => mode,
        BodyMode::Auto => {
            let path = request_path.to_ascii_lowercase();
            if path.contains("chat") {
                BodyMode::Chat
            } else if path.trim_end_matches('/').ends_with("completions") {
                BodyMode::Completion
            } else {
                BodyMode::Chat
            }
        }
    }
}

pub fn build_body(settings: &BodySettings, mode: BodyMode, prompt: &str, stream: bool) -> Value {
    let mut body = Map::new();
    if let Some(model) = settings.model.as_deref().filter(|m| !m.is_empty()) {
        body.insert("model".to_string(), json!(model));
    }

    match mode {
        BodyMode::Completion => {
            let prompt = match settings.system_prompt.as_deref().filter(|s| !s.is_empty()) {
                Some(system) => format!("{system}\n\n{prompt}"),
                None => prompt.to_string(),
            };
            body.insert("prompt".to_string(), json!(prompt));
        }
        BodyMode::Chat | BodyMode::Auto => {
            let mut messages = Vec::new();
            if let Some(system) = settings.system_prompt.as_deref().filter(|s| !s.is_empty()) {
                messages.push(json!({"role": "system", "content": system}));
            }
            messages.push(json!({"role": "user", "content": prompt}));
            body.insert("messages".to_string(), Value::Array(messages));
        }
    }

    if let Some(temperature) = settings.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(max_tokens) = settings.max_tokens {
        body.insert("max_tokens".to_string(), json!(max_tokens));
    }
    body.insert("stream".to_string(), json!(stream));
    Value::Object(body)
}

/// Text of the first choice of a complete (non-streamed) response.
pub fn extract_text(response: &Value) -> Option<&str> {
    let choice = response.get("choices")?.get(0)?;
    choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .or_else(|| choice.get("text").and_then(Value::as_str))
}

/// Model ids from a `/models` listing, sorted.
pub fn extract_model_ids(listing: &Value) -> Vec<String> {
    let entries = match listing.get("data").and_then(Value::as_array) {
        Some(data) => data.as_slice(),
        None => listing.as_array().map(Vec::as_slice).unwrap_or_default(),
    };
    let mut ids: Vec<String> = entries
        .iter()
        .filter_map(|entry| match entry {
            Value::String(id) => Some(id.clone()),
            other => other.get("id").and_then(Value::as_str).map(str::to_string),
        })
        .collect();
    ids.sort();
    ids.dedup();
    ids
}
