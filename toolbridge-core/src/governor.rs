//! Outbound response size governance.
//!
//! Frontends reject WebSocket frames above a fixed size. Tool replies
//! (document search in particular) easily exceed it, so every response
//! bound for a frontend is passed through [`ResponseGovernor::shrink`],
//! which degrades the payload in two passes and finally replaces it with a
//! size error.
//!
//! # Passes
//!
//! 1. `result.items[*].content` bounded to `max_content_chars`, at most 5
//!    items; `result.content` string bounded to `max_content_chars`;
//!    `result.content` list texts bounded to
//!    `min(max_content_chars, ceiling / 4 - 100)`, stopping once the kept
//!    text exceeds `ceiling / 2` or ten entries were kept.
//! 2. At most 2 items with content bounded to 1000; content list capped at
//!    3 entries with texts bounded to 5000; content string bounded to 10000.

use serde_json::{Map, Value};

use crate::error::GatewayError;
use crate::jsonrpc::{JsonRpcId, envelope_id, serialized_len};

/// Appended to every truncated text field.
pub const TRUNCATION_MARKER: &str = "... [truncated]";

const FIRST_PASS_MAX_ITEMS: usize = 5;
const FIRST_PASS_MAX_CONTENT_ENTRIES: usize = 10;
const SECOND_PASS_MAX_ITEMS: usize = 2;
const SECOND_PASS_ITEM_CHARS: usize = 1000;
const SECOND_PASS_MAX_CONTENT_ENTRIES: usize = 3;
const SECOND_PASS_ENTRY_CHARS: usize = 5000;
const SECOND_PASS_CONTENT_CHARS: usize = 10_000;

/// Staged degradation of oversized responses.
#[derive(Debug, Clone, Copy)]
pub struct ResponseGovernor {
    max_bytes: usize,
    max_content_chars: usize,
}

impl ResponseGovernor {
    pub fn new(max_bytes: usize, max_content_chars: usize) -> Self {
        Self {
            max_bytes,
            max_content_chars,
        }
    }

    pub fn from_limits(limits: &crate::config::Limits) -> Self {
        Self::new(limits.max_message_bytes, limits.max_content_chars)
    }

    /// Return `response` unchanged if it fits, a reduced copy if it can be
    /// made to fit, or a `-32603` error envelope with the same id otherwise.
    pub fn shrink(&self, mut response: Value) -> Value {
        let original_size = serialized_len(&response);
        if original_size <= self.max_bytes {
            return response;
        }
        tracing::warn!(
            size = original_size,
            max_size = self.max_bytes,
            "response exceeds frontend ceiling, truncating"
        );

        if let Some(result) = response.get_mut("result").and_then(Value::as_object_mut) {
            self.first_pass(result);
        }
        let mut size = serialized_len(&response);

        if size > self.max_bytes {
            tracing::warn!(size, "response still too large, applying aggressive truncation");
            if let Some(result) = response.get_mut("result").and_then(Value::as_object_mut) {
                second_pass(result);
            }
            size = serialized_len(&response);
            tracing::debug!(size, "size after aggressive truncation");
        }

        if size > self.max_bytes {
            tracing::error!(size, original_size, "response cannot be reduced below ceiling");
            let id = envelope_id(&response).unwrap_or(JsonRpcId::Null);
            return GatewayError::ResponseTooLarge {
                original_size,
                max_size: self.max_bytes,
            }
            .to_response(&id);
        }

        tracing::info!(original_size, size, "response truncated");
        response
    }

    fn first_pass(&self, result: &mut Map<String, Value>) {
        if let Some(items) = result.get_mut("items").and_then(Value::as_array_mut) {
            let before = items.len();
            for item in items.iter_mut() {
                truncate_member(item, "content", self.max_content_chars);
            }
            items.truncate(FIRST_PASS_MAX_ITEMS);
            tracing::info!(before, after = items.len(), "truncated search items");
        }

        match result.get_mut("content") {
            Some(Value::String(text)) => truncate_string(text, self.max_content_chars),
            Some(Value::Array(entries)) => {
                let before = entries.len();
                let entry_bound = self
                    .max_content_chars
                    .min((self.max_bytes / 4).saturating_sub(100));
                let budget = self.max_bytes / 2;
                let mut kept = Vec::with_capacity(entries.len());
                let mut total = 0usize;

                for (idx, mut entry) in std::mem::take(entries).into_iter().enumerate() {
                    if let Some(Value::String(text)) = entry.get_mut("text") {
                        truncate_string(text, entry_bound);
                        total += text.chars().count();
                        if total > budget || idx >= FIRST_PASS_MAX_CONTENT_ENTRIES {
                            tracing::info!(idx, total, "stopping content truncation");
                            break;
                        }
                    }
                    kept.push(entry);
                }

                tracing::info!(before, after = kept.len(), "truncated content entries");
                *entries = kept;
            }
            _ => {}
        }
    }
}

impl Default for ResponseGovernor {
    fn default() -> Self {
        Self::from_limits(&crate::config::Limits::default())
    }
}

fn second_pass(result: &mut Map<String, Value>) {
    if let Some(items) = result.get_mut("items").and_then(Value::as_array_mut) {
        items.truncate(SECOND_PASS_MAX_ITEMS);
        for item in items.iter_mut() {
            truncate_member(item, "content", SECOND_PASS_ITEM_CHARS);
        }
    }

    match result.get_mut("content") {
        Some(Value::Array(entries)) => {
            entries.truncate(SECOND_PASS_MAX_CONTENT_ENTRIES);
            for entry in entries.iter_mut() {
                truncate_member(entry, "text", SECOND_PASS_ENTRY_CHARS);
            }
        }
        Some(Value::String(text)) => truncate_string(text, SECOND_PASS_CONTENT_CHARS),
        _ => {}
    }
}

fn truncate_member(value: &mut Value, key: &str, max_chars: usize) {
    if let Some(Value::String(text)) = value.get_mut(key) {
        truncate_string(text, max_chars);
    }
}

/// Cut `text` to `max_chars` characters and append the marker.
///
/// Cuts on a character boundary, never inside a multi-byte sequence.
fn truncate_string(text: &mut String, max_chars: usize) {
    if let Some((byte_idx, _)) = text.char_indices().nth(max_chars) {
        text.truncate(byte_idx);
        text.push_str(TRUNCATION_MARKER);
    }
}
