//! Tool catalog aggregation.
//!
//! Every `tools/list` fans out to all connected backends, waits for all of
//! them, and merges the answers into one namespace. Nothing is cached.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::{Value, json};

use crate::backend::Backend;
use crate::config::normalize_backend_name;
use crate::jsonrpc::build_request;
use crate::remap::IdRemapper;

pub const TOOLS_LIST: &str = "tools/list";

/// Prefixes that already disambiguate a tool and are never doubled.
const RESERVED_PREFIXES: &[&str] = &["portal_", "sql_", "aperag_", "google_calendar_", "notion_"];

/// Public name of `native` as exposed by the backend normalized to `normalized`.
pub fn public_tool_name(native: &str, normalized: &str) -> String {
    let own = format!("{normalized}_");
    if native.starts_with(&own) || RESERVED_PREFIXES.iter().any(|p| native.starts_with(p)) {
        native.to_string()
    } else {
        format!("{own}{native}")
    }
}

/// The tools a backend reported, or nothing if the reply is unusable.
fn reply_tools(backend: &str, reply: &Value) -> Vec<Value> {
    if let Some(error) = reply.get("error") {
        tracing::warn!(backend, error = %error, "tools/list returned an error");
        return Vec::new();
    }
    match reply.pointer("/result/tools").and_then(Value::as_array) {
        Some(tools) => tools.clone(),
        None => {
            tracing::warn!(backend, "tools/list reply has no tools array");
            Vec::new()
        }
    }
}

/// Query one backend, never failing.
async fn list_one(backend: &Arc<dyn Backend>, ids: &IdRemapper, params: &Value) -> Vec<Value> {
    let local_id = ids.next_local_id();
    let name = backend.name();
    match backend
        .send_message(build_request(local_id, TOOLS_LIST, params.clone()))
        .await
    {
        Ok(Some(reply)) => reply_tools(name, &reply),
        Ok(None) => {
            tracing::warn!(backend = name, local_id, "tools/list got no reply");
            Vec::new()
        }
        Err(e) => {
            tracing::warn!(backend = name, local_id, error = %e, "tools/list failed");
            Vec::new()
        }
    }
}

/// Query every connected backend concurrently and merge the catalogs.
///
/// Tools are renamed with [`public_tool_name`]. When two backends end up
/// with the same public name, the lower-indexed backend keeps it.
pub async fn aggregate(backends: &[Arc<dyn Backend>], ids: &IdRemapper, params: Value) -> Vec<Value> {
    let live: Vec<&Arc<dyn Backend>> = backends.iter().filter(|b| b.is_connected()).collect();
    if live.is_empty() {
        tracing::warn!("tools/list with no connected backend");
        return Vec::new();
    }

    let replies = join_all(live.iter().map(|b| list_one(b, ids, &params))).await;

    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for (backend, tools) in live.iter().zip(replies) {
        let normalized = normalize_backend_name(backend.name());
        let count = tools.len();
        for mut tool in tools {
            let Some(native) = tool.get("name").and_then(Value::as_str) else {
                tracing::debug!(backend = backend.name(), "skipping tool without a name");
                continue;
            };
            let public = public_tool_name(native, &normalized);
            if !seen.insert(public.clone()) {
                tracing::warn!(backend = backend.name(), tool = %public, "duplicate public tool name dropped");
                continue;
            }
            tool["name"] = Value::String(public);
            merged.push(tool);
        }
        tracing::debug!(backend = backend.name(), tools = count, "catalog merged");
    }

    tracing::info!(backends = live.len(), tools = merged.len(), "tool catalog aggregated");
    merged
}

/// `result` member for a merged catalog.
pub fn catalog_result(tools: Vec<Value>) -> Value {
    json!({ "tools": tools })
}
