//! Tool-call routing.
//!
//! Maps a public tool name from the aggregated catalog back to the owning
//! backend and its native name. All functions here are pure; the gateway
//! owns the I/O.

use serde_json::Value;

use crate::config::{BackendConfig, PrefixPolicy, normalize_backend_name};

/// Tools whose `collection_id` argument may be a human-readable title.
pub const COLLECTION_TOOLS: &[&str] = &["search_collection", "search_chat_files"];

/// Argument carrying the collection reference.
pub const COLLECTION_ARGUMENT: &str = "collection_id";

/// Tool that lists collections on the owning backend.
pub const LIST_COLLECTIONS_TOOL: &str = "list_collections";

/// Opaque collection ids start with this.
const COLLECTION_ID_PREFIX: &str = "col";

/// Unprefixed database tool names.
const SQL_TOOL_STEMS: &[&str] = &[
    "list_tables",
    "execute_select",
    "count_records",
    "get_table_sample",
    "describe_table",
    "list_schemas",
];

/// Routing view of one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    /// Lowercased configured name, hyphens kept.
    pub raw: String,
    /// Lowercased with `-` replaced by `_`.
    pub normalized: String,
    pub policy: PrefixPolicy,
}

impl RouteEntry {
    pub fn new(name: &str, policy: PrefixPolicy) -> Self {
        Self {
            raw: name.to_lowercase(),
            normalized: normalize_backend_name(name),
            policy,
        }
    }

    fn owns_prefix(&self, tool: &str) -> bool {
        tool.starts_with(&format!("{}_", self.raw))
            || tool.starts_with(&format!("{}_", self.normalized))
            || (self.raw == "google-calendar" && tool.contains("google_calendar_"))
            || (self.raw == "notion" && tool.contains("notion_"))
    }
}

/// How a route was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMatch {
    /// The tool carries a backend's own prefix.
    Prefix,
    /// The tool follows a known unprefixed naming convention.
    Convention(&'static str),
    /// Nothing matched; defaulted to the first backend.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub index: usize,
    pub matched: RouteMatch,
}

/// Naming conventions for tools that reach the gateway without a backend
/// prefix. Each pairs a tool-name test with a backend-name test.
struct Convention {
    label: &'static str,
    tool: fn(&str) -> bool,
    backend: fn(&str) -> bool,
}

const CONVENTIONS: &[Convention] = &[
    Convention {
        label: "portal",
        tool: |t| t.starts_with("portal_"),
        backend: |b| b.contains("portal") || b.contains("transparencia"),
    },
    Convention {
        label: "calendar",
        tool: |t| t.contains("google_calendar_"),
        backend: |b| b.contains("google") && b.contains("calendar"),
    },
    Convention {
        label: "notion",
        tool: |t| t.starts_with("notion_"),
        backend: |b| b.contains("notion"),
    },
    Convention {
        label: "aperag",
        tool: |t| t.starts_with("aperag_") || t.starts_with("aperag-mcp_"),
        backend: |b| b.contains("aperag"),
    },
    Convention {
        label: "sql",
        tool: |t| t.starts_with("sql_") || SQL_TOOL_STEMS.iter().any(|s| t.starts_with(s)),
        backend: |b| b.contains("sql") || b.contains("dw") || b.contains("sensr"),
    },
];

/// Routing table, one entry per configured backend in index order.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn new(entries: Vec<RouteEntry>) -> Self {
        Self { entries }
    }

    pub fn from_configs(backends: &[BackendConfig]) -> Self {
        Self::new(
            backends
                .iter()
                .map(|b| RouteEntry::new(&b.name, b.effective_prefix_policy()))
                .collect(),
        )
    }

    /// Pick the backend that owns `tool`.
    ///
    /// Own prefixes are tried first, then the first naming convention the
    /// tool matches. Only one convention is consulted: if no backend fits
    /// it, the route falls back to index 0.
    pub fn route(&self, tool: &str) -> Route {
        if let Some(index) = self.entries.iter().position(|e| e.owns_prefix(tool)) {
            return Route {
                index,
                matched: RouteMatch::Prefix,
            };
        }

        if let Some(conv) = CONVENTIONS.iter().find(|c| (c.tool)(tool)) {
            if let Some(index) = self.entries.iter().position(|e| (conv.backend)(&e.raw)) {
                return Route {
                    index,
                    matched: RouteMatch::Convention(conv.label),
                };
            }
        }

        tracing::warn!(tool, "could not determine backend for tool, using first backend");
        Route {
            index: 0,
            matched: RouteMatch::Fallback,
        }
    }

    /// The name the backend at `index` knows `tool` by.
    pub fn native_name(&self, index: usize, tool: &str) -> String {
        match self.entries.get(index) {
            Some(entry) => strip_prefix(tool, entry),
            None => tool.to_string(),
        }
    }
}

/// Remove the disambiguation prefix the aggregator (or a confused caller)
/// put on `tool`.
///
/// [`PrefixPolicy::KeepNative`] backends expose names that already start
/// with their prefix, so only a doubled prefix is collapsed. Other backends
/// lose one prefix layer; a doubled prefix is removed entirely, as is a
/// leading `mcp_` left behind.
pub fn strip_prefix(tool: &str, entry: &RouteEntry) -> String {
    match entry.policy {
        PrefixPolicy::KeepNative => {
            let prefix = format!("{}_", entry.normalized);
            let doubled = format!("{prefix}{prefix}");
            if tool.starts_with(&doubled) {
                tool[prefix.len()..].to_string()
            } else {
                tool.to_string()
            }
        }
        PrefixPolicy::Strip => strip_one_layer(tool, entry),
    }
}

fn strip_one_layer(tool: &str, entry: &RouteEntry) -> String {
    for alias in ["aperag-mcp_", "aperag_mcp_"] {
        if let Some(rest) = tool.strip_prefix(alias) {
            return rest.to_string();
        }
    }
    if let Some(rest) = tool.strip_prefix("aperag_") {
        return rest.strip_prefix("mcp_").unwrap_or(rest).to_string();
    }

    for prefix in [format!("{}_", entry.normalized), format!("{}_", entry.raw)] {
        if let Some(rest) = tool.strip_prefix(prefix.as_str()) {
            let rest = rest.strip_prefix(prefix.as_str()).unwrap_or(rest);
            return rest.strip_prefix("mcp_").unwrap_or(rest).to_string();
        }
    }

    tool.to_string()
}

/// The collection title to resolve, if this call names a collection by
/// title rather than by opaque id.
pub fn collection_title<'a>(native_tool: &str, arguments: &'a Value) -> Option<&'a str> {
    if !COLLECTION_TOOLS.contains(&native_tool) {
        return None;
    }
    arguments
        .get(COLLECTION_ARGUMENT)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty() && !v.starts_with(COLLECTION_ID_PREFIX))
}

/// Find the id of the collection titled `title` (case-insensitive) in a
/// `list_collections` result.
///
/// Looks in `structuredContent.items` first, then in any `content[].text`
/// entry that parses as JSON with an `items` array.
pub fn find_collection_id(result: &Value, title: &str) -> Option<String> {
    let wanted = title.to_lowercase();
    let scan = |items: &Value| -> Option<String> {
        items.as_array()?.iter().find_map(|coll| {
            let coll_title = coll.get("title").and_then(Value::as_str)?;
            if coll_title.to_lowercase() == wanted {
                coll.get("id").and_then(Value::as_str).map(str::to_string)
            } else {
                None
            }
        })
    };

    if let Some(found) = result.pointer("/structuredContent/items").and_then(scan) {
        return Some(found);
    }

    result
        .get("content")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(|entry| entry.get("text").and_then(Value::as_str))
        .filter_map(|text| serde_json::from_str::<Value>(text).ok())
        .find_map(|parsed| parsed.get("items").and_then(scan))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table(names: &[&str]) -> RouteTable {
        RouteTable::new(
            names
                .iter()
                .map(|n| {
                    let policy = if matches!(*n, "google-calendar" | "notion") {
                        PrefixPolicy::KeepNative
                    } else {
                        PrefixPolicy::Strip
                    };
                    RouteEntry::new(n, policy)
                })
                .collect(),
        )
    }

    #[test]
    fn test_route_by_own_prefix() {
        let t = table(&["sql-dw", "aperag", "google-calendar"]);
        assert_eq!(
            t.route("aperag_search_collection"),
            Route {
                index: 1,
                matched: RouteMatch::Prefix
            }
        );
        assert_eq!(t.route("sql-dw_list_tables").index, 0);
        assert_eq!(t.route("sql_dw_list_tables").index, 0);
        assert_eq!(t.route("google_calendar_list_events").index, 2);
    }

    #[test]
    fn test_route_by_convention() {
        let t = table(&["alpha", "portal-transparencia", "sensr", "notion"]);
        assert_eq!(t.route("portal_search").index, 1);
        assert_eq!(
            t.route("describe_table"),
            Route {
                index: 2,
                matched: RouteMatch::Convention("sql")
            }
        );
        assert_eq!(t.route("notion_search").index, 3);
    }

    #[test]
    fn test_route_fallback_to_first() {
        let t = table(&["alpha", "beta"]);
        assert_eq!(
            t.route("mystery"),
            Route {
                index: 0,
                matched: RouteMatch::Fallback
            }
        );
        // A matching convention without a matching backend still falls back.
        assert_eq!(t.route("portal_search").matched, RouteMatch::Fallback);
    }

    #[test]
    fn test_strip_single_and_doubled_prefix() {
        let t = table(&["alpha"]);
        assert_eq!(t.native_name(0, "alpha_foo"), "foo");
        assert_eq!(t.native_name(0, "alpha_alpha_foo"), "foo");
        assert_eq!(t.native_name(0, "alpha_mcp_foo"), "foo");
        assert_eq!(t.native_name(0, "foo"), "foo");
    }

    #[test]
    fn test_strip_hyphenated_name() {
        let t = table(&["sql-dw"]);
        assert_eq!(t.native_name(0, "sql_dw_list_tables"), "list_tables");
        assert_eq!(t.native_name(0, "sql-dw_list_tables"), "list_tables");
    }

    #[test]
    fn test_strip_aperag_aliases() {
        let t = table(&["rag"]);
        assert_eq!(t.native_name(0, "aperag-mcp_search"), "search");
        assert_eq!(t.native_name(0, "aperag_mcp_search"), "search");
        assert_eq!(t.native_name(0, "aperag_search"), "search");
    }

    #[test]
    fn test_keep_native_only_collapses_doubles() {
        let t = table(&["google-calendar", "notion"]);
        assert_eq!(
            t.native_name(0, "google_calendar_list_events"),
            "google_calendar_list_events"
        );
        assert_eq!(
            t.native_name(0, "google_calendar_google_calendar_list_events"),
            "google_calendar_list_events"
        );
        assert_eq!(t.native_name(1, "notion_notion_search"), "notion_search");
    }

    #[test]
    fn test_native_name_out_of_range() {
        assert_eq!(table(&[]).native_name(3, "x_y"), "x_y");
    }

    #[test]
    fn test_collection_title_detection() {
        let args = json!({"collection_id": "Engineering Docs"});
        assert_eq!(collection_title("search_collection", &args), Some("Engineering Docs"));
        assert_eq!(collection_title("other_tool", &args), None);
        assert_eq!(
            collection_title("search_chat_files", &json!({"collection_id": "col_abc"})),
            None
        );
        assert_eq!(collection_title("search_collection", &json!({"collection_id": 3})), None);
        assert_eq!(collection_title("search_collection", &json!({})), None);
    }

    #[test]
    fn test_find_collection_id_structured() {
        let result = json!({
            "structuredContent": {"items": [
                {"id": "col_1", "title": "Other"},
                {"id": "col_2", "title": "Engineering Docs"}
            ]}
        });
        assert_eq!(
            find_collection_id(&result, "engineering docs"),
            Some("col_2".to_string())
        );
    }

    #[test]
    fn test_find_collection_id_text_content() {
        let listing = json!({"items": [{"id": "col_9", "title": "HR"}]}).to_string();
        let result = json!({"content": [
            {"type": "text", "text": "not json"},
            {"type": "text", "text": listing}
        ]});
        assert_eq!(find_collection_id(&result, "hr"), Some("col_9".to_string()));
        assert_eq!(find_collection_id(&result, "finance"), None);
    }
}
