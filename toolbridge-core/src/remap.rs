//! Identifier remapping between frontend requests and backend wire ids.
//!
//! A frontend's request id is only unique within that frontend, and several
//! frontends share every backend. Each admitted request therefore gets a
//! fresh local id from one process-wide counter, and the pair
//! `(frontend, cloud_id) ↔ (backend, local_id)` is recorded until the
//! matching response (or a failure) consumes it.

use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;

use crate::jsonrpc::JsonRpcId;

/// First value handed out is `LOCAL_ID_BASE + 1`. Ids at or below the base
/// are reserved for protocol-internal calls such as `initialize` (id 1).
pub const LOCAL_ID_BASE: i64 = 10_000;

type CloudKey = (String, JsonRpcId);
type LocalKey = (usize, i64);

/// Bidirectional id map shared by every frontend and backend task.
#[derive(Debug)]
pub struct IdRemapper {
    counter: AtomicI64,
    by_cloud: DashMap<CloudKey, LocalKey>,
    by_local: DashMap<LocalKey, CloudKey>,
}

impl Default for IdRemapper {
    fn default() -> Self {
        Self::new()
    }
}

impl IdRemapper {
    pub fn new() -> Self {
        Self {
            counter: AtomicI64::new(LOCAL_ID_BASE),
            by_cloud: DashMap::new(),
            by_local: DashMap::new(),
        }
    }

    /// Allocate the next local id without recording a mapping.
    ///
    /// Used for gateway-internal sub-requests (aggregation fan-out, name
    /// lookups) which draw from the same sequence so wire ids never collide.
    pub fn next_local_id(&self) -> i64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record a frontend request bound for `backend` and return its local id.
    ///
    /// If the frontend reuses a cloud id that is still pending, the older
    /// mapping is dropped so its late response cannot be misattributed.
    pub fn admit(&self, frontend: &str, cloud_id: &JsonRpcId, backend: usize) -> i64 {
        let local_id = self.next_local_id();
        let cloud_key = (frontend.to_string(), cloud_id.clone());
        let local_key = (backend, local_id);

        self.by_local.insert(local_key, cloud_key.clone());
        if let Some(stale) = self.by_cloud.insert(cloud_key, local_key) {
            tracing::warn!(
                frontend,
                cloud_id = %cloud_id,
                stale_backend = stale.0,
                stale_local_id = stale.1,
                "cloud id reused while still pending, dropping older mapping"
            );
            self.by_local.remove(&stale);
        }

        local_id
    }

    /// Consume the mapping for a response from `backend` with `local_id`,
    /// provided it belongs to `frontend`.
    ///
    /// Returns the frontend's original id exactly once; any later call for
    /// the same local id returns `None`.
    pub fn resolve(&self, frontend: &str, backend: usize, local_id: i64) -> Option<JsonRpcId> {
        let local_key = (backend, local_id);
        let (_, (_, cloud_id)) = self
            .by_local
            .remove_if(&local_key, |_, (owner, _)| owner == frontend)?;
        self.by_cloud
            .remove_if(&(frontend.to_string(), cloud_id.clone()), |_, v| *v == local_key);
        Some(cloud_id)
    }

    /// Consume the mapping for a response whose frontend is not known to the
    /// caller (a response the backend pushed outside any pending wait).
    pub fn resolve_any(&self, backend: usize, local_id: i64) -> Option<(String, JsonRpcId)> {
        let local_key = (backend, local_id);
        let (_, cloud_key) = self.by_local.remove(&local_key)?;
        self.by_cloud.remove_if(&cloud_key, |_, v| *v == local_key);
        Some(cloud_key)
    }

    /// Drop the mapping for a request that failed or timed out.
    ///
    /// Returns `true` if a mapping was removed.
    pub fn evict(&self, frontend: &str, backend: usize, local_id: i64) -> bool {
        self.resolve(frontend, backend, local_id).is_some()
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.by_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_local.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_counter_starts_above_reserved_range() {
        let remap = IdRemapper::new();
        assert_eq!(remap.next_local_id(), LOCAL_ID_BASE + 1);
        assert_eq!(remap.next_local_id(), LOCAL_ID_BASE + 2);
    }

    #[test]
    fn test_admit_and_resolve_restores_cloud_id() {
        let remap = IdRemapper::new();
        let cloud = JsonRpcId::String("abc".into());
        let local = remap.admit("endpoint-0", &cloud, 1);

        assert_eq!(remap.len(), 1);
        assert_eq!(remap.resolve("endpoint-0", 1, local), Some(cloud.clone()));
        assert!(remap.is_empty());
        assert_eq!(remap.resolve("endpoint-0", 1, local), None);
    }

    #[test]
    fn test_duplicate_resolution_is_noop() {
        let remap = IdRemapper::new();
        let local = remap.admit("endpoint-0", &JsonRpcId::Number(5), 0);
        assert!(remap.resolve("endpoint-0", 0, local).is_some());
        assert!(remap.resolve("endpoint-0", 0, local).is_none());
        assert!(remap.resolve_any(0, local).is_none());
    }

    #[test]
    fn test_resolve_requires_matching_frontend_and_backend() {
        let remap = IdRemapper::new();
        let local = remap.admit("endpoint-0", &JsonRpcId::Number(5), 0);
        assert!(remap.resolve("endpoint-1", 0, local).is_none());
        assert!(remap.resolve("endpoint-0", 1, local).is_none());
        assert_eq!(remap.len(), 1);
        assert!(remap.resolve("endpoint-0", 0, local).is_some());
    }

    #[test]
    fn test_same_cloud_id_on_two_frontends_is_independent() {
        let remap = IdRemapper::new();
        let id = JsonRpcId::Number(1);
        let a = remap.admit("endpoint-0", &id, 0);
        let b = remap.admit("endpoint-1", &id, 0);
        assert_ne!(a, b);
        assert_eq!(remap.resolve_any(0, b), Some(("endpoint-1".into(), id.clone())));
        assert_eq!(remap.resolve("endpoint-0", 0, a), Some(id));
    }

    #[test]
    fn test_reused_cloud_id_replaces_stale_mapping() {
        let remap = IdRemapper::new();
        let id = JsonRpcId::Number(9);
        let first = remap.admit("endpoint-0", &id, 0);
        let second = remap.admit("endpoint-0", &id, 1);

        assert_eq!(remap.len(), 1);
        assert!(remap.resolve("endpoint-0", 0, first).is_none());
        assert_eq!(remap.resolve("endpoint-0", 1, second), Some(id));
    }

    #[test]
    fn test_evict() {
        let remap = IdRemapper::new();
        let local = remap.admit("endpoint-0", &JsonRpcId::Null, 2);
        assert!(remap.evict("endpoint-0", 2, local));
        assert!(!remap.evict("endpoint-0", 2, local));
        assert!(remap.is_empty());
    }

    #[test]
    fn test_concurrent_admissions_get_unique_ids() {
        let remap = Arc::new(IdRemapper::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let remap = Arc::clone(&remap);
                std::thread::spawn(move || {
                    (0..200)
                        .map(|i| remap.admit(&format!("endpoint-{t}"), &JsonRpcId::Number(i), t % 3))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "local id {id} handed out twice");
            }
        }
        assert_eq!(remap.len(), 1600);
    }
}
