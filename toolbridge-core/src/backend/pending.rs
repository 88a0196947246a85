//! Pending-request table for stream backends.

use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::jsonrpc::JsonRpcId;

/// Outcome of waiting on a pending request.
#[derive(Debug, PartialEq)]
pub enum PendingOutcome {
    Response(Value),
    /// The table was drained (transport lost) before a response arrived.
    Failed,
    TimedOut,
}

/// Requests awaiting exactly one response, keyed by wire id.
#[derive(Debug, Default)]
pub struct PendingTable {
    waiters: DashMap<JsonRpcId, oneshot::Sender<Value>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` and return the receiving half.
    ///
    /// A previous waiter on the same id is dropped and observes a failure.
    pub fn register(&self, id: JsonRpcId) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        if self.waiters.insert(id.clone(), tx).is_some() {
            tracing::warn!(id = %id, "replacing pending request with the same id");
        }
        rx
    }

    /// Deliver `response` to the waiter for `id`.
    ///
    /// Removal is atomic, so a duplicate response finds no waiter. Returns
    /// the response back when nobody is waiting for it.
    pub fn complete(&self, id: &JsonRpcId, response: Value) -> Result<(), Value> {
        match self.waiters.remove(id) {
            Some((_, tx)) => tx.send(response),
            None => Err(response),
        }
    }

    /// Forget the waiter for `id`.
    pub fn cancel(&self, id: &JsonRpcId) -> bool {
        self.waiters.remove(id).is_some()
    }

    /// Drop every waiter; each resolves to [`PendingOutcome::Failed`].
    pub fn fail_all(&self) -> usize {
        let count = self.waiters.len();
        self.waiters.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Wait on `rx` for at most `timeout`. A timed-out id is removed.
    pub async fn wait(
        &self,
        id: &JsonRpcId,
        rx: oneshot::Receiver<Value>,
        timeout: Duration,
    ) -> PendingOutcome {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => PendingOutcome::Response(response),
            Ok(Err(_)) => PendingOutcome::Failed,
            Err(_) => {
                self.cancel(id);
                PendingOutcome::TimedOut
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_complete_delivers_once() {
        let table = PendingTable::new();
        let id = JsonRpcId::Number(10_001);
        let rx = table.register(id.clone());

        assert!(table.complete(&id, json!({"id": 10_001, "result": {}})).is_ok());
        assert!(table.complete(&id, json!({"id": 10_001, "result": {}})).is_err());
        assert_eq!(
            table.wait(&id, rx, Duration::from_secs(1)).await,
            PendingOutcome::Response(json!({"id": 10_001, "result": {}}))
        );
    }

    #[tokio::test]
    async fn test_fail_all_wakes_waiters() {
        let table = PendingTable::new();
        let rx1 = table.register(JsonRpcId::Number(1));
        let rx2 = table.register(JsonRpcId::Number(2));
        assert_eq!(table.fail_all(), 2);
        assert!(table.is_empty());
        assert_eq!(
            table.wait(&JsonRpcId::Number(1), rx1, Duration::from_secs(1)).await,
            PendingOutcome::Failed
        );
        assert_eq!(
            table.wait(&JsonRpcId::Number(2), rx2, Duration::from_secs(1)).await,
            PendingOutcome::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_evicts_entry() {
        let table = PendingTable::new();
        let id = JsonRpcId::Number(7);
        let rx = table.register(id.clone());

        let started = tokio::time::Instant::now();
        let outcome = table.wait(&id, rx, Duration::from_secs(60)).await;
        assert_eq!(outcome, PendingOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(table.is_empty());
    }

    #[test]
    fn test_unsolicited_response_is_returned() {
        let table = PendingTable::new();
        let msg = json!({"id": 99, "result": 1});
        assert_eq!(table.complete(&JsonRpcId::Number(99), msg.clone()), Err(msg));
    }
}
