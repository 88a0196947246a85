//! Gateway orchestration.
//!
//! Owns every backend and frontend connection plus the shared state that
//! ties them together: the id remapper, the routing table, the response
//! governor and the collection cache. Startup connects backends first and
//! only then frontends; after that, three background tasks keep it going:
//!
//! - frontend pump: dispatches envelopes arriving from any frontend
//! - backend pump: delivers unsolicited backend messages
//! - health loop: reconnects and re-initializes dropped backends

pub mod state;

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, BackendEvent, ShutdownGrace, build_backend};
use crate::catalog::{TOOLS_LIST, aggregate, catalog_result};
use crate::config::{ClientIdentity, Config, FrontendConfig, GatewayDefaults};
use crate::error::{BackendError, GatewayError};
use crate::frontend::{FrontendConnection, FrontendMessage, FrontendTiming};
use crate::governor::ResponseGovernor;
use crate::jsonrpc::{
    JsonRpcId, JsonRpcMessageKind, build_request, build_success, classify_jsonrpc, set_id,
};
use crate::remap::IdRemapper;
use crate::router::{
    COLLECTION_ARGUMENT, LIST_COLLECTIONS_TOOL, RouteTable, collection_title, find_collection_id,
};

pub use state::{GatewayState, StateCell};

pub const TOOLS_CALL: &str = "tools/call";

/// Everything [`Gateway::assemble`] needs.
pub struct GatewayParts {
    pub backends: Vec<Arc<dyn Backend>>,
    pub routes: RouteTable,
    /// `(endpoint id, config)` per usable frontend.
    pub frontends: Vec<(String, FrontendConfig)>,
    pub client: ClientIdentity,
    pub governor: ResponseGovernor,
    pub defaults: GatewayDefaults,
    pub events: mpsc::UnboundedReceiver<BackendEvent>,
}

type Inbound = (
    mpsc::UnboundedReceiver<FrontendMessage>,
    mpsc::UnboundedReceiver<BackendEvent>,
);

pub struct Gateway {
    backends: Vec<Arc<dyn Backend>>,
    routes: RouteTable,
    frontends: Vec<Arc<FrontendConnection>>,
    ids: IdRemapper,
    governor: ResponseGovernor,
    /// `(backend index, title) → collection id`. Never invalidated.
    collections: DashMap<(usize, String), String>,
    state: StateCell,
    health_interval: Duration,
    cancel: CancellationToken,
    inbound: Mutex<Option<Inbound>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("state", &self.state.get())
            .field("backends", &self.backends.len())
            .field("frontends", &self.frontends.len())
            .finish()
    }
}

impl Gateway {
    /// Build every connection described by `config`. Nothing is connected
    /// until [`Gateway::start`].
    ///
    /// # Errors
    ///
    /// Fails if an HTTP backend's client cannot be built.
    pub fn new(config: &Config, defaults: &GatewayDefaults) -> Result<Arc<Self>, BackendError> {
        let (event_tx, events) = mpsc::unbounded_channel();
        let grace = ShutdownGrace::from(defaults);
        let backends = config
            .backends
            .iter()
            .enumerate()
            .map(|(index, backend)| {
                build_backend(
                    index,
                    backend,
                    &config.client,
                    &config.limits,
                    grace,
                    event_tx.clone(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let frontends = config
            .usable_frontends()
            .into_iter()
            .map(|(endpoint, frontend)| (endpoint, frontend.clone()))
            .collect();

        Ok(Self::assemble(GatewayParts {
            backends,
            routes: RouteTable::from_configs(&config.backends),
            frontends,
            client: config.client.clone(),
            governor: ResponseGovernor::from_limits(&config.limits),
            defaults: defaults.clone(),
            events,
        }))
    }

    pub fn assemble(parts: GatewayParts) -> Arc<Self> {
        let (frontend_tx, frontend_rx) = mpsc::unbounded_channel();
        let timing = FrontendTiming::from(&parts.defaults);
        let frontends = parts
            .frontends
            .into_iter()
            .map(|(endpoint, config)| {
                FrontendConnection::new(
                    endpoint,
                    config,
                    parts.client.clone(),
                    timing,
                    frontend_tx.clone(),
                )
            })
            .collect();

        Arc::new(Self {
            backends: parts.backends,
            routes: parts.routes,
            frontends,
            ids: IdRemapper::new(),
            governor: parts.governor,
            collections: DashMap::new(),
            state: StateCell::default(),
            health_interval: parts.defaults.health_check_interval,
            cancel: CancellationToken::new(),
            inbound: Mutex::new(Some((frontend_rx, parts.events))),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> GatewayState {
        self.state.get()
    }

    pub fn backends(&self) -> &[Arc<dyn Backend>] {
        &self.backends
    }

    pub fn frontends(&self) -> &[Arc<FrontendConnection>] {
        &self.frontends
    }

    pub fn remapper(&self) -> &IdRemapper {
        &self.ids
    }

    /// Connect backends, then frontends, then start the background tasks.
    ///
    /// # Errors
    ///
    /// [`GatewayError::NoBackendsConnected`] or
    /// [`GatewayError::NoFrontendsConnected`] when a phase connects nothing;
    /// the gateway is stopped before returning.
    pub async fn start(self: &Arc<Self>) -> Result<(), GatewayError> {
        let Some((frontend_rx, event_rx)) = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Err(GatewayError::InternalError {
                details: "gateway already started".to_string(),
            });
        };

        self.state.set(GatewayState::ConnectingBackends);
        let backends_up = join_all(self.backends.iter().map(connect_backend))
            .await
            .into_iter()
            .filter(|up| *up)
            .count();
        if backends_up == 0 {
            tracing::error!(total = self.backends.len(), "no backend could be connected");
            self.stop().await;
            return Err(GatewayError::NoBackendsConnected);
        }
        tracing::info!(connected = backends_up, total = self.backends.len(), "backends connected");

        self.spawn(Arc::clone(self).pump_backend_events(event_rx));
        self.spawn(Arc::clone(self).pump_frontend_messages(frontend_rx));

        self.state.set(GatewayState::ConnectingFrontends);
        let frontends_up = join_all(self.frontends.iter().map(|frontend| async move {
            match frontend.connect().await {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(frontend = %frontend.endpoint(), error = %e, "frontend connect failed");
                    false
                }
            }
        }))
        .await
        .into_iter()
        .filter(|up| *up)
        .count();
        if frontends_up == 0 {
            tracing::error!(total = self.frontends.len(), "no frontend could be connected");
            self.stop().await;
            return Err(GatewayError::NoFrontendsConnected);
        }
        tracing::info!(connected = frontends_up, total = self.frontends.len(), "frontends connected");

        self.spawn(Arc::clone(self).health_loop());
        self.state.set(GatewayState::Running);
        Ok(())
    }

    /// Start, serve until `shutdown` resolves, then stop.
    ///
    /// # Errors
    ///
    /// Propagates [`Gateway::start`] failures.
    pub async fn run_until(
        self: &Arc<Self>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), GatewayError> {
        self.start().await?;
        shutdown.await;
        self.stop().await;
        Ok(())
    }

    /// Disconnect frontends, then backends. Idempotent.
    pub async fn stop(&self) {
        if !self.state.begin_stop() {
            return;
        }
        self.cancel.cancel();

        join_all(self.frontends.iter().map(|f| f.disconnect())).await;
        join_all(self.backends.iter().map(|b| b.disconnect())).await;

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "gateway task ended abnormally");
            }
        }
        self.state.set(GatewayState::Stopped);
    }

    fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tokio::spawn(task));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Background tasks
    // ─────────────────────────────────────────────────────────────────────

    async fn pump_frontend_messages(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<FrontendMessage>) {
        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => return,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => return,
                },
            };
            let FrontendMessage {
                endpoint,
                kind,
                message,
            } = msg;
            match kind {
                JsonRpcMessageKind::Request { id, method } => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Some(response) = this.handle_request(&endpoint, id, &method, message).await {
                            this.deliver(&endpoint, response);
                        }
                    });
                }
                JsonRpcMessageKind::Notification { method } => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.broadcast_to_backends(&method, message).await });
                }
                JsonRpcMessageKind::Response { id } => {
                    tracing::debug!(frontend = %endpoint, cloud_id = %id, "ignoring response from frontend");
                }
            }
        }
    }

    async fn pump_backend_events(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<BackendEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = rx.recv() => match event {
                    Some(event) => self.on_backend_event(event),
                    None => return,
                },
            }
        }
    }

    async fn health_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval_at(
            tokio::time::Instant::now() + self.health_interval,
            self.health_interval,
        );
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tick.tick() => {}
            }
            let down: Vec<&Arc<dyn Backend>> =
                self.backends.iter().filter(|b| !b.is_connected()).collect();
            if down.is_empty() {
                continue;
            }
            tracing::info!(count = down.len(), "reconnecting backends");
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = join_all(down.into_iter().map(connect_backend)) => {}
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────────────

    /// Answer one frontend request. `None` means nothing is sent back.
    pub async fn handle_request(
        &self,
        endpoint: &str,
        id: JsonRpcId,
        method: &str,
        message: Value,
    ) -> Option<Value> {
        tracing::debug!(frontend = endpoint, cloud_id = %id, method, "frontend request");
        match method {
            TOOLS_LIST => Some(self.list_tools(&id, &message).await),
            TOOLS_CALL => self.call_tool(endpoint, id, message).await,
            _ => self.forward_default(endpoint, id, message).await,
        }
    }

    async fn list_tools(&self, id: &JsonRpcId, message: &Value) -> Value {
        let params = message.get("params").cloned().unwrap_or_else(|| json!({}));
        let tools = aggregate(&self.backends, &self.ids, params).await;
        build_success(id, catalog_result(tools))
    }

    async fn call_tool(&self, endpoint: &str, id: JsonRpcId, mut message: Value) -> Option<Value> {
        let Some(tool) = message
            .pointer("/params/name")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            let err = GatewayError::InvalidRequest {
                details: "tools/call requires params.name".to_string(),
            };
            return Some(err.to_response(&id));
        };

        let route = self.routes.route(&tool);
        let Some(backend) = self.backends.get(route.index) else {
            return Some(GatewayError::NoRoute { tool }.to_response(&id));
        };
        if !backend.is_connected() {
            tracing::warn!(frontend = endpoint, tool = %tool, backend = %backend.name(), "owning backend is down");
            let err = GatewayError::BackendNotConnected {
                backend: backend.name().to_string(),
            };
            return Some(err.to_response(&id));
        }

        let native = self.routes.native_name(route.index, &tool);
        let title = message
            .pointer("/params/arguments")
            .and_then(|args| collection_title(&native, args))
            .map(str::to_string);
        let resolved = match title {
            Some(title) => self.resolve_collection(route.index, &title).await,
            None => None,
        };

        if let Some(params) = message.get_mut("params").and_then(Value::as_object_mut) {
            params.insert("name".to_string(), Value::String(native.clone()));
            if let (Some(collection), Some(args)) = (
                resolved,
                params.get_mut("arguments").and_then(Value::as_object_mut),
            ) {
                args.insert(COLLECTION_ARGUMENT.to_string(), Value::String(collection));
            }
        }

        tracing::info!(
            frontend = endpoint,
            tool = %tool,
            native = %native,
            backend = %backend.name(),
            matched = ?route.matched,
            "routing tool call"
        );
        self.forward(endpoint, id, backend, message).await
    }

    async fn forward_default(&self, endpoint: &str, id: JsonRpcId, message: Value) -> Option<Value> {
        let Some(backend) = self.backends.first() else {
            let method = message
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Some(GatewayError::NoRoute { tool: method }.to_response(&id));
        };
        if !backend.is_connected() {
            let err = GatewayError::BackendNotConnected {
                backend: backend.name().to_string(),
            };
            return Some(err.to_response(&id));
        }
        self.forward(endpoint, id, backend, message).await
    }

    /// Send `message` to `backend` under a fresh local id and restore the
    /// caller's id on the reply.
    async fn forward(
        &self,
        endpoint: &str,
        cloud_id: JsonRpcId,
        backend: &Arc<dyn Backend>,
        mut message: Value,
    ) -> Option<Value> {
        let index = backend.index();
        let local_id = self.ids.admit(endpoint, &cloud_id, index);
        set_id(&mut message, &JsonRpcId::Number(local_id));

        let failure = match backend.send_message(message).await {
            Ok(Some(mut reply)) => {
                return match self.ids.resolve(endpoint, index, local_id) {
                    Some(original) => {
                        set_id(&mut reply, &original);
                        Some(reply)
                    }
                    None => {
                        tracing::warn!(frontend = endpoint, backend = %backend.name(), local_id, "reply for a superseded request dropped");
                        None
                    }
                };
            }
            Ok(None) => "no reply".to_string(),
            Err(e) => e.to_string(),
        };

        // A late reply may have consumed the mapping on the event path; the
        // caller then already has its answer.
        if !self.ids.evict(endpoint, index, local_id) {
            tracing::debug!(frontend = endpoint, backend = %backend.name(), local_id, "reply already delivered, suppressing failure");
            return None;
        }
        let err = GatewayError::ForwardingFailed {
            backend: backend.name().to_string(),
            reason: failure,
        };
        tracing::warn!(
            frontend = endpoint,
            backend = %backend.name(),
            cloud_id = %cloud_id,
            local_id,
            error_type = err.error_type_name(),
            error = %err,
            "forwarding failed"
        );
        Some(err.to_response(&cloud_id))
    }

    /// Turn a collection title into its id on backend `index`. Best effort.
    async fn resolve_collection(&self, index: usize, title: &str) -> Option<String> {
        let key = (index, title.to_string());
        if let Some(hit) = self.collections.get(&key) {
            return Some(hit.value().clone());
        }
        let backend = self.backends.get(index)?;

        let request = build_request(
            self.ids.next_local_id(),
            TOOLS_CALL,
            json!({"name": LIST_COLLECTIONS_TOOL, "arguments": {}}),
        );
        let reply = match backend.send_message(request).await {
            Ok(Some(reply)) => reply,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(backend = %backend.name(), title, error = %e, "collection lookup failed");
                return None;
            }
        };

        match reply.get("result").and_then(|r| find_collection_id(r, title)) {
            Some(id) => {
                tracing::info!(backend = %backend.name(), title, collection_id = %id, "collection resolved");
                self.collections.insert(key, id.clone());
                Some(id)
            }
            None => {
                tracing::warn!(backend = %backend.name(), title, "collection title not found");
                None
            }
        }
    }

    async fn broadcast_to_backends(&self, method: &str, notification: Value) {
        let live = self.backends.iter().filter(|b| b.is_connected());
        let sends = live.map(|backend| {
            let notification = notification.clone();
            async move {
                if let Err(e) = backend.send_message(notification).await {
                    tracing::warn!(backend = %backend.name(), method, error = %e, "notification not delivered");
                }
            }
        });
        join_all(sends).await;
    }

    fn on_backend_event(&self, event: BackendEvent) {
        let BackendEvent {
            backend,
            mut message,
        } = event;
        match classify_jsonrpc(&message) {
            Ok(JsonRpcMessageKind::Response { id }) => {
                let resolved = id
                    .as_i64()
                    .and_then(|local_id| self.ids.resolve_any(backend, local_id));
                match resolved {
                    Some((endpoint, original)) => {
                        set_id(&mut message, &original);
                        self.deliver(&endpoint, message);
                    }
                    None => {
                        tracing::warn!(backend, local_id = %id, "unmatched backend response dropped");
                    }
                }
            }
            Ok(JsonRpcMessageKind::Notification { method }) => {
                tracing::debug!(backend, method = %method, "relaying backend notification");
                for frontend in self.frontends.iter().filter(|f| f.is_connected()) {
                    if let Err(e) = frontend.send_message(message.clone()) {
                        tracing::warn!(frontend = %frontend.endpoint(), error = %e, "notification not delivered");
                    }
                }
            }
            Ok(JsonRpcMessageKind::Request { method, .. }) => {
                tracing::debug!(backend, method = %method, "ignoring backend request");
            }
            Err(e) => {
                tracing::debug!(backend, error = %e, "dropping invalid backend message");
            }
        }
    }

    /// Send a response to `endpoint` through the governor.
    fn deliver(&self, endpoint: &str, response: Value) {
        let response = self.governor.shrink(response);
        let Some(frontend) = self.frontends.iter().find(|f| f.endpoint() == endpoint) else {
            tracing::warn!(frontend = endpoint, "response for unknown frontend dropped");
            return;
        };
        if let Err(e) = frontend.send_message(response) {
            tracing::warn!(frontend = endpoint, error = %e, "response not delivered");
        }
    }
}

/// `connect` then `initialize`; a failed handshake leaves the backend down.
async fn connect_backend(backend: &Arc<dyn Backend>) -> bool {
    if let Err(e) = backend.connect().await {
        tracing::warn!(backend = %backend.name(), error = %e, "backend connect failed");
        return false;
    }
    if let Err(e) = backend.initialize().await {
        tracing::warn!(backend = %backend.name(), error = %e, "backend initialize failed");
        backend.disconnect().await;
        return false;
    }
    true
}
