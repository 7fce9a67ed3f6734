//! Client facade and shared state.
//!
//! [`Client`] is a cheap-clone handle over the shared state: the resource
//! cache, the pending-request table and the connection. All state
//! transitions run under one mutex, never held across an await; events for
//! user handlers are collected as effects and dispatched after the lock is
//! released.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use resmux_proto::{
    method, method_with_name, Inbound, Response, VERB_AUTH, VERB_CALL, VERB_SUBSCRIBE,
};

use crate::bus::{EventBus, EventHandler, EventPayload, HandlerId};
use crate::cache::CacheEntry;
use crate::codec::{Codec, Completion};
use crate::collection::{Collection, IdCallback};
use crate::error::{Error, Result};
use crate::model::Model;
use crate::registry::{ChangeCtx, ChangeHandler, ModelType, TypeRegistry};
use crate::resource::Resource;
use crate::transport::{Transport, WsTransport};

// ─── Configuration ────────────────────────────────────────────────────────

pub const DEFAULT_NAMESPACE: &str = "resclient";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3_000);
pub const DEFAULT_STALE_RESUBSCRIBE_DELAY: Duration = Duration::from_millis(2_000);

/// Client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Server URL. `ws://` and `wss://` are taken verbatim; `http://` and
    /// `https://` are rewritten to the matching WebSocket scheme.
    pub url: String,
    /// Event namespace prefixed to every emitted event path.
    pub namespace: String,
    /// Delay before a reconnect attempt after the connection drops.
    pub reconnect_delay: Duration,
    /// Delay before resubscribing an entry kept alive only by direct
    /// listeners after its subscription was lost.
    pub stale_resubscribe_delay: Duration,
    /// Optional secondary-id callback applied to every collection.
    pub collection_id_callback: Option<IdCallback>,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            stale_resubscribe_delay: DEFAULT_STALE_RESUBSCRIBE_DELAY,
            collection_id_callback: None,
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn stale_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.stale_resubscribe_delay = delay;
        self
    }

    pub fn collection_id_callback(mut self, callback: IdCallback) -> Self {
        self.collection_id_callback = Some(callback);
        self
    }
}

// ─── Shared state ─────────────────────────────────────────────────────────

pub(crate) enum ConnState {
    Idle,
    Connecting,
    /// Transport open, hook/resubscription still running; requests flow.
    Opening {
        writer: mpsc::UnboundedSender<String>,
    },
    Open {
        writer: mpsc::UnboundedSender<String>,
    },
}

pub(crate) struct State {
    pub cache: HashMap<String, CacheEntry>,
    pub codec: Codec,
    pub conn: ConnState,
    /// Whether the client should hold a connection (set by `connect`,
    /// cleared by `disconnect`); gates reconnects.
    pub try_connect: bool,
    /// Fences stale `run_connect` completions.
    pub connect_attempt: u64,
    /// Fences frames and close handling from superseded connections.
    pub epoch: u64,
    pub connect_waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl State {
    pub(crate) fn writer(&self) -> Option<mpsc::UnboundedSender<String>> {
        match &self.conn {
            ConnState::Opening { writer } | ConnState::Open { writer } => Some(writer.clone()),
            _ => None,
        }
    }
}

/// Hook invoked on every transport open, before resubscription and before
/// the connect future resolves.
pub type ConnectHook = Arc<
    dyn Fn(Client) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

pub(crate) struct ClientInner {
    pub cfg: ClientConfig,
    pub url: Url,
    pub transport: Arc<dyn Transport>,
    pub bus: EventBus,
    pub registry: Mutex<TypeRegistry>,
    pub state: Mutex<State>,
    pub on_connect: Mutex<Option<ConnectHook>>,
    pub rt: tokio::runtime::Handle,
    pub weak: Weak<ClientInner>,
}

// ─── Deferred effects ─────────────────────────────────────────────────────

/// User-visible work collected under the state lock and run after it is
/// released, so handlers can call back into the client.
pub(crate) enum Effect {
    Emit {
        target: String,
        event: String,
        payload: EventPayload,
    },
    CustomChange {
        handler: ChangeHandler,
        ctx: ChangeCtx,
    },
}

impl Effect {
    pub(crate) fn emit(target: &str, event: &str, payload: EventPayload) -> Self {
        Self::Emit {
            target: target.to_string(),
            event: event.to_string(),
            payload,
        }
    }

    pub(crate) fn client_error(error: Error) -> Self {
        Self::Emit {
            target: String::new(),
            event: "error".to_string(),
            payload: EventPayload::Error { error },
        }
    }
}

pub(crate) type Effects = Vec<Effect>;

impl ClientInner {
    pub(crate) fn run_effects(&self, effects: Effects) {
        for effect in effects {
            match effect {
                Effect::Emit {
                    target,
                    event,
                    payload,
                } => self.bus.emit(&target, &event, &payload),
                Effect::CustomChange { handler, ctx } => {
                    if catch_unwind(AssertUnwindSafe(|| handler(&ctx))).is_err() {
                        tracing::warn!(rid = ctx.model.rid(), "custom change handler panicked");
                    }
                }
            }
        }
    }

    /// Registers a pending request and writes its frame. The pending entry
    /// is rolled back when the writer is gone.
    pub(crate) fn send_locked(
        &self,
        st: &mut State,
        method: String,
        params: Option<Value>,
        completion: Completion,
    ) -> Result<()> {
        let Some(writer) = st.writer() else {
            return Err(Error::transport("not connected"));
        };
        let (id, frame) = st.codec.prepare(method, params, completion)?;
        if writer.send(frame).is_err() {
            st.codec.take(id);
            return Err(Error::transport("connection closed"));
        }
        Ok(())
    }

    // ─── Inbound dispatch ─────────────────────────────────────────────────

    pub(crate) fn handle_frame(&self, epoch: u64, text: &str) {
        let mut effects = Effects::new();
        {
            let mut st = self.state.lock().unwrap();
            if st.epoch != epoch {
                return;
            }
            match resmux_proto::parse_inbound(text) {
                Ok(Inbound::Response(resp)) => {
                    self.handle_response(&mut st, &mut effects, resp);
                }
                Ok(Inbound::Event(frame)) => {
                    if let Err(err) = self.handle_event_frame(&mut st, &mut effects, &frame) {
                        tracing::warn!(event = %frame.event, error = %err, "failed to apply event");
                        effects.push(Effect::client_error(err));
                    }
                }
                Err(parse_err) => {
                    let err = Error::protocol(format!("malformed inbound frame: {parse_err}"));
                    tracing::warn!(%err, "dropping frame");
                    effects.push(Effect::client_error(err));
                }
            }
        }
        self.run_effects(effects);
    }

    fn handle_response(&self, st: &mut State, effects: &mut Effects, resp: Response) {
        let id = resp.id();
        let Some(pending) = st.codec.take(id) else {
            let err = Error::protocol(format!("response for unknown request id {id}"));
            tracing::warn!(%err, "dropping response");
            effects.push(Effect::client_error(err));
            return;
        };

        match resp.into_result() {
            Ok(result) => match pending.completion {
                Completion::Call(tx) => {
                    let _ = tx.send(Ok(result));
                }
                Completion::Subscribe { rid } => {
                    self.complete_subscribe(st, effects, &rid, Ok(result));
                }
                Completion::Resubscribe { rid } => {
                    self.complete_resubscribe(st, effects, &rid, Ok(result));
                }
                Completion::Unsubscribe { rid } => {
                    self.complete_unsubscribe(st, effects, &rid);
                }
            },
            Err(error_obj) => {
                let err = Error::server(error_obj, pending.method, pending.params);
                effects.push(Effect::client_error(err.clone()));
                match pending.completion {
                    Completion::Call(tx) => {
                        let _ = tx.send(Err(err));
                    }
                    Completion::Subscribe { rid } => {
                        self.complete_subscribe(st, effects, &rid, Err(err));
                    }
                    Completion::Resubscribe { rid } => {
                        self.complete_resubscribe(st, effects, &rid, Err(err));
                    }
                    Completion::Unsubscribe { rid } => {
                        self.complete_unsubscribe(st, effects, &rid);
                    }
                }
            }
        }
    }
}

// ─── URL resolution ───────────────────────────────────────────────────────

/// Accepts absolute `ws`/`wss` URLs, rewriting `http`/`https` schemes.
/// There is no host document to resolve relative URLs against.
fn resolve_url(raw: &str) -> Result<Url> {
    let rewritten = if let Some(rest) = raw.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = raw.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        raw.to_string()
    };
    let url = Url::parse(&rewritten)
        .map_err(|e| Error::config(format!("invalid URL '{raw}': {e}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(Error::config(format!(
            "unsupported URL scheme '{other}' in '{raw}'"
        ))),
    }
}

// ─── Client ───────────────────────────────────────────────────────────────

/// Handle to a resmux client. Cloning is cheap; all clones share one cache
/// and one connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Creates a client over the production WebSocket transport.
    ///
    /// Must be called within a tokio runtime; background work (read pump,
    /// timers) is spawned onto it.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_transport(config, Arc::new(WsTransport))
    }

    /// Creates a client over a custom transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let url = resolve_url(&config.url)?;
        let rt = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::config("client must be created within a tokio runtime"))?;

        let inner = Arc::new_cyclic(|weak| ClientInner {
            bus: EventBus::new(config.namespace.clone()),
            cfg: config,
            url,
            transport,
            registry: Mutex::new(TypeRegistry::new()),
            state: Mutex::new(State {
                cache: HashMap::new(),
                codec: Codec::new(),
                conn: ConnState::Idle,
                try_connect: false,
                connect_attempt: 0,
                epoch: 0,
                connect_waiters: Vec::new(),
            }),
            on_connect: Mutex::new(None),
            rt,
            weak: weak.clone(),
        });
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    // ─── Connection ───────────────────────────────────────────────────────

    /// Connects, or joins the in-flight attempt. Resolves once the
    /// connection is open, the on-connect hook has run and stale entries
    /// are resubscribed.
    pub async fn connect(&self) -> Result<()> {
        let rx = {
            let mut st = self.inner.state.lock().unwrap();
            st.try_connect = true;
            if matches!(st.conn, ConnState::Open { .. }) {
                return Ok(());
            }
            self.inner.start_connect_locked(&mut st)
        };
        rx.await
            .map_err(|_| Error::transport("connect aborted"))?
    }

    /// Closes the connection and stops reconnecting. Cached entries go
    /// stale; pending requests fail.
    pub fn disconnect(&self) {
        let (waiters, was_open, effects) = {
            let mut st = self.inner.state.lock().unwrap();
            st.try_connect = false;
            if matches!(st.conn, ConnState::Idle) {
                return;
            }
            if matches!(st.conn, ConnState::Connecting) {
                st.conn = ConnState::Idle;
                (std::mem::take(&mut st.connect_waiters), false, Effects::new())
            } else {
                st.epoch += 1; // orphan the read pump
                st.conn = ConnState::Idle; // dropping the writer closes the transport
                let mut effects = Effects::new();
                self.inner.teardown_locked(&mut st, &mut effects);
                (std::mem::take(&mut st.connect_waiters), true, effects)
            }
        };
        for waiter in waiters {
            let _ = waiter.send(Err(Error::transport("disconnected")));
        }
        if was_open {
            tracing::info!("disconnected");
            self.inner.bus.emit("", "close", &EventPayload::Close);
        }
        self.inner.run_effects(effects);
    }

    /// Whether the connection is open and fully synchronized.
    pub fn is_connected(&self) -> bool {
        matches!(self.inner.state.lock().unwrap().conn, ConnState::Open { .. })
    }

    /// Sets the hook run on every transport open before anything else;
    /// typically used to authenticate. A failing hook closes the transport.
    pub fn set_on_connect<F, Fut>(&self, hook: F)
    where
        F: Fn(Client) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        *self.inner.on_connect.lock().unwrap() = Some(Arc::new(move |c| Box::pin(hook(c))));
    }

    pub fn clear_on_connect(&self) {
        *self.inner.on_connect.lock().unwrap() = None;
    }

    // ─── Resources ────────────────────────────────────────────────────────

    /// Fetches a resource, subscribing to it. A cached resource returns
    /// immediately; concurrent fetches of the same rid share one
    /// subscribe.
    pub async fn get_resource(&self, rid: &str) -> Result<Resource> {
        if rid.is_empty() {
            return Err(Error::config("rid must not be empty"));
        }
        loop {
            enum Step {
                Wait(oneshot::Receiver<Result<Resource>>),
                Connect,
            }
            let step = {
                let mut st = self.inner.state.lock().unwrap();
                if let Some(entry) = st.cache.get_mut(rid) {
                    if let Some(item) = entry.item.clone() {
                        return Ok(item);
                    }
                    let (tx, rx) = oneshot::channel();
                    entry.waiters.push(tx);
                    Step::Wait(rx)
                } else if st.writer().is_some() {
                    let mut entry = CacheEntry::new(rid);
                    entry.subscribed = true;
                    let (tx, rx) = oneshot::channel();
                    entry.waiters.push(tx);
                    st.cache.insert(rid.to_string(), entry);
                    let completion = Completion::Subscribe {
                        rid: rid.to_string(),
                    };
                    if let Err(err) = self.inner.send_locked(
                        &mut st,
                        method(VERB_SUBSCRIBE, rid),
                        None,
                        completion,
                    ) {
                        st.cache.remove(rid);
                        return Err(err);
                    }
                    Step::Wait(rx)
                } else {
                    Step::Connect
                }
            };
            match step {
                Step::Wait(rx) => {
                    return rx.await.map_err(|_| Error::transport("connection closed"))?
                }
                Step::Connect => self.connect().await?,
            }
        }
    }

    /// Fetches a resource expected to be a model.
    pub async fn get_model(&self, rid: &str) -> Result<Model> {
        self.get_resource(rid).await?.into_model()
    }

    /// Fetches a resource expected to be a collection.
    pub async fn get_collection(&self, rid: &str) -> Result<Collection> {
        self.get_resource(rid).await?.into_collection()
    }

    // ─── Calls ────────────────────────────────────────────────────────────

    /// Calls a method on a resource.
    pub async fn call_model(
        &self,
        rid: &str,
        method_name: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        self.request(method_with_name(VERB_CALL, rid, method_name), params)
            .await
    }

    /// Sets model properties. A `None` value requests key deletion and is
    /// translated to the wire sentinel.
    pub async fn set_model(
        &self,
        rid: &str,
        props: impl IntoIterator<Item = (String, Option<Value>)>,
    ) -> Result<Value> {
        let params: serde_json::Map<String, Value> = props
            .into_iter()
            .map(|(key, value)| (key, value.unwrap_or_else(resmux_proto::delete_sentinel)))
            .collect();
        self.request(
            method_with_name(VERB_CALL, rid, "set"),
            Some(Value::Object(params)),
        )
        .await
    }

    /// Creates a model in a collection and fetches it. The call result
    /// must carry the new model's rid.
    pub async fn create_model(
        &self,
        collection_rid: &str,
        props: impl IntoIterator<Item = (String, Value)>,
    ) -> Result<Model> {
        let params: serde_json::Map<String, Value> = props.into_iter().collect();
        let result = self
            .request(
                method_with_name(VERB_CALL, collection_rid, "new"),
                Some(Value::Object(params)),
            )
            .await?;
        let rid = result
            .get("rid")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::protocol("new-model result carries no rid"))?
            .to_string();
        self.get_model(&rid).await
    }

    /// Asks a collection to remove a model.
    pub async fn remove_model(&self, collection_rid: &str, rid: &str) -> Result<()> {
        self.request(
            method_with_name(VERB_CALL, collection_rid, "remove"),
            Some(serde_json::json!({ "rid": rid })),
        )
        .await
        .map(|_| ())
    }

    /// Sends an authentication call.
    pub async fn authenticate(
        &self,
        rid: &str,
        method_name: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        self.request(method_with_name(VERB_AUTH, rid, method_name), params)
            .await
    }

    /// Sends a request, connecting first when needed.
    async fn request(&self, method: String, params: Option<Value>) -> Result<Value> {
        loop {
            let rx = {
                let mut st = self.inner.state.lock().unwrap();
                if st.writer().is_some() {
                    let (tx, rx) = oneshot::channel();
                    self.inner.send_locked(
                        &mut st,
                        method.clone(),
                        params.clone(),
                        Completion::Call(tx),
                    )?;
                    Some(rx)
                } else {
                    None
                }
            };
            match rx {
                Some(rx) => {
                    return rx.await.map_err(|_| Error::transport("connection closed"))?
                }
                None => self.connect().await?,
            }
        }
    }

    // ─── Model types ──────────────────────────────────────────────────────

    /// Registers a model type keyed on its two-segment prefix. Duplicate
    /// or malformed ids are rejected.
    pub fn register_model_type(&self, model_type: ModelType) -> Result<()> {
        self.inner.registry.lock().unwrap().register(model_type)
    }

    /// Unregisters a model type, returning it if present.
    pub fn unregister_model_type(&self, id: &str) -> Option<Arc<ModelType>> {
        self.inner.registry.lock().unwrap().unregister(id)
    }

    // ─── Client events ────────────────────────────────────────────────────

    /// Attaches a handler for client-level events: `connect`, `close`,
    /// `error`.
    pub fn on(
        &self,
        events: &str,
        handler: impl Fn(&str, &EventPayload) + Send + Sync + 'static,
    ) -> HandlerId {
        let handler: EventHandler = Arc::new(handler);
        self.inner.bus.on("", events, handler)
    }

    /// Detaches a client-level handler.
    pub fn off(&self, events: &str, id: HandlerId) -> bool {
        self.inner.bus.off("", events, id)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_accepts_websocket_schemes() {
        assert_eq!(resolve_url("ws://host/ws").unwrap().as_str(), "ws://host/ws");
        assert_eq!(
            resolve_url("wss://host:8080/ws").unwrap().as_str(),
            "wss://host:8080/ws"
        );
    }

    #[test]
    fn url_rewrites_http_schemes() {
        assert_eq!(
            resolve_url("http://host/ws").unwrap().as_str(),
            "ws://host/ws"
        );
        assert_eq!(
            resolve_url("https://host/ws").unwrap().as_str(),
            "wss://host/ws"
        );
    }

    #[test]
    fn url_rejects_other_inputs() {
        assert!(matches!(
            resolve_url("/relative/path").unwrap_err(),
            Error::Config { .. }
        ));
        assert!(matches!(
            resolve_url("ftp://host/ws").unwrap_err(),
            Error::Config { .. }
        ));
    }

    #[test]
    fn config_defaults() {
        let cfg = ClientConfig::new("ws://host/ws");
        assert_eq!(cfg.namespace, "resclient");
        assert_eq!(cfg.reconnect_delay, Duration::from_millis(3_000));
        assert_eq!(cfg.stale_resubscribe_delay, Duration::from_millis(2_000));
    }
}
