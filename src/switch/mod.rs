//! The RPC switch: a JSON-RPC 2.0 broker between clients and workers.
//!
//! The switch authenticates every peer, authorizes calls against the method
//! configuration, picks a worker per call, and relays all further traffic
//! for that call-pair over a virtual channel. It never executes application
//! methods itself.
//!
//! ## Architecture
//!
//! - `protocol`: JSON-RPC 2.0 request/response types and error codes
//! - `transport`: TCP listeners with newline-delimited JSON framing
//! - `dispatcher`: frame classification and the `rpcswitch.*` handlers
//! - `registry`: announced workers, flat or bucketed by filter value
//! - `channel`: per-(client, worker) virtual channels
//! - `client`: client for connecting to a running switch
//!
//! All broker state lives behind one coarse async mutex; every mutation
//! happens inside a single lock section, so handlers never observe each
//! other mid-update.

pub(crate) mod channel;
pub mod client;
mod dispatcher;
pub mod protocol;
mod registry;
mod transport;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::AuthVerifier;
use crate::config::AppConfig;
use crate::policy::Policy;

use channel::Channel;
use protocol::Response;
use registry::{ConnId, WorkerRegistry};

/// A dispatch failure, carrying its JSON-RPC error code.
#[derive(Debug)]
pub enum SwitchError {
    /// Request lacks an id but the method is not a notification
    NotNotification(String),
    /// An internal method handler failed
    Handler(String),
    /// Method invoked in the wrong connection state
    BadState(String),
    /// No worker registered for the target backend
    NoWorker(String),
    /// Malformed or missing rpcswitch envelope
    BadChannel(&'static str),
    /// Envelope references an unknown vci
    NoChannel(String),
    /// Opposite end of the channel disconnected
    Gone,
    /// Method name lacks a `ns.` prefix
    NoNamespace(String),
    /// No ACL entry matches the method or its `ns.*`
    NoAcl(String),
    /// Caller not in the matched ACL
    NotAllowed(String),
    /// Filter param missing or undefined
    BadParam(String),
    /// Frame exceeds the configured size limit
    TooBig(usize),
    InvalidRequest(&'static str),
    MethodNotFound(String),
    InvalidParams(String),
}

impl SwitchError {
    pub fn code(&self) -> i32 {
        match self {
            SwitchError::NotNotification(_) => protocol::ERR_NOT_NOTIFICATION,
            SwitchError::Handler(_) => protocol::ERR_HANDLER,
            SwitchError::BadState(_) => protocol::ERR_BAD_STATE,
            SwitchError::NoWorker(_) => protocol::ERR_NO_WORKER,
            SwitchError::BadChannel(_) => protocol::ERR_BAD_CHANNEL,
            SwitchError::NoChannel(_) => protocol::ERR_NO_CHANNEL,
            SwitchError::Gone => protocol::ERR_GONE,
            SwitchError::NoNamespace(_) => protocol::ERR_NO_NAMESPACE,
            SwitchError::NoAcl(_) => protocol::ERR_NO_ACL,
            SwitchError::NotAllowed(_) => protocol::ERR_NOT_ALLOWED,
            SwitchError::BadParam(_) => protocol::ERR_BAD_PARAM,
            SwitchError::TooBig(_) => protocol::ERR_TOO_BIG,
            SwitchError::InvalidRequest(_) => protocol::INVALID_REQUEST,
            SwitchError::MethodNotFound(_) => protocol::METHOD_NOT_FOUND,
            SwitchError::InvalidParams(_) => protocol::INVALID_PARAMS,
        }
    }
}

impl std::fmt::Display for SwitchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwitchError::NotNotification(method) => {
                write!(f, "method '{method}' is not a notification")
            }
            SwitchError::Handler(msg) => write!(f, "{msg}"),
            SwitchError::BadState(msg) => write!(f, "{msg}"),
            SwitchError::NoWorker(backend) => write!(f, "no worker available for '{backend}'"),
            SwitchError::BadChannel(msg) => write!(f, "{msg}"),
            SwitchError::NoChannel(vci) => write!(f, "no such channel '{vci}'"),
            SwitchError::Gone => write!(f, "opposite end of channel gone"),
            SwitchError::NoNamespace(method) => write!(f, "no namespace in method '{method}'"),
            SwitchError::NoAcl(method) => write!(f, "no ACL found for '{method}'"),
            SwitchError::NotAllowed(msg) => write!(f, "{msg}"),
            SwitchError::BadParam(msg) => write!(f, "{msg}"),
            SwitchError::TooBig(size) => write!(f, "frame of {size} bytes exceeds limit"),
            SwitchError::InvalidRequest(msg) => write!(f, "{msg}"),
            SwitchError::MethodNotFound(method) => write!(f, "Method not found: {method}"),
            SwitchError::InvalidParams(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for SwitchError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    New,
    Auth,
    Closing,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::New => "new",
            ConnState::Auth => "auth",
            ConnState::Closing => "closing",
        }
    }
}

/// A method announced by a worker connection. The announced backend name is
/// the key it is stored under in [`Connection::methods`].
pub(crate) struct WorkerMethod {
    pub doc: Option<String>,
    /// Filter key and the announced value, when the backend is filtered.
    pub filter: Option<(String, Value)>,
}

impl WorkerMethod {
    /// Registry bucket key for the announced filter value.
    pub fn bucket_key(&self) -> Option<String> {
        self.filter.as_ref().map(|(_, value)| value.to_string())
    }
}

/// Messages for a connection's writer task.
pub(crate) enum Outgoing {
    Frame(String),
    Close,
}

/// Per-socket connection state.
pub(crate) struct Connection {
    pub from: String,
    pub state: ConnState,
    pub who: Option<String>,
    pub workername: Option<String>,
    /// Assigned at first successful announce; 0 means not a worker.
    pub worker_id: u64,
    pub methods: HashMap<String, WorkerMethod>,
    /// vcis of channels this connection is an endpoint of.
    pub channels: HashSet<String>,
    /// In-flight requests this connection is the target of.
    pub refcount: usize,
    tx: mpsc::UnboundedSender<Outgoing>,
    /// Wakes the read loop so the socket closes.
    pub shutdown: Arc<Notify>,
    pub ping_task: Option<JoinHandle<()>>,
    /// Outstanding switch-originated pings, keyed by request id.
    pub pending_pings: HashMap<String, oneshot::Sender<()>>,
}

impl Connection {
    pub fn send_value(&self, value: &Value) {
        let _ = self.tx.send(Outgoing::Frame(value.to_string()));
    }

    pub fn send_raw(&self, frame: String) {
        let _ = self.tx.send(Outgoing::Frame(frame));
    }

    pub fn send_response(&self, response: &Response) {
        if let Ok(frame) = serde_json::to_string(response) {
            let _ = self.tx.send(Outgoing::Frame(frame));
        }
    }

    pub fn push_close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }
}

pub(crate) struct SwitchState {
    pub policy: Arc<Policy>,
    pub connections: HashMap<ConnId, Connection>,
    pub channels: HashMap<String, Channel>,
    pub registry: WorkerRegistry,
    next_conn_id: ConnId,
    next_worker_id: u64,
    /// JSON frames handled since startup.
    pub chunks: u64,
    /// Connections accepted since startup.
    pub total_connections: u64,
    pub call_counters: HashMap<String, u64>,
}

impl SwitchState {
    pub fn next_worker_id(&mut self) -> u64 {
        self.next_worker_id += 1;
        self.next_worker_id
    }

    pub fn worker_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| !c.methods.is_empty())
            .count()
    }
}

/// The broker. Shared across listener and connection tasks via `Arc`.
pub struct Switch {
    cfg: Arc<AppConfig>,
    auth: Arc<dyn AuthVerifier>,
    state: Mutex<SwitchState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Switch {
    pub fn new(cfg: AppConfig, policy: Policy, auth: Arc<dyn AuthVerifier>) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            cfg: Arc::new(cfg),
            auth,
            state: Mutex::new(SwitchState {
                policy: Arc::new(policy),
                connections: HashMap::new(),
                channels: HashMap::new(),
                registry: WorkerRegistry::default(),
                next_conn_id: 0,
                next_worker_id: 0,
                chunks: 0,
                total_connections: 0,
                call_counters: HashMap::new(),
            }),
            shutdown_tx,
        })
    }

    pub(crate) fn config(&self) -> &AppConfig {
        &self.cfg
    }

    pub(crate) fn state(&self) -> &Mutex<SwitchState> {
        &self.state
    }

    pub(crate) fn verifier(&self) -> Arc<dyn AuthVerifier> {
        Arc::clone(&self.auth)
    }

    /// Bind the configured listeners and serve until shutdown() is called.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listeners = transport::bind(&self.cfg.listen).await?;
        self.serve(listeners).await
    }

    /// Serve on pre-bound listeners until shutdown() is called.
    pub async fn serve(self: Arc<Self>, listeners: Vec<TcpListener>) -> Result<()> {
        transport::serve(self, listeners).await
    }

    /// Signal the switch to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub(crate) fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Parse a fresh policy snapshot and swap it in. Existing channels and
    /// in-flight calls keep the snapshot they were dispatched against.
    pub async fn reload_policy(&self) -> Result<()> {
        let policy = Policy::load(&self.cfg.methods).context("Policy reload failed")?;
        let mut state = self.state.lock().await;
        state
            .call_counters
            .retain(|method, _| policy.method(method).is_some());
        state.policy = Arc::new(policy);
        info!("method configuration reloaded");
        Ok(())
    }

    pub(crate) async fn register_connection(
        &self,
        from: String,
        tx: mpsc::UnboundedSender<Outgoing>,
        shutdown: Arc<Notify>,
    ) -> ConnId {
        let mut state = self.state.lock().await;
        state.next_conn_id += 1;
        state.total_connections += 1;
        let id = state.next_conn_id;
        state.connections.insert(
            id,
            Connection {
                from,
                state: ConnState::New,
                who: None,
                workername: None,
                worker_id: 0,
                methods: HashMap::new(),
                channels: HashSet::new(),
                refcount: 0,
                tx,
                shutdown,
                ping_task: None,
                pending_pings: HashMap::new(),
            },
        );
        id
    }

    /// Initiate teardown of a connection: the read loop wakes up, exits, and
    /// runs [`Switch::disconnect`].
    pub(crate) async fn force_close(&self, conn_id: ConnId) {
        let mut state = self.state.lock().await;
        if let Some(conn) = state.connections.get_mut(&conn_id) {
            conn.state = ConnState::Closing;
            conn.push_close();
            conn.shutdown.notify_one();
        }
    }

    /// Answer an oversized frame and drop the connection.
    pub(crate) async fn frame_too_big(&self, conn_id: ConnId, size: usize) {
        let mut state = self.state.lock().await;
        if let Some(conn) = state.connections.get_mut(&conn_id) {
            warn!(from = %conn.from, size, "frame exceeds limit, disconnecting");
            let err = SwitchError::TooBig(size);
            conn.send_response(&Response::switch_error(Value::Null, &err));
            conn.state = ConnState::Closing;
            conn.push_close();
        }
    }

    /// Full teardown bookkeeping once a connection's read loop has ended:
    /// withdraw announced methods, resolve every channel the connection was
    /// an endpoint of, and notify the opposite ends.
    pub(crate) async fn disconnect(&self, conn_id: ConnId) {
        let mut state = self.state.lock().await;
        let Some(mut conn) = state.connections.remove(&conn_id) else {
            return;
        };

        if let Some(ping) = conn.ping_task.take() {
            ping.abort();
        }

        for (backend, wm) in conn.methods.drain() {
            state
                .registry
                .withdraw(&backend, wm.bucket_key().as_deref(), conn_id);
        }

        for vci in conn.channels.drain() {
            let Some(chan) = state.channels.remove(&vci) else {
                continue;
            };
            let Some(other_id) = chan.other_end(conn_id) else {
                continue;
            };
            let Some(other) = state.connections.get_mut(&other_id) else {
                continue;
            };
            for pending in chan.reqs.values() {
                if chan.responder(pending.direction) == conn_id {
                    // The survivor was waiting on the disconnected side.
                    let gone = Response::switch_error(pending.id.clone(), &SwitchError::Gone);
                    other.send_response(&gone);
                } else {
                    // The survivor would have answered; release its slot.
                    other.refcount = other.refcount.saturating_sub(1);
                }
            }
            other.send_value(&channel_gone_notification(&vci));
            other.channels.remove(&vci);
            debug!(vci = %vci, from = %conn.from, "channel gone");
        }

        info!(
            from = %conn.from,
            who = conn.who.as_deref().unwrap_or("-"),
            "peer disconnected"
        );
    }

    /// Keepalive loop for a worker connection, started on its first
    /// announce. Sends `rpcswitch.ping` every ping interval and disconnects
    /// the peer when the pong deadline expires.
    pub(crate) fn spawn_ping(self: &Arc<Self>, conn_id: ConnId) -> JoinHandle<()> {
        let switch = Arc::clone(self);
        let period = Duration::from_secs(self.cfg.ping_interval_secs);
        let deadline = Duration::from_secs(self.cfg.pong_timeout_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let pong = {
                    let mut state = switch.state.lock().await;
                    let Some(conn) = state.connections.get_mut(&conn_id) else {
                        return;
                    };
                    let id = format!("ping:{}", Uuid::now_v7());
                    let (tx, rx) = oneshot::channel();
                    conn.pending_pings.insert(id.clone(), tx);
                    conn.send_value(&json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "method": "rpcswitch.ping",
                    }));
                    rx
                };
                match tokio::time::timeout(deadline, pong).await {
                    Ok(Ok(())) => {}
                    // connection already torn down
                    Ok(Err(_)) => return,
                    Err(_) => {
                        warn!(conn = conn_id, "ping deadline expired, disconnecting");
                        switch.force_close(conn_id).await;
                        return;
                    }
                }
            }
        })
    }
}

fn channel_gone_notification(vci: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "rpcswitch.channel_gone",
        "params": {"channel": vci},
    })
}
