//! Frame classification and method dispatch.
//!
//! Every parsed frame from a connection lands here. Decision order:
//! responses first (channel-tracked, then switch-originated), then requests
//! carrying a channel envelope, then the internal `rpcswitch.*` table, then
//! the method configuration for external calls; anything else is
//! method-not-found.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::sync::MutexGuard;
use tracing::{debug, error, info, warn};

use crate::auth::AuthResult;
use crate::policy;

use super::channel::{self, Channel, DIR_TO_WORKER};
use super::protocol::{self, Envelope, Request, Response, envelope_of};
use super::registry::{ConnId, pick_least_loaded};
use super::{ConnState, Switch, SwitchError, SwitchState, WorkerMethod};

pub(crate) async fn handle_frame(switch: &Arc<Switch>, conn_id: ConnId, raw: &str) {
    let msg: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            warn!(conn = conn_id, error = %err, "Parse error");
            let mut state = switch.state().lock().await;
            state.chunks += 1;
            if let Some(conn) = state.connections.get(&conn_id) {
                conn.send_response(&Response::parse_error());
            }
            return;
        }
    };

    let mut state = switch.state().lock().await;
    state.chunks += 1;

    // Responses have no method member.
    if msg.get("method").is_none() {
        handle_response(&mut state, conn_id, &msg, raw);
        return;
    }

    let id = msg.get("id").cloned().unwrap_or(Value::Null);

    let envelope = match envelope_of(&msg) {
        Ok(envelope) => envelope,
        Err(err) => {
            respond_err(&state, conn_id, id, &err);
            return;
        }
    };
    if let Some(envelope) = envelope {
        if let Err(err) = forward_channel_request(&mut state, conn_id, &envelope, &msg, raw) {
            respond_err(&state, conn_id, id, &err);
        }
        return;
    }

    let request: Request = match serde_json::from_value(msg) {
        Ok(request) => request,
        Err(_) => {
            respond_err(
                &state,
                conn_id,
                id,
                &SwitchError::InvalidRequest("invalid request envelope"),
            );
            return;
        }
    };
    if let Err(reason) = request.validate() {
        respond_err(&state, conn_id, id, &SwitchError::InvalidRequest(reason));
        return;
    }

    if request.method.starts_with("rpcswitch.") {
        handle_internal(switch, state, conn_id, request).await;
        return;
    }

    let snapshot = Arc::clone(&state.policy);
    if snapshot.method(&request.method).is_some() {
        if let Err(err) = dispatch_external(&mut state, &snapshot, conn_id, &request) {
            if request.id.is_some() {
                respond_err(&state, conn_id, id, &err);
            } else {
                debug!(method = %request.method, error = %err, "failing notification dropped");
            }
        }
        return;
    }

    respond_err(
        &state,
        conn_id,
        id,
        &SwitchError::MethodNotFound(request.method),
    );
}

fn respond_ok(state: &SwitchState, conn_id: ConnId, id: Value, result: Value) {
    if let Some(conn) = state.connections.get(&conn_id) {
        conn.send_response(&Response::success(id, result));
    }
}

fn respond_err(state: &SwitchState, conn_id: ConnId, id: Value, err: &SwitchError) {
    if let Some(conn) = state.connections.get(&conn_id) {
        debug!(conn = conn_id, code = err.code(), error = %err, "request failed");
        conn.send_response(&Response::switch_error(id, err));
    }
}

/// Route a response frame: in-channel traffic goes to the opposite
/// endpoint, pongs resolve the pending ping, anything else is dropped.
fn handle_response(state: &mut SwitchState, conn_id: ConnId, msg: &Value, raw: &str) {
    let Some(id) = msg.get("id") else {
        debug!(conn = conn_id, "response without id dropped");
        return;
    };

    match envelope_of(msg) {
        Ok(Some(envelope)) => {
            forward_channel_response(state, conn_id, &envelope.vci, id, raw);
            return;
        }
        Ok(None) => {}
        Err(err) => {
            debug!(conn = conn_id, error = %err, "response with bad envelope dropped");
            return;
        }
    }

    // No envelope: look for a channel this connection owes an answer on.
    let vcis: Vec<String> = state
        .connections
        .get(&conn_id)
        .map(|c| c.channels.iter().cloned().collect())
        .unwrap_or_default();
    for vci in vcis {
        let owed = state.channels.get(&vci).is_some_and(|chan| {
            chan.reqs
                .get(&channel::id_key(id))
                .is_some_and(|p| chan.responder(p.direction) == conn_id)
        });
        if owed {
            forward_channel_response(state, conn_id, &vci, id, raw);
            return;
        }
    }

    // A response to a switch-originated request (keepalive ping).
    if let Value::String(key) = id {
        if let Some(conn) = state.connections.get_mut(&conn_id) {
            if let Some(waiter) = conn.pending_pings.remove(key) {
                let _ = waiter.send(());
                return;
            }
        }
    }

    debug!(conn = conn_id, id = %id, "unmatched response dropped");
}

fn forward_channel_response(
    state: &mut SwitchState,
    sender: ConnId,
    vci: &str,
    id: &Value,
    raw: &str,
) {
    let Some(chan) = state.channels.get_mut(vci) else {
        debug!(vci = %vci, "response for unknown channel dropped");
        return;
    };
    let Some(dest_id) = chan.other_end(sender) else {
        debug!(vci = %vci, conn = sender, "response from non-endpoint dropped");
        return;
    };
    if chan.resolve_from(sender, id).is_none() {
        debug!(vci = %vci, id = %id, "response with untracked id dropped");
        return;
    }
    if let Some(conn) = state.connections.get_mut(&sender) {
        conn.refcount = conn.refcount.saturating_sub(1);
    }
    if let Some(dest) = state.connections.get(&dest_id) {
        dest.send_raw(raw.to_string());
    }
}

/// Forward an in-channel request verbatim to the opposite endpoint.
fn forward_channel_request(
    state: &mut SwitchState,
    sender: ConnId,
    envelope: &Envelope,
    msg: &Value,
    raw: &str,
) -> Result<(), SwitchError> {
    let chan = state
        .channels
        .get_mut(&envelope.vci)
        .ok_or_else(|| SwitchError::NoChannel(envelope.vci.clone()))?;
    let direction = chan
        .direction_from(sender)
        .ok_or(SwitchError::BadChannel("sender is not a channel endpoint"))?;
    let dest_id = chan
        .other_end(sender)
        .ok_or(SwitchError::BadChannel("sender is not a channel endpoint"))?;

    let tracked = match msg.get("id") {
        Some(id) if !id.is_null() => {
            chan.record(id, direction);
            true
        }
        _ => false,
    };

    let Some(dest) = state.connections.get_mut(&dest_id) else {
        return Err(SwitchError::Gone);
    };
    if tracked {
        dest.refcount += 1;
    }
    dest.send_raw(raw.to_string());
    Ok(())
}

async fn handle_internal(
    switch: &Arc<Switch>,
    mut state: MutexGuard<'_, SwitchState>,
    conn_id: ConnId,
    request: Request,
) {
    let method = request.method.clone();
    let Some(id) = request.id.clone() else {
        // none of the rpcswitch.* methods are notifications
        respond_err(
            &state,
            conn_id,
            Value::Null,
            &SwitchError::NotNotification(method),
        );
        return;
    };

    if method == "rpcswitch.hello" {
        rpc_hello(switch, state, conn_id, id, request.params).await;
        return;
    }

    // Everything except hello requires an authenticated connection.
    let conn_state = match state.connections.get(&conn_id) {
        Some(conn) => conn.state,
        None => return,
    };
    if conn_state != ConnState::Auth {
        respond_err(
            &state,
            conn_id,
            id,
            &SwitchError::BadState(format!(
                "can't call '{method}' in state '{}'",
                conn_state.as_str()
            )),
        );
        return;
    }

    let result = match method.as_str() {
        "rpcswitch.ping" => Ok(json!("pong?")),
        _ => named_params(request.params).and_then(|params| match method.as_str() {
            "rpcswitch.announce" => rpc_announce(switch, &mut state, conn_id, params),
            "rpcswitch.withdraw" => rpc_withdraw(&mut state, conn_id, params),
            "rpcswitch.get_clients" => Ok(get_clients(&state)),
            "rpcswitch.get_methods" => Ok(get_methods(&state)),
            "rpcswitch.get_method_details" => get_method_details(&state, params),
            "rpcswitch.get_workers" => Ok(get_workers(&state)),
            "rpcswitch.get_stats" => Ok(get_stats(&state)),
            _ => Err(SwitchError::MethodNotFound(method.clone())),
        }),
    };

    match result {
        Ok(value) => respond_ok(&state, conn_id, id, value),
        Err(err) => respond_err(&state, conn_id, id, &err),
    }
}

/// All `rpcswitch.*` methods declare named parameters.
fn named_params(params: Option<Value>) -> Result<Map<String, Value>, SwitchError> {
    match params {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(SwitchError::InvalidParams(
            "params must be an object".to_string(),
        )),
    }
}

async fn rpc_hello(
    switch: &Arc<Switch>,
    state: MutexGuard<'_, SwitchState>,
    conn_id: ConnId,
    id: Value,
    params: Option<Value>,
) {
    #[derive(Deserialize)]
    struct Params {
        method: String,
        who: String,
        token: String,
    }

    let params: Params = match params.map(serde_json::from_value).transpose() {
        Ok(Some(p)) => p,
        _ => {
            respond_err(
                &state,
                conn_id,
                id,
                &SwitchError::InvalidParams("hello requires method, who and token".to_string()),
            );
            return;
        }
    };

    // The verifier may suspend; release the state so other connections
    // keep being served while it runs.
    drop(state);
    let verdict = switch
        .verifier()
        .verify(&params.method, &params.who, &params.token)
        .await;

    let mut state = switch.state().lock().await;
    let Some(conn) = state.connections.get_mut(&conn_id) else {
        return;
    };
    match verdict {
        Ok(AuthResult::Granted) => {
            conn.state = ConnState::Auth;
            conn.who = Some(params.who.clone());
            info!(from = %conn.from, who = %params.who, auth = %params.method, "peer authenticated");
            conn.send_response(&Response::success(
                id,
                json!([true, format!("welcome {}!", params.who)]),
            ));
        }
        Ok(AuthResult::Denied(reason)) => {
            warn!(from = %conn.from, who = %params.who, reason = %reason, "authentication denied");
            let err = SwitchError::NotAllowed(format!("authentication failed: {reason}"));
            conn.send_response(&Response::switch_error(id, &err));
            conn.state = ConnState::Closing;
            conn.push_close();
            conn.shutdown.notify_one();
        }
        Err(err) => {
            error!(error = %err, "auth verifier failed");
            conn.send_response(&Response::error(
                id,
                protocol::INTERNAL_ERROR,
                "authentication backend failure",
            ));
            conn.state = ConnState::Closing;
            conn.push_close();
            conn.shutdown.notify_one();
        }
    }
}

fn rpc_announce(
    switch: &Arc<Switch>,
    state: &mut SwitchState,
    conn_id: ConnId,
    params: Map<String, Value>,
) -> Result<Value, SwitchError> {
    #[derive(Deserialize)]
    struct Params {
        method: String,
        #[serde(default)]
        workername: Option<String>,
        #[serde(default)]
        filter: Option<Value>,
        #[serde(default)]
        doc: Option<String>,
    }

    let params: Params = serde_json::from_value(Value::Object(params))
        .map_err(|e| SwitchError::InvalidParams(e.to_string()))?;

    policy::split_namespace(&params.method)
        .ok_or_else(|| SwitchError::NoNamespace(params.method.clone()))?;

    let snapshot = Arc::clone(&state.policy);
    let acl = snapshot
        .backend_acl(&params.method)
        .ok_or_else(|| SwitchError::NoAcl(params.method.clone()))?;
    let who = state
        .connections
        .get(&conn_id)
        .and_then(|c| c.who.clone())
        .ok_or_else(|| SwitchError::BadState("connection has no principal".to_string()))?;
    if !snapshot.check_acl(acl, &who) {
        return Err(SwitchError::NotAllowed(format!(
            "announcing '{}' not allowed for '{who}'",
            params.method
        )));
    }

    let filter = match (snapshot.filter_key(&params.method), params.filter) {
        (Some(key), Some(Value::Object(map))) => {
            if map.len() != 1 || !map.contains_key(key) {
                return Err(SwitchError::Handler(format!(
                    "filter must be an object with exactly the key '{key}'"
                )));
            }
            let value = map[key].clone();
            if !(value.is_string() || value.is_number() || value.is_boolean()) {
                return Err(SwitchError::Handler(
                    "filter value must be a defined scalar".to_string(),
                ));
            }
            Some((key.to_string(), value))
        }
        (Some(_), Some(_)) => {
            return Err(SwitchError::Handler(
                "filter must be a JSON object".to_string(),
            ));
        }
        (Some(key), None) => {
            return Err(SwitchError::Handler(format!(
                "backend '{}' requires filter key '{key}'",
                params.method
            )));
        }
        (None, Some(_)) => {
            return Err(SwitchError::Handler(format!(
                "backend '{}' does not accept a filter",
                params.method
            )));
        }
        (None, None) => None,
    };

    if state
        .connections
        .get(&conn_id)
        .is_some_and(|c| c.methods.contains_key(&params.method))
    {
        return Err(SwitchError::Handler(format!(
            "backend '{}' already announced",
            params.method
        )));
    }

    let wm = WorkerMethod {
        doc: params.doc,
        filter,
    };
    let bucket_key = wm.bucket_key();
    state
        .registry
        .announce(&params.method, bucket_key.clone(), conn_id)?;

    if !state.connections.contains_key(&conn_id) {
        state
            .registry
            .withdraw(&params.method, bucket_key.as_deref(), conn_id);
        return Err(SwitchError::Handler("connection gone".to_string()));
    }

    let assign_id = state
        .connections
        .get(&conn_id)
        .is_some_and(|c| c.worker_id == 0);
    let new_worker_id = assign_id.then(|| state.next_worker_id());

    let mut worker_id = 0;
    let mut first_announce = false;
    if let Some(conn) = state.connections.get_mut(&conn_id) {
        if let Some(assigned) = new_worker_id {
            conn.worker_id = assigned;
        }
        if conn.workername.is_none() {
            conn.workername = Some(params.workername.unwrap_or_else(|| who.clone()));
        }
        first_announce = conn.methods.is_empty();
        conn.methods.insert(params.method.clone(), wm);
        worker_id = conn.worker_id;
    }

    if first_announce {
        let handle = switch.spawn_ping(conn_id);
        if let Some(conn) = state.connections.get_mut(&conn_id) {
            conn.ping_task = Some(handle);
        }
    }

    info!(who = %who, backend = %params.method, worker_id, "worker announced");
    Ok(json!({"msg": "success", "worker_id": worker_id}))
}

fn rpc_withdraw(
    state: &mut SwitchState,
    conn_id: ConnId,
    params: Map<String, Value>,
) -> Result<Value, SwitchError> {
    #[derive(Deserialize)]
    struct Params {
        method: String,
    }

    let params: Params = serde_json::from_value(Value::Object(params))
        .map_err(|e| SwitchError::InvalidParams(e.to_string()))?;

    let (bucket_key, ping) = {
        let Some(conn) = state.connections.get_mut(&conn_id) else {
            return Err(SwitchError::Handler("connection gone".to_string()));
        };
        let Some(wm) = conn.methods.remove(&params.method) else {
            return Err(SwitchError::Handler(format!(
                "backend '{}' not announced",
                params.method
            )));
        };
        let ping = conn.methods.is_empty().then(|| conn.ping_task.take()).flatten();
        (wm.bucket_key(), ping)
    };

    state
        .registry
        .withdraw(&params.method, bucket_key.as_deref(), conn_id);
    if let Some(handle) = ping {
        handle.abort();
    }

    info!(conn = conn_id, backend = %params.method, "worker withdrew");
    Ok(json!(true))
}

/// External call: authorize, select a worker, and forward the rewritten
/// request over the pair's virtual channel.
fn dispatch_external(
    state: &mut SwitchState,
    snapshot: &crate::policy::Policy,
    conn_id: ConnId,
    request: &Request,
) -> Result<(), SwitchError> {
    let method = &request.method;
    let Some(conn) = state.connections.get(&conn_id) else {
        return Ok(());
    };
    if conn.state != ConnState::Auth {
        return Err(SwitchError::BadState(format!(
            "can't call '{method}' in state '{}'",
            conn.state.as_str()
        )));
    }
    let who = conn
        .who
        .clone()
        .ok_or_else(|| SwitchError::BadState("connection has no principal".to_string()))?;

    let entry = snapshot
        .method(method)
        .ok_or_else(|| SwitchError::MethodNotFound(method.clone()))?;
    let acl = snapshot
        .method_acl(method)
        .ok_or_else(|| SwitchError::NoAcl(method.clone()))?;
    if !snapshot.check_acl(acl, &who) {
        return Err(SwitchError::NotAllowed(format!(
            "method '{method}' not allowed for '{who}'"
        )));
    }

    let backend = entry.backend.clone();
    let bucket_key = match snapshot.filter_key(&backend) {
        Some(key) => {
            let Some(Value::Object(params)) = &request.params else {
                return Err(SwitchError::BadParam(format!(
                    "filtered method '{method}' requires named params"
                )));
            };
            match params.get(key) {
                Some(value) if !value.is_null() => Some(value.to_string()),
                _ => {
                    return Err(SwitchError::BadParam(format!(
                        "missing filter param '{key}'"
                    )));
                }
            }
        }
        None => None,
    };

    let candidates = state.registry.candidates(&backend, bucket_key.as_deref())?;
    let worker_conn = pick_least_loaded(&candidates, |c| {
        state.connections.get(&c).map_or(usize::MAX, |w| w.refcount)
    })
    .ok_or_else(|| SwitchError::NoWorker(backend.clone()))?;

    *state.call_counters.entry(method.clone()).or_insert(0) += 1;

    let vci = state
        .connections
        .get(&conn_id)
        .and_then(|c| {
            c.channels.iter().find(|vci| {
                state
                    .channels
                    .get(*vci)
                    .is_some_and(|ch| ch.client == conn_id && ch.worker == worker_conn)
            })
        })
        .cloned();
    let vci = match vci {
        Some(vci) => vci,
        None => {
            let chan = Channel::new(conn_id, worker_conn);
            let vci = chan.vci.clone();
            state.channels.insert(vci.clone(), chan);
            if let Some(c) = state.connections.get_mut(&conn_id) {
                c.channels.insert(vci.clone());
            }
            if let Some(w) = state.connections.get_mut(&worker_conn) {
                w.channels.insert(vci.clone());
            }
            vci
        }
    };

    if let Some(id) = &request.id {
        if let Some(chan) = state.channels.get_mut(&vci) {
            chan.record(id, DIR_TO_WORKER);
        }
        if let Some(worker) = state.connections.get_mut(&worker_conn) {
            worker.refcount += 1;
        }
    }

    // Rewrite the top-level envelope; params pass through untouched.
    let mut forwarded = json!({
        "jsonrpc": "2.0",
        "rpcswitch": {"vcookie": protocol::VCOOKIE, "vci": vci, "who": who},
        "method": backend,
    });
    if let Some(params) = &request.params {
        forwarded["params"] = params.clone();
    }
    if let Some(id) = &request.id {
        forwarded["id"] = id.clone();
    }

    if let Some(worker) = state.connections.get(&worker_conn) {
        debug!(method = %method, backend = %backend, vci = %vci, "call dispatched");
        worker.send_value(&forwarded);
    }
    Ok(())
}

fn get_clients(state: &SwitchState) -> Value {
    let mut clients = Map::new();
    let mut froms: Vec<_> = state.connections.values().collect();
    froms.sort_by(|a, b| a.from.cmp(&b.from));
    for conn in froms {
        let mut entry = Map::new();
        entry.insert("who".to_string(), json!(conn.who));
        entry.insert("state".to_string(), json!(conn.state.as_str()));
        if conn.worker_id != 0 {
            entry.insert("workername".to_string(), json!(conn.workername));
            entry.insert("worker_id".to_string(), json!(conn.worker_id));
        }
        let mut methods: Vec<_> = conn.methods.keys().cloned().collect();
        methods.sort();
        entry.insert("methods".to_string(), json!(methods));
        clients.insert(conn.from.clone(), Value::Object(entry));
    }
    Value::Object(clients)
}

fn get_methods(state: &SwitchState) -> Value {
    let mut names: Vec<_> = state.policy.methods().keys().collect();
    names.sort();
    let mut methods = Map::new();
    for name in names {
        let entry = &state.policy.methods()[name];
        methods.insert(
            name.clone(),
            json!({"backend": entry.backend, "doc": entry.doc}),
        );
    }
    Value::Object(methods)
}

fn get_method_details(
    state: &SwitchState,
    params: Map<String, Value>,
) -> Result<Value, SwitchError> {
    #[derive(Deserialize)]
    struct Params {
        method: String,
    }

    let params: Params = serde_json::from_value(Value::Object(params))
        .map_err(|e| SwitchError::InvalidParams(e.to_string()))?;

    let entry = state
        .policy
        .method(&params.method)
        .ok_or_else(|| SwitchError::MethodNotFound(params.method.clone()))?;

    Ok(json!({
        "method": params.method,
        "backend": entry.backend,
        "doc": entry.doc,
        "filter": state.policy.filter_key(&entry.backend),
        "workers": workers_for(state, &entry.backend),
    }))
}

fn get_workers(state: &SwitchState) -> Value {
    let mut backends: Vec<String> = state
        .registry
        .snapshot()
        .into_iter()
        .map(|(backend, _, _)| backend)
        .collect();
    backends.sort();
    backends.dedup();

    let mut workers = Map::new();
    for backend in backends {
        workers.insert(backend.clone(), json!(workers_for(state, &backend)));
    }
    Value::Object(workers)
}

fn workers_for(state: &SwitchState, backend: &str) -> Vec<Value> {
    let mut rows = Vec::new();
    for (announced, filter_value, conn_id) in state.registry.snapshot() {
        if announced != backend {
            continue;
        }
        let Some(conn) = state.connections.get(&conn_id) else {
            continue;
        };
        let mut row = Map::new();
        row.insert("workername".to_string(), json!(conn.workername));
        row.insert("worker_id".to_string(), json!(conn.worker_id));
        if let Some(value) = filter_value {
            let parsed: Value = serde_json::from_str(&value).unwrap_or(Value::Null);
            row.insert("filter".to_string(), parsed);
        }
        rows.push(Value::Object(row));
    }
    rows.sort_by_key(|row| row["worker_id"].as_u64());
    rows
}

fn get_stats(state: &SwitchState) -> Value {
    let mut counters = Map::new();
    let mut names: Vec<_> = state
        .call_counters
        .iter()
        .filter(|(_, &count)| count > 0)
        .map(|(name, _)| name.clone())
        .collect();
    names.sort();
    for name in names {
        counters.insert(name.clone(), json!(state.call_counters[&name]));
    }

    json!({
        "chunks": state.chunks,
        "clients": state.connections.len(),
        "connections": state.total_connections,
        "workers": state.worker_count(),
        "methods": counters,
    })
}
