//! End-to-end tests driving a real switch over TCP.
//!
//! Each test boots a switch on an ephemeral port and speaks raw
//! newline-delimited JSON-RPC to it, the way production peers do.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rpcswitch::auth;
use rpcswitch::config::{AppConfig, AuthMethodConfig};
use rpcswitch::policy::Policy;
use rpcswitch::switch::Switch;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const METHODS: &str = r#"
[acl]
workers = ["alice"]
trusted = ["bob"]

[method2acl]
"foo.*" = "public"
"bar.*" = "public"
"locked.*" = "trusted"

[backend2acl]
"foo.*" = "workers"
"bar.*" = "workers"
"locked.*" = "workers"

[backendfilter]
"bar.filtered" = "region"

[methods]
"foo.bar" = { backend = "foo.bar", doc = "echo test method" }
"foo.add" = "foo."
"bar.filtered" = { backend = "bar.filtered" }
"locked.secret" = { backend = "locked.secret" }
"#;

fn test_config(methods_path: std::path::PathBuf) -> AppConfig {
    let mut auth_methods = HashMap::new();
    auth_methods.insert(
        "password".to_string(),
        AuthMethodConfig {
            tokens: HashMap::from([
                ("alice".to_string(), "wrkr-token".to_string()),
                ("bob".to_string(), "clnt-token".to_string()),
            ]),
        },
    );
    AppConfig {
        listen: vec!["127.0.0.1:0".parse().expect("addr")],
        methods: methods_path,
        ping_interval_secs: 60,
        pong_timeout_secs: 10,
        max_frame_bytes: 1024 * 1024,
        verbose: false,
        json_log: false,
        pid_file: None,
        auth: auth_methods,
    }
}

async fn start_switch_with(
    methods_toml: &str,
    adjust: impl FnOnce(&mut AppConfig),
) -> (SocketAddr, Arc<Switch>, tempfile::NamedTempFile) {
    let methods_file = tempfile::NamedTempFile::new().expect("temp file");
    std::fs::write(methods_file.path(), methods_toml).expect("write methods file");

    let mut cfg = test_config(methods_file.path().to_path_buf());
    adjust(&mut cfg);

    let policy = Policy::load(&cfg.methods).expect("policy loads");
    let verifier = auth::create_verifier(&cfg);
    let switch = Switch::new(cfg, policy, verifier);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(Arc::clone(&switch).serve(vec![listener]));

    (addr, switch, methods_file)
}

async fn start_switch(methods_toml: &str) -> (SocketAddr, Arc<Switch>, tempfile::NamedTempFile) {
    start_switch_with(methods_toml, |_| {}).await
}

struct Peer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Peer {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, value: Value) {
        let mut frame = value.to_string();
        frame.push('\n');
        self.writer.write_all(frame.as_bytes()).await.expect("send");
    }

    async fn recv(&mut self) -> Value {
        let mut line = String::new();
        let bytes_read = timeout(Duration::from_secs(2), self.reader.read_line(&mut line))
            .await
            .expect("timeout waiting for frame")
            .expect("read");
        assert!(bytes_read > 0, "connection closed unexpectedly");
        serde_json::from_str(line.trim()).expect("valid json frame")
    }

    /// Read a frame, or None when nothing arrives in time.
    async fn recv_opt(&mut self, ms: u64) -> Option<Value> {
        let mut line = String::new();
        match timeout(Duration::from_millis(ms), self.reader.read_line(&mut line)).await {
            Ok(Ok(n)) if n > 0 => Some(serde_json::from_str(line.trim()).expect("valid json")),
            _ => None,
        }
    }

    /// Wait for the switch to close this connection.
    async fn expect_eof(&mut self, secs: u64) {
        let mut line = String::new();
        loop {
            let bytes_read = timeout(Duration::from_secs(secs), self.reader.read_line(&mut line))
                .await
                .expect("timeout waiting for close")
                .expect("read");
            if bytes_read == 0 {
                return;
            }
            line.clear();
        }
    }

    async fn hello(&mut self, who: &str, token: &str) {
        self.send(json!({
            "jsonrpc": "2.0",
            "id": "hello",
            "method": "rpcswitch.hello",
            "params": {"method": "password", "who": who, "token": token},
        }))
        .await;
        let resp = self.recv().await;
        assert_eq!(resp["result"][0], json!(true), "hello failed: {resp}");
    }

    async fn announce(&mut self, method: &str, filter: Option<Value>) -> Value {
        let mut params = json!({"method": method});
        if let Some(filter) = filter {
            params["filter"] = filter;
        }
        self.send(json!({
            "jsonrpc": "2.0",
            "id": "announce",
            "method": "rpcswitch.announce",
            "params": params,
        }))
        .await;
        self.recv().await
    }
}

fn error_code(frame: &Value) -> i64 {
    frame["error"]["code"].as_i64().expect("error code")
}

#[tokio::test]
async fn call_reaches_worker_and_response_returns() {
    let (addr, _switch, _methods) = start_switch(METHODS).await;

    let mut worker = Peer::connect(addr).await;
    worker.hello("alice", "wrkr-token").await;
    let announced = worker.announce("foo.bar", None).await;
    assert_eq!(announced["result"]["msg"], json!("success"));
    assert!(announced["result"]["worker_id"].as_u64().expect("worker id") > 0);

    let mut client = Peer::connect(addr).await;
    client.hello("bob", "clnt-token").await;
    client
        .send(json!({"jsonrpc": "2.0", "id": 1, "method": "foo.bar", "params": {"x": 1}}))
        .await;

    let forwarded = worker.recv().await;
    assert_eq!(forwarded["method"], json!("foo.bar"));
    assert_eq!(forwarded["params"], json!({"x": 1}));
    assert_eq!(forwarded["id"], json!(1));
    assert_eq!(forwarded["rpcswitch"]["vcookie"], json!("eatme"));
    assert_eq!(forwarded["rpcswitch"]["who"], json!("bob"));
    let vci = forwarded["rpcswitch"]["vci"].as_str().expect("vci").to_string();
    assert!(!vci.is_empty());

    worker
        .send(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"ok": true},
            "rpcswitch": {"vcookie": "eatme", "vci": vci},
        }))
        .await;

    let reply = client.recv().await;
    assert_eq!(reply["id"], json!(1));
    assert_eq!(reply["result"], json!({"ok": true}));

    client
        .send(json!({"jsonrpc": "2.0", "id": 2, "method": "rpcswitch.get_stats"}))
        .await;
    let stats = client.recv().await;
    assert_eq!(stats["result"]["methods"]["foo.bar"], json!(1));
    assert!(stats["result"]["chunks"].as_u64().expect("chunks") > 0);
}

#[tokio::test]
async fn acl_denial_never_reaches_worker() {
    let (addr, _switch, _methods) = start_switch(METHODS).await;

    let mut worker = Peer::connect(addr).await;
    worker.hello("alice", "wrkr-token").await;
    worker.announce("locked.secret", None).await;

    // alice is not in 'trusted', which guards locked.*
    let mut client = Peer::connect(addr).await;
    client.hello("alice", "wrkr-token").await;
    client
        .send(json!({"jsonrpc": "2.0", "id": 1, "method": "locked.secret"}))
        .await;

    let reply = client.recv().await;
    assert_eq!(error_code(&reply), -32009);
    assert!(worker.recv_opt(200).await.is_none(), "worker saw traffic");
}

#[tokio::test]
async fn call_without_worker_fails() {
    let (addr, _switch, _methods) = start_switch(METHODS).await;

    let mut client = Peer::connect(addr).await;
    client.hello("bob", "clnt-token").await;
    client
        .send(json!({"jsonrpc": "2.0", "id": 1, "method": "foo.bar"}))
        .await;

    let reply = client.recv().await;
    assert_eq!(error_code(&reply), -32003);
}

#[tokio::test]
async fn filtered_dispatch_routes_by_value() {
    let (addr, _switch, _methods) = start_switch(METHODS).await;

    let mut worker_eu = Peer::connect(addr).await;
    worker_eu.hello("alice", "wrkr-token").await;
    let announced = worker_eu
        .announce("bar.filtered", Some(json!({"region": "eu"})))
        .await;
    assert_eq!(announced["result"]["msg"], json!("success"));

    let mut worker_us = Peer::connect(addr).await;
    worker_us.hello("alice", "wrkr-token").await;
    worker_us
        .announce("bar.filtered", Some(json!({"region": "us"})))
        .await;

    let mut client = Peer::connect(addr).await;
    client.hello("bob", "clnt-token").await;

    client
        .send(json!({
            "jsonrpc": "2.0", "id": 1, "method": "bar.filtered",
            "params": {"region": "us", "x": 1},
        }))
        .await;
    let forwarded = worker_us.recv().await;
    assert_eq!(forwarded["params"]["region"], json!("us"));
    assert!(worker_eu.recv_opt(200).await.is_none(), "eu worker saw us call");

    // missing filter param
    client
        .send(json!({"jsonrpc": "2.0", "id": 2, "method": "bar.filtered", "params": {}}))
        .await;
    assert_eq!(error_code(&client.recv().await), -32010);

    // no bucket for this value
    client
        .send(json!({
            "jsonrpc": "2.0", "id": 3, "method": "bar.filtered",
            "params": {"region": "apac"},
        }))
        .await;
    assert_eq!(error_code(&client.recv().await), -32003);
}

#[tokio::test]
async fn announce_filter_must_match_configuration() {
    let (addr, _switch, _methods) = start_switch(METHODS).await;

    let mut worker = Peer::connect(addr).await;
    worker.hello("alice", "wrkr-token").await;

    // filtered backend without a filter
    let resp = worker.announce("bar.filtered", None).await;
    assert_eq!(error_code(&resp), -32001);

    // wrong filter key
    let resp = worker
        .announce("bar.filtered", Some(json!({"zone": "eu"})))
        .await;
    assert_eq!(error_code(&resp), -32001);

    // filter on an unfiltered backend
    let resp = worker.announce("foo.bar", Some(json!({"region": "eu"}))).await;
    assert_eq!(error_code(&resp), -32001);

    // duplicate announce
    let resp = worker.announce("foo.add", None).await;
    assert_eq!(resp["result"]["msg"], json!("success"));
    let resp = worker.announce("foo.add", None).await;
    assert_eq!(error_code(&resp), -32001);
}

#[tokio::test]
async fn sequential_calls_distribute_round_robin() {
    let (addr, _switch, _methods) = start_switch(METHODS).await;

    let mut workers = Vec::new();
    for _ in 0..3 {
        let mut worker = Peer::connect(addr).await;
        worker.hello("alice", "wrkr-token").await;
        worker.announce("foo.bar", None).await;
        workers.push(worker);
    }

    let mut client = Peer::connect(addr).await;
    client.hello("bob", "clnt-token").await;
    for id in 1..=3 {
        client
            .send(json!({"jsonrpc": "2.0", "id": id, "method": "foo.bar"}))
            .await;
    }

    // every worker gets exactly one of the three calls
    let mut seen = Vec::new();
    for worker in &mut workers {
        let forwarded = worker.recv().await;
        seen.push(forwarded["id"].as_i64().expect("id"));
        assert!(worker.recv_opt(200).await.is_none(), "worker got two calls");
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2, 3]);
}

#[tokio::test]
async fn busy_worker_is_skipped() {
    let (addr, _switch, _methods) = start_switch(METHODS).await;

    let mut worker_a = Peer::connect(addr).await;
    worker_a.hello("alice", "wrkr-token").await;
    worker_a.announce("foo.bar", None).await;

    let mut worker_b = Peer::connect(addr).await;
    worker_b.hello("alice", "wrkr-token").await;
    worker_b.announce("foo.bar", None).await;

    let mut client = Peer::connect(addr).await;
    client.hello("bob", "clnt-token").await;

    // first call lands on one of the two; it never answers
    client
        .send(json!({"jsonrpc": "2.0", "id": 1, "method": "foo.bar"}))
        .await;
    let (busy, idle) = if worker_a.recv_opt(1000).await.is_some() {
        (&mut worker_a, &mut worker_b)
    } else {
        assert!(worker_b.recv_opt(1000).await.is_some(), "call went nowhere");
        (&mut worker_b, &mut worker_a)
    };

    // the next two calls prefer the idle worker over rotation order
    client
        .send(json!({"jsonrpc": "2.0", "id": 2, "method": "foo.bar"}))
        .await;
    let forwarded = idle.recv().await;
    assert_eq!(forwarded["id"], json!(2));

    assert!(busy.recv_opt(200).await.is_none(), "busy worker got the call");
}

#[tokio::test]
async fn worker_disconnect_fails_outstanding_calls() {
    let (addr, _switch, _methods) = start_switch(METHODS).await;

    let mut worker = Peer::connect(addr).await;
    worker.hello("alice", "wrkr-token").await;
    worker.announce("foo.bar", None).await;

    let mut client = Peer::connect(addr).await;
    client.hello("bob", "clnt-token").await;
    client
        .send(json!({"jsonrpc": "2.0", "id": 7, "method": "foo.bar"}))
        .await;

    let forwarded = worker.recv().await;
    let vci = forwarded["rpcswitch"]["vci"].as_str().expect("vci").to_string();

    drop(worker);

    let first = client.recv().await;
    let second = client.recv().await;
    let (gone, notification) = if first.get("error").is_some() {
        (first, second)
    } else {
        (second, first)
    };

    assert_eq!(gone["id"], json!(7));
    assert_eq!(error_code(&gone), -32006);
    assert_eq!(
        gone["error"]["message"],
        json!("opposite end of channel gone")
    );

    assert_eq!(notification["method"], json!("rpcswitch.channel_gone"));
    assert_eq!(notification["params"]["channel"], json!(vci));

    // nothing further arrives for that channel
    assert!(client.recv_opt(200).await.is_none());
}

#[tokio::test]
async fn worker_can_call_back_over_the_channel() {
    let (addr, _switch, _methods) = start_switch(METHODS).await;

    let mut worker = Peer::connect(addr).await;
    worker.hello("alice", "wrkr-token").await;
    worker.announce("foo.bar", None).await;

    let mut client = Peer::connect(addr).await;
    client.hello("bob", "clnt-token").await;
    client
        .send(json!({"jsonrpc": "2.0", "id": 1, "method": "foo.bar"}))
        .await;
    let forwarded = worker.recv().await;
    let vci = forwarded["rpcswitch"]["vci"].as_str().expect("vci").to_string();

    // nested request from worker to client on the same channel
    worker
        .send(json!({
            "jsonrpc": "2.0",
            "id": "progress-1",
            "method": "foo.bar_progress",
            "params": {"done": 50},
            "rpcswitch": {"vcookie": "eatme", "vci": vci},
        }))
        .await;
    let nested = client.recv().await;
    assert_eq!(nested["method"], json!("foo.bar_progress"));
    assert_eq!(nested["params"], json!({"done": 50}));

    client
        .send(json!({
            "jsonrpc": "2.0",
            "id": "progress-1",
            "result": true,
            "rpcswitch": {"vcookie": "eatme", "vci": vci},
        }))
        .await;
    let nested_reply = worker.recv().await;
    assert_eq!(nested_reply["result"], json!(true));

    // the original call still completes
    worker
        .send(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": "done",
            "rpcswitch": {"vcookie": "eatme", "vci": vci},
        }))
        .await;
    assert_eq!(client.recv().await["result"], json!("done"));
}

#[tokio::test]
async fn unknown_channel_and_bad_envelope_are_rejected() {
    let (addr, _switch, _methods) = start_switch(METHODS).await;

    let mut peer = Peer::connect(addr).await;
    peer.hello("bob", "clnt-token").await;

    peer.send(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "anything",
        "rpcswitch": {"vcookie": "eatme", "vci": "no-such-vci"},
    }))
    .await;
    assert_eq!(error_code(&peer.recv().await), -32005);

    peer.send(json!({
        "jsonrpc": "2.0",
        "id": 2,
        "method": "anything",
        "rpcswitch": {"vcookie": "wrong", "vci": "x"},
    }))
    .await;
    assert_eq!(error_code(&peer.recv().await), -32004);
}

#[tokio::test]
async fn methods_require_authentication() {
    let (addr, _switch, _methods) = start_switch(METHODS).await;

    let mut peer = Peer::connect(addr).await;

    peer.send(json!({
        "jsonrpc": "2.0", "id": 1, "method": "rpcswitch.announce",
        "params": {"method": "foo.bar"},
    }))
    .await;
    assert_eq!(error_code(&peer.recv().await), -32002);

    peer.send(json!({"jsonrpc": "2.0", "id": 2, "method": "foo.bar"}))
        .await;
    assert_eq!(error_code(&peer.recv().await), -32002);
}

#[tokio::test]
async fn failed_hello_closes_the_connection() {
    let (addr, _switch, _methods) = start_switch(METHODS).await;

    let mut peer = Peer::connect(addr).await;
    peer.send(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "rpcswitch.hello",
        "params": {"method": "password", "who": "mallory", "token": "guess"},
    }))
    .await;

    let reply = peer.recv().await;
    assert_eq!(error_code(&reply), -32009);
    peer.expect_eof(2).await;
}

#[tokio::test]
async fn unknown_method_and_missing_id_are_rejected() {
    let (addr, _switch, _methods) = start_switch(METHODS).await;

    let mut peer = Peer::connect(addr).await;
    peer.hello("bob", "clnt-token").await;

    peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "nope.nothing"}))
        .await;
    assert_eq!(error_code(&peer.recv().await), -32601);

    // internal methods are not notifications
    peer.send(json!({"jsonrpc": "2.0", "method": "rpcswitch.get_stats"}))
        .await;
    let reply = peer.recv().await;
    assert_eq!(error_code(&reply), -32000);
    assert_eq!(reply["id"], Value::Null);

    peer.send(json!({"jsonrpc": "2.0", "id": 2, "method": "rpcswitch.ping"}))
        .await;
    assert_eq!(peer.recv().await["result"], json!("pong?"));
}

#[tokio::test]
async fn withdraw_removes_the_worker() {
    let (addr, _switch, _methods) = start_switch(METHODS).await;

    let mut worker = Peer::connect(addr).await;
    worker.hello("alice", "wrkr-token").await;
    worker.announce("foo.bar", None).await;

    worker
        .send(json!({
            "jsonrpc": "2.0", "id": "w", "method": "rpcswitch.withdraw",
            "params": {"method": "foo.bar"},
        }))
        .await;
    assert_eq!(worker.recv().await["result"], json!(true));

    let mut client = Peer::connect(addr).await;
    client.hello("bob", "clnt-token").await;
    client
        .send(json!({"jsonrpc": "2.0", "id": 1, "method": "foo.bar"}))
        .await;
    assert_eq!(error_code(&client.recv().await), -32003);
}

#[tokio::test]
async fn introspection_reports_workers_and_methods() {
    let (addr, _switch, _methods) = start_switch(METHODS).await;

    let mut worker = Peer::connect(addr).await;
    worker.hello("alice", "wrkr-token").await;
    worker.announce("foo.bar", None).await;

    let mut client = Peer::connect(addr).await;
    client.hello("bob", "clnt-token").await;

    client
        .send(json!({"jsonrpc": "2.0", "id": 1, "method": "rpcswitch.get_methods"}))
        .await;
    let methods = client.recv().await;
    assert_eq!(methods["result"]["foo.bar"]["backend"], json!("foo.bar"));
    assert_eq!(methods["result"]["foo.add"]["backend"], json!("foo.add"));

    client
        .send(json!({
            "jsonrpc": "2.0", "id": 2, "method": "rpcswitch.get_method_details",
            "params": {"method": "foo.bar"},
        }))
        .await;
    let details = client.recv().await;
    assert_eq!(details["result"]["backend"], json!("foo.bar"));
    assert_eq!(details["result"]["doc"], json!("echo test method"));
    assert_eq!(details["result"]["workers"][0]["workername"], json!("alice"));

    client
        .send(json!({"jsonrpc": "2.0", "id": 3, "method": "rpcswitch.get_workers"}))
        .await;
    let workers = client.recv().await;
    assert_eq!(
        workers["result"]["foo.bar"][0]["worker_id"],
        json!(1)
    );

    client
        .send(json!({"jsonrpc": "2.0", "id": 4, "method": "rpcswitch.get_clients"}))
        .await;
    let clients = client.recv().await;
    let table = clients["result"].as_object().expect("client table");
    assert_eq!(table.len(), 2);
    assert!(table.values().any(|c| c["who"] == json!("alice")));
    assert!(table.values().any(|c| c["who"] == json!("bob")));
}

#[tokio::test]
async fn reload_applies_to_subsequent_calls() {
    let (addr, switch, methods_file) = start_switch(METHODS).await;

    let mut client = Peer::connect(addr).await;
    client.hello("bob", "clnt-token").await;

    client
        .send(json!({"jsonrpc": "2.0", "id": 1, "method": "foo.new"}))
        .await;
    assert_eq!(error_code(&client.recv().await), -32601);

    let extended = format!(
        "{METHODS}\n\"foo.new\" = {{ backend = \"foo.new\" }}\n"
    );
    std::fs::write(methods_file.path(), extended).expect("rewrite methods");
    switch.reload_policy().await.expect("reload");

    // known method now, but nobody serves it yet
    client
        .send(json!({"jsonrpc": "2.0", "id": 2, "method": "foo.new"}))
        .await;
    assert_eq!(error_code(&client.recv().await), -32003);
}

#[tokio::test]
async fn failed_reload_keeps_previous_policy() {
    let (addr, switch, methods_file) = start_switch(METHODS).await;

    std::fs::write(methods_file.path(), "[methods]\n\"broken\" = \"x\"\n")
        .expect("rewrite methods");
    assert!(switch.reload_policy().await.is_err());

    let mut client = Peer::connect(addr).await;
    client.hello("bob", "clnt-token").await;
    client
        .send(json!({"jsonrpc": "2.0", "id": 1, "method": "foo.bar"}))
        .await;
    // still resolved by the old policy: known method, no worker
    assert_eq!(error_code(&client.recv().await), -32003);
}

#[tokio::test]
async fn unresponsive_worker_is_disconnected() {
    let (addr, _switch, _methods) = start_switch_with(METHODS, |cfg| {
        cfg.ping_interval_secs = 1;
        cfg.pong_timeout_secs = 1;
    })
    .await;

    let mut worker = Peer::connect(addr).await;
    worker.hello("alice", "wrkr-token").await;
    worker.announce("foo.bar", None).await;

    // a ping arrives and goes unanswered; the switch hangs up
    let ping = worker.recv_opt(3000).await.expect("ping from switch");
    assert_eq!(ping["method"], json!("rpcswitch.ping"));
    worker.expect_eof(5).await;
}

#[tokio::test]
async fn answered_pings_keep_the_worker_alive() {
    let (addr, _switch, _methods) = start_switch_with(METHODS, |cfg| {
        cfg.ping_interval_secs = 1;
        cfg.pong_timeout_secs = 1;
    })
    .await;

    let mut worker = Peer::connect(addr).await;
    worker.hello("alice", "wrkr-token").await;
    worker.announce("foo.bar", None).await;

    for _ in 0..3 {
        let ping = worker.recv_opt(3000).await.expect("ping from switch");
        assert_eq!(ping["method"], json!("rpcswitch.ping"));
        worker
            .send(json!({"jsonrpc": "2.0", "id": ping["id"], "result": "pong!"}))
            .await;
    }
}

#[tokio::test]
async fn oversized_frames_drop_the_connection() {
    let (addr, _switch, _methods) = start_switch_with(METHODS, |cfg| {
        cfg.max_frame_bytes = 256;
    })
    .await;

    let mut peer = Peer::connect(addr).await;
    let huge = json!({
        "jsonrpc": "2.0", "id": 1, "method": "rpcswitch.hello",
        "params": {"method": "password", "who": "bob", "token": "x".repeat(512)},
    });
    peer.send(huge).await;

    let reply = peer.recv().await;
    assert_eq!(error_code(&reply), -32010);
    peer.expect_eof(2).await;
}
