//! TCP transport layer for the switch.
//!
//! Accepts connections on one or more listeners with newline-delimited
//! JSON framing. Each connection gets its own read loop plus a writer task
//! that serializes everything the switch sends it: responses, forwarded
//! traffic, pings and notifications.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info};

use crate::logging::LogThrottle;

use super::dispatcher;
use super::{Outgoing, Switch};

pub(crate) async fn bind(addrs: &[SocketAddr]) -> Result<Vec<TcpListener>> {
    let mut listeners = Vec::with_capacity(addrs.len());
    for addr in addrs {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind listener on {addr}"))?;
        listeners.push(listener);
    }
    Ok(listeners)
}

/// Accept connections until the shutdown signal fires, then wake every
/// connection so teardown bookkeeping runs.
pub(crate) async fn serve(switch: Arc<Switch>, listeners: Vec<TcpListener>) -> Result<()> {
    let mut accept_tasks = Vec::with_capacity(listeners.len());
    for listener in listeners {
        let addr = listener
            .local_addr()
            .context("listener has no local address")?;
        info!(addr = %addr, "switch listening");
        let switch = Arc::clone(&switch);
        let mut shutdown = switch.subscribe_shutdown();
        accept_tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, peer_addr)) => {
                                debug!(peer = %peer_addr, "peer connected");
                                let switch = Arc::clone(&switch);
                                tokio::spawn(handle_connection(switch, stream, peer_addr));
                            }
                            Err(e) => {
                                error!(error = %e, "Failed to accept connection");
                            }
                        }
                    }
                    _ = shutdown.recv() => {
                        info!(addr = %addr, "listener shutting down");
                        break;
                    }
                }
            }
        }));
    }

    for task in accept_tasks {
        let _ = task.await;
    }

    let conn_ids: Vec<_> = {
        let state = switch.state().lock().await;
        state.connections.keys().copied().collect()
    };
    for conn_id in conn_ids {
        switch.force_close(conn_id).await;
    }

    Ok(())
}

/// Read loop for a single peer.
async fn handle_connection(switch: Arc<Switch>, stream: TcpStream, peer_addr: SocketAddr) {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let shutdown = Arc::new(Notify::new());
    let conn_id = switch
        .register_connection(peer_addr.to_string(), tx, Arc::clone(&shutdown))
        .await;
    let writer_task = tokio::spawn(write_loop(writer, rx));

    let max_frame = switch.config().max_frame_bytes as u64;
    let throttle = LogThrottle::new(Duration::from_millis(500));
    // the +1 lets an oversized frame be told apart from one of exactly the limit
    let mut reader = BufReader::new(reader).take(max_frame + 1);
    let mut line = String::new();

    loop {
        line.clear();
        reader.set_limit(max_frame + 1);
        tokio::select! {
            _ = shutdown.notified() => break,
            read_result = reader.read_line(&mut line) => match read_result {
                Ok(0) => break, // EOF - peer disconnected
                Ok(n) if n as u64 > max_frame => {
                    switch.frame_too_big(conn_id, n).await;
                    break;
                }
                Ok(_) => {
                    let frame = line.trim();
                    if frame.is_empty() {
                        continue;
                    }
                    if throttle.should_log() {
                        debug!(peer = %peer_addr, bytes = frame.len(), "frame received");
                    }
                    dispatcher::handle_frame(&switch, conn_id, frame).await;
                }
                Err(e) => {
                    debug!(peer = %peer_addr, error = %e, "read error");
                    break;
                }
            }
        }
    }

    switch.disconnect(conn_id).await;
    // disconnect dropped the connection's sender; the writer drains what
    // was queued and closes the socket
    let _ = writer_task.await;
    debug!(peer = %peer_addr, "peer disconnected");
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(message) = rx.recv().await {
        match message {
            Outgoing::Frame(mut frame) => {
                frame.push('\n');
                if writer.write_all(frame.as_bytes()).await.is_err() {
                    break;
                }
            }
            Outgoing::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}
