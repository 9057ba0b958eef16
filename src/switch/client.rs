//! Client for connecting to a running switch.
//!
//! Holds a persistent connection, since the switch ties authentication to
//! the socket: `hello` first, then call away.

use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use super::protocol::{Request, Response, RpcError};

/// Client for speaking JSON-RPC to the switch.
pub struct SwitchClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

/// Error returned by client operations.
#[derive(Debug)]
pub enum ClientError {
    /// Failed to connect to the switch
    Connect(std::io::Error),
    /// Failed to send/receive data
    Io(std::io::Error),
    /// Failed to serialize request
    Serialize(serde_json::Error),
    /// Failed to parse response
    Parse(serde_json::Error),
    /// Switch returned an error
    Rpc(RpcError),
    /// Connection closed before the response arrived
    Disconnected,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Connect(e) => write!(f, "Failed to connect to switch: {}", e),
            ClientError::Io(e) => write!(f, "Communication error: {}", e),
            ClientError::Serialize(e) => write!(f, "Failed to serialize request: {}", e),
            ClientError::Parse(e) => write!(f, "Failed to parse response: {}", e),
            ClientError::Rpc(e) => write!(f, "RPC error {}: {}", e.code, e.message),
            ClientError::Disconnected => write!(f, "Switch closed the connection"),
        }
    }
}

impl std::error::Error for ClientError {}

impl SwitchClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(ClientError::Connect)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            next_id: 0,
        })
    }

    /// Authenticate this connection.
    pub async fn hello(
        &mut self,
        auth_method: &str,
        who: &str,
        token: &str,
    ) -> Result<Value, ClientError> {
        self.call(
            "rpcswitch.hello",
            Some(json!({"method": auth_method, "who": who, "token": token})),
        )
        .await
    }

    /// Call a method and return the result.
    pub async fn call<T: DeserializeOwned>(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        self.next_id += 1;
        let id = Value::Number(self.next_id.into());
        let request = Request {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: Some(id.clone()),
        };

        let mut frame = serde_json::to_string(&request).map_err(ClientError::Serialize)?;
        frame.push('\n');
        self.writer
            .write_all(frame.as_bytes())
            .await
            .map_err(ClientError::Io)?;

        loop {
            let mut line = String::new();
            let bytes_read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(ClientError::Io)?;
            if bytes_read == 0 {
                return Err(ClientError::Disconnected);
            }

            // Skip frames that aren't our response, e.g. notifications.
            let response: Response = match serde_json::from_str(line.trim()) {
                Ok(response) => response,
                Err(_) => continue,
            };
            if response.id != id {
                continue;
            }

            if let Some(error) = response.error {
                return Err(ClientError::Rpc(error));
            }
            let result = response.result.unwrap_or(Value::Null);
            return serde_json::from_value(result).map_err(ClientError::Parse);
        }
    }
}
