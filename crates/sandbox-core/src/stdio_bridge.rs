//! Serialized JSON-RPC over a container's attached stdin/stdout. One call
//! in flight at a time; concurrent callers queue on the bridge's mutex.
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{CoreError, CoreResult};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
const READ_BUFFER_HINT_BYTES: usize = 64 * 1024;

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: i64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[allow(dead_code)]
    jsonrpc: String,
    id: i64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// A pluggable transport so the bridge logic can be tested without a real
/// container attachment. The container provider supplies the real
/// implementation over its attached stdin/stdout streams.
#[async_trait::async_trait]
pub trait StdioTransport: Send + Sync {
    async fn write_line(&self, line: &str) -> std::io::Result<()>;
    async fn read_line(&self) -> std::io::Result<Option<String>>;
}

pub struct ChildProcessTransport {
    stdin: Mutex<tokio::process::ChildStdin>,
    stdout: Mutex<BufReader<tokio::process::ChildStdout>>,
}

impl ChildProcessTransport {
    pub fn new(stdin: tokio::process::ChildStdin, stdout: tokio::process::ChildStdout) -> Self {
        Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::with_capacity(READ_BUFFER_HINT_BYTES, stdout)),
        }
    }
}

#[async_trait::async_trait]
impl StdioTransport for ChildProcessTransport {
    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    async fn read_line(&self) -> std::io::Result<Option<String>> {
        let mut stdout = self.stdout.lock().await;
        let mut line = String::new();
        let n = stdout.read_line(&mut line).await?;
        if n == 0 {
            Ok(None)
        } else {
            Ok(Some(line))
        }
    }
}

pub struct StdioBridge {
    transport: Box<dyn StdioTransport>,
    next_id: AtomicI64,
    closed: AtomicBool,
    call_lock: Mutex<()>,
    call_timeout: Duration,
}

impl StdioBridge {
    pub fn new(transport: Box<dyn StdioTransport>) -> Self {
        Self {
            transport,
            next_id: AtomicI64::new(1),
            closed: AtomicBool::new(false),
            call_lock: Mutex::new(()),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Idempotent: calling Close more than once is a no-op.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub async fn call(&self, method: &str, params: Value) -> CoreResult<Value> {
        if self.is_closed() {
            return Err(CoreError::BridgeClosed);
        }

        let _permit = self.call_lock.lock().await;
        if self.is_closed() {
            return Err(CoreError::BridgeClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let line = serde_json::to_string(&request).map_err(|e| CoreError::Other(e.into()))?;

        self.transport
            .write_line(&line)
            .await
            .map_err(|e| CoreError::Other(e.into()))?;

        let read_result = tokio::time::timeout(self.call_timeout, self.transport.read_line()).await;

        let raw = match read_result {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => return Err(CoreError::PeerDisconnected),
            Ok(Err(e)) => return Err(CoreError::Other(e.into())),
            Err(_) => return Err(CoreError::CallTimedOut),
        };

        let response: JsonRpcResponse =
            serde_json::from_str(raw.trim_end()).map_err(|e| CoreError::Other(e.into()))?;

        if response.id != id {
            // Logged but not fatal: the response is still returned to
            // preserve liveness, as a mismatch here usually means a
            // previous call's response arrived late, not that the channel
            // is unusable.
            warn!(expected = id, got = response.id, "stdio bridge response id mismatch");
        }

        if let Some(error) = response.error {
            return Err(CoreError::Other(anyhow::anyhow!(
                "mcp call failed: code={} message={}",
                error.code,
                error.message
            )));
        }

        Ok(response.result.unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::collections::VecDeque;

    struct ScriptedTransport {
        responses: StdMutex<VecDeque<Option<String>>>,
        sent: StdMutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl StdioTransport for ScriptedTransport {
        async fn write_line(&self, line: &str) -> std::io::Result<()> {
            self.sent.lock().unwrap().push(line.to_string());
            Ok(())
        }

        async fn read_line(&self) -> std::io::Result<Option<String>> {
            Ok(self.responses.lock().unwrap().pop_front().flatten())
        }
    }

    #[tokio::test]
    async fn round_trips_a_call() {
        let transport = ScriptedTransport {
            responses: StdMutex::new(VecDeque::from([Some(
                "{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\n".to_string(),
            )])),
            sent: StdMutex::new(Vec::new()),
        };
        let bridge = StdioBridge::new(Box::new(transport));
        let result = bridge.call("tools/list", Value::Null).await.unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn eof_becomes_peer_disconnected() {
        let transport = ScriptedTransport {
            responses: StdMutex::new(VecDeque::from([None])),
            sent: StdMutex::new(Vec::new()),
        };
        let bridge = StdioBridge::new(Box::new(transport));
        let err = bridge.call("tools/list", Value::Null).await.unwrap_err();
        assert!(matches!(err, CoreError::PeerDisconnected));
        assert!(!bridge.is_closed(), "eof must not auto-close the bridge");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_subsequent_calls() {
        let transport = ScriptedTransport {
            responses: StdMutex::new(VecDeque::new()),
            sent: StdMutex::new(Vec::new()),
        };
        let bridge = StdioBridge::new(Box::new(transport));
        bridge.close();
        bridge.close();
        let err = bridge.call("tools/list", Value::Null).await.unwrap_err();
        assert!(matches!(err, CoreError::BridgeClosed));
    }

    #[tokio::test]
    async fn mismatched_response_id_is_still_returned() {
        let transport = ScriptedTransport {
            responses: StdMutex::new(VecDeque::from([Some(
                "{\"jsonrpc\":\"2.0\",\"id\":999,\"result\":\"late\"}\n".to_string(),
            )])),
            sent: StdMutex::new(Vec::new()),
        };
        let bridge = StdioBridge::new(Box::new(transport));
        let result = bridge.call("ping", Value::Null).await.unwrap();
        assert_eq!(result, Value::String("late".to_string()));
    }
}
