//! Capability server connection management (spawn, communicate, lifecycle).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{
    CallCapabilityParams, CallCapabilityResult, CancelledParams, CapabilityInfo,
    InitializeParams, InitializeResult, JsonRpcRequest, JsonRpcResponse, ListCapabilitiesResult,
    PROTOCOL_VERSION, RequestId, ServerInfo, methods,
};

/// Default timeout for handshake and listing, and for calls when the server
/// config does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum size of one response line (1MB).
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Bound on best-effort notifications and on reaping a killed process.
const HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for a remote capability server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-call timeout in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            timeout_ms: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn call_timeout(&self) -> Duration {
        self.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT)
    }
}

/// Lifecycle of one server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Ready,
    Closed,
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Both halves of the byte stream. Held under one lock for a whole
/// request/response exchange.
struct Transport {
    reader: BufReader<BoxedReader>,
    writer: BoxedWriter,
    /// Bytes of a line not yet terminated. Survives a cancelled read.
    pending: Vec<u8>,
    /// Set while a write is in progress; still set if that write was dropped
    /// half-way, after which the stream can no longer be trusted.
    writing: bool,
}

impl Transport {
    async fn send(&mut self, line: &str) -> Result<()> {
        if self.writing {
            return Err(Error::Closed);
        }
        self.writing = true;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        self.writing = false;
        Ok(())
    }

    /// Read one line, never holding more than `MAX_OUTPUT_SIZE + 1` bytes of
    /// it.
    async fn read_line(&mut self) -> Result<String> {
        let limit = (MAX_OUTPUT_SIZE + 1).saturating_sub(self.pending.len());
        let bytes_read = (&mut self.reader)
            .take(limit as u64)
            .read_until(b'\n', &mut self.pending)
            .await?;

        if self.pending.len() > MAX_OUTPUT_SIZE {
            let size = self.pending.len();
            self.pending = Vec::new();
            return Err(Error::OutputTooLarge {
                size,
                max: MAX_OUTPUT_SIZE,
            });
        }
        if bytes_read == 0 {
            return Err(Error::ServerExited);
        }

        let line = std::mem::take(&mut self.pending);

        String::from_utf8(line)
            .map_err(|e| Error::InvalidResponse(format!("response is not UTF-8: {e}")))
    }

    /// Read until the response for `expected` arrives.
    ///
    /// Responses to earlier, abandoned requests and messages initiated by the
    /// server are discarded.
    async fn receive(&mut self, server: &str, expected: i64) -> Result<JsonRpcResponse> {
        loop {
            let line = self.read_line().await?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let value: Value = serde_json::from_str(trimmed)?;
            if value.get("method").is_some() {
                debug!(server, "ignoring server-initiated message");
                continue;
            }

            let response: JsonRpcResponse = serde_json::from_value(value)?;
            match &response.id {
                Some(RequestId::Number(id)) if *id == expected => return Ok(response),
                Some(RequestId::Number(id)) if *id < expected => {
                    warn!(server, id, expected, "discarding response to abandoned request");
                }
                other => {
                    return Err(Error::InvalidResponse(format!(
                        "response ID mismatch: expected {expected}, got {other:?}"
                    )));
                }
            }
        }
    }
}

/// Handle to one remote capability server.
///
/// Requests are single-flight: one exchange holds the transport from writing
/// the request until its response is read, so responses always pair with the
/// request that caused them.
pub struct Client {
    name: String,
    transport: Mutex<Transport>,
    process: Mutex<Option<Child>>,
    state: Mutex<ConnectionState>,
    server_info: Mutex<Option<ServerInfo>>,
    next_id: AtomicI64,
    call_timeout: Duration,
}

impl Client {
    /// Spawn a server process and attach to its stdio.
    pub async fn spawn(config: ServerConfig) -> Result<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let spawn_error = |source| Error::Spawn {
            command: config.command.clone(),
            source,
        };

        let mut process = cmd.spawn().map_err(spawn_error)?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| spawn_error(std::io::Error::other("failed to capture stdin")))?;

        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| spawn_error(std::io::Error::other("failed to capture stdout")))?;

        info!(server = %config.name, command = %config.command, "spawned capability server");

        let mut client = Self::connect(config.name.clone(), stdout, stdin)
            .with_call_timeout(config.call_timeout());
        client.process = Mutex::new(Some(process));
        Ok(client)
    }

    /// Attach to a server over already-open streams.
    pub fn connect<R, W>(name: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            name: name.into(),
            transport: Mutex::new(Transport {
                reader: BufReader::new(Box::new(reader) as BoxedReader),
                writer: Box::new(writer),
                pending: Vec::new(),
                writing: false,
            }),
            process: Mutex::new(None),
            state: Mutex::new(ConnectionState::Uninitialized),
            server_info: Mutex::new(None),
            next_id: AtomicI64::new(1),
            call_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Get the server name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    /// Get server info (after initialization).
    pub async fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.lock().await.clone()
    }

    /// Perform the handshake. Must be called exactly once, before anything else.
    pub async fn initialize(&self) -> Result<ServerInfo> {
        let mut state = self.state.lock().await;
        match *state {
            ConnectionState::Uninitialized => {}
            ConnectionState::Ready => return Err(Error::AlreadyInitialized),
            ConnectionState::Closed => return Err(Error::Closed),
        }

        let params = InitializeParams::default();
        let result: InitializeResult = match self
            .request(methods::INITIALIZE, Some(params), DEFAULT_TIMEOUT, None)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                if breaks_connection(&e) {
                    *state = ConnectionState::Closed;
                }
                return Err(e);
            }
        };

        if result.protocol_version != PROTOCOL_VERSION {
            warn!(
                server = %self.name,
                theirs = %result.protocol_version,
                ours = PROTOCOL_VERSION,
                "protocol version mismatch"
            );
        }

        *self.server_info.lock().await = Some(result.server_info.clone());
        *state = ConnectionState::Ready;
        info!(server = %self.name, remote = %result.server_info.name, "handshake complete");
        Ok(result.server_info)
    }

    /// Query the server's capability catalog.
    pub async fn list_capabilities(&self) -> Result<Vec<CapabilityInfo>> {
        self.ensure_ready().await?;
        let result: ListCapabilitiesResult = self
            .tracked(self.request(methods::LIST_CAPABILITIES, None::<()>, DEFAULT_TIMEOUT, None))
            .await?;
        debug!(server = %self.name, count = result.capabilities.len(), "listed capabilities");
        Ok(result.capabilities)
    }

    /// Call a capability by its server-local name.
    ///
    /// Bounded by the call timeout; returns early with [`Error::Cancelled`]
    /// when `cancel` fires. Either way the server is told the request was
    /// abandoned.
    pub async fn call_capability(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<CallCapabilityResult> {
        self.ensure_ready().await?;

        let params = CallCapabilityParams {
            name: name.to_string(),
            arguments,
        };

        let result: CallCapabilityResult = self
            .tracked(self.request(
                methods::CALL_CAPABILITY,
                Some(params),
                self.call_timeout,
                Some(cancel),
            ))
            .await?;

        if result.is_error {
            return Err(Error::CapabilityFailed(result.joined_text()));
        }

        Ok(result)
    }

    /// Check if the server process is still running.
    ///
    /// Attached connections have no process and report `false`.
    pub async fn is_running(&self) -> bool {
        match self.process.lock().await.as_mut() {
            Some(process) => matches!(process.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Terminate the connection and its process.
    ///
    /// Idempotent; a process that already exited is not an error.
    pub async fn close(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.lock().await, ConnectionState::Closed);

        // An in-flight exchange owns the transport; the kill below ends it.
        if let Ok(mut transport) = self.transport.try_lock() {
            let shutdown = serde_json::to_string(&JsonRpcRequest::notification(methods::SHUTDOWN))?;
            let _ = timeout(HOUSEKEEPING_TIMEOUT, transport.send(&shutdown)).await;
            let _ = transport.writer.shutdown().await;
        }

        let child = self.process.lock().await.take();
        if let Some(mut child) = child {
            if let Ok(Some(status)) = child.try_wait() {
                debug!(server = %self.name, %status, "server process already exited");
            } else {
                if let Err(e) = child.start_kill() {
                    debug!(server = %self.name, error = %e, "kill failed, process likely gone");
                }
                match timeout(HOUSEKEEPING_TIMEOUT, child.wait()).await {
                    Ok(Ok(status)) => debug!(server = %self.name, %status, "server process reaped"),
                    Ok(Err(e)) => return Err(Error::Io(e)),
                    Err(_) => warn!(server = %self.name, "server process did not exit in time"),
                }
            }
        }

        if previous != ConnectionState::Closed {
            info!(server = %self.name, "connection closed");
        }
        Ok(())
    }

    // --- Internal methods ---

    async fn ensure_ready(&self) -> Result<()> {
        match *self.state.lock().await {
            ConnectionState::Ready => Ok(()),
            ConnectionState::Uninitialized => Err(Error::NotInitialized),
            ConnectionState::Closed => Err(Error::Closed),
        }
    }

    /// Mark the connection closed when an exchange shows it is unusable.
    async fn tracked<T>(&self, exchange: impl Future<Output = Result<T>>) -> Result<T> {
        let result = exchange.await;
        if let Err(e) = &result {
            if breaks_connection(e) {
                warn!(server = %self.name, error = %e, "connection lost");
                *self.state.lock().await = ConnectionState::Closed;
            }
        }
        result
    }

    async fn request<P, R>(
        &self,
        method: &str,
        params: Option<P>,
        limit: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<R>
    where
        P: serde::Serialize,
        R: DeserializeOwned,
    {
        let deadline = Instant::now() + limit;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut request = JsonRpcRequest::new(id, method);
        if let Some(p) = params {
            request = request.with_params(p);
        }
        let request_json = serde_json::to_string(&request)?;

        let mut transport = tokio::select! {
            guard = timeout_at(deadline, self.transport.lock()) => guard.map_err(|_| Error::Timeout)?,
            _ = cancelled(cancel) => return Err(Error::Cancelled),
        };

        debug!(server = %self.name, method, id, "sending request");

        let outcome = tokio::select! {
            response = timeout_at(deadline, async {
                transport.send(&request_json).await?;
                transport.receive(&self.name, id).await
            }) => response.unwrap_or(Err(Error::Timeout)),
            _ = cancelled(cancel) => Err(Error::Cancelled),
        };

        let response = match outcome {
            Ok(response) => response,
            Err(e @ (Error::Timeout | Error::Cancelled)) => {
                let notice = JsonRpcRequest::notification(methods::CANCELLED).with_params(
                    CancelledParams {
                        request_id: RequestId::Number(id),
                    },
                );
                if let Ok(line) = serde_json::to_string(&notice) {
                    let _ = timeout(HOUSEKEEPING_TIMEOUT, transport.send(&line)).await;
                }
                debug!(server = %self.name, method, id, error = %e, "request abandoned");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let result_value = response.into_result()?;
        let result: R = serde_json::from_value(result_value)?;

        Ok(result)
    }
}

/// Errors after which the byte stream can no longer be used.
fn breaks_connection(error: &Error) -> bool {
    matches!(
        error,
        Error::ServerExited | Error::Io(_) | Error::Closed | Error::OutputTooLarge { .. }
    )
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
