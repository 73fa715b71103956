//! Server side of the protocol, for writing capability servers in Rust.
//!
//! Requests are handled one at a time in arrival order.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::error::Result;
use crate::protocol::{
    CallCapabilityParams, CallCapabilityResult, CapabilityInfo, InitializeResult, JsonRpcError,
    JsonRpcRequest, JsonRpcResponse, ListCapabilitiesResult, PROTOCOL_VERSION, RequestId,
    ServerInfo, methods,
};

/// What a capability server exposes.
#[async_trait]
pub trait Handler: Send + Sync {
    fn server_info(&self) -> ServerInfo;

    fn capabilities(&self) -> Vec<CapabilityInfo>;

    /// Run one capability. Failures are reported in-band with `is_error`.
    async fn call(&self, name: &str, arguments: Value) -> CallCapabilityResult;
}

/// Serve requests from `reader` until EOF or a `shutdown` notification.
pub async fn serve<R, W, H>(reader: R, writer: W, handler: &H) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    H: Handler + ?Sized,
{
    let mut lines = BufReader::new(reader).lines();
    let mut writer = writer;

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: JsonRpcRequest = match serde_json::from_str(trimmed) {
            Ok(request) => request,
            Err(e) => {
                let error = JsonRpcError::new(JsonRpcError::PARSE_ERROR, format!("Parse error: {e}"));
                write_response(&mut writer, &JsonRpcResponse::failure(None, error)).await?;
                continue;
            }
        };

        let Some(id) = request.id.clone() else {
            match request.method.as_str() {
                methods::SHUTDOWN => {
                    debug!("shutdown requested");
                    break;
                }
                methods::CANCELLED => debug!(params = ?request.params, "client abandoned a request"),
                other => debug!(method = other, "ignoring notification"),
            }
            continue;
        };

        let response = dispatch(handler, id, request).await;
        write_response(&mut writer, &response).await?;
    }

    Ok(())
}

async fn dispatch<H>(handler: &H, id: RequestId, request: JsonRpcRequest) -> JsonRpcResponse
where
    H: Handler + ?Sized,
{
    let id = Some(id);
    match request.method.as_str() {
        methods::INITIALIZE => success(
            id,
            InitializeResult {
                protocol_version: PROTOCOL_VERSION.to_string(),
                server_info: handler.server_info(),
            },
        ),

        methods::LIST_CAPABILITIES => success(
            id,
            ListCapabilitiesResult {
                capabilities: handler.capabilities(),
            },
        ),

        methods::CALL_CAPABILITY => {
            let params = request.params.unwrap_or(Value::Null);
            match serde_json::from_value::<CallCapabilityParams>(params) {
                Ok(params) => success(id, handler.call(&params.name, params.arguments).await),
                Err(e) => JsonRpcResponse::failure(
                    id,
                    JsonRpcError::new(JsonRpcError::INVALID_PARAMS, format!("invalid params: {e}")),
                ),
            }
        }

        method => {
            warn!(method, "unknown method");
            JsonRpcResponse::failure(
                id,
                JsonRpcError::new(
                    JsonRpcError::METHOD_NOT_FOUND,
                    format!("Method not found: {method}"),
                ),
            )
        }
    }
}

fn success(id: Option<RequestId>, result: impl Serialize) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::failure(
            id,
            JsonRpcError::new(-32603, format!("failed to encode result: {e}")),
        ),
    }
}

async fn write_response<W>(writer: &mut W, response: &JsonRpcResponse) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
