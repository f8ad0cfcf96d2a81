//! Length-framed JSON-RPC 2.0 over a local unix stream socket.
//!
//! Frame format: 4-byte big-endian payload length, then the JSON payload.
//! A connection carries any number of request/response frames in sequence.

pub mod auth;
pub mod handlers;
pub mod proto;

use std::path::Path;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use crate::state::AppState;

/// Cap on a single frame; anything larger is a protocol violation.
const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Bind the socket (replacing any stale file) and serve until shutdown.
pub fn spawn(state: AppState, socket_path: &Path) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    tracing::info!(path = %socket_path.display(), "RPC server listening");

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let conn_state = state.clone();
                            tokio::spawn(async move {
                                handle_connection(conn_state, stream).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to accept RPC connection");
                        }
                    }
                }
                () = state.shutdown.cancelled() => {
                    tracing::info!("RPC server stopped");
                    return;
                }
            }
        }
    }))
}

async fn handle_connection(state: AppState, stream: UnixStream) {
    let (mut reader, mut writer) = stream.into_split();
    loop {
        let payload = tokio::select! {
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(payload)) => payload,
                Ok(None) => return,          // clean EOF
                Err(_) => return,            // framing violation or I/O error
            },
            () = state.shutdown.cancelled() => return,
        };

        let response = handle_payload(&state, &payload).await;
        let Ok(bytes) = serde_json::to_vec(&response) else {
            return;
        };
        if write_frame(&mut writer, &bytes).await.is_err() {
            return;
        }
    }
}

async fn read_frame(
    reader: &mut (impl AsyncReadExt + Unpin),
) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::other("frame exceeds maximum size"));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

async fn write_frame(
    writer: &mut (impl AsyncWriteExt + Unpin),
    payload: &[u8],
) -> std::io::Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

async fn handle_payload(state: &AppState, payload: &[u8]) -> proto::Response {
    let request: proto::Request = match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(e) => {
            return proto::Response::err(
                Value::Null,
                proto::RpcError::protocol(proto::PARSE_ERROR, format!("bad JSON: {e}")),
            )
        }
    };
    if request.method.is_empty() {
        return proto::Response::err(
            request.id,
            proto::RpcError::protocol(proto::INVALID_REQUEST, "missing method"),
        );
    }

    match handlers::dispatch(state, &request.method, &request.params).await {
        Ok(result) => proto::Response::ok(request.id, result),
        Err(err) => {
            let rpc_err = match err {
                hb_domain::Error::NotFound(ref what) if what.starts_with("method ") => {
                    proto::RpcError::protocol(proto::METHOD_NOT_FOUND, err.to_string())
                }
                ref err => proto::to_rpc_error(err),
            };
            proto::Response::err(request.id, rpc_err)
        }
    }
}
