//! Minimal HTTP/1.1 client over a Unix stream socket.
//!
//! Every host-side control plane in this system (gvproxy's forwarder API,
//! the Guest-Config Server, the Podman API forwarded through the Socket
//! Tunnel) is HTTP-over-Unix-socket. This is the one client used by the
//! readiness probes (C9) to reach all three without pulling in a
//! full-blown Unix-socket transport crate — a one-shot `hyper::client::conn`
//! handshake per call is enough for the fixed-path GETs probes make.

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::path::Path;
use tokio::net::UnixStream;
use vmforge_types::Error;

/// `GET path` against the Unix socket at `sock`. Returns the response
/// status and body.
pub async fn get(sock: &Path, path: &str) -> vmforge_types::Result<(StatusCode, Bytes)> {
    let stream = UnixStream::connect(sock).await.map_err(|e| Error::ExternalTool {
        tool: "uds-connect",
        code: None,
        detail: format!("{}: {e}", sock.display()),
    })?;
    let io = TokioIo::new(stream);

    let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| Error::Internal(format!("http handshake failed on {}: {e}", sock.display())))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(error = %e, "uds http connection closed");
        }
    });

    let request = Request::builder()
        .method("GET")
        .uri(path)
        .header("Host", "localhost")
        .body(Empty::<Bytes>::new())
        .map_err(|e| Error::Internal(format!("failed to build request: {e}")))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| Error::Internal(format!("request to {} failed: {e}", sock.display())))?;

    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| Error::Internal(format!("failed to read response body: {e}")))?
        .to_bytes();

    Ok((status, body))
}

/// Convenience for probes that only care whether the status was 200.
pub async fn get_ok(sock: &Path, path: &str) -> bool {
    matches!(get(sock, path).await, Ok((StatusCode::OK, _)))
}
