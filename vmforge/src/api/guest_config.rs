//! Guest-Config Server (C6).
//!
//! A minimal HTTP server on a host Unix socket that the hypervisor binds to
//! the guest's VSock port 62234 (§4.6). Two routes only: `/healthz` and
//! `/vmconfig`; everything else (including a method mismatch on either
//! route) is a 404/405 — there is no reason for this surface to grow, the
//! in-guest agent reads its configuration once at boot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::UnixListener;
use vmforge_types::{Error, Result, VmConfig};

#[derive(Clone)]
struct AppState {
    config: Arc<VmConfig>,
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({})))
}

async fn vmconfig(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.config.as_ref().clone()))
}

/// Bind `sock` and serve until `cancel` fires. The socket file is removed
/// on entry (stale file from a previous crash) and on exit.
pub async fn serve(
    sock: &Path,
    config: Arc<VmConfig>,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<()> {
    remove_stale(sock).await?;

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/vmconfig", get(vmconfig))
        .with_state(AppState { config });

    let listener = UnixListener::bind(sock).map_err(|e| Error::io(sock, e))?;

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await;

    let _ = tokio::fs::remove_file(sock).await;

    match result {
        Ok(()) => {
            if cancel.is_cancelled() {
                Err(Error::Cancelled)
            } else {
                Ok(())
            }
        }
        Err(e) => Err(Error::Internal(format!("guest-config server error: {e}"))),
    }
}

async fn remove_stale(sock: &Path) -> Result<()> {
    match tokio::fs::remove_file(sock).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(PathBuf::from(sock), e)),
    }
}
