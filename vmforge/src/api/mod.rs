//! Management API Server (C10): `/healthz`, `/vmconfig`, `/stop`, `/exec`
//! on a single host Unix socket (§4.10).
//!
//! `/stop` doesn't tear anything down itself — it fires the supervisor's
//! stop token and returns 200. Teardown is the Lifecycle Supervisor's job
//! once the cancellation propagates.

pub mod exec;
pub mod guest_config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use vmforge_types::{Error, Result, VmConfig};

use exec::{exec, ExecState};

#[derive(Clone)]
struct AppState {
    config: Arc<VmConfig>,
    stop: CancellationToken,
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({})))
}

async fn vmconfig(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.config.as_ref().clone()))
}

async fn stop(State(state): State<AppState>) -> impl IntoResponse {
    state.stop.cancel();
    (StatusCode::OK, Json(serde_json::json!({})))
}

/// Bind `sock` and serve `/healthz`, `/vmconfig`, `/stop`, `/exec` until
/// `cancel` fires (either externally, by the supervisor, or from within via
/// `GET /stop`). The socket file is removed on entry and on exit.
pub async fn serve(sock: &Path, config: Arc<VmConfig>, cancel: CancellationToken) -> Result<()> {
    remove_stale(sock).await?;

    let state = AppState { config: config.clone(), stop: cancel.clone() };
    let main_routes = Router::new()
        .route("/healthz", get(healthz))
        .route("/vmconfig", get(vmconfig))
        .route("/stop", get(stop))
        .with_state(state);

    let exec_routes = Router::new().route("/exec", post(exec)).with_state(ExecState { config });

    let app = main_routes.merge(exec_routes);

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
        Err(e) => Err(Error::Internal(format!("management api server error: {e}"))),
    }
}

async fn remove_stale(sock: &Path) -> Result<()> {
    match tokio::fs::remove_file(sock).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(PathBuf::from(sock), e)),
    }
}
