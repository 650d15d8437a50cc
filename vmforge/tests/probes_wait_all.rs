//! C9 Readiness Probes against a real Unix-socket HTTP server, rather than
//! the fake `Probe` impls `probes.rs`'s own unit tests use — exercises the
//! `uds_http` client path `GuestConfigProbe` actually drives.

use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use vmforge::probes::{self, GuestConfigProbe, Probe};

fn scratch_dir() -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("vmforge-probes-test-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

async fn spawn_healthz_server(sock: std::path::PathBuf, delay: Duration) {
    tokio::time::sleep(delay).await;
    let app = Router::new().route("/healthz", get(|| async { "{}" }));
    let listener = UnixListener::bind(&sock).unwrap();
    axum::serve(listener, app).await.unwrap();
}

#[tokio::test]
async fn guest_config_probe_succeeds_once_the_server_is_listening() {
    let dir = scratch_dir();
    let sock = dir.join("guest-config.sock");

    tokio::spawn(spawn_healthz_server(sock.clone(), Duration::from_millis(100)));

    let cancel = CancellationToken::new();
    let probe = GuestConfigProbe { sock };
    let probes: Vec<&dyn Probe> = vec![&probe];

    probes::wait_all(&probes, Duration::from_secs(5), &cancel).await.unwrap();
}

#[tokio::test]
async fn guest_config_probe_times_out_when_nothing_is_listening() {
    let dir = scratch_dir();
    let sock = dir.join("never-bound.sock");

    let cancel = CancellationToken::new();
    let probe = GuestConfigProbe { sock };
    let probes: Vec<&dyn Probe> = vec![&probe];

    let result = probes::wait_all(&probes, Duration::from_millis(150), &cancel).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn wait_all_is_cancelled_immediately_when_the_token_is_already_cancelled() {
    let dir = scratch_dir();
    let sock = dir.join("never-bound-2.sock");

    let cancel = CancellationToken::new();
    cancel.cancel();

    let probe = GuestConfigProbe { sock };
    let probes: Vec<&dyn Probe> = vec![&probe];

    let result = probes::wait_all(&probes, Duration::from_secs(5), &cancel).await;
    assert!(matches!(result, Err(vmforge::Error::Cancelled)));
}
