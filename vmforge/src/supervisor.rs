//! Lifecycle Supervisor (C11).
//!
//! The single cancellable scope that owns every long-lived task for one VM
//! run: network (C5), guest-config server (C6), management API (C10),
//! socket tunnel (C8), and the hypervisor itself (C7) — gated on the
//! readiness probes (C9) per the ordering guarantees in §5.

use std::fs::File;
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::fcntl::{flock, FlockArg};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use vmforge_types::{Error, NetworkMode, Result, VmConfig};

use crate::hypervisor::{HypervisorContext, NewContext};
use crate::net::gvproxy::GvproxyProcess;
use crate::probes::{self, GuestConfigProbe, GvproxyProbe};
use crate::workspace::Workspace;
use crate::{api, identity, tunnel};

/// Holds the advisory `flock` on `<rootfs>/.lock` for the process lifetime
/// (§5 "Locks"); dropping it releases the lock.
///
/// Acquired by `main.rs` right after `ensure_dirs()`, before gvproxy is
/// spawned or the Config Builder touches the rootfs disk/SSH identity —
/// two concurrent runs against the same rootfs must fail here, not race
/// each other through `mkfs`/`fsck`/keygen first (§3 invariant iv, §5
/// "acquired at startup").
pub struct RootfsLock(File);

impl RootfsLock {
    pub fn acquire(rootfs: &Path) -> Result<Self> {
        std::fs::create_dir_all(rootfs).map_err(|e| Error::io(rootfs, e))?;
        let path = Workspace::rootfs_lock_path(rootfs);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::io(path.clone(), e))?;
        flock(file.as_fd(), FlockArg::LockExclusiveNonblock).map_err(|_| {
            Error::invalid_input(format!("another instance already holds the lock at {}", path.display()))
        })?;
        Ok(Self(file))
    }
}

impl Drop for RootfsLock {
    fn drop(&mut self) {
        let _ = flock(self.0.as_fd(), FlockArg::UnlockNonblock);
    }
}

/// Runs a fully-built `config` to completion: spawns every remaining
/// component, gates dependent tasks on readiness, and tears everything
/// down on the first error or a termination signal.
///
/// `gvproxy_process`, if any, must already be running — C5 is spawned
/// before the Config Builder runs, since the network strategy and its
/// socket URLs are themselves inputs to the config (§4.2 step 4).
///
/// `rootfs_lock` must already be held — acquired by the caller before
/// gvproxy/the Config Builder ran — and is kept alive for the duration of
/// this run by simply holding it in scope here.
pub async fn run(
    config: VmConfig,
    rest_api_override: Option<PathBuf>,
    gvproxy_process: Option<GvproxyProcess>,
    rootfs_lock: RootfsLock,
) -> Result<()> {
    let _rootfs_lock = rootfs_lock;
    let config = Arc::new(config);
    let workspace = Workspace::new(config.workspace.clone());
    let scope = CancellationToken::new();

    install_signal_handlers(scope.clone());
    spawn_orphan_watchdog(scope.clone());

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    // Reused as one-shot ready latches: `.cancel()` signals "ready" rather
    // than "abort". Being children of `scope`, they also resolve when the
    // whole run is cancelled before readiness — gated tasks below check
    // `scope.is_cancelled()` after waiting to tell the two apart.
    let gvproxy_ready = scope.child_token();
    let ign_ready = scope.child_token();

    if config.network_mode == NetworkMode::Gvisor {
        let control_sock = match &gvproxy_process {
            Some(process) => process.control_sock().to_path_buf(),
            None => return Err(Error::Internal("gvisor mode without a running gvproxy process".into())),
        };

        let probe_cancel = gvproxy_ready.clone();
        let probe = GvproxyProbe { control_sock };
        tasks.spawn(async move {
            let result = probes::poll_until_ready(&probe, &probe_cancel).await;
            if result.is_ok() {
                probe_cancel.cancel();
            }
            result
        });
    } else {
        gvproxy_ready.cancel();
    }

    {
        let sock = workspace.guest_config_sock();
        let cancel = scope.clone();
        let config = config.clone();
        tasks.spawn(async move { api::guest_config::serve(&sock, config, cancel).await });

        let probe_cancel = ign_ready.clone();
        let probe = GuestConfigProbe { sock: workspace.guest_config_sock() };
        tasks.spawn(async move {
            let result = probes::poll_until_ready(&probe, &probe_cancel).await;
            if result.is_ok() {
                probe_cancel.cancel();
            }
            result
        });
    }

    {
        let sock = rest_api_override.unwrap_or_else(|| workspace.vmctl_sock());
        let cancel = scope.clone();
        let config = config.clone();
        tasks.spawn(async move { api::serve(&sock, config, cancel).await });
    }

    if let Some(podman) = config.podman.clone() {
        let control_sock = workspace.gvproxy_control_sock();
        let cancel = scope.clone();
        let gvproxy_ready = gvproxy_ready.clone();
        tasks.spawn(async move {
            gvproxy_ready.cancelled().await;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            tunnel::serve(&podman.host_socket_path, control_sock, podman.guest_ip, podman.guest_port, cancel).await
        });
    }

    {
        let config = config.clone();
        let scope_for_vm = scope.clone();
        let gvproxy_ready = gvproxy_ready.clone();
        let ign_ready = ign_ready.clone();
        tasks.spawn(async move {
            gvproxy_ready.cancelled().await;
            ign_ready.cancelled().await;
            if scope_for_vm.is_cancelled() {
                return Err(Error::Cancelled);
            }
            run_vm(config, scope_for_vm).await
        });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let result = match joined {
            Ok(r) => r,
            Err(e) => Err(Error::Internal(format!("supervised task panicked: {e}"))),
        };
        if let Err(e) = result {
            if !e.is_cancellation() && first_error.is_none() {
                first_error = Some(e);
            }
            scope.cancel();
        }
    }

    if let Some(process) = gvproxy_process {
        process.stop().await;
    }

    identity::unlink_private_key(&config.ssh.private_key_path).await;

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn run_vm(config: Arc<VmConfig>, cancel: CancellationToken) -> Result<()> {
    let ctx: Arc<HypervisorContext> = Arc::new(NewContext::new().create(&config)?);
    let result = ctx.clone().start(&config, cancel.clone()).await;
    ctx.close();
    result
}

fn install_signal_handlers(scope: CancellationToken) {
    tokio::spawn(async move {
        let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
        scope.cancel();
    });
}

/// Cancels the scope once this process becomes a child of init (PID 1),
/// i.e. the original parent died without us noticing otherwise (§4.11.1).
fn spawn_orphan_watchdog(scope: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = scope.cancelled() => return,
                _ = ticker.tick() => {
                    if nix::unistd::getppid().as_raw() == 1 {
                        tracing::warn!("parent process became pid 1, treating as orphaned");
                        scope.cancel();
                        return;
                    }
                }
            }
        }
    });
}
