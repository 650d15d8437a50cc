//! Readiness Probes (C9).
//!
//! Each probe is polled on a fixed interval until it succeeds or the scope
//! is cancelled; a probe's `Err` return means "not ready yet", not failure
//! — the only hard failures this module produces are cancellation and
//! `wait_all`'s overall timeout (§4.9).

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vmforge_types::{Error, PodmanInfo, Result};

use crate::net::{ssh::SshSession, uds_http};

/// Default overall deadline for `wait_all` (§4.9).
pub const DEFAULT_WAIT_ALL_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Probe: Send + Sync {
    fn name(&self) -> &'static str;

    /// Poll interval for this probe kind.
    fn interval(&self) -> Duration {
        Duration::from_millis(50)
    }

    /// `Ok(())` means ready; `Err` means "try again after `interval()`".
    async fn probe_once(&self) -> Result<()>;
}

/// Polls `probe` until it succeeds or `cancel` fires.
pub async fn poll_until_ready(probe: &dyn Probe, cancel: &CancellationToken) -> Result<()> {
    loop {
        if probe.probe_once().await.is_ok() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(probe.interval()) => {}
        }
    }
}

/// Runs every probe concurrently under one overall deadline; the first
/// probe to fail (timeout or cancellation) aborts the rest.
pub async fn wait_all(probes: &[&dyn Probe], timeout: Duration, cancel: &CancellationToken) -> Result<()> {
    let group_cancel = cancel.child_token();
    let guard = group_cancel.clone().drop_guard();

    let polls = probes.iter().map(|p| poll_until_ready(*p, &group_cancel));
    let joined = futures::future::try_join_all(polls);

    let result = match tokio::time::timeout(timeout, joined).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::unavailable("readiness-probe-group", timeout.as_millis() as u64)),
    };

    drop(guard);
    result
}

pub struct GvproxyProbe {
    pub control_sock: PathBuf,
}

#[async_trait]
impl Probe for GvproxyProbe {
    fn name(&self) -> &'static str {
        "gvproxy"
    }

    async fn probe_once(&self) -> Result<()> {
        if uds_http::get_ok(&self.control_sock, "/services/forwarder/all").await {
            Ok(())
        } else {
            Err(Error::unavailable("gvproxy", 0))
        }
    }
}

pub struct GuestConfigProbe {
    pub sock: PathBuf,
}

#[async_trait]
impl Probe for GuestConfigProbe {
    fn name(&self) -> &'static str {
        "guest-config"
    }

    async fn probe_once(&self) -> Result<()> {
        if uds_http::get_ok(&self.sock, "/healthz").await {
            Ok(())
        } else {
            Err(Error::unavailable("guest-config", 0))
        }
    }
}

pub struct GuestSshProbe {
    pub host_port: u16,
    pub user: String,
    pub private_key_path: PathBuf,
}

#[async_trait]
impl Probe for GuestSshProbe {
    fn name(&self) -> &'static str {
        "guest-ssh"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    async fn probe_once(&self) -> Result<()> {
        let mut session = SshSession::connect(self.host_port, &self.user, &self.private_key_path).await?;
        let result = session.probe_true().await;
        session.disconnect().await;
        result
    }
}

pub struct PodmanProbe {
    pub host_socket_path: PathBuf,
}

impl PodmanProbe {
    pub fn from_info(info: &PodmanInfo) -> Self {
        Self { host_socket_path: info.host_socket_path.clone() }
    }
}

#[async_trait]
impl Probe for PodmanProbe {
    fn name(&self) -> &'static str {
        "podman"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    async fn probe_once(&self) -> Result<()> {
        if uds_http::get_ok(&self.host_socket_path, "/libpod/_ping").await {
            Ok(())
        } else {
            Err(Error::unavailable("podman", 0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysReady;

    #[async_trait]
    impl Probe for AlwaysReady {
        fn name(&self) -> &'static str {
            "always-ready"
        }
        async fn probe_once(&self) -> Result<()> {
            Ok(())
        }
    }

    struct NeverReady;

    #[async_trait]
    impl Probe for NeverReady {
        fn name(&self) -> &'static str {
            "never-ready"
        }
        fn interval(&self) -> Duration {
            Duration::from_millis(5)
        }
        async fn probe_once(&self) -> Result<()> {
            Err(Error::unavailable("never-ready", 0))
        }
    }

    #[tokio::test]
    async fn wait_all_succeeds_when_every_probe_is_ready() {
        let cancel = CancellationToken::new();
        let probe = AlwaysReady;
        let probes: Vec<&dyn Probe> = vec![&probe];
        wait_all(&probes, Duration::from_millis(200), &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn wait_all_times_out_when_a_probe_never_becomes_ready() {
        let cancel = CancellationToken::new();
        let probe = NeverReady;
        let probes: Vec<&dyn Probe> = vec![&probe];
        let result = wait_all(&probes, Duration::from_millis(50), &cancel).await;
        assert!(matches!(result, Err(Error::ServiceUnavailable { .. })));
    }
}
