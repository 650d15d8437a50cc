//! SSH client helper shared by the Guest SSH readiness probe (C9), `attach`,
//! and the Management API's `/exec` route (C10).
//!
//! Every run generates a fresh guest key pair (C3) with no stable host key
//! across runs, so host-key verification is pinned to "accept whatever the
//! guest presents this session" rather than a persisted `known_hosts` file
//! (SPEC_FULL.md supplemented feature 5) — the guest is ephemeral and only
//! reachable from this host's loopback/tunnel, so cross-run host-key
//! pinning buys nothing.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{Config, Handle, Handler, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use vmforge_types::{Error, Result};

struct AcceptAnyHostKey;

#[async_trait::async_trait]
impl Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// An authenticated SSH session against the guest.
pub struct SshSession {
    handle: Handle<AcceptAnyHostKey>,
}

impl SshSession {
    /// Connect over TCP to `127.0.0.1:host_port` (the gvproxy-forwarded
    /// guest SSH port in gvisor mode, or the guest's direct address in TSI
    /// mode) and authenticate with the generated private key.
    pub async fn connect(host_port: u16, user: &str, private_key_path: &std::path::Path) -> Result<Self> {
        let key_data = tokio::fs::read_to_string(private_key_path)
            .await
            .map_err(|e| Error::io(private_key_path, e))?;
        let key_pair: KeyPair = russh_keys::decode_secret_key(&key_data, None)
            .map_err(|e| Error::Internal(format!("failed to decode ssh private key: {e}")))?;

        let config = Arc::new(Config { inactivity_timeout: Some(Duration::from_secs(30)), ..Config::default() });

        let mut handle = russh::client::connect(config, ("127.0.0.1", host_port), AcceptAnyHostKey)
            .await
            .map_err(|e| Error::Internal(format!("ssh connect failed: {e}")))?;

        let authenticated = handle
            .authenticate_publickey(user, Arc::new(key_pair))
            .await
            .map_err(|e| Error::Internal(format!("ssh authentication failed: {e}")))?;

        if !authenticated {
            return Err(Error::Internal("ssh authentication rejected".to_string()));
        }

        Ok(Self { handle })
    }

    /// A cheap liveness check for the readiness probe: a full handshake
    /// plus `busybox true` returning 0 (§4.9 "Guest SSH").
    pub async fn probe_true(&mut self) -> Result<()> {
        let mut channel = self.open_exec("busybox true").await?;
        let status = drain_to_exit_status(&mut channel).await?;
        if status == 0 {
            Ok(())
        } else {
            Err(Error::Internal(format!("busybox true exited with status {status}")))
        }
    }

    pub async fn open_exec(&mut self, command: &str) -> Result<Channel<Msg>> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::Internal(format!("failed to open ssh channel: {e}")))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::Internal(format!("ssh exec failed: {e}")))?;
        Ok(channel)
    }

    /// Like `open_exec`, but requests a PTY first (`attach --pty`).
    pub async fn open_exec_pty(&mut self, command: &str) -> Result<Channel<Msg>> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::Internal(format!("failed to open ssh channel: {e}")))?;
        channel
            .request_pty(true, "xterm", 80, 24, 0, 0, &[])
            .await
            .map_err(|e| Error::Internal(format!("ssh pty request failed: {e}")))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::Internal(format!("ssh exec failed: {e}")))?;
        Ok(channel)
    }

    pub async fn disconnect(&mut self) {
        let _ = self.handle.disconnect(Disconnect::ByApplication, "", "en-US").await;
    }
}

async fn drain_to_exit_status(channel: &mut Channel<Msg>) -> Result<u32> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::ExitStatus { exit_status }) => return Ok(exit_status),
            Some(ChannelMsg::Close) | Some(ChannelMsg::Eof) | None => {
                return Err(Error::Internal("ssh channel closed before exit status".to_string()))
            }
            Some(_) => continue,
        }
    }
}
