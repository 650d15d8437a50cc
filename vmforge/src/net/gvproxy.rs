//! Virtual Network — gvproxy wrapper (C5).
//!
//! The gvisor-tap-vsock userspace network stack is an external collaborator
//! (§1): this module only spawns the `gvproxy` binary with the flags that
//! materialize the network facts in §4.5, waits for its control socket to
//! appear, and owns its subprocess/socket-file lifecycle. The HTTP control
//! API (`/services/forwarder/*`), the gateway's `:80` listener, and the
//! vfkit/qemu datagram handshake are gvproxy's own internals — this crate
//! never reimplements them, only talks to the control API as a client
//! (see `probes::gvproxy_ready` and `tunnel`).

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};
use vmforge_types::{Error, NetworkFacts, Result};

use super::TapFraming;

/// Looked up via `VMFORGE_GVPROXY_PATH` first, falling back to `$PATH`
/// (SPEC_FULL.md, supplemented feature 4).
pub fn find_binary() -> PathBuf {
    if let Ok(path) = std::env::var("VMFORGE_GVPROXY_PATH") {
        return PathBuf::from(path);
    }
    PathBuf::from("gvproxy")
}

/// A running gvproxy subprocess plus the socket paths it was told to bind.
pub struct GvproxyProcess {
    child: Child,
    control_sock: PathBuf,
    net_sock: PathBuf,
}

pub struct GvproxySpawnArgs<'a> {
    pub control_sock: PathBuf,
    pub net_sock: PathBuf,
    pub facts: &'a NetworkFacts,
    pub ssh_host_port: u16,
    pub dns_search: Vec<String>,
}

impl GvproxyProcess {
    pub fn control_sock(&self) -> &Path {
        &self.control_sock
    }

    pub fn net_sock(&self) -> &Path {
        &self.net_sock
    }

    /// `unix://` URL for the control socket, for `VmConfig::gvisor_sockets`.
    pub fn control_url(&self) -> String {
        format!("unix://{}", self.control_sock.display())
    }

    /// `unixgram://` URL for the datagram/tap socket.
    pub fn net_url(&self) -> String {
        format!("unixgram://{}", self.net_sock.display())
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Terminate the subprocess and remove the socket files it owned.
    pub async fn stop(mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
        for sock in [&self.control_sock, &self.net_sock] {
            if let Err(e) = tokio::fs::remove_file(sock).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %sock.display(), error = %e, "failed to unlink gvproxy socket");
                }
            }
        }
    }
}

/// Spawn gvproxy configured for the fixed `192.168.127.0/24` subnet (§4.5).
pub async fn spawn(args: GvproxySpawnArgs<'_>) -> Result<GvproxyProcess> {
    for sock in [&args.control_sock, &args.net_sock] {
        match tokio::fs::remove_file(sock).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(sock, e)),
        }
    }

    let tap_flag = match TapFraming::for_host() {
        TapFraming::Vfkit => "-listen-vfkit",
        TapFraming::Qemu => "-listen-qemu",
    };

    let mut cmd = Command::new(find_binary());
    cmd.arg("-listen")
        .arg(format!("unix://{}", args.control_sock.display()))
        .arg(tap_flag)
        .arg(format!("unixgram://{}", args.net_sock.display()))
        .arg("-mtu")
        .arg(args.facts.mtu.to_string())
        .arg("-gateway-ip")
        .arg(args.facts.gateway.to_string())
        .arg("-host-ip")
        .arg(args.facts.host_alias.to_string())
        .arg("-guest-mac")
        .arg(format_mac(&args.facts.guest_mac))
        .arg("-guest-ip")
        .arg(args.facts.guest_ip.to_string())
        .arg("-forward-port")
        .arg(format!("{}:{}:{}", args.ssh_host_port, args.facts.guest_ip, 22));

    for domain in &args.dns_search {
        cmd.arg("-dns-search").arg(domain);
    }

    cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::piped());

    let child = cmd.spawn().map_err(|e| Error::external_tool("gvproxy", None, e.to_string()))?;

    Ok(GvproxyProcess { child, control_sock: args.control_sock, net_sock: args.net_sock })
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
}

/// Pick `2222` if it's free on loopback, else an ephemeral port (§4.5).
pub fn pick_ssh_host_port() -> Result<u16> {
    const PREFERRED: u16 = 2222;
    if TcpListener::bind(("127.0.0.1", PREFERRED)).is_ok() {
        return Ok(PREFERRED);
    }
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .map_err(|e| Error::io(PathBuf::from("127.0.0.1:0"), e))?;
    Ok(listener.local_addr().map_err(|e| Error::io(PathBuf::from("127.0.0.1:0"), e))?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_formats_lowercase_colon_separated() {
        assert_eq!(format_mac(&[0x5a, 0x94, 0xef, 0xe4, 0x0c, 0xee]), "5a:94:ef:e4:0c:ee");
    }

    #[test]
    fn ssh_host_port_picks_something_bindable() {
        // We can't assert it's always 2222 (CI may have it taken), only
        // that the function returns a port nothing else is obviously using
        // at the instant of the call.
        let port = pick_ssh_host_port().unwrap();
        assert!(port > 0);
    }
}
