//! Socket Tunnel (C8).
//!
//! Exposes the guest's Podman API (container mode only) on a host Unix
//! socket. Every accepted client connection opens a second stream to the
//! virtual network's control socket, sends a tunnel-setup frame naming the
//! guest `ip:port` to reach, then the two streams are spliced until either
//! side closes (§4.8).

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use vmforge_types::{Error, Result};

/// Accept on `sock` until `cancel` fires, forwarding each connection to
/// `target_ip:target_port` through `control_sock`. The socket file is
/// removed on entry (ignoring a missing file) and again on exit.
pub async fn serve(
    sock: &Path,
    control_sock: PathBuf,
    target_ip: Ipv4Addr,
    target_port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    remove_stale(sock).await?;

    let listener = UnixListener::bind(sock).map_err(|e| Error::io(sock, e))?;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (client, _) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "socket tunnel accept failed");
                        continue;
                    }
                };
                let control_sock = control_sock.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(client, &control_sock, target_ip, target_port).await {
                        tracing::debug!(error = %e, "socket tunnel connection ended with error");
                    }
                });
            }
        }
    }

    let _ = tokio::fs::remove_file(sock).await;
    Err(Error::Cancelled)
}

async fn handle_connection(
    mut client: UnixStream,
    control_sock: &Path,
    target_ip: Ipv4Addr,
    target_port: u16,
) -> Result<()> {
    let mut upstream = UnixStream::connect(control_sock).await.map_err(|e| Error::io(control_sock, e))?;

    let frame = serde_json::json!({ "target_ip": target_ip.to_string(), "target_port": target_port }).to_string();
    use tokio::io::AsyncWriteExt;
    upstream
        .write_all(frame.as_bytes())
        .await
        .map_err(|e| Error::io(control_sock, e))?;
    upstream.write_all(b"\n").await.map_err(|e| Error::io(control_sock, e))?;

    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok(_) => Ok(()),
        Err(e) if is_closed_connection(&e) => Ok(()),
        Err(e) => Err(Error::Internal(format!("socket tunnel splice failed: {e}"))),
    }
}

fn is_closed_connection(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::NotConnected
    )
}

async fn remove_stale(sock: &Path) -> Result<()> {
    match tokio::fs::remove_file(sock).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(PathBuf::from(sock), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_connection_errors_are_recognized() {
        let broken = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        assert!(is_closed_connection(&broken));
        let other = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(!is_closed_connection(&other));
    }
}
