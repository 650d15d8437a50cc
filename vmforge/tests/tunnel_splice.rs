//! C8 Socket Tunnel: a client connected to the tunnel's host socket should
//! see exactly the bytes a fake "virtual network control socket" echoes
//! back, and the accept loop should stop cleanly on cancellation.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

fn scratch_dir() -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("vmforge-tunnel-test-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Accepts one connection on `control_sock`, reads the tunnel-setup frame
/// (discarded), then echoes everything it receives back verbatim.
async fn fake_control_socket(control_sock: std::path::PathBuf) {
    let listener = UnixListener::bind(&control_sock).unwrap();
    let (mut stream, _) = listener.accept().await.unwrap();

    // Drain the JSON tunnel-setup frame (one line).
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.unwrap();
        if byte[0] == b'\n' {
            break;
        }
    }

    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

#[tokio::test]
async fn client_bytes_are_echoed_through_the_tunnel() {
    let dir = scratch_dir();
    let client_sock = dir.join("podman-api.sock");
    let control_sock = dir.join("gvpctl.sock");

    tokio::spawn(fake_control_socket(control_sock.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let cancel = CancellationToken::new();
    let serve_cancel = cancel.clone();
    let serve_sock = client_sock.clone();
    let serve_control = control_sock.clone();
    let server = tokio::spawn(async move {
        vmforge::tunnel::serve(&serve_sock, serve_control, Ipv4Addr::new(192, 168, 127, 2), 25883, serve_cancel).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = UnixStream::connect(&client_sock).await.unwrap();
    client.write_all(b"ping").await.unwrap();

    let mut response = [0u8; 4];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(&response, b"ping");

    drop(client);
    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), server).await;

    assert!(!client_sock.exists(), "tunnel socket file should be removed on shutdown");
}
