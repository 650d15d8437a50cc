//! Key & Identity (C3).
//!
//! Generates the host-side Ed25519 SSH key pair the guest's SSH server
//! authorizes at first boot. Writes OpenSSH-format files with the modes the
//! `ssh` client insists on (0600 private, 0644 public).

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use vmforge_types::Error;

/// Generated key material, ready to populate `SshInfo`.
pub struct Identity {
    pub public_key_openssh: String,
}

/// Generate a fresh Ed25519 key pair and write it to `private_path`/`public_path`.
pub async fn generate(private_path: &Path, public_path: &Path) -> vmforge_types::Result<Identity> {
    let private_path = private_path.to_path_buf();
    let public_path = public_path.to_path_buf();

    tokio::task::spawn_blocking(move || generate_blocking(&private_path, &public_path))
        .await
        .map_err(|e| Error::Internal(format!("identity generation task panicked: {e}")))?
}

fn generate_blocking(private_path: &Path, public_path: &Path) -> vmforge_types::Result<Identity> {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| Error::Internal(format!("failed to generate ed25519 key: {e}")))?;

    let private_pem = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| Error::Internal(format!("failed to encode private key: {e}")))?;
    std::fs::write(private_path, private_pem.as_bytes())
        .map_err(|e| Error::io(private_path, e))?;
    std::fs::set_permissions(private_path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| Error::io(private_path, e))?;

    let public_openssh = key.public_key().to_openssh().map_err(|e| {
        Error::Internal(format!("failed to encode public key: {e}"))
    })?;
    std::fs::write(public_path, format!("{public_openssh}\n"))
        .map_err(|e| Error::io(public_path, e))?;
    std::fs::set_permissions(public_path, std::fs::Permissions::from_mode(0o644))
        .map_err(|e| Error::io(public_path, e))?;

    Ok(Identity { public_key_openssh: public_openssh })
}

/// Remove the private key file, best-effort, as part of C11's deferred
/// teardown (§4.11 step 5). Missing file is not an error.
pub async fn unlink_private_key(private_path: &Path) {
    if let Err(e) = tokio::fs::remove_file(private_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %private_path.display(), error = %e, "failed to unlink ssh private key");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generate_writes_keys_with_expected_modes() {
        let dir = tempfile::tempdir().unwrap();
        let priv_path = dir.path().join("key");
        let pub_path = dir.path().join("key.pub");

        let identity = generate(&priv_path, &pub_path).await.unwrap();
        assert!(identity.public_key_openssh.starts_with("ssh-ed25519"));

        let priv_mode = std::fs::metadata(&priv_path).unwrap().permissions().mode() & 0o777;
        let pub_mode = std::fs::metadata(&pub_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(priv_mode, 0o600);
        assert_eq!(pub_mode, 0o644);
    }
}
