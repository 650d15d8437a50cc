//! Path/Workspace Manager (C1).
//!
//! Single source of truth for every transient path under a run's workspace
//! directory. Functions here are pure and idempotent: they never touch the
//! filesystem except `ensure_dirs`, which is an explicit, separate step.
//!
//! Mirrors the teacher's `runtime::layout` module (a `FilesystemLayout`
//! deriving deterministic sub-paths from a home directory) but scoped to a
//! single per-run workspace instead of a persistent multi-box home.

use std::path::{Path, PathBuf};
use vmforge_types::Result;

/// Deterministic, absolute paths under a single run's workspace.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// `root` must already be an absolute, existing, writable directory;
    /// the Config Builder validates that before constructing this.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn socks_dir(&self) -> PathBuf {
        self.root.join("socks")
    }

    pub fn gvproxy_control_sock(&self) -> PathBuf {
        self.socks_dir().join("gvpctl.sock")
    }

    pub fn gvproxy_net_sock(&self) -> PathBuf {
        self.socks_dir().join("gvpnet.sock")
    }

    pub fn podman_api_sock(&self) -> PathBuf {
        self.socks_dir().join("podman-api.sock")
    }

    pub fn vmctl_sock(&self) -> PathBuf {
        self.socks_dir().join("vmctl.sock")
    }

    pub fn guest_config_sock(&self) -> PathBuf {
        self.socks_dir().join("ign.sock")
    }

    pub fn ssh_dir(&self) -> PathBuf {
        self.root.join("ssh")
    }

    pub fn ssh_private_key(&self) -> PathBuf {
        self.ssh_dir().join("key")
    }

    pub fn ssh_public_key(&self) -> PathBuf {
        self.ssh_dir().join("key.pub")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn raw_disk_dir(&self) -> PathBuf {
        self.root.join("raw-disk")
    }

    pub fn container_storage_disk(&self) -> PathBuf {
        self.raw_disk_dir().join("container-storage.ext4")
    }

    /// Default built-in rootfs, when the user doesn't supply one in
    /// container mode.
    pub fn builtin_rootfs_dir(&self) -> PathBuf {
        self.root.join("rootfs")
    }

    pub fn rootfs_lock_path(rootfs: &Path) -> PathBuf {
        rootfs.join(".lock")
    }

    pub fn vmconfig_json_path(rootfs: &Path) -> PathBuf {
        rootfs.join("vmconfig.json")
    }

    /// Every directory a component might need to write into. Called once,
    /// at the start of Config Builder.
    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.socks_dir(), self.ssh_dir(), self.logs_dir(), self.raw_disk_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| vmforge_types::Error::io(dir, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_deterministic_and_rooted_under_workspace() {
        let ws = Workspace::new("/tmp/run-1");
        let first = ws.gvproxy_control_sock();
        let second = ws.gvproxy_control_sock();
        assert_eq!(first, second);

        for path in [
            ws.gvproxy_control_sock(),
            ws.gvproxy_net_sock(),
            ws.podman_api_sock(),
            ws.vmctl_sock(),
            ws.guest_config_sock(),
            ws.ssh_private_key(),
            ws.ssh_public_key(),
            ws.logs_dir(),
            ws.container_storage_disk(),
        ] {
            assert!(path.starts_with("/tmp/run-1"));
            assert!(path.is_absolute());
        }
    }
}
