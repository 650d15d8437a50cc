//! Raw-Disk Manager (C4).
//!
//! Creates, formats, and inspects raw ext4 disk-image files via the
//! standard external tools (`mkfs.ext4`, `blkid`, `fsck.ext4`), the same
//! way the teacher shells out to filesystem tooling rather than linking a
//! Rust ext4 implementation (`litebox/init/tasks/container_rootfs.rs`
//! follows the same external-tool pattern for qcow2).
//!
//! Policy (§4.4): an existing non-empty image file is always reused and
//! fscked, never reformatted — reformatting would destroy user data.

use std::path::{Path, PathBuf};
use tokio::process::Command;
use vmforge_types::Error;

/// Sparse disk size used when a user `--data-disk`/container-storage image
/// doesn't already exist.
pub const DEFAULT_DISK_SIZE_GIB: u64 = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInfo {
    pub uuid: String,
    pub fs_type: String,
}

/// Ensure a disk image exists at `path`, creating and formatting it if
/// missing, or fsck-ing it in place if it already has content.
///
/// Returns the disk's inspected `uuid`/`fs_type`.
pub async fn ensure_disk(path: &Path) -> vmforge_types::Result<DiskInfo> {
    ensure_disk_sized(path, DEFAULT_DISK_SIZE_GIB).await
}

pub async fn ensure_disk_sized(path: &Path, size_gib: u64) -> vmforge_types::Result<DiskInfo> {
    let existing_len = match tokio::fs::metadata(path).await {
        Ok(meta) => Some(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(Error::io(path, e)),
    };

    match existing_len {
        None | Some(0) => {
            create(path, size_gib).await?;
            let uuid = uuid::Uuid::new_v4().to_string();
            format(path, &uuid).await?;
            Ok(DiskInfo { uuid, fs_type: "ext4".to_string() })
        }
        Some(_) => {
            let info = inspect(path).await?;
            if info.fs_type == "ext4" {
                fsck(path).await?;
            } else {
                tracing::warn!(
                    path = %path.display(),
                    fs_type = %info.fs_type,
                    "skipping fsck: not an ext4 filesystem"
                );
            }
            Ok(info)
        }
    }
}

/// Truncate a sparse file of `size_gib` GiB at `path`.
pub async fn create(path: &Path, size_gib: u64) -> vmforge_types::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| Error::io(parent, e))?;
    }
    let file = tokio::fs::File::create(path).await.map_err(|e| Error::io(path, e))?;
    let size_bytes = size_gib * 1024 * 1024 * 1024;
    file.set_len(size_bytes).await.map_err(|e| Error::io(path, e))?;
    Ok(())
}

/// Format `path` as ext4 with an explicit UUID, matching §4.4's "format"
/// operation (mkfs.ext4 with explicit UUID and discard).
pub async fn format(path: &Path, uuid: &str) -> vmforge_types::Result<()> {
    run_tool(
        "mkfs.ext4",
        Command::new("mkfs.ext4")
            .arg("-q")
            .arg("-F")
            .arg("-U")
            .arg(uuid)
            .arg("-E")
            .arg("discard")
            .arg(path),
    )
    .await
}

/// `blkid` the image for its UUID and filesystem type.
pub async fn inspect(path: &Path) -> vmforge_types::Result<DiskInfo> {
    let output = Command::new("blkid")
        .arg("-o")
        .arg("export")
        .arg(path)
        .output()
        .await
        .map_err(|e| Error::ExternalTool {
            tool: "blkid",
            code: None,
            detail: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(Error::external_tool(
            "blkid",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let mut uuid = None;
    let mut fs_type = None;
    for line in text.lines() {
        if let Some(v) = line.strip_prefix("UUID=") {
            uuid = Some(v.to_string());
        } else if let Some(v) = line.strip_prefix("TYPE=") {
            fs_type = Some(v.to_string());
        }
    }

    let uuid = uuid.ok_or_else(|| {
        Error::external_tool("blkid", output.status.code(), "no UUID reported for disk image")
    })?;
    let fs_type = fs_type.ok_or_else(|| {
        Error::external_tool("blkid", output.status.code(), "no TYPE reported for disk image")
    })?;

    Ok(DiskInfo { uuid, fs_type })
}

/// `fsck -p` an ext4 image. Failure is fatal (§4.4): we never silently
/// reformat a non-empty image.
pub async fn fsck(path: &Path) -> vmforge_types::Result<()> {
    run_tool("fsck.ext4", Command::new("fsck.ext4").arg("-p").arg(path)).await
}

async fn run_tool(name: &'static str, cmd: &mut Command) -> vmforge_types::Result<()> {
    let output = cmd.output().await.map_err(|e| Error::ExternalTool {
        tool: name,
        code: None,
        detail: e.to_string(),
    })?;

    // fsck -p exit code 1 means "errors corrected" which is a success path.
    let acceptable = output.status.success() || (name == "fsck.ext4" && output.status.code() == Some(1));
    if !acceptable {
        return Err(Error::external_tool(
            name,
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }
    Ok(())
}

/// Resolve the mount point a block device lives at inside the guest, per
/// §3 invariant ii.
pub fn mount_point_for(path: &Path, is_container_storage: bool) -> PathBuf {
    if is_container_storage {
        PathBuf::from("/var/lib/containers")
    } else {
        vmforge_types::BlockDevice::default_mount_point(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_storage_always_mounts_at_fixed_path() {
        assert_eq!(
            mount_point_for(Path::new("/whatever.img"), true),
            PathBuf::from("/var/lib/containers")
        );
    }

    #[test]
    fn other_disks_mount_under_var_tmp_mnt() {
        assert_eq!(
            mount_point_for(Path::new("/tmp/data.img"), false),
            PathBuf::from("/var/tmp/mnt/tmp/data.img")
        );
    }
}
