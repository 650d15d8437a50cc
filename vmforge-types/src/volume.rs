//! Mount-tag hashing and `SRC[:TGT[:ro|rw]]` volume-syntax parsing.
//!
//! Tags must be deterministic across restarts (§3 invariant on Mounts), so
//! they are derived purely from the mount target string — never from a
//! random UUID.

use sha2::{Digest, Sha256};

/// Length of the virtio-fs tag: first 36 hex chars of SHA-256(target).
pub const TAG_LEN: usize = 36;

/// Derive the deterministic virtiofs tag for a given mount target.
pub fn mount_tag(target: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(target.as_bytes());
    let digest = hasher.finalize();
    let hex = hex::encode(digest);
    hex[..TAG_LEN].to_string()
}

/// A single parsed `--mount` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedVolume {
    pub tag: String,
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Parse `SRC`, `SRC:TGT`, `SRC:TGT:ro`, or `SRC:TGT:rw` into a `ParsedVolume`.
///
/// When `TGT` is omitted, the target equals the source (matching the
/// behavior a bare `-v /path` flag has in container tooling).
pub fn split_volume(spec: &str) -> ParsedVolume {
    let mut parts = spec.splitn(3, ':');
    let source = parts.next().unwrap_or_default().to_string();
    let target = parts.next().map(str::to_string).unwrap_or_else(|| source.clone());
    let read_only = matches!(parts.next(), Some("ro"));
    let tag = mount_tag(&target);
    ParsedVolume { tag, source, target, read_only }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_tag_is_36_lowercase_hex_chars() {
        let tag = mount_tag("/mnt/dst");
        assert_eq!(tag.len(), TAG_LEN);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn mount_tag_matches_truncated_sha256() {
        let mut hasher = Sha256::new();
        hasher.update(b"/mnt/dst");
        let expect = hex::encode(hasher.finalize());
        assert_eq!(mount_tag("/mnt/dst"), expect[..TAG_LEN]);
    }

    #[test]
    fn mount_tag_is_deterministic() {
        assert_eq!(mount_tag("/a/b"), mount_tag("/a/b"));
    }

    #[test]
    fn split_volume_bare_source() {
        let v = split_volume("A");
        assert_eq!(v.source, "A");
        assert_eq!(v.target, "A");
        assert!(!v.read_only);
        assert_eq!(v.tag, mount_tag("A"));
    }

    #[test]
    fn split_volume_source_and_target() {
        let v = split_volume("A:B");
        assert_eq!(v.source, "A");
        assert_eq!(v.target, "B");
        assert!(!v.read_only);
        assert_eq!(v.tag, mount_tag("B"));
    }

    #[test]
    fn split_volume_read_only() {
        let v = split_volume("A:B:ro");
        assert_eq!((v.source.as_str(), v.target.as_str(), v.read_only), ("A", "B", true));
    }

    #[test]
    fn split_volume_explicit_read_write() {
        let v = split_volume("A:B:rw");
        assert_eq!((v.source.as_str(), v.target.as_str(), v.read_only), ("A", "B", false));
    }
}
