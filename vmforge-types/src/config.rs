//! The VM Config root entity (§3).
//!
//! Built once by the Config Builder and read by every other component.
//! After `VmConfig` is constructed it is treated as immutable: nothing
//! downstream of the builder mutates it, it is only enriched in-place for
//! the handful of fields (`BlockDevice::uuid`/`fs_type`) that can only be
//! known after the backing image exists (§3 "Lifecycle").

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Top-level run mode selected on the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Rootfs,
    Container,
}

/// CPU/memory allocation for the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: u32,
    pub memory_mib: u32,
}

impl Resources {
    pub const MIN_MEMORY_MIB: u32 = 128;
}

/// A block device attached to the guest as a raw disk image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    pub path: PathBuf,
    pub is_container_storage: bool,
    pub reuse: bool,
    /// Populated by the Raw-Disk Manager after `inspect()`.
    pub uuid: Option<String>,
    pub fs_type: Option<String>,
    pub mount_point: PathBuf,
}

impl BlockDevice {
    /// Mount point for a non-container-storage disk: `/var/tmp/mnt/<abs-path>`
    /// with the leading `/` stripped so it composes into a single path.
    pub fn default_mount_point(path: &std::path::Path) -> PathBuf {
        let stripped = path.to_string_lossy().trim_start_matches('/').to_string();
        PathBuf::from("/var/tmp/mnt").join(stripped)
    }
}

/// A VirtIO-FS share between host directory and guest mount point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    /// Deterministic 36-char hex tag, see `crate::volume::mount_tag`.
    pub tag: String,
    pub read_only: bool,
    #[serde(rename = "type")]
    pub kind: MountKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Virtiofs,
}

impl Default for MountKind {
    fn default() -> Self {
        MountKind::Virtiofs
    }
}

/// Which network strategy backs the guest's connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Userspace gvisor-tap-vsock stack (gvproxy), the default.
    Gvisor,
    /// The hypervisor's built-in transparent socket interception.
    Tsi,
}

/// Control-plane socket URLs for gvisor-mode networking. `None` in TSI mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GvisorSockets {
    /// `unix://.../gvpctl.sock`
    pub control_url: String,
    /// `unixgram://.../gvpnet.sock`
    pub net_url: String,
}

/// Fixed network facts for the gvisor-tap-vsock subnet (§3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkFacts {
    pub gateway: Ipv4Addr,
    pub host_alias: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub guest_mac: [u8; 6],
    pub mtu: u16,
}

impl NetworkFacts {
    pub const SUBNET_CIDR: &'static str = "192.168.127.0/24";
    pub const HOST_DNS_NAME: &'static str = "host.containers.internal";

    pub fn standard() -> Self {
        Self {
            gateway: Ipv4Addr::new(192, 168, 127, 1),
            host_alias: Ipv4Addr::new(192, 168, 127, 254),
            guest_ip: Ipv4Addr::new(192, 168, 127, 2),
            guest_mac: [0x5a, 0x94, 0xef, 0xe4, 0x0c, 0xee],
            mtu: 1500,
        }
    }
}

/// Host-side SSH key material and forwarded port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshInfo {
    pub public_key_path: PathBuf,
    pub private_key_path: PathBuf,
    pub public_key: String,
    pub guest_port: u16,
    pub host_port: u16,
    pub user: String,
}

impl SshInfo {
    pub const GUEST_PORT: u16 = 22;
    pub const DEFAULT_USER: &'static str = "root";
    pub const PREFERRED_HOST_PORT_BASE: u16 = 2222;
}

/// Podman/Docker-API info, present only in container mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodmanInfo {
    pub host_socket_path: PathBuf,
    pub guest_ip: Ipv4Addr,
    pub guest_port: u16,
    pub env: Vec<(String, String)>,
}

impl PodmanInfo {
    pub const GUEST_PORT: u16 = 25883;
}

/// What the in-guest init execs as the guest-agent entrypoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestAgentCommand {
    pub workdir: String,
    pub executable: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl GuestAgentCommand {
    pub const EXECUTABLE: &'static str = "/.bin/guest-agent";
}

/// The guest-visible command requested by `rootfs-mode -- <cmd> [args]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadCommand {
    pub executable: String,
    pub args: Vec<String>,
}

/// The full VM configuration, serialized verbatim to `<rootfs>/vmconfig.json`
/// (§3 invariant vi) and to the Guest-Config Server's `/vmconfig` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    pub run_mode: RunMode,
    pub workspace: PathBuf,
    pub resources: Resources,
    pub rootfs: PathBuf,
    pub block_devices: Vec<BlockDevice>,
    pub mounts: Vec<Mount>,
    pub network_mode: NetworkMode,
    pub gvisor_sockets: Option<GvisorSockets>,
    pub network_facts: NetworkFacts,
    pub ssh: SshInfo,
    pub podman: Option<PodmanInfo>,
    pub guest_agent: GuestAgentCommand,
    pub payload: Option<PayloadCommand>,
    pub vmctl_socket: PathBuf,
    pub guest_config_socket: PathBuf,
    pub guest_config_vsock_port: u32,
}

impl VmConfig {
    pub const GUEST_CONFIG_VSOCK_PORT: u32 = 62234;

    /// Serialize to the canonical `vmconfig.json` representation.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VmConfig {
        VmConfig {
            run_mode: RunMode::Rootfs,
            workspace: PathBuf::from("/tmp/ws"),
            resources: Resources { cpus: 2, memory_mib: 1024 },
            rootfs: PathBuf::from("/tmp/rootfs"),
            block_devices: vec![],
            mounts: vec![],
            network_mode: NetworkMode::Gvisor,
            gvisor_sockets: Some(GvisorSockets {
                control_url: "unix:///tmp/ws/socks/gvpctl.sock".into(),
                net_url: "unixgram:///tmp/ws/socks/gvpnet.sock".into(),
            }),
            network_facts: NetworkFacts::standard(),
            ssh: SshInfo {
                public_key_path: PathBuf::from("/tmp/ws/ssh/key.pub"),
                private_key_path: PathBuf::from("/tmp/ws/ssh/key"),
                public_key: "ssh-ed25519 AAAA".into(),
                guest_port: SshInfo::GUEST_PORT,
                host_port: 2222,
                user: SshInfo::DEFAULT_USER.into(),
            },
            podman: None,
            guest_agent: GuestAgentCommand {
                workdir: "/".into(),
                executable: GuestAgentCommand::EXECUTABLE.into(),
                args: vec![],
                env: vec![],
            },
            payload: Some(PayloadCommand { executable: "/bin/sh".into(), args: vec!["-c".into(), "echo hi".into()] }),
            vmctl_socket: PathBuf::from("/tmp/ws/socks/vmctl.sock"),
            guest_config_socket: PathBuf::from("/tmp/ws/socks/ign.sock"),
            guest_config_vsock_port: VmConfig::GUEST_CONFIG_VSOCK_PORT,
        }
    }

    #[test]
    fn json_round_trip_preserves_equality_and_absolute_paths() {
        let cfg = sample();
        let json = cfg.to_json().unwrap();
        let parsed = VmConfig::from_json(&json).unwrap();
        assert_eq!(cfg, parsed);
        assert!(parsed.rootfs.is_absolute());
        assert!(parsed.workspace.is_absolute());
    }

    #[test]
    fn guest_mac_matches_standard_dhcp_lease_mac() {
        // The MAC used when adding the net device must equal the MAC used
        // in the DHCP static lease entry for 192.168.127.2 (§8 property 3).
        let facts = NetworkFacts::standard();
        assert_eq!(facts.guest_mac, [0x5a, 0x94, 0xef, 0xe4, 0x0c, 0xee]);
        assert_eq!(facts.guest_ip, Ipv4Addr::new(192, 168, 127, 2));
    }
}
