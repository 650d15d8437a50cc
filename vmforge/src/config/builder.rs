//! Config Builder (C2) — §4.2's eleven strictly-ordered steps.

use std::path::{Path, PathBuf};

use sysinfo::System;
use vmforge_types::{
    BlockDevice, Error, GuestAgentCommand, GvisorSockets, Mount, MountKind, NetworkFacts,
    NetworkMode, PayloadCommand, PodmanInfo, Resources, Result, RunMode, SshInfo, VmConfig,
};

use crate::cli::{Command, DockerModeArgs, GlobalFlags, ResourceFlags, RootfsModeArgs};
use crate::{diskmgr, identity, workspace::Workspace};

/// Everything `build` needs beyond the parsed CLI: the sockets gvproxy was
/// actually bound to, since C5 must already be running before Create can
/// wire the net device (§5 ordering guarantee 2-3).
pub struct BuildContext {
    pub gvproxy: Option<GvisorSockets>,
    pub ssh_host_port: u16,
}

/// `build(cli_args) -> Config` (§4.2). Steps 1-2, 3, 5-10 happen here;
/// step 4 (network strategy) is threaded in via `BuildContext` because it
/// depends on C5 already being spawned by the supervisor.
pub async fn build(global: &GlobalFlags, command: &Command, ctx: BuildContext) -> Result<VmConfig> {
    // Step 1: workspace.
    let workspace = resolve_workspace(&global.workspace)?;
    workspace.ensure_dirs().await?;

    // Step 2: log level is applied by the caller before this runs (main.rs
    // initializes tracing from `global.log_level` first).

    match command {
        Command::RootfsMode(args) => build_rootfs(&workspace, args, ctx).await,
        Command::DockerMode(args) => build_docker(&workspace, args, ctx).await,
        Command::Attach(_) => Err(Error::invalid_input("attach does not build a VmConfig")),
    }
}

/// Resolves the rootfs path a command will run against, without building
/// the rest of the config. `main.rs` calls this to acquire the rootfs
/// `flock` before gvproxy is spawned or the disk/SSH-identity steps below
/// touch that path (§5 "acquired at startup").
pub fn rootfs_for(workspace: &Workspace, command: &Command) -> Result<PathBuf> {
    match command {
        Command::RootfsMode(args) => resolve_rootfs(workspace, Some(&args.rootfs)),
        Command::DockerMode(args) => resolve_rootfs(workspace, args.rootfs.as_deref()),
        Command::Attach(_) => Err(Error::invalid_input("attach does not build a VmConfig")),
    }
}

fn resolve_workspace(root: &Path) -> Result<Workspace> {
    if !root.is_absolute() {
        return Err(Error::invalid_input(format!("--workspace must be absolute: {}", root.display())));
    }
    Ok(Workspace::new(root))
}

// Step 3.
fn validate_resources(flags: &ResourceFlags) -> Result<Resources> {
    if flags.cpus == 0 {
        return Err(Error::invalid_input("--cpus must be at least 1"));
    }
    if flags.memory < Resources::MIN_MEMORY_MIB {
        return Err(Error::invalid_input(format!(
            "--memory must be at least {} MiB",
            Resources::MIN_MEMORY_MIB
        )));
    }

    let sys = System::new_all();
    let host_cpus = sys.cpus().len().max(1) as u32;
    let host_mem_mib = (sys.total_memory() / (1024 * 1024)).max(1) as u32;

    if flags.cpus > host_cpus {
        return Err(Error::invalid_input(format!(
            "--cpus {} exceeds host CPU count {host_cpus}",
            flags.cpus
        )));
    }
    if flags.memory > host_mem_mib {
        return Err(Error::invalid_input(format!(
            "--memory {} MiB exceeds host memory {host_mem_mib} MiB",
            flags.memory
        )));
    }

    Ok(Resources { cpus: flags.cpus, memory_mib: flags.memory })
}

// Step 4.
fn network_mode(ctx: &BuildContext) -> (NetworkMode, Option<GvisorSockets>) {
    match &ctx.gvproxy {
        Some(sockets) => (NetworkMode::Gvisor, Some(sockets.clone())),
        None => (NetworkMode::Tsi, None),
    }
}

// Step 5.
fn resolve_rootfs(workspace: &Workspace, user_rootfs: Option<&Path>) -> Result<PathBuf> {
    match user_rootfs {
        Some(path) => {
            if !path.is_absolute() {
                return Err(Error::invalid_input(format!("--rootfs must be absolute: {}", path.display())));
            }
            if !path.is_dir() {
                return Err(Error::invalid_input(format!("--rootfs is not a directory: {}", path.display())));
            }
            Ok(path.to_path_buf())
        }
        None => Ok(workspace.builtin_rootfs_dir()),
    }
}

async fn resolve_mounts(specs: &[String]) -> Result<Vec<Mount>> {
    let mut mounts = Vec::with_capacity(specs.len());
    for spec in specs {
        let parsed = vmforge_types::volume::split_volume(spec);
        let source = PathBuf::from(&parsed.source);
        if !source.is_absolute() {
            return Err(Error::invalid_input(format!("mount source must be absolute: {}", parsed.source)));
        }
        mounts.push(Mount {
            source,
            target: parsed.target,
            tag: parsed.tag,
            read_only: parsed.read_only,
            kind: MountKind::Virtiofs,
        });
    }
    Ok(mounts)
}

async fn ensure_block_devices(paths: &[PathBuf]) -> Result<Vec<BlockDevice>> {
    let mut devices = Vec::with_capacity(paths.len());
    for path in paths {
        if !path.is_absolute() {
            return Err(Error::invalid_input(format!("--data-disk must be absolute: {}", path.display())));
        }
        let info = diskmgr::ensure_disk(path).await?;
        devices.push(BlockDevice {
            path: path.clone(),
            is_container_storage: false,
            reuse: true,
            uuid: Some(info.uuid),
            fs_type: Some(info.fs_type),
            mount_point: diskmgr::mount_point_for(path, false),
        });
    }
    Ok(devices)
}

/// `PATH`/`LC_ALL`/`TMPDIR`/`HOST_DOMAIN` guest-agent defaults (§3
/// invariant v). Added here, before `VmConfig` is frozen, so the
/// persisted `vmconfig.json` and the env `Start` later hands to
/// `krun_set_exec` always agree — vmconfig.json is the guest agent's
/// only source of configuration (§3 invariant vi).
fn standard_guest_env() -> Vec<(String, String)> {
    vec![
        ("PATH".to_string(), "/usr/bin:/bin:/usr/sbin:/sbin".to_string()),
        ("LC_ALL".to_string(), "C.UTF-8".to_string()),
        ("TMPDIR".to_string(), "/tmp".to_string()),
        ("HOST_DOMAIN".to_string(), NetworkFacts::HOST_DNS_NAME.to_string()),
    ]
}

fn proxy_env_if_requested(system_proxy: bool) -> Vec<(String, String)> {
    if !system_proxy || !cfg!(target_os = "macos") {
        return Vec::new();
    }
    ["HTTP_PROXY", "HTTPS_PROXY"]
        .iter()
        .filter_map(|k| std::env::var(k).ok().map(|v| (k.to_string(), v)))
        .collect()
}

async fn build_ssh(workspace: &Workspace, host_port: u16) -> Result<SshInfo> {
    let private_key_path = workspace.ssh_private_key();
    let public_key_path = workspace.ssh_public_key();
    let identity = identity::generate(&private_key_path, &public_key_path).await?;
    Ok(SshInfo {
        public_key_path,
        private_key_path,
        public_key: identity.public_key_openssh,
        guest_port: SshInfo::GUEST_PORT,
        host_port,
        user: SshInfo::DEFAULT_USER.to_string(),
    })
}

async fn build_rootfs(workspace: &Workspace, args: &RootfsModeArgs, ctx: BuildContext) -> Result<VmConfig> {
    let resources = validate_resources(&args.resources)?;
    let (network_mode, gvisor_sockets) = network_mode(&ctx);
    let rootfs = resolve_rootfs(workspace, Some(&args.rootfs))?;

    let block_devices = ensure_block_devices(&args.data_disks).await?;
    let mounts = resolve_mounts(&args.mounts).await?;
    let ssh = build_ssh(workspace, ctx.ssh_host_port).await?;

    let mut env = proxy_env_if_requested(args.system_proxy);
    for raw in &args.envs {
        if let Some((k, v)) = raw.split_once('=') {
            env.push((k.to_string(), v.to_string()));
        } else {
            return Err(Error::invalid_input(format!("--envs entry missing `=`: {raw}")));
        }
    }
    env.extend(standard_guest_env());

    let (executable, payload_args) =
        args.command.split_first().ok_or_else(|| Error::invalid_input("missing payload command after `--`"))?;

    Ok(VmConfig {
        run_mode: RunMode::Rootfs,
        workspace: workspace.root().to_path_buf(),
        resources,
        rootfs,
        block_devices,
        mounts,
        network_mode,
        gvisor_sockets,
        network_facts: NetworkFacts::standard(),
        ssh,
        podman: None,
        guest_agent: GuestAgentCommand {
            workdir: "/".to_string(),
            executable: GuestAgentCommand::EXECUTABLE.to_string(),
            args: Vec::new(),
            env,
        },
        payload: Some(PayloadCommand { executable: executable.clone(), args: payload_args.to_vec() }),
        vmctl_socket: workspace.vmctl_sock(),
        guest_config_socket: workspace.guest_config_sock(),
        guest_config_vsock_port: VmConfig::GUEST_CONFIG_VSOCK_PORT,
    })
}

async fn build_docker(workspace: &Workspace, args: &DockerModeArgs, ctx: BuildContext) -> Result<VmConfig> {
    let resources = validate_resources(&args.resources)?;
    let (network_mode, gvisor_sockets) = network_mode(&ctx);
    let rootfs = resolve_rootfs(workspace, args.rootfs.as_deref())?;

    // Step 6: user-home share + container-storage disk.
    let home = dirs::home_dir().ok_or_else(|| Error::invalid_input("could not resolve $HOME"))?;
    let mut mounts = resolve_mounts(&args.mounts).await?;
    let home_str = home.to_string_lossy().to_string();
    mounts.push(Mount {
        source: home.clone(),
        target: home_str.clone(),
        tag: vmforge_types::volume::mount_tag(&home_str),
        read_only: false,
        kind: MountKind::Virtiofs,
    });

    let storage_info = diskmgr::ensure_disk(&args.data_storage).await?;
    let block_devices = vec![BlockDevice {
        path: args.data_storage.clone(),
        is_container_storage: true,
        reuse: true,
        uuid: Some(storage_info.uuid),
        fs_type: Some(storage_info.fs_type),
        mount_point: diskmgr::mount_point_for(&args.data_storage, true),
    }];

    let ssh = build_ssh(workspace, ctx.ssh_host_port).await?;

    let podman_socket = args.listen_unix.clone().unwrap_or_else(|| workspace.podman_api_sock());
    let network_facts = NetworkFacts::standard();
    let podman = PodmanInfo {
        host_socket_path: podman_socket,
        guest_ip: network_facts.guest_ip,
        guest_port: PodmanInfo::GUEST_PORT,
        env: proxy_env_if_requested(args.system_proxy),
    };

    Ok(VmConfig {
        run_mode: RunMode::Container,
        workspace: workspace.root().to_path_buf(),
        resources,
        rootfs,
        block_devices,
        mounts,
        network_mode,
        gvisor_sockets,
        network_facts,
        ssh,
        podman: Some(podman),
        guest_agent: GuestAgentCommand {
            workdir: "/".to_string(),
            executable: GuestAgentCommand::EXECUTABLE.to_string(),
            args: Vec::new(),
            env: standard_guest_env(),
        },
        payload: None,
        vmctl_socket: workspace.vmctl_sock(),
        guest_config_socket: workspace.guest_config_sock(),
        guest_config_vsock_port: VmConfig::GUEST_CONFIG_VSOCK_PORT,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_workspace() {
        let err = resolve_workspace(Path::new("relative/dir")).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn rejects_zero_cpus() {
        let err = validate_resources(&ResourceFlags { cpus: 0, memory: 1024 }).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn rejects_below_minimum_memory() {
        let err = validate_resources(&ResourceFlags { cpus: 1, memory: 64 }).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn proxy_env_empty_when_not_requested() {
        assert!(proxy_env_if_requested(false).is_empty());
    }

    #[test]
    fn standard_guest_env_covers_the_four_mandated_vars() {
        let env = standard_guest_env();
        let keys: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["PATH", "LC_ALL", "TMPDIR", "HOST_DOMAIN"]);
    }
}
