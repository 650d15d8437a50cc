//! CLI definition (§6 "External Interfaces").
//!
//! Mirrors the teacher's `Cli { global, command }` / flattened `*Flags`
//! shape (`boxlite-cli/src/cli.rs`), scoped down to this orchestrator's
//! three run modes instead of a box-management verb set.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "vmforge", author, version, about = "Host-side VM orchestrator for libkrun-family microVMs")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalFlags {
    /// Workspace directory owning this run's sockets, keys, and logs.
    #[arg(long, global = true)]
    pub workspace: PathBuf,

    /// Hypervisor/orchestrator log verbosity.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: LogLevel,

    /// Unix socket for the Management API (`/healthz`, `/vmconfig`, `/exec`, `/stop`).
    #[arg(long = "rest-api", global = true)]
    pub rest_api: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Boot a VM against a user-supplied rootfs running a single payload command.
    RootfsMode(RootfsModeArgs),

    /// Boot a VM backed by a Podman-compatible container runtime.
    DockerMode(DockerModeArgs),

    /// SSH into an already-running VM's workspace.
    Attach(AttachArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RootfsModeArgs {
    #[command(flatten)]
    pub resources: ResourceFlags,

    /// Absolute path to the guest rootfs directory.
    #[arg(long)]
    pub rootfs: PathBuf,

    /// Environment variables forwarded to the guest payload, `K=V`.
    #[arg(long = "envs", value_name = "K=V")]
    pub envs: Vec<String>,

    /// Additional raw-disk images to attach, created on first use.
    #[arg(long = "data-disk")]
    pub data_disks: Vec<PathBuf>,

    /// Host directory shares, `SRC[:TGT[:ro|rw]]`.
    #[arg(long = "mount")]
    pub mounts: Vec<String>,

    /// Forward the host's HTTP_PROXY/HTTPS_PROXY into the guest (macOS only).
    #[arg(long = "system-proxy")]
    pub system_proxy: bool,

    /// Guest payload command and arguments, after `--`.
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct DockerModeArgs {
    #[command(flatten)]
    pub resources: ResourceFlags,

    /// Raw-disk image backing `/var/lib/containers`.
    #[arg(long = "data-storage")]
    pub data_storage: PathBuf,

    /// Guest rootfs directory; defaults to the built-in container rootfs.
    #[arg(long)]
    pub rootfs: Option<PathBuf>,

    /// Host Unix socket the Docker-API-compatible Podman endpoint listens on.
    #[arg(long = "listen-unix")]
    pub listen_unix: Option<PathBuf>,

    /// Host directory shares, `SRC[:TGT[:ro|rw]]`.
    #[arg(long = "mount")]
    pub mounts: Vec<String>,

    #[arg(long = "system-proxy")]
    pub system_proxy: bool,
}

#[derive(Args, Debug, Clone)]
pub struct AttachArgs {
    /// Workspace of the running VM to attach to.
    pub rootfs: PathBuf,

    /// Allocate a PTY for the remote command.
    #[arg(long)]
    pub pty: bool,

    /// Remote command and arguments, after `--`.
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

#[derive(Args, Debug, Clone, Copy)]
pub struct ResourceFlags {
    /// Guest vCPU count.
    #[arg(long, default_value_t = 2)]
    pub cpus: u32,

    /// Guest RAM in MiB.
    #[arg(long, default_value_t = 2048)]
    pub memory: u32,
}
