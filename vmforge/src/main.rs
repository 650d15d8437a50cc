//! CLI entrypoint: parses args, sets up logging, and dispatches to the
//! Config Builder + Lifecycle Supervisor (run modes) or a direct SSH
//! session (`attach`).

use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::EnvFilter;
use vmforge::cli::{Cli, Command};
use vmforge::config::{self, BuildContext};
use vmforge::net::{gvproxy, ssh::SshSession};
use vmforge::supervisor::RootfsLock;
use vmforge::workspace::Workspace;
use vmforge::{supervisor, Error};
use vmforge_types::GvisorSockets;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = init_logging(&cli.global.workspace, cli.global.log_level.as_filter());

    let result = match &cli.command {
        Command::Attach(args) => run_attach(args).await,
        Command::RootfsMode(_) | Command::DockerMode(_) => run_vm_command(&cli).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_cancellation() => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("vmforge: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(workspace: &std::path::Path, default_filter: &str) -> tracing_appender::non_blocking::WorkerGuard {
    let logs_dir = Workspace::new(workspace.to_path_buf()).logs_dir();
    let _ = std::fs::create_dir_all(&logs_dir);

    let file_appender = tracing_appender::rolling::never(&logs_dir, "vmforge.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(non_blocking).with_ansi(false).init();

    guard
}

async fn run_vm_command(cli: &Cli) -> vmforge_types::Result<()> {
    let workspace = Workspace::new(cli.global.workspace.clone());
    workspace.ensure_dirs().await?;

    // Acquired before gvproxy is spawned or the Config Builder formats the
    // rootfs disk / regenerates the SSH identity, so a second concurrent
    // run against this rootfs fails here instead of racing those steps.
    let rootfs = config::rootfs_for(&workspace, &cli.command)?;
    let rootfs_lock = RootfsLock::acquire(&rootfs)?;

    let ssh_host_port = gvproxy::pick_ssh_host_port()?;

    let gvproxy_process = match gvproxy::spawn(gvproxy::GvproxySpawnArgs {
        control_sock: workspace.gvproxy_control_sock(),
        net_sock: workspace.gvproxy_net_sock(),
        facts: &vmforge_types::NetworkFacts::standard(),
        ssh_host_port,
        dns_search: Vec::new(),
    })
    .await
    {
        Ok(process) => Some(process),
        Err(e) => {
            tracing::warn!(error = %e, "gvproxy unavailable, falling back to TSI networking");
            None
        }
    };

    let gvproxy_sockets = gvproxy_process
        .as_ref()
        .map(|p| GvisorSockets { control_url: p.control_url(), net_url: p.net_url() });

    let ctx = BuildContext { gvproxy: gvproxy_sockets, ssh_host_port };

    let config = match config::build(&cli.global, &cli.command, ctx).await {
        Ok(config) => config,
        Err(e) => {
            if let Some(process) = gvproxy_process {
                process.stop().await;
            }
            return Err(e);
        }
    };

    supervisor::run(config, cli.global.rest_api.clone(), gvproxy_process, rootfs_lock).await
}

async fn run_attach(args: &vmforge::cli::AttachArgs) -> vmforge_types::Result<()> {
    let vmconfig_path = Workspace::vmconfig_json_path(&args.rootfs);
    let raw = tokio::fs::read_to_string(&vmconfig_path).await.map_err(|e| Error::io(vmconfig_path.clone(), e))?;
    let config = vmforge_types::VmConfig::from_json(&raw)
        .map_err(|e| Error::Internal(format!("failed to parse {}: {e}", vmconfig_path.display())))?;

    let (executable, rest) =
        args.command.split_first().ok_or_else(|| Error::invalid_input("missing remote command after `--`"))?;
    let command_line = std::iter::once(executable.clone())
        .chain(rest.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ");

    let mut session = SshSession::connect(config.ssh.host_port, &config.ssh.user, &config.ssh.private_key_path).await?;
    let mut channel =
        if args.pty { session.open_exec_pty(&command_line).await? } else { session.open_exec(&command_line).await? };

    let mut stdin = tokio::io::stdin();
    let mut stdin_buf = [0u8; 4096];
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut exit_status = 0i32;

    loop {
        tokio::select! {
            n = stdin.read(&mut stdin_buf) => {
                match n {
                    Ok(0) => { let _ = channel.eof().await; }
                    Ok(n) => { let _ = channel.data(&stdin_buf[..n]).await; }
                    Err(_) => {}
                }
            }
            msg = channel.wait() => {
                match msg {
                    Some(russh::ChannelMsg::Data { data }) => { let _ = stdout.write_all(&data).await; let _ = stdout.flush().await; }
                    Some(russh::ChannelMsg::ExtendedData { data, ext: 1 }) => { let _ = stderr.write_all(&data).await; let _ = stderr.flush().await; }
                    Some(russh::ChannelMsg::ExitStatus { exit_status: status }) => { exit_status = status as i32; }
                    Some(russh::ChannelMsg::Eof) | Some(russh::ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
        }
    }

    session.disconnect().await;

    if exit_status != 0 {
        return Err(Error::Internal(format!("remote command exited with status {exit_status}")));
    }
    Ok(())
}
