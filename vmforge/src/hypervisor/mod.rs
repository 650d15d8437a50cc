//! Hypervisor Driver (C7).
//!
//! Safe wrapper around libkrun's context FFI (see `ffi`). State machine:
//! `New -> Configured -> Running -> Stopped -> Closed`; each transition is
//! exclusive under the context's mutex, mirroring the way the teacher's
//! `KrunContext`/`KrunVmmInstance` split "build up the context" from
//! "enter the guest" into two distinct calls. `New` is a distinct type,
//! `NewContext`, rather than a third enum variant on `HypervisorContext`:
//! `create` consumes it, so a context that has already been configured
//! can't be handed to `create` again.

pub mod ffi;

use std::ffi::CString;
use std::os::unix::io::AsRawFd;

use parking_lot::Mutex;
use vmforge_types::{BlockDevice, Error, Mount, NetworkMode, Result, VmConfig};

use crate::net::TapFraming;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Configured,
    Running,
    Stopped,
    Closed,
}

/// Backs §4.7 invariant (i) ("`Create` must be called exactly once; a
/// second call is an error") independent of the FFI calls it gates, so the
/// transition itself is unit-testable without a real libkrun context.
struct CreateGuard(Mutex<bool>);

impl CreateGuard {
    fn new() -> Self {
        Self(Mutex::new(false))
    }

    /// First call returns `Ok`; every call after that returns `Err`.
    fn enter(&self) -> Result<()> {
        let mut entered = self.0.lock();
        if *entered {
            return Err(Error::Internal("HypervisorContext::create called more than once".to_string()));
        }
        *entered = true;
        Ok(())
    }
}

/// A libkrun context that has not yet been configured. Obtained via
/// `NewContext::new()`; `create` consumes it to produce the running
/// `HypervisorContext`.
pub struct NewContext {
    guard: CreateGuard,
}

impl Default for NewContext {
    fn default() -> Self {
        Self::new()
    }
}

impl NewContext {
    pub fn new() -> Self {
        Self { guard: CreateGuard::new() }
    }

    /// `Create` (§4.7): programs the full VM configuration into a fresh
    /// libkrun context. `self` is consumed, and `guard` is checked first so
    /// even a caller that somehow retains access to this handle across
    /// calls (e.g. through a shared reference obtained before the move)
    /// gets a typed error rather than a second `krun_create_ctx`.
    pub fn create(self, config: &VmConfig) -> Result<HypervisorContext> {
        self.guard.enter()?;
        create_context(config)
    }
}

/// Owns one libkrun context for the lifetime of a single VM run.
pub struct HypervisorContext {
    state: Mutex<State>,
    ctx_id: ffi::KrunCtxId,
    /// Held open for the lifetime of the VM so the guest-log console port
    /// stays writable (§5 "Shared resources": single writer FD).
    _guest_log: std::fs::File,
}

// SAFETY: the libkrun context handle is a plain integer token; libkrun's
// own C API serializes access to a given ctx_id internally. The `state`
// mutex enforces our own exclusive-transition invariant on top of that.
unsafe impl Send for HypervisorContext {}
unsafe impl Sync for HypervisorContext {}

fn cstr(s: impl AsRef<str>) -> Result<CString> {
    CString::new(s.as_ref()).map_err(|e| Error::invalid_input(format!("embedded NUL byte: {e}")))
}

fn check(function: &'static str, code: i32) -> Result<()> {
    if code < 0 {
        Err(Error::ffi(function, code))
    } else {
        Ok(())
    }
}

/// Body of `Create` (§4.7), factored out of `NewContext::create` so the
/// one-shot guard above it is the only thing standing between a caller and
/// this function.
fn create_context(config: &VmConfig) -> Result<HypervisorContext> {
    unsafe {
        // Step 1: hypervisor logging must be initialized before the
        // context exists.
        if let Ok(level) = std::env::var("LIBKRUN_DEBUG") {
            check("krun_set_log_level", ffi::krun_set_log_level(parse_log_level(&level)))?;
        }

        // Step 2: create the context.
        let raw = ffi::krun_create_ctx();
        if raw < 0 {
            return Err(Error::ffi("krun_create_ctx", raw));
        }
        let ctx_id = raw as ffi::KrunCtxId;

        // Step 3: CPU/memory.
        let cpus = config.resources.cpus.clamp(1, 255) as u8;
        check(
            "krun_set_vm_config",
            ffi::krun_set_vm_config(ctx_id, cpus, config.resources.memory_mib),
        )?;

        // Step 4: rlimits (guest NPROC soft=4096 hard=8192).
        let rlimit_entry = cstr("6=4096:8192")?;
        let rlimits = [rlimit_entry.as_ptr(), std::ptr::null()];
        check("krun_set_rlimits", ffi::krun_set_rlimits(ctx_id, rlimits.as_ptr()))?;

        // Step 5: console + guest-log.
        check("krun_disable_implicit_console", ffi::krun_disable_implicit_console(ctx_id))?;
        let all_ttys = is_tty(std::io::stdin().as_raw_fd())
            && is_tty(std::io::stdout().as_raw_fd())
            && is_tty(std::io::stderr().as_raw_fd());
        if all_ttys {
            check(
                "krun_add_console_port",
                ffi::krun_add_console_port(ctx_id, std::io::stdin().as_raw_fd(), true),
            )?;
        } else {
            for fd in [
                std::io::stdin().as_raw_fd(),
                std::io::stdout().as_raw_fd(),
                std::io::stderr().as_raw_fd(),
            ] {
                check("krun_add_console_port", ffi::krun_add_console_port(ctx_id, fd, false))?;
            }
        }
        let log_path = config.workspace.join("logs").join("guest.log");
        let guest_log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| Error::io(&log_path, e))?;
        let log_cstr = cstr(log_path.to_string_lossy())?;
        check("krun_set_console_output", ffi::krun_set_console_output(ctx_id, log_cstr.as_ptr()))?;

        // Step 6: vsock + network hijack mode.
        check("krun_disable_implicit_vsock", ffi::krun_disable_implicit_vsock(ctx_id))?;
        match config.network_mode {
            NetworkMode::Gvisor => {
                check("krun_set_tsi_hijack", ffi::krun_set_tsi_hijack(ctx_id, false, false))?;
            }
            NetworkMode::Tsi => {
                let unix_hijack = cfg!(target_os = "linux");
                check("krun_set_tsi_hijack", ffi::krun_set_tsi_hijack(ctx_id, true, unix_hijack))?;
            }
        }

        // Step 7: GPU (Venus, no legacy VirGL).
        check(
            "krun_set_gpu_options",
            ffi::krun_set_gpu_options(ctx_id, ffi::GPU_VIRGL_FLAG_VENUS),
        )?;

        // Step 8: rootfs.
        let rootfs_cstr = cstr(config.rootfs.to_string_lossy())?;
        check("krun_set_root", ffi::krun_set_root(ctx_id, rootfs_cstr.as_ptr()))?;

        // Step 9: block devices.
        for dev in &config.block_devices {
            add_disk(ctx_id, dev)?;
        }

        // Step 10: mounts.
        for mount in &config.mounts {
            add_mount(ctx_id, mount)?;
        }

        // Step 11: gvisor net device.
        if let (NetworkMode::Gvisor, Some(sockets)) = (config.network_mode, &config.gvisor_sockets) {
            let path = sockets
                .net_url
                .strip_prefix("unixgram://")
                .ok_or_else(|| Error::invalid_input("gvisor net_url missing unixgram:// scheme"))?;
            let path_cstr = cstr(path)?;
            let mut mac = config.network_facts.guest_mac;
            let flags = match TapFraming::for_host() {
                TapFraming::Vfkit => ffi::net_flags::VFKIT,
                TapFraming::Qemu => ffi::net_flags::QEMU,
            };
            let features = ffi::net_features::CSUM
                | ffi::net_features::GUEST_CSUM
                | ffi::net_features::GUEST_TSO4
                | ffi::net_features::GUEST_UFO
                | ffi::net_features::HOST_TSO4
                | ffi::net_features::HOST_UFO;
            check(
                "krun_add_net_unixgram",
                ffi::krun_add_net_unixgram(ctx_id, path_cstr.as_ptr(), -1, mac.as_mut_ptr(), features, flags),
            )?;
        }

        // Step 12: VSock port for the guest-config server.
        let vsock_sock_cstr = cstr(config.guest_config_socket.to_string_lossy())?;
        check(
            "krun_add_vsock_port",
            ffi::krun_add_vsock_port(ctx_id, config.guest_config_vsock_port, vsock_sock_cstr.as_ptr()),
        )?;

        // Step 13: nested virtualization, best-effort.
        let nested = ffi::krun_check_nested_virt();
        if nested > 0 {
            let _ = ffi::krun_set_nested_virt(ctx_id, true);
        }

        // Step 14: freeze the config to disk.
        let vmconfig_path = config.rootfs.join("vmconfig.json");
        let json = config
            .to_json()
            .map_err(|e| Error::Internal(format!("failed to serialize vmconfig.json: {e}")))?;
        std::fs::write(&vmconfig_path, json).map_err(|e| Error::io(&vmconfig_path, e))?;

        Ok(HypervisorContext { state: Mutex::new(State::Configured), ctx_id, _guest_log: guest_log })
    }
}

impl HypervisorContext {
    /// `Start` (§4.7): sets the guest-agent exec and blocks the current
    /// (dedicated) thread inside the hypervisor until the guest exits, or
    /// returns a cancellation error if `cancel` fires first. Must run on a
    /// thread reserved for it — `krun_start_enter` is a non-cancellable
    /// blocking FFI call.
    pub async fn start(
        self: std::sync::Arc<Self>,
        config: &VmConfig,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != State::Configured {
                return Err(Error::Internal(format!("hypervisor start from invalid state {state:?}")));
            }
            *state = State::Running;
        }

        unsafe {
            let exec_cstr = cstr(&config.guest_agent.executable)?;
            let mut argv_cstrs: Vec<CString> =
                config.guest_agent.args.iter().map(|a| cstr(a)).collect::<Result<_>>()?;
            argv_cstrs.insert(0, exec_cstr.clone());
            let mut argv_ptrs: Vec<*const std::os::raw::c_char> =
                argv_cstrs.iter().map(|c| c.as_ptr()).collect();
            argv_ptrs.push(std::ptr::null());

            // `config.guest_agent.env` already carries the PATH/LC_ALL/
            // TMPDIR/HOST_DOMAIN defaults (added by the Config Builder
            // before `Create` freezes `vmconfig.json`), so the env handed
            // to `krun_set_exec` here matches what every other consumer of
            // the config sees.
            let env_cstrs: Vec<CString> = config
                .guest_agent
                .env
                .iter()
                .map(|(k, v)| cstr(format!("{k}={v}")))
                .collect::<Result<_>>()?;
            let mut env_ptrs: Vec<*const std::os::raw::c_char> =
                env_cstrs.iter().map(|c| c.as_ptr()).collect();
            env_ptrs.push(std::ptr::null());

            check(
                "krun_set_exec",
                ffi::krun_set_exec(self.ctx_id, exec_cstr.as_ptr(), argv_ptrs.as_ptr(), env_ptrs.as_ptr()),
            )?;
        }

        raise_nofile_limit();

        let ctx_id = self.ctx_id;
        let enter = tokio::task::spawn_blocking(move || {
            let status = unsafe { ffi::krun_start_enter(ctx_id) };
            status
        });

        tokio::select! {
            result = enter => {
                let mut state = self.state.lock();
                *state = State::Stopped;
                match result {
                    Ok(status) if status < 0 => Err(Error::ffi("krun_start_enter", status)),
                    Ok(_) => Ok(()),
                    Err(e) => Err(Error::Internal(format!("guest-enter task panicked: {e}"))),
                }
            }
            _ = cancel.cancelled() => {
                // libkrun offers no graceful-stop call; the process will be
                // reaped when the supervisor exits the scope.
                Err(Error::Cancelled)
            }
        }
    }

    /// Idempotent per §4.7 invariant (iii).
    pub fn close(&self) {
        let mut state = self.state.lock();
        if matches!(*state, State::Closed) {
            return;
        }
        let rc = unsafe { ffi::krun_free_ctx(self.ctx_id) };
        if rc < 0 {
            tracing::warn!(code = rc, "krun_free_ctx failed");
        }
        *state = State::Closed;
    }
}

impl Drop for HypervisorContext {
    fn drop(&mut self) {
        self.close();
    }
}

fn add_disk(ctx_id: ffi::KrunCtxId, dev: &BlockDevice) -> Result<()> {
    if !dev.path.is_file() {
        return Err(Error::invalid_input(format!(
            "block device {} is not a regular file",
            dev.path.display()
        )));
    }
    let block_id = dev.uuid.clone().ok_or_else(|| {
        Error::Internal(format!("block device {} missing uuid before Create", dev.path.display()))
    })?;
    let block_id_cstr = cstr(block_id)?;
    let path_cstr = cstr(dev.path.to_string_lossy())?;
    check(
        "krun_add_disk",
        unsafe { ffi::krun_add_disk(ctx_id, block_id_cstr.as_ptr(), path_cstr.as_ptr(), false) },
    )
}

/// DAX window for virtio-fs shares (§4.7 step 10).
const VIRTIOFS_DAX_WINDOW_BYTES: u64 = 512 * 1024 * 1024;

fn add_mount(ctx_id: ffi::KrunCtxId, mount: &Mount) -> Result<()> {
    let resolved = std::fs::canonicalize(&mount.source).map_err(|e| Error::io(&mount.source, e))?;
    if !resolved.is_dir() {
        return Err(Error::invalid_input(format!("mount source {} is not a directory", resolved.display())));
    }
    let tag_cstr = cstr(&mount.tag)?;
    let path_cstr = cstr(resolved.to_string_lossy())?;
    check(
        "krun_add_virtiofs2",
        unsafe {
            ffi::krun_add_virtiofs2(ctx_id, tag_cstr.as_ptr(), path_cstr.as_ptr(), VIRTIOFS_DAX_WINDOW_BYTES)
        },
    )
}

fn is_tty(fd: std::os::unix::io::RawFd) -> bool {
    unsafe { libc::isatty(fd) == 1 }
}

fn raise_nofile_limit() {
    unsafe {
        let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) == 0 {
            limit.rlim_cur = limit.rlim_max;
            if libc::setrlimit(libc::RLIMIT_NOFILE, &limit) != 0 {
                tracing::warn!("failed to raise RLIMIT_NOFILE before guest enter");
            }
        }
    }
}

fn parse_log_level(value: &str) -> u32 {
    match value {
        "trace" => 4,
        "debug" => 3,
        "info" => 2,
        "warn" => 1,
        "error" => 0,
        _ => value.parse().unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_guard_allows_exactly_one_entry() {
        let guard = CreateGuard::new();
        guard.enter().unwrap();
        let err = guard.enter().unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
