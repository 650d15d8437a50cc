//! Narrow `extern "C"` bindings to libkrun.
//!
//! libkrun is an external collaborator (§1): this crate does not vendor a
//! `-sys` binding crate for it, it links against the system library
//! (`build.rs`) and declares only the functions the Config Builder and
//! Hypervisor Driver actually call. Signatures follow libkrun's public
//! `include/libkrun.h` contract: a context is an opaque non-negative `u32`
//! handle, every setter returns `0` on success or a negative `errno` on
//! failure, and `krun_start_enter` only returns on failure (or to report
//! guest exit as a non-negative status).

use std::os::raw::{c_char, c_int};

pub type KrunCtxId = u32;

extern "C" {
    /// Must precede `krun_create_ctx`; `level` is the `LIBKRUN_DEBUG` value.
    pub fn krun_set_log_level(level: u32) -> c_int;

    pub fn krun_create_ctx() -> c_int;
    pub fn krun_free_ctx(ctx_id: KrunCtxId) -> c_int;

    pub fn krun_set_vm_config(ctx_id: KrunCtxId, num_vcpus: u8, ram_mib: u32) -> c_int;

    pub fn krun_set_rlimits(ctx_id: KrunCtxId, rlimits: *const *const c_char) -> c_int;

    /// Disables the implicit console device so only the ports we add exist.
    pub fn krun_disable_implicit_console(ctx_id: KrunCtxId) -> c_int;

    /// Adds a console bound to a host file descriptor; `is_tty` requests
    /// full ioctl passthrough.
    pub fn krun_add_console_port(ctx_id: KrunCtxId, fd: c_int, is_tty: bool) -> c_int;

    /// Binds an additional console port to an append-only log file.
    pub fn krun_set_console_output(ctx_id: KrunCtxId, path: *const c_char) -> c_int;

    pub fn krun_disable_implicit_vsock(ctx_id: KrunCtxId) -> c_int;
    pub fn krun_add_vsock_port(ctx_id: KrunCtxId, port: u32, host_socket: *const c_char) -> c_int;

    /// Enables the TSI (transparent socket interception) networking path.
    pub fn krun_set_tsi_hijack(ctx_id: KrunCtxId, inet: bool, unix_sockets: bool) -> c_int;

    /// Adds a unixgram-backed net device, e.g. gvproxy's vfkit-framed
    /// socket. `flags` selects vfkit (1) vs qemu-stream (0) framing.
    pub fn krun_add_net_unixgram(
        ctx_id: KrunCtxId,
        path: *const c_char,
        fd: c_int,
        mac: *const u8,
        features: u32,
        flags: u32,
    ) -> c_int;

    pub fn krun_set_gpu_options(ctx_id: KrunCtxId, virgl_flags: u32) -> c_int;

    pub fn krun_set_root(ctx_id: KrunCtxId, path: *const c_char) -> c_int;

    pub fn krun_add_disk(
        ctx_id: KrunCtxId,
        block_id: *const c_char,
        path: *const c_char,
        read_only: bool,
    ) -> c_int;

    /// `shm_size` is the DAX window size in bytes; `0` disables DAX.
    pub fn krun_add_virtiofs2(
        ctx_id: KrunCtxId,
        tag: *const c_char,
        path: *const c_char,
        shm_size: u64,
    ) -> c_int;

    pub fn krun_set_workdir(ctx_id: KrunCtxId, path: *const c_char) -> c_int;

    pub fn krun_set_exec(
        ctx_id: KrunCtxId,
        exec_path: *const c_char,
        argv: *const *const c_char,
        envp: *const *const c_char,
    ) -> c_int;

    pub fn krun_check_nested_virt() -> c_int;
    pub fn krun_set_nested_virt(ctx_id: KrunCtxId, enabled: bool) -> c_int;

    /// Never returns on success: the calling thread becomes the guest.
    /// Returns a negative errno on failure to start.
    pub fn krun_start_enter(ctx_id: KrunCtxId) -> c_int;
}

/// Virtio-net feature bits libkrun negotiates with the guest driver, mirrored
/// from the offloads gvproxy's userspace stack supports.
pub mod net_features {
    pub const CSUM: u32 = 1 << 0;
    pub const GUEST_CSUM: u32 = 1 << 1;
    pub const GUEST_TSO4: u32 = 1 << 7;
    pub const GUEST_UFO: u32 = 1 << 10;
    pub const HOST_TSO4: u32 = 1 << 11;
    pub const HOST_UFO: u32 = 1 << 14;
}

/// `flags` values for `krun_add_net_unixgram`.
pub mod net_flags {
    pub const QEMU: u32 = 0;
    pub const VFKIT: u32 = 1 << 0;
}

/// `virgl_flags` bit requesting Venus (Vulkan passthrough) without legacy
/// VirGL 3D, per §4.7 step 7.
pub const GPU_VIRGL_FLAG_VENUS: u32 = 1 << 2;
