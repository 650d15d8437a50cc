//! Shared data model and error taxonomy for the VM orchestrator.
//!
//! This crate has no process-lifecycle logic of its own: it is the wire
//! format (`VmConfig`, serialized to `vmconfig.json`) and the error kinds
//! every orchestrator component returns.

mod config;
mod error;
pub mod volume;

pub use config::{
    BlockDevice, GuestAgentCommand, GvisorSockets, Mount, MountKind, NetworkFacts, NetworkMode,
    PayloadCommand, PodmanInfo, Resources, RunMode, SshInfo, VmConfig,
};
pub use error::{Error, Result};
