//! Host-side VM Orchestrator library.
//!
//! See `SPEC_FULL.md` for the component map (C1-C11). `main.rs` is a thin
//! CLI shell around this library so that integration tests can drive the
//! orchestrator without spawning a subprocess.

pub mod api;
pub mod cli;
pub mod config;
pub mod diskmgr;
pub mod hypervisor;
pub mod identity;
pub mod net;
pub mod probes;
pub mod supervisor;
pub mod tunnel;
pub mod workspace;

pub use vmforge_types::{Error, Result};
