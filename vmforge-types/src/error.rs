//! Error taxonomy shared by every component of the orchestrator.
//!
//! The kinds mirror the failure taxonomy in the design doc: components
//! return the first failing error up through the supervisor, which cancels
//! the run and prints the first non-cancellation error.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A CLI flag or path is malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A filesystem read/write/mkdir failed.
    #[error("filesystem error at {path}: {source}")]
    FilesystemIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An external tool (blkid/mkfs/fsck/gvproxy) exited non-zero.
    #[error("external tool `{tool}` failed (exit {code:?}): {detail}")]
    ExternalTool {
        tool: &'static str,
        code: Option<i32>,
        detail: String,
    },

    /// The hypervisor FFI returned a negative status code.
    #[error("hypervisor call `{function}` failed with code {code}")]
    Ffi { function: &'static str, code: i32 },

    /// A readiness probe's deadline expired.
    #[error("service `{service}` did not become ready within {timeout_ms}ms")]
    ServiceUnavailable { service: &'static str, timeout_ms: u64 },

    /// The run was cancelled (signal, watchdog, or sibling task failure).
    #[error("cancelled")]
    Cancelled,

    /// An invariant the code assumes was violated; always a bug.
    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::FilesystemIo { path: path.into(), source }
    }

    pub fn external_tool(tool: &'static str, code: Option<i32>, detail: impl Into<String>) -> Self {
        Error::ExternalTool { tool, code, detail: detail.into() }
    }

    pub fn ffi(function: &'static str, code: i32) -> Self {
        Error::Ffi { function, code }
    }

    pub fn unavailable(service: &'static str, timeout_ms: u64) -> Self {
        Error::ServiceUnavailable { service, timeout_ms }
    }

    /// True for errors that are expected noise during teardown and should
    /// not be logged as the run's primary failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
