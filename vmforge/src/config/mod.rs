//! Config Builder (C2).
//!
//! Turns parsed CLI args into a frozen `VmConfig`. See `builder` for the
//! strictly-ordered build steps (§4.2).

pub mod builder;

pub use builder::{build, rootfs_for, BuildContext};
