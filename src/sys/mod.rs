//! OS specific bits.
//!
//! The `unix` module carries the real implementation; `shell` routes
//! unsupported targets to stubs that panic when used, keeping the crate
//! compilable everywhere.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use self::unix::*;

#[cfg(not(unix))]
mod shell;
#[cfg(not(unix))]
pub(crate) use self::shell::*;
