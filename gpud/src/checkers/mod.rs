//! Built-in components run by the daemon
//!
//! - `os`: boot time and uptime, records one reboot event per boot
//! - command checks: run a health-check program and escalate recurring failures

pub mod command;
pub mod os;

use std::path::PathBuf;

use thiserror::Error;

pub use command::{CommandChecker, EscalationPolicy};
pub use os::OsChecker;

/// Errors raised while collecting health data
#[derive(Debug, Error)]
pub enum CheckerError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },

    #[error("failed to execute {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Core(#[from] gpud_core::Error),
}
