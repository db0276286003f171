//! Error kinds for the daemon (spec §7).
//!
//! Startup errors (`ConfigInvalid`, `ChildSpawnFailed`, `DeviceOpenFailed`)
//! propagate out of `start()` and map to the process exit codes in spec §6.
//! Steady-state errors (`BusUnreachable`/`BusDisconnected`,
//! `RemoteCallFailed`/`RemoteCallTimeout`) are contained at the subsystem
//! boundary and only ever logged from there on.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum VelaError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("level {level} folder has no usable media: {folder}")]
    EmptyMediaFolder { level: u32, folder: PathBuf },

    #[error("failed to spawn child process {program}: {source}")]
    ChildSpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("session bus unreachable: {0}")]
    BusUnreachable(String),

    #[error("session bus disconnected")]
    BusDisconnected,

    #[error("remote call {method} failed: {source}")]
    RemoteCallFailed {
        method: String,
        #[source]
        source: zbus::Error,
    },

    #[error("remote call {method} timed out after {elapsed_ms}ms")]
    RemoteCallTimeout { method: String, elapsed_ms: u64 },

    #[error("input adapter {name} failed to open its device: {reason}")]
    DeviceOpenFailed { name: String, reason: String },
}

pub type Result<T> = std::result::Result<T, VelaError>;
