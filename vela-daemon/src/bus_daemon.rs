//! Private session bus lifecycle (spec §4.4).
//!
//! Grounded on the original `main.py` (checks `DBUS_SESSION_BUS_ADDRESS`,
//! otherwise spawns a private `dbus-daemon --session --print-address`) and
//! on [`crate::process`] for the spawn/reap mechanics.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::info;

use crate::error::{Result, VelaError};

pub enum BusDaemon {
    /// Reused an already-running session bus, found via the environment.
    External { address: String },
    /// Spawned a private instance; kept alive for the lifetime of this value.
    Owned {
        address: String,
        child: Child,
    },
}

impl BusDaemon {
    pub fn address(&self) -> &str {
        match self {
            BusDaemon::External { address } => address,
            BusDaemon::Owned { address, .. } => address,
        }
    }

    /// Uses `DBUS_SESSION_BUS_ADDRESS` if already set, otherwise spawns
    /// `dbus_daemon_bin --session --print-address --nofork` and parses its
    /// first stdout line as the bus address (spec §4.4).
    pub async fn acquire(dbus_daemon_bin: &str) -> Result<Self> {
        if let Ok(address) = std::env::var("DBUS_SESSION_BUS_ADDRESS") {
            if !address.is_empty() {
                info!(address, "reusing existing session bus");
                return Ok(BusDaemon::External { address });
            }
        }

        let mut command = Command::new(dbus_daemon_bin);
        command
            .args(["--session", "--print-address", "--nofork"])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null());

        let mut child = command.spawn().map_err(|e| VelaError::ChildSpawnFailed {
            program: dbus_daemon_bin.to_string(),
            source: e,
        })?;

        let stdout = child.stdout.take().ok_or_else(|| VelaError::BusUnreachable(
            "dbus-daemon produced no stdout".into(),
        ))?;
        let mut lines = BufReader::new(stdout).lines();

        let address = timeout(Duration::from_secs(5), lines.next_line())
            .await
            .map_err(|_| VelaError::BusUnreachable("dbus-daemon did not print an address in time".into()))?
            .map_err(|e| VelaError::BusUnreachable(format!("reading dbus-daemon stdout: {e}")))?
            .ok_or_else(|| VelaError::BusUnreachable("dbus-daemon closed stdout without printing an address".into()))?;

        if address.is_empty() {
            return Err(VelaError::BusUnreachable("dbus-daemon printed an empty address".into()));
        }

        std::env::set_var("DBUS_SESSION_BUS_ADDRESS", &address);
        info!(address, "spawned private session bus");

        Ok(BusDaemon::Owned { address, child })
    }

    /// Terminates an owned daemon; a no-op for a reused external one.
    pub async fn shutdown(self) {
        if let BusDaemon::Owned { mut child, .. } = self {
            if let Some(pid) = child.id() {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGTERM,
                );
            }
            let _ = timeout(Duration::from_secs(2), child.wait()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reuses_existing_session_bus_address() {
        std::env::set_var("DBUS_SESSION_BUS_ADDRESS", "unix:path=/tmp/test-bus-socket");
        let daemon = BusDaemon::acquire("dbus-daemon").await.unwrap();
        assert_eq!(daemon.address(), "unix:path=/tmp/test-bus-socket");
        assert!(matches!(daemon, BusDaemon::External { .. }));
        std::env::remove_var("DBUS_SESSION_BUS_ADDRESS");
    }
}
