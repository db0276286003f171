//! Dynamic log-level control (spec §6 `set_log_level`).
//!
//! Wraps a `tracing_subscriber::reload::Handle` so a `SetLogLevel` request
//! from the control socket or the web UI actually reconfigures verbosity,
//! mirroring the original `log/log.py::_LogManager.set_level`, instead of
//! only logging that the request arrived.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::error::{Result, VelaError};

pub struct LogController {
    handle: reload::Handle<EnvFilter, Registry>,
    default_level: Mutex<String>,
    overrides: Mutex<HashMap<String, String>>,
}

impl LogController {
    pub fn new(handle: reload::Handle<EnvFilter, Registry>, default_level: String) -> Self {
        Self {
            handle,
            default_level: Mutex::new(default_level),
            overrides: Mutex::new(HashMap::new()),
        }
    }

    /// Applies `settings.loglevel`/`settings.loglevels` at startup.
    pub async fn apply_initial(&self, default_level: &str, overrides: &HashMap<String, String>) -> Result<()> {
        *self.default_level.lock().await = default_level.to_string();
        *self.overrides.lock().await = overrides.clone();
        self.apply().await
    }

    /// Sets one namespace's level at runtime, leaving every other namespace
    /// and the default level unchanged.
    pub async fn set_level(&self, namespace: &str, level: &str) -> Result<()> {
        self.overrides
            .lock()
            .await
            .insert(namespace.to_string(), level.to_string());
        self.apply().await
    }

    async fn apply(&self) -> Result<()> {
        let default_level = self.default_level.lock().await.clone();
        let overrides = self.overrides.lock().await.clone();

        let mut directive = default_level;
        for (namespace, level) in &overrides {
            directive.push(',');
            directive.push_str(&format!("{namespace}={level}"));
        }

        let filter = EnvFilter::try_new(&directive)
            .map_err(|e| VelaError::ConfigInvalid(format!("invalid log directive {directive:?}: {e}")))?;
        self.handle
            .reload(filter)
            .map_err(|e| VelaError::ConfigInvalid(format!("reloading log filter: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn controller(default_level: &str) -> LogController {
        let (layer, handle) = reload::Layer::new(EnvFilter::new(default_level));
        // Not installed as the global default: reload::Handle mutates its
        // own inner storage independent of whether its Layer is active,
        // which is all these tests need to exercise.
        let _ = tracing_subscriber::registry().with(layer);
        LogController::new(handle, default_level.to_string())
    }

    #[tokio::test]
    async fn set_level_accepts_a_namespace_override() {
        let controller = controller("warn");
        controller.set_level("vela_daemon::player", "debug").await.unwrap();
    }

    #[tokio::test]
    async fn set_level_rejects_an_invalid_directive() {
        let controller = controller("warn");
        assert!(controller.set_level("ns", "not-a-level!!").await.is_err());
    }

    #[tokio::test]
    async fn apply_initial_seeds_default_and_overrides() {
        let controller = controller("warn");
        let mut overrides = HashMap::new();
        overrides.insert("vela_daemon::agd".to_string(), "debug".to_string());
        controller.apply_initial("info", &overrides).await.unwrap();
    }
}
