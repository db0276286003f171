//! Startup configuration (spec §6 "Configuration").
//!
//! Read once at process start and never reloaded. Grounded on the original
//! `main.py::load_settings` (JSON document, relative level folders resolved
//! against the executable's directory) and on the teacher's
//! `orchestration::Config::load` for the "parse, validate, default" shape.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, VelaError};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
    #[serde(default)]
    pub loglevels: HashMap<String, String>,
    pub environment: EnvironmentConfig,
    pub levels: HashMap<String, LevelConfig>,
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
}

fn default_loglevel() -> String {
    "warn".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentConfig {
    pub dbus_daemon_bin: String,
    pub omxplayer_bin: String,
    pub ld_library_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LevelConfig {
    pub folder: PathBuf,
    #[serde(with = "humantime_serde")]
    pub fadein: std::time::Duration,
    #[serde(with = "humantime_serde")]
    pub fadeout: std::time::Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InputConfig {
    Serial {
        port: String,
        #[serde(default = "default_baud")]
        baud: u32,
    },
    Hid {
        device: PathBuf,
        #[serde(default = "default_hid_scale")]
        scale: f64,
        #[serde(default)]
        offset: f64,
        #[serde(default = "default_hid_interval_ms")]
        interval_ms: u64,
    },
    Network {
        #[serde(default = "default_network_bind")]
        bind: String,
    },
    Web {
        #[serde(default = "default_web_bind")]
        bind: String,
    },
}

fn default_baud() -> u32 {
    9600
}
fn default_hid_scale() -> f64 {
    1.0
}
fn default_hid_interval_ms() -> u64 {
    100
}
fn default_network_bind() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_web_bind() -> String {
    "0.0.0.0:9091".to_string()
}

impl Settings {
    /// Load and validate the settings file, resolving relative level folders
    /// against `base_dir` (the executable's directory, per the original).
    pub fn load(path: &Path, base_dir: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| VelaError::ConfigInvalid(format!("reading {path:?}: {e}")))?;
        let mut settings: Settings = serde_json::from_str(&content)
            .map_err(|e| VelaError::ConfigInvalid(format!("parsing {path:?}: {e}")))?;

        if settings.levels.is_empty() {
            return Err(VelaError::ConfigInvalid(
                "settings.levels must define at least one level".into(),
            ));
        }

        for (key, level) in settings.levels.iter_mut() {
            key.parse::<u32>()
                .map_err(|_| VelaError::ConfigInvalid(format!("level key {key:?} is not an integer")))?;
            if !level.folder.is_absolute() {
                level.folder = base_dir.join(&level.folder);
            }
        }

        for input in &settings.inputs {
            input.validate()?;
        }

        Ok(settings)
    }

    /// Ordered (0..N) level numbers this configuration defines.
    pub fn level_numbers(&self) -> Vec<u32> {
        let mut numbers: Vec<u32> = self
            .levels
            .keys()
            .map(|k| k.parse::<u32>().expect("validated in load()"))
            .collect();
        numbers.sort_unstable();
        numbers
    }

    pub fn level(&self, number: u32) -> Option<&LevelConfig> {
        self.levels.get(&number.to_string())
    }
}

impl InputConfig {
    fn validate(&self) -> Result<()> {
        match self {
            InputConfig::Serial { port, .. } if port.is_empty() => Err(VelaError::ConfigInvalid(
                "serial input requires a non-empty port".into(),
            )),
            InputConfig::Hid { device, .. } if device.as_os_str().is_empty() => {
                Err(VelaError::ConfigInvalid(
                    "hid input requires a non-empty device path".into(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Scans a level's folder for playable media files, matching the original's
/// implicit "discover videos at startup" behaviour. Any regular file counts;
/// decoding format validation is delegated to the external player process.
pub fn discover_media(folder: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(folder).map_err(|e| VelaError::ConfigInvalid(format!(
        "reading level folder {folder:?}: {e}"
    )))?;

    let mut files = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_settings(dir: &Path, json: &str) -> PathBuf {
        let path = dir.join("settings.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(json.as_bytes()).unwrap();
        path
    }

    #[test]
    fn relative_level_folders_resolve_against_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("media0")).unwrap();
        let json = r#"{
            "environment": {"dbus_daemon_bin": "dbus-daemon", "omxplayer_bin": "omxplayer.bin"},
            "levels": {"0": {"folder": "media0", "fadein": "1s", "fadeout": "1s"}}
        }"#;
        let path = write_settings(dir.path(), json);
        let settings = Settings::load(&path, dir.path()).unwrap();
        assert_eq!(settings.level(0).unwrap().folder, dir.path().join("media0"));
    }

    #[test]
    fn missing_levels_is_config_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let json = r#"{
            "environment": {"dbus_daemon_bin": "dbus-daemon", "omxplayer_bin": "omxplayer.bin"},
            "levels": {}
        }"#;
        let path = write_settings(dir.path(), json);
        assert!(matches!(
            Settings::load(&path, dir.path()),
            Err(VelaError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn level_numbers_are_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::create_dir_all(dir.path().join("b")).unwrap();
        let json = r#"{
            "environment": {"dbus_daemon_bin": "dbus-daemon", "omxplayer_bin": "omxplayer.bin"},
            "levels": {
                "2": {"folder": "a", "fadein": "1s", "fadeout": "1s"},
                "0": {"folder": "b", "fadein": "1s", "fadeout": "1s"}
            }
        }"#;
        let path = write_settings(dir.path(), json);
        let settings = Settings::load(&path, dir.path()).unwrap();
        assert_eq!(settings.level_numbers(), vec![0, 2]);
    }
}
