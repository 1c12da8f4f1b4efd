//! Configuration – reads/writes `~/.digiweight/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use digiweight_bridge::DEFAULT_ADDR;
use digiweight_client::ControllerConfig;
use digiweight_link::{DEFAULT_BAUD_RATE, LinkConfig};
use digiweight_types::{CalibrationSet, GyroOffset};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialise config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write config at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Persisted settings, every field defaulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address the bridge server listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Bridge root used by the client subcommands.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Substring matched against serial port descriptions.
    #[serde(default = "default_device_hint")]
    pub device_hint: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_status_timeout_ms")]
    pub status_timeout_ms: u64,

    /// Serve from the built-in simulator instead of hardware.
    #[serde(default)]
    pub offline: bool,

    /// Have the simulator emit periodic telemetry.
    #[serde(default)]
    pub simulate_telemetry: bool,

    #[serde(default)]
    pub gyro_offset: GyroOffset,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<CalibrationSet>,
}

fn default_bind_addr() -> SocketAddr {
    DEFAULT_ADDR
}
fn default_api_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_device_hint() -> String {
    LinkConfig::default().device_hint
}
fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}
fn default_poll_interval_ms() -> u64 {
    10
}
fn default_reconnect_interval_ms() -> u64 {
    1000
}
fn default_status_timeout_ms() -> u64 {
    2000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            api_url: default_api_url(),
            device_hint: default_device_hint(),
            baud_rate: default_baud_rate(),
            poll_interval_ms: default_poll_interval_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            status_timeout_ms: default_status_timeout_ms(),
            offline: false,
            simulate_telemetry: false,
            gyro_offset: GyroOffset::default(),
            calibration: None,
        }
    }
}

impl Config {
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            device_hint: self.device_hint.clone(),
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            status_timeout: Duration::from_millis(self.status_timeout_ms),
            gyro_offset: self.gyro_offset,
            calibration: self.calibration.clone().unwrap_or_default(),
        }
    }
}

/// Return the path to `~/.digiweight/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".digiweight").join("config.toml")
}

/// Load from `path`, or defaults when the file does not exist.  Environment
/// overrides are applied either way.
pub fn load_or_default(path: &Path) -> Result<Config, ConfigError> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the file at `path` as written.  `None` if it does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(cfg))
}

/// Apply `DIGIWEIGHT_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `DIGIWEIGHT_BIND_ADDR` | `bind_addr` |
/// | `DIGIWEIGHT_API_URL` | `api_url` |
/// | `DIGIWEIGHT_DEVICE_HINT` | `device_hint` |
/// | `DIGIWEIGHT_OFFLINE` | `offline` (`1`/`true`/`yes`) |
///
/// Unparsable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("DIGIWEIGHT_BIND_ADDR")
        && let Ok(addr) = v.parse::<SocketAddr>()
    {
        cfg.bind_addr = addr;
    }
    if let Ok(v) = std::env::var("DIGIWEIGHT_API_URL") {
        cfg.api_url = v;
    }
    if let Ok(v) = std::env::var("DIGIWEIGHT_DEVICE_HINT") {
        cfg.device_hint = v;
    }
    if let Ok(v) = std::env::var("DIGIWEIGHT_OFFLINE")
        && let Some(flag) = parse_flag(&v)
    {
        cfg.offline = flag;
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Save to `path`, creating the parent directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(write_err)?;
        }
    }
    let raw = toml::to_string_pretty(cfg)?;

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use digiweight_types::Vector3;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .expect("dir metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_with_calibration() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg = Config {
            baud_rate: 57_600,
            simulate_telemetry: true,
            calibration: Some(CalibrationSet {
                flat: Some(Vector3::new(0.0, 0.0, 512.0)),
                up: Some(Vector3::new(512.0, 0.0, 0.0)),
                ..CalibrationSet::default()
            }),
            ..Config::default()
        };
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "offline = true\n[gyro_offset]\nx = 1.0\ny = 2.0\nz = 3.0\n").unwrap();

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert!(cfg.offline);
        assert_eq!(cfg.gyro_offset, GyroOffset { x: 1.0, y: 2.0, z: 3.0 });
        assert_eq!(cfg.baud_rate, 115_200);
        assert_eq!(cfg.device_hint, "USB Serial Device");
        assert_eq!(cfg.bind_addr, DEFAULT_ADDR);
        assert_eq!(cfg.calibration, None);
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "baud_rate = \"fast\"\n").unwrap();
        assert!(matches!(load_from(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn config_path_points_to_digiweight_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".digiweight"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn derived_link_and_controller_configs() {
        let cfg = Config {
            reconnect_interval_ms: 250,
            status_timeout_ms: 500,
            ..Config::default()
        };
        let link = cfg.link_config();
        assert_eq!(link.reconnect_interval, Duration::from_millis(250));
        assert_eq!(link.poll_interval, Duration::from_millis(10));
        let controller = cfg.controller_config();
        assert_eq!(controller.status_timeout, Duration::from_millis(500));
        assert!(!controller.calibration.is_complete());
    }

    #[test]
    fn apply_env_overrides_changes_api_url() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("DIGIWEIGHT_API_URL", "http://rig:8000") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.api_url, "http://rig:8000");
        unsafe { std::env::remove_var("DIGIWEIGHT_API_URL") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_bind_addr() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("DIGIWEIGHT_BIND_ADDR", "not-an-addr") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.bind_addr, DEFAULT_ADDR);
        unsafe { std::env::remove_var("DIGIWEIGHT_BIND_ADDR") };
    }

    #[test]
    fn apply_env_overrides_parses_offline_flag() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("DIGIWEIGHT_OFFLINE", "yes") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert!(cfg.offline);
        unsafe { std::env::remove_var("DIGIWEIGHT_OFFLINE") };
    }

    #[test]
    fn flag_parsing() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
