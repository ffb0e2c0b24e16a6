
use serde::Deserialize;
use anyhow::{Context, Result};
use std::{fs, path::{Path, PathBuf}, time::Duration};

/// Settings of the console itself. The daemon's own configuration lives in
/// `daemon_config` and is handled by [`crate::daemon_conf`].
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_daemon_config")]
    pub daemon_config: PathBuf,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    #[serde(default = "default_locale_dir")]
    pub locale_dir: PathBuf,
    /// Directory with the web UI assets; not served when missing.
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_reload_command")]
    pub reload_command: Vec<String>,
    #[serde(default = "default_restart_command")]
    pub restart_command: Vec<String>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let s = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path))?;
        let cfg: Config = toml::from_str(&s)
            .with_context(|| format!("invalid TOML in {}", path))?;
        Ok(cfg)
    }

    /// Loads `path` when given, otherwise falls back to the built-in defaults.
    pub fn load_or_default(path: Option<&str>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn has_static_dir(&self) -> bool {
        Path::new(&self.static_dir).is_dir()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon_config: default_daemon_config(),
            log_file: default_log_file(),
            locale_dir: default_locale_dir(),
            static_dir: default_static_dir(),
            base_path: default_base_path(),
            poll_interval_ms: default_poll_interval_ms(),
            reload_command: default_reload_command(),
            restart_command: default_restart_command(),
        }
    }
}

fn default_daemon_config() -> PathBuf { PathBuf::from("/etc/deeprotection/deeprotection.conf") }
fn default_log_file() -> PathBuf { PathBuf::from("/var/log/deeprotection.log") }
fn default_locale_dir() -> PathBuf { PathBuf::from("/usr/share/locale/deeprotection") }
fn default_static_dir() -> PathBuf { PathBuf::from("/usr/share/deeprotection/web") }
fn default_base_path() -> String { "/api".to_string() }
fn default_poll_interval_ms() -> u64 { 500 }
fn default_reload_command() -> Vec<String> { vec!["dplauncher".into(), "--reload".into()] }
fn default_restart_command() -> Vec<String> {
    vec!["systemctl".into(), "restart".into(), "deeprotection".into()]
}
