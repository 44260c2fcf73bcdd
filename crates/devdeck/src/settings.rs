use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;

const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;
const DEFAULT_SSH_KEEPALIVE_SECS: u64 = 30;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn clamp_poll_interval_ms(v: u64) -> u64 {
    v.clamp(250, 10 * 60 * 1000)
}

/// Optional on-disk overrides, `<data_root>/settings.toml`.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct FileSettings {
    default_poll_interval_ms: Option<u64>,
    ssh_program: Option<String>,
    ssh_server_alive_interval_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub data_root: PathBuf,
    pub default_poll_interval: Duration,
    pub ssh_program: String,
    pub ssh_server_alive_interval_secs: u64,
}

impl Settings {
    pub fn load() -> anyhow::Result<Self> {
        let data_root = match env_string("DEVDECK_DATA_ROOT") {
            Some(v) => PathBuf::from(v),
            None => default_data_root()?,
        };
        Self::load_from(data_root)
    }

    pub fn load_from(data_root: PathBuf) -> anyhow::Result<Self> {
        let file = read_file_settings(&data_root.join("settings.toml"))?;

        let poll_ms = env_u64("DEVDECK_POLL_INTERVAL_MS")
            .or(file.default_poll_interval_ms)
            .map(clamp_poll_interval_ms)
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        let ssh_program = env_string("DEVDECK_SSH")
            .or(file.ssh_program)
            .unwrap_or_else(|| "ssh".to_string());
        let keepalive = env_u64("DEVDECK_SSH_KEEPALIVE_SECS")
            .or(file.ssh_server_alive_interval_secs)
            .map(|v| v.min(3600))
            .unwrap_or(DEFAULT_SSH_KEEPALIVE_SECS);

        Ok(Self {
            data_root,
            default_poll_interval: Duration::from_millis(poll_ms),
            ssh_program,
            ssh_server_alive_interval_secs: keepalive,
        })
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_root.join("devdeck.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_root.join("logs")
    }
}

fn default_data_root() -> anyhow::Result<PathBuf> {
    directories::ProjectDirs::from("", "", "devdeck")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| anyhow::anyhow!("cannot determine config directory (set DEVDECK_DATA_ROOT)"))
}

fn read_file_settings(path: &Path) -> anyhow::Result<FileSettings> {
    let text = match std::fs::read_to_string(path) {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(FileSettings::default()),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    toml::from_str(&text).with_context(|| format!("parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_interval_is_clamped() {
        assert_eq!(clamp_poll_interval_ms(1), 250);
        assert_eq!(clamp_poll_interval_ms(5000), 5000);
        assert_eq!(clamp_poll_interval_ms(u64::MAX), 600_000);
    }

    #[test]
    fn file_settings_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("settings.toml"),
            "default_poll_interval_ms = 1500\nssh_program = \"/usr/local/bin/ssh\"\n",
        )
        .unwrap();

        let s = Settings::load_from(dir.path().to_path_buf()).unwrap();
        // Env overrides are not set in tests; file values win over defaults.
        if std::env::var("DEVDECK_POLL_INTERVAL_MS").is_err() {
            assert_eq!(s.default_poll_interval, Duration::from_millis(1500));
        }
        if std::env::var("DEVDECK_SSH").is_err() {
            assert_eq!(s.ssh_program, "/usr/local/bin/ssh");
        }
        assert_eq!(s.store_path(), dir.path().join("devdeck.json"));
    }

    #[test]
    fn missing_settings_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::load_from(dir.path().to_path_buf()).unwrap();
        if std::env::var("DEVDECK_SSH").is_err() {
            assert_eq!(s.ssh_program, "ssh");
        }
        assert_eq!(s.log_dir(), dir.path().join("logs"));
    }

    #[test]
    fn malformed_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("settings.toml"), "default_poll_interval_ms = [").unwrap();
        let err = Settings::load_from(dir.path().to_path_buf()).unwrap_err();
        assert!(err.to_string().contains("settings.toml"));
    }
}
