//! Daemon configuration: defaults, then the config file, then environment.
//!
//! File: ~/.config/peer-upgrade/config.toml or /etc/peer-upgrade/config.toml
//! (the first one that exists). Env overrides: PEER_UPGRADE_PORT,
//! PEER_UPGRADE_DISCOVERY_PORT, PEER_UPGRADE_DISCOVERY_KEY,
//! PEER_UPGRADE_STORAGE_DIR.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use semver::Version;
use serde::Deserialize;

use crate::discovery::DiscoveryOptions;
use crate::error::{Error, Result};
use crate::manager::ManagerOptions;
use crate::storage::{StoreOptions, DEFAULT_ARCH, DEFAULT_PLATFORM};
use crate::transport::DEFAULT_DISCOVERY_PORT;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Installer HTTP port (default 0: any free port, announced to peers).
    #[serde(default)]
    pub port: u16,
    /// Multicast discovery UDP port (default 45461).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Required. Only peers announcing the same key are queried.
    #[serde(default)]
    pub discovery_key: Option<String>,
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default = "default_arch")]
    pub arch: Vec<String>,
    /// The installer this device runs, served to peers.
    #[serde(default)]
    pub apk_path: Option<PathBuf>,
    #[serde(default)]
    pub apk_version: Option<Version>,
    #[serde(default = "default_lookup_interval_ms")]
    pub lookup_interval_ms: u64,
    #[serde(default = "default_emit_throttle_ms")]
    pub emit_throttle_ms: u64,
    #[serde(default = "default_peer_ttl_ms")]
    pub peer_ttl_ms: u64,
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}
fn default_storage_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share/peer-upgrade"),
        None => PathBuf::from("/var/lib/peer-upgrade"),
    }
}
fn default_platform() -> String {
    DEFAULT_PLATFORM.to_string()
}
fn default_arch() -> Vec<String> {
    vec![DEFAULT_ARCH.to_string()]
}
fn default_lookup_interval_ms() -> u64 {
    2000
}
fn default_emit_throttle_ms() -> u64 {
    5000
}
fn default_peer_ttl_ms() -> u64 {
    4000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 0,
            discovery_port: default_discovery_port(),
            discovery_key: None,
            storage_dir: default_storage_dir(),
            platform: default_platform(),
            arch: default_arch(),
            apk_path: None,
            apk_version: None,
            lookup_interval_ms: default_lookup_interval_ms(),
            emit_throttle_ms: default_emit_throttle_ms(),
            peer_ttl_ms: default_peer_ttl_ms(),
        }
    }
}

impl Config {
    /// Options for the upgrade manager. The discovery key must be set.
    pub fn manager_options(&self) -> Result<ManagerOptions> {
        let key = self
            .discovery_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Config("discovery_key is required".to_string()))?;
        if self.apk_path.is_some() != self.apk_version.is_some() {
            return Err(Error::Config(
                "apk_path and apk_version must be set together".to_string(),
            ));
        }
        let discovery = DiscoveryOptions {
            installer_emit_throttle: Duration::from_millis(self.emit_throttle_ms),
            lookup_interval: Duration::from_millis(self.lookup_interval_ms),
            peer_ttl: Duration::from_millis(self.peer_ttl_ms),
            ..DiscoveryOptions::new(key)
        };
        let store = StoreOptions::new(&self.storage_dir)
            .with_platform(self.platform.clone(), self.arch.clone())
            .with_current_version(self.apk_version.clone().unwrap_or(Version::new(0, 0, 0)));
        Ok(ManagerOptions {
            port: self.port,
            discovery,
            store,
        })
    }
}

/// Load config: defaults, then the first config file found, then env vars.
pub fn load() -> Result<Config> {
    load_from(&config_paths(), |name| std::env::var(name).ok())
}

fn load_from(paths: &[PathBuf], env: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let mut c = match paths.iter().find(|p| p.exists()) {
        Some(path) => load_file(path)?,
        None => Config::default(),
    };
    if let Some(s) = env("PEER_UPGRADE_PORT") {
        c.port = parse_env("PEER_UPGRADE_PORT", &s)?;
    }
    if let Some(s) = env("PEER_UPGRADE_DISCOVERY_PORT") {
        c.discovery_port = parse_env("PEER_UPGRADE_DISCOVERY_PORT", &s)?;
    }
    if let Some(s) = env("PEER_UPGRADE_DISCOVERY_KEY") {
        c.discovery_key = Some(s);
    }
    if let Some(s) = env("PEER_UPGRADE_STORAGE_DIR") {
        c.storage_dir = PathBuf::from(s);
    }
    Ok(c)
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{name}: invalid value {value:?}")))
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peer-upgrade/config.toml"));
    }
    out.push(PathBuf::from("/etc/peer-upgrade/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config> {
    let s = std::fs::read_to_string(path)?;
    toml::from_str(&s).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_without_file() {
        let c = load_from(&[PathBuf::from("/nonexistent/peer-upgrade.toml")], no_env).unwrap();
        assert_eq!(c.port, 0);
        assert_eq!(c.discovery_port, DEFAULT_DISCOVERY_PORT);
        assert_eq!(c.lookup_interval_ms, 2000);
        assert_eq!(c.emit_throttle_ms, 5000);
        assert_eq!(c.peer_ttl_ms, 4000);
        assert!(matches!(c.manager_options(), Err(Error::Config(_))));
    }

    #[test]
    fn file_then_env() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
port = 8080
discovery_key = "from-file"
apk_path = "/data/app/base.apk"
apk_version = "2.1.0"
arch = ["arm64-v8a", "armeabi-v7a"]
"#,
        )
        .unwrap();
        let env: HashMap<&str, &str> = [
            ("PEER_UPGRADE_PORT", "9090"),
            ("PEER_UPGRADE_STORAGE_DIR", "/tmp/installers"),
        ]
        .into_iter()
        .collect();
        let c = load_from(&[path], |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.port, 9090);
        assert_eq!(c.discovery_key.as_deref(), Some("from-file"));
        assert_eq!(c.storage_dir, PathBuf::from("/tmp/installers"));

        let options = c.manager_options().unwrap();
        assert_eq!(options.port, 9090);
        assert_eq!(options.discovery.discovery_key, "from-file");
        assert_eq!(options.store.current_version, Version::new(2, 1, 0));
        assert_eq!(options.store.arch.len(), 2);
    }

    #[test]
    fn rejects_unknown_keys_and_bad_env() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "proxy_port = 3128\n").unwrap();
        assert!(matches!(load_from(&[path], no_env), Err(Error::Config(_))));

        let result = load_from(&[], |k| {
            (k == "PEER_UPGRADE_DISCOVERY_PORT").then(|| "not-a-port".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn apk_path_needs_version() {
        let c = Config {
            discovery_key: Some("k".to_string()),
            apk_path: Some(PathBuf::from("/data/app/base.apk")),
            ..Config::default()
        };
        assert!(matches!(c.manager_options(), Err(Error::Config(_))));
    }
}
