//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use wlan_core::{Feature, Priority, ServiceConfig};

/// Daemon configuration. File: ~/.config/wlan/config.toml or /etc/wlan/config.toml.
/// Env overrides: WLAN_BRIDGE_SOCKET, WLAN_FORMATION_TIMEOUT_SECS, WLAN_LOG_LEVEL.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Socket of the bridge process (default /run/wlan/bridge.sock).
    #[serde(default = "default_bridge_socket")]
    pub bridge_socket: PathBuf,
    /// Socket the network helper hands out leases on (default /run/wlan/lease.sock).
    #[serde(default = "default_lease_socket")]
    pub lease_socket: PathBuf,
    /// Seconds a group formation, a join, an access-point start or a teardown may take
    /// (default 30).
    #[serde(default = "default_formation_timeout_secs")]
    pub formation_timeout_secs: u64,
    /// tracing filter directive, e.g. "info" or "wlan_core=debug" (default "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Upstream interface for tethering; unset means hotspots are local-only.
    #[serde(default)]
    pub upstream: Option<String>,
    #[serde(default)]
    pub priorities: Priorities,
}

/// Per-feature priority overrides, 0..=100. `station` applies to interfaces the bridge
/// registers with `RegisterExternal`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Priorities {
    pub station: Option<Priority>,
    pub tethering: Option<Priority>,
    pub local_only_hotspot: Option<Priority>,
    pub wifi_direct: Option<Priority>,
}

fn default_bridge_socket() -> PathBuf {
    PathBuf::from("/run/wlan/bridge.sock")
}
fn default_lease_socket() -> PathBuf {
    PathBuf::from("/run/wlan/lease.sock")
}
fn default_formation_timeout_secs() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bridge_socket: default_bridge_socket(),
            lease_socket: default_lease_socket(),
            formation_timeout_secs: default_formation_timeout_secs(),
            log_level: default_log_level(),
            upstream: None,
            priorities: Priorities::default(),
        }
    }
}

impl Config {
    pub fn service_config(&self) -> ServiceConfig {
        let mut service = ServiceConfig {
            formation_timeout: Duration::from_secs(self.formation_timeout_secs),
            upstream: self.upstream.clone(),
            ..ServiceConfig::default()
        };
        let overrides = [
            (Feature::Station, self.priorities.station),
            (Feature::Tethering, self.priorities.tethering),
            (Feature::LocalOnlyHotspot, self.priorities.local_only_hotspot),
            (Feature::WifiDirect, self.priorities.wifi_direct),
        ];
        for (feature, priority) in overrides {
            if let Some(p) = priority {
                service.priorities.insert(feature, p);
            }
        }
        service
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("WLAN_BRIDGE_SOCKET") {
        c.bridge_socket = PathBuf::from(s);
    }
    if let Some(s) = var("WLAN_FORMATION_TIMEOUT_SECS") {
        if let Ok(secs) = s.parse::<u64>() {
            c.formation_timeout_secs = secs;
        }
    }
    if let Some(s) = var("WLAN_LOG_LEVEL") {
        c.log_level = s;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/wlan/config.toml"));
    }
    out.push(PathBuf::from("/etc/wlan/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            return load_from(&p);
        }
    }
    None
}

/// First existing file wins; a file that fails to parse falls back to defaults.
fn load_from(path: &Path) -> Option<Config> {
    let s = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<Config>(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            eprintln!("ignoring {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn file_values_and_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "bridge_socket = \"/tmp/bridge.sock\"\nupstream = \"eth0\"\n\n[priorities]\nwifi_direct = 45\nstation = 70"
        )
        .unwrap();
        let c = load_from(file.path()).unwrap();
        assert_eq!(c.bridge_socket, PathBuf::from("/tmp/bridge.sock"));
        assert_eq!(c.lease_socket, default_lease_socket());
        assert_eq!(c.formation_timeout_secs, 30);
        assert_eq!(c.upstream.as_deref(), Some("eth0"));
        assert_eq!(c.priorities.wifi_direct, Some(45));

        let service = c.service_config();
        assert_eq!(service.priority_for(Feature::WifiDirect), 45);
        assert_eq!(service.priority_for(Feature::Tethering), 50);
        assert_eq!(service.priority_for(Feature::Station), 70);
        assert_eq!(service.upstream.as_deref(), Some("eth0"));
    }

    #[test]
    fn unknown_fields_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "proxy_port = 3128").unwrap();
        assert!(load_from(file.path()).is_none());
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("WLAN_BRIDGE_SOCKET", "/run/other.sock"),
            ("WLAN_FORMATION_TIMEOUT_SECS", "5"),
            ("WLAN_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(c.bridge_socket, PathBuf::from("/run/other.sock"));
        assert_eq!(c.log_level, "debug");
        assert_eq!(
            c.service_config().formation_timeout,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn bad_env_number_ignored() {
        let mut c = Config::default();
        apply_env(&mut c, |k| {
            (k == "WLAN_FORMATION_TIMEOUT_SECS").then(|| "soon".to_string())
        });
        assert_eq!(c.formation_timeout_secs, 30);
    }
}
