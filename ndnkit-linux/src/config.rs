//! Load config from file and environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// Daemon configuration. File: ~/.config/ndnkit/config.toml or /etc/ndnkit/config.toml.
/// Env overrides: NDNKIT_PORT, NDNKIT_MULTICAST_GROUP, NDNKIT_LIFETIME_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP port shared by every node on the segment (default 56363).
    #[serde(default = "default_port")]
    pub port: u16,
    /// IPv4 multicast group (default 239.255.63.63).
    #[serde(default = "default_multicast_group")]
    pub multicast_group: String,
    /// Settings passed through to the core.
    #[serde(default)]
    pub core: ndnkit_core::Config,
}

fn default_port() -> u16 {
    56363
}
fn default_multicast_group() -> String {
    "239.255.63.63".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            multicast_group: default_multicast_group(),
            core: ndnkit_core::Config::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    checked(c)
}

/// Fall back to default core settings when the loaded ones are unusable.
fn checked(mut c: Config) -> Config {
    if let Err(e) = c.core.validate() {
        warn!(error = %e, "bad [core] settings, using defaults");
        c.core = ndnkit_core::Config::default();
    }
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("NDNKIT_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.port = p,
            Err(_) => warn!(value = %s, "ignoring bad NDNKIT_PORT"),
        }
    }
    if let Some(s) = var("NDNKIT_MULTICAST_GROUP") {
        c.multicast_group = s;
    }
    if let Some(s) = var("NDNKIT_LIFETIME_MS") {
        match s.parse::<u64>() {
            Ok(ms) => c.core.default_lifetime = Duration::from_millis(ms),
            Err(_) => warn!(value = %s, "ignoring bad NDNKIT_LIFETIME_MS"),
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/ndnkit/config.toml"));
    }
    out.push(PathBuf::from("/etc/ndnkit/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "bad config file, using defaults")
                    }
                },
                Err(e) => warn!(path = %p.display(), error = %e, "cannot read config file"),
            }
            break;
        }
    }
    None
}
