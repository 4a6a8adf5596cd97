//! Load config from file and environment.

use bridge_core::BridgeConfig;
use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/bridge/config.toml or /etc/bridge/config.toml.
/// Env overrides: BRIDGE_LISTEN_PORT, BRIDGE_ASYNC_MODE, BRIDGE_HIGH_WATERMARK,
/// BRIDGE_PULL_CHUNK, BRIDGE_LOG_LEVEL.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// HTTP listen port on localhost (default 8088).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Bytes asked for per resume_data call on async streams (default 16384).
    #[serde(default = "default_pull_chunk")]
    pub pull_chunk: u64,
    /// Filter used when RUST_LOG is unset (default "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

fn default_listen_port() -> u16 {
    8088
}
fn default_pull_chunk() -> u64 {
    16 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            pull_chunk: default_pull_chunk(),
            log_level: default_log_level(),
            bridge: BridgeConfig::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("BRIDGE_LISTEN_PORT").and_then(|s| s.parse().ok()) {
        c.listen_port = p;
    }
    if let Some(v) = var("BRIDGE_ASYNC_MODE").and_then(|s| parse_bool(&s)) {
        c.bridge.async_mode = v;
    }
    if let Some(n) = var("BRIDGE_HIGH_WATERMARK").and_then(|s| s.parse().ok()) {
        c.bridge.high_watermark = n;
    }
    if let Some(n) = var("BRIDGE_PULL_CHUNK").and_then(|s| s.parse().ok()) {
        c.pull_chunk = n;
    }
    if let Some(l) = var("BRIDGE_LOG_LEVEL") {
        c.log_level = l;
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/bridge/config.toml"));
    }
    out.push(PathBuf::from("/etc/bridge/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p)
                .map_err(|e| e.to_string())
                .and_then(|s| toml::from_str::<Config>(&s).map_err(|e| e.to_string()))
            {
                Ok(c) => return Some(c),
                Err(e) => eprintln!("ignoring {}: {e}", p.display()),
            }
            break;
        }
    }
    None
}
