//! Load config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use skiff_core::TransferConfig;
use tracing::warn;

/// Host configuration. File: ~/.config/skiff/config.toml or /etc/skiff/config.toml.
/// Env overrides: SKIFF_RELAY_ADDR, SKIFF_RELAY_BIND, SKIFF_TRANSPORT_PORT, SKIFF_DOWNLOAD_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Relay the endpoints connect to (default 127.0.0.1:7878).
    #[serde(default = "default_relay_addr")]
    pub relay_addr: String,
    /// Where `skiff relay` listens (default 0.0.0.0:7878).
    #[serde(default = "default_relay_bind")]
    pub relay_bind: String,
    /// Origin's transport listener port; 0 picks an ephemeral port.
    #[serde(default)]
    pub transport_port: u16,
    /// Received files land here (default: current directory).
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Write large files straight to disk instead of holding them in memory.
    #[serde(default = "default_true")]
    pub stream_large_files: bool,
    /// Ask on the terminal before opening a streamed save target.
    #[serde(default)]
    pub prompt_before_streaming: bool,
    #[serde(default)]
    pub transfer: TransferConfig,
}

fn default_relay_addr() -> String {
    "127.0.0.1:7878".to_string()
}
fn default_relay_bind() -> String {
    "0.0.0.0:7878".to_string()
}
fn default_download_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_addr: default_relay_addr(),
            relay_bind: default_relay_bind(),
            transport_port: 0,
            download_dir: default_download_dir(),
            stream_large_files: true,
            prompt_before_streaming: false,
            transfer: TransferConfig::default(),
        }
    }
}

/// Load config: default, then config file, then env vars.
/// An explicit path must exist and parse; the default locations are best effort.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => read(path)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

fn read(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("SKIFF_RELAY_ADDR") {
        c.relay_addr = s;
    }
    if let Some(s) = var("SKIFF_RELAY_BIND") {
        c.relay_bind = s;
    }
    if let Some(s) = var("SKIFF_TRANSPORT_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.transport_port = p,
            Err(_) => warn!(value = %s, "Ignoring invalid SKIFF_TRANSPORT_PORT"),
        }
    }
    if let Some(s) = var("SKIFF_DOWNLOAD_DIR") {
        c.download_dir = PathBuf::from(s);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/skiff/config.toml"));
    }
    out.push(PathBuf::from("/etc/skiff/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match read(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(error = %format!("{e:#}"), "Falling back to default config");
            None
        }
    }
}
