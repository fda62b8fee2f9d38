//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use modlink_core::{HostInfo, ModuleVersion, RetentionPolicy, Role};
use serde::Deserialize;

/// Node configuration. File: ~/.config/modlink/config.toml or /etc/modlink/config.toml.
/// Env overrides: MODLINK_ROLE, MODLINK_LISTEN_PORT, MODLINK_CONNECT_ADDR, MODLINK_MANIFEST,
/// MODLINK_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// `host` listens, `participant` connects to `connect_addr`.
    #[serde(default = "default_role")]
    pub role: Role,
    /// Host listen port (default 2456).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Host to join when running as participant.
    #[serde(default)]
    pub connect_addr: Option<SocketAddr>,
    /// Module manifest; no manifest means no modules.
    #[serde(default)]
    pub manifest_path: Option<PathBuf>,
    /// Name sent in the handshake.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_host_version")]
    pub host_version: String,
    #[serde(default = "default_network_protocol_version")]
    pub network_protocol_version: u32,
    #[serde(default)]
    pub freeform_version: String,
    #[serde(default)]
    pub retention: RetentionPolicy,
    /// How long a host waits for the participant's handshake (default 5000).
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Default tracing filter; RUST_LOG wins when set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_role() -> Role {
    Role::Host
}
fn default_listen_port() -> u16 {
    2456
}
fn default_name() -> String {
    "modlink".to_string()
}
fn default_host_version() -> String {
    "0.1.0".to_string()
}
fn default_network_protocol_version() -> u32 {
    1
}
fn default_handshake_timeout_ms() -> u64 {
    5000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: default_role(),
            listen_port: default_listen_port(),
            connect_addr: None,
            manifest_path: None,
            name: default_name(),
            host_version: default_host_version(),
            network_protocol_version: default_network_protocol_version(),
            freeform_version: String::new(),
            retention: RetentionPolicy::default(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Host metadata advertised with the module inventory.
    pub fn host_info(&self) -> anyhow::Result<HostInfo> {
        let version: ModuleVersion = self
            .host_version
            .parse()
            .context("host_version in config")?;
        Ok(HostInfo {
            version,
            network_protocol_version: self.network_protocol_version,
            freeform_version: self.freeform_version.clone(),
        })
    }

    pub fn handshake_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Load config: default, then the first config file that exists, then env vars.
pub fn load() -> anyhow::Result<Config> {
    load_from(&config_paths(), |k| std::env::var(k).ok())
}

fn load_from(
    paths: &[PathBuf],
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Config> {
    let mut c = match paths.iter().find(|p| p.exists()) {
        Some(p) => load_file(p)?,
        None => Config::default(),
    };
    if let Some(s) = env("MODLINK_ROLE") {
        c.role = match s.as_str() {
            "host" => Role::Host,
            "participant" => Role::Participant,
            other => anyhow::bail!("MODLINK_ROLE must be host or participant, got {other:?}"),
        };
    }
    if let Some(s) = env("MODLINK_LISTEN_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.listen_port = p;
        }
    }
    if let Some(s) = env("MODLINK_CONNECT_ADDR") {
        c.connect_addr = Some(
            s.parse()
                .with_context(|| format!("MODLINK_CONNECT_ADDR {s:?}"))?,
        );
    }
    if let Some(s) = env("MODLINK_MANIFEST") {
        c.manifest_path = Some(PathBuf::from(s));
    }
    if let Some(s) = env("MODLINK_LOG") {
        c.log_level = s;
    }
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/modlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/modlink/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}
