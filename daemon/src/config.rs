//! Daemon configuration: `config.yaml` plus `EBPF_*` environment overrides.

use std::collections::HashSet;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

const DEFAULT_CONFIG_FILE: &str = "config.yaml";
const AUTH_TOKEN_LENGTH: usize = 18;

/// Abuse tracker settings, consumed by the HTTP security middleware.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SecurityConfig {
    /// Errors allowed per client IP before it is blacklisted.
    pub ip_error_threshold: u32,
    /// Window for counting errors, in seconds.
    pub error_window: u64,
}

impl Default for SecurityConfig {
    fn default() -> SecurityConfig {
        SecurityConfig {
            ip_error_threshold: 10,
            error_window: 86_400,
        }
    }
}

/// Request rate limiting, consumed by the HTTP middleware.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RateLimitConfig {
    pub request: u32,
    /// Interval for the request budget, in seconds.
    pub interval: u64,
}

impl Default for RateLimitConfig {
    fn default() -> RateLimitConfig {
        RateLimitConfig {
            request: 120,
            interval: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AppConfig {
    /// Bearer token for the HTTP API; generated and logged when empty.
    pub auth: String,
    /// Interface to monitor; empty picks the first usable interface.
    pub interface: String,
    /// HTTP listen address, e.g. `:5678` or `127.0.0.1:5678`.
    pub addr: String,
    /// Base directory for all persisted state.
    pub data_dir: PathBuf,
    /// MaxMind GeoLite2 City database path, relative to `data-dir`.
    pub geoip_path: String,
    /// Pre-built XDP object file loaded at startup.
    pub bpf_object: PathBuf,
    /// Minutes between metrics snapshots; zero disables persistence.
    pub metrics_persist_interval: u64,
    /// How long packet data is retained, in hours.
    pub retention_hours: u64,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
}

impl Default for AppConfig {
    fn default() -> AppConfig {
        AppConfig {
            auth: String::new(),
            interface: String::new(),
            addr: ":5678".to_string(),
            data_dir: PathBuf::from("./data"),
            geoip_path: "GeoLite2-City.mmdb".to_string(),
            bpf_object: PathBuf::from("xdp_firewall.o"),
            metrics_persist_interval: 10,
            retention_hours: 720,
            security: SecurityConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl AppConfig {
    /// Read the config file (if present), apply environment overrides,
    /// and validate. Fatal configuration problems surface here, at boot.
    pub fn load(path: Option<&Path>) -> Result<AppConfig> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            info!("no config file found, using default values");
            AppConfig::default()
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        fn var(key: &str) -> Option<String> {
            std::env::var(key).ok().filter(|value| !value.is_empty())
        }
        fn numeric<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
            match var(key) {
                Some(value) => value
                    .parse::<T>()
                    .map(Some)
                    .map_err(|_| anyhow::anyhow!("invalid value for {key}: {value}")),
                None => Ok(None),
            }
        }

        if let Some(value) = var("EBPF_AUTH") {
            self.auth = value;
        }
        if let Some(value) = var("EBPF_INTERFACE") {
            self.interface = value;
        }
        if let Some(value) = var("EBPF_ADDR") {
            self.addr = value;
        }
        if let Some(value) = var("EBPF_DATA_DIR") {
            self.data_dir = value.into();
        }
        if let Some(value) = var("EBPF_GEOIP_PATH") {
            self.geoip_path = value;
        }
        if let Some(value) = var("EBPF_BPF_OBJECT") {
            self.bpf_object = value.into();
        }
        if let Some(value) = numeric("EBPF_METRICS_PERSIST_INTERVAL")? {
            self.metrics_persist_interval = value;
        }
        if let Some(value) = numeric("EBPF_RETENTION_HOURS")? {
            self.retention_hours = value;
        }
        if let Some(value) = numeric("EBPF_SECURITY_IP_ERROR_THRESHOLD")? {
            self.security.ip_error_threshold = value;
        }
        if let Some(value) = numeric("EBPF_SECURITY_ERROR_WINDOW")? {
            self.security.error_window = value;
        }
        if let Some(value) = numeric("EBPF_RATE_LIMIT_REQUEST")? {
            self.rate_limit.request = value;
        }
        if let Some(value) = numeric("EBPF_RATE_LIMIT_INTERVAL")? {
            self.rate_limit.interval = value;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.auth.is_empty() {
            self.auth = generate_token(AUTH_TOKEN_LENGTH);
            info!(token = %self.auth, "no auth token provided, generated a random one");
        }
        if !check_addr(&self.addr) {
            bail!("invalid listen address: {}", self.addr);
        }
        if self.interface.is_empty() {
            self.interface = default_interface()?;
            info!(interface = %self.interface, "no interface provided, using default");
        } else if !Path::new("/sys/class/net").join(&self.interface).exists() {
            bail!("invalid interface: {}", self.interface);
        }
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("failed to create data directory {}", self.data_dir.display()))?;
        Ok(())
    }
}

/// Accepts `host:port` with an optional host; the host must be a literal
/// IP (domains are deliberately not resolved here).
pub fn check_addr(addr: &str) -> bool {
    let Some((host, port)) = addr.rsplit_once(':') else {
        return false;
    };
    if port.parse::<u16>().is_err() {
        return false;
    }
    if host.is_empty() {
        return true;
    }
    let host = host
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(host);
    host.parse::<IpAddr>().is_ok()
}

/// First interface that is UP, not loopback, and IPv4-capable.
fn default_interface() -> Result<String> {
    const IFF_UP: u32 = 0x1;
    const IFF_LOOPBACK: u32 = 0x8;

    // interfaces with an IPv4 route are the ones with an IPv4 address
    let route = fs::read_to_string("/proc/net/route").unwrap_or_default();
    let ipv4_capable: HashSet<String> = route
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect();

    let mut names: Vec<String> = fs::read_dir("/sys/class/net")
        .context("failed to enumerate network interfaces")?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();

    for name in names {
        let Ok(raw) = fs::read_to_string(format!("/sys/class/net/{name}/flags")) else {
            continue;
        };
        let Ok(flags) = u32::from_str_radix(raw.trim().trim_start_matches("0x"), 16) else {
            continue;
        };
        if flags & IFF_UP != 0 && flags & IFF_LOOPBACK == 0 && ipv4_capable.contains(&name) {
            return Ok(name);
        }
    }
    bail!("no suitable network interface found")
}

pub fn generate_token(length: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}
