use std::env;
use std::num::ParseIntError;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Suffix appended to the configured logjam base URL; every outbound
/// signaling endpoint lives under it.
pub const LOGJAM_SUFFIX: &str = "/auxiliary-node";

/// One entry of `ice.servers.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// host:port the HTTP surface binds.
    pub listen_addr: String,
    /// Logjam base URL with the auxiliary-node suffix already appended.
    pub logjam_base_url: String,
    /// Legacy: room to join at startup.
    pub target_room: Option<String>,
    /// Non-zero enables TCP ICE candidate gathering.
    pub ice_tcp_mux_listen_port: u16,
    /// If non-empty, advertised as the only host ICE candidate (1-to-1 NAT).
    pub custom_ice_host_candidate_ip: Option<String>,
    /// ICE servers loaded from `ice.servers.json`.
    pub ice_servers: Vec<IceServerConfig>,
    /// Whether peers carry distinct send/recv sessions.
    pub split_sessions: bool,
    /// Logging level (e.g., "info", "debug").
    pub rust_log: String,
}

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    MissingVariable(String),
    #[error("{0} must be a valid port number (got '{1}': {2})")]
    InvalidPort(String, String, ParseIntError),
    #[error("{0} shouldn't end with /")]
    TrailingSlash(String),
    #[error("ice servers file {0} is malformed: {1}")]
    MalformedIceServers(String, serde_json::Error),
}

/// Validates environment variables and returns a Config object.
/// Returns an error if any required variable is missing or invalid.
pub fn validate_env() -> Result<Config, ConfigError> {
    // Required: LOGJAM_BASE_URL, no trailing slash
    let logjam_base_url = env::var("LOGJAM_BASE_URL")
        .map_err(|_| ConfigError::MissingVariable("LOGJAM_BASE_URL".to_string()))?;
    if logjam_base_url.ends_with('/') {
        return Err(ConfigError::TrailingSlash("LOGJAM_BASE_URL".to_string()));
    }

    let listen_addr = env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    let target_room = env::var("TARGET_ROOM").ok().filter(|v| !v.is_empty());

    let ice_tcp_mux_listen_port: u16 = match env::var("ICE_TCP_MUX_LISTEN_PORT") {
        Ok(v) => v.parse().map_err(|e| {
            ConfigError::InvalidPort("ICE_TCP_MUX_LISTEN_PORT".to_string(), v, e)
        })?,
        Err(_) => 0,
    };

    let custom_ice_host_candidate_ip = env::var("CUSTOM_ICE_HOST_CANDIDATE_IP")
        .ok()
        .filter(|v| !v.is_empty());

    let ice_servers_file =
        env::var("ICE_SERVERS_FILE").unwrap_or_else(|_| "ice.servers.json".to_string());
    let ice_servers = load_ice_servers(&ice_servers_file)?;

    let split_sessions = env::var("SPLIT_SESSIONS")
        .map(|v| v != "false" && v != "0")
        .unwrap_or(true);

    // Optional: RUST_LOG (defaults to "info")
    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    Ok(Config {
        listen_addr,
        logjam_base_url: format!("{}{}", logjam_base_url, LOGJAM_SUFFIX),
        target_room,
        ice_tcp_mux_listen_port,
        custom_ice_host_candidate_ip,
        ice_servers,
        split_sessions,
        rust_log,
    })
}

/// Reads the ICE server list. A missing file yields an empty list; a file
/// that exists but doesn't parse is fatal.
pub fn load_ice_servers(path: &str) -> Result<Vec<IceServerConfig>, ConfigError> {
    if !Path::new(path).exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path).map_err(|_| {
        ConfigError::MissingVariable(format!("ice servers file {} unreadable", path))
    })?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::MalformedIceServers(path.to_string(), e))
}
