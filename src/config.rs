//! Centralized configuration management for the tunnel broker.
//!
//! Unlike the teacher (which treats its API secret as mandatory-and-panics),
//! this broker holds no secrets of its own — the bearer token arrives
//! per-session from the connecting client — so every variable here has a
//! usable default and `load` never panics.

use std::sync::OnceLock;
use std::time::Duration;

mod env {
    pub const PORT: &str = "PORT";
    pub const RPC_HEARTBEAT_INTERVAL: &str = "RPC_HEARTBEAT_INTERVAL";
    pub const RPC_SESSION_KEEPALIVE: &str = "RPC_SESSION_KEEPALIVE";
    pub const USER_PUBLIC_KEY: &str = "USER_PUBLIC_KEY";
    pub const DEBUG: &str = "TUNNEL_BROKER_DEBUG";
    pub const PROVIDER_BASE_URL: &str = "PROVIDER_BASE_URL";
    pub const PROVIDER_USER_AGENT: &str = "PROVIDER_USER_AGENT";
}

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 60_000;
const DEFAULT_SESSION_KEEPALIVE_MS: u64 = 300_000;
const DEFAULT_PROVIDER_BASE_URL: &str = "https://api.github.com";
const DEFAULT_PROVIDER_USER_AGENT: &str = "tunnel-broker/0.1";

/// Fallback local ports probed for the RPC mapping when no other discovery
/// strategy finds one. §9 Open Question: treat as configuration, not truth.
pub const DEFAULT_RPC_FALLBACK_PORTS: &[u16] = &[16634, 16635, 16636, 16637, 16638, 16639];

/// Fallback local ports probed for the SSH mapping.
pub const DEFAULT_SSH_FALLBACK_PORTS: &[u16] = &[2222, 2223, 2224, 22];

/// The well-known remote port the control-plane RPC service listens on
/// inside the workspace.
pub const RPC_REMOTE_PORT: u16 = 16634;

/// Remote ports that categorize as `ssh`.
pub const SSH_REMOTE_PORTS: &[u16] = &[22, 2222];

/// Remote port range that categorizes as `management`.
pub const MANAGEMENT_REMOTE_PORT_RANGE: std::ops::RangeInclusive<u16> = 16634..=16640;

static CONFIG: OnceLock<Config> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub rpc_heartbeat_interval: Duration,
    pub rpc_session_keepalive: Duration,
    pub user_public_key_override: Option<String>,
    pub debug: bool,
    pub provider_base_url: String,
    pub provider_user_agent: String,
}

impl Config {
    fn load() -> Self {
        let port = std::env::var(env::PORT)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let rpc_heartbeat_interval = std::env::var(env::RPC_HEARTBEAT_INTERVAL)
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS));

        let rpc_session_keepalive = std::env::var(env::RPC_SESSION_KEEPALIVE)
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(DEFAULT_SESSION_KEEPALIVE_MS));

        let user_public_key_override = std::env::var(env::USER_PUBLIC_KEY).ok();

        let debug = std::env::var(env::DEBUG)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let provider_base_url = std::env::var(env::PROVIDER_BASE_URL)
            .unwrap_or_else(|_| DEFAULT_PROVIDER_BASE_URL.to_string());

        let provider_user_agent = std::env::var(env::PROVIDER_USER_AGENT)
            .unwrap_or_else(|_| DEFAULT_PROVIDER_USER_AGENT.to_string());

        Self {
            port,
            rpc_heartbeat_interval,
            rpc_session_keepalive,
            user_public_key_override,
            debug,
            provider_base_url,
            provider_user_agent,
        }
    }
}

/// Initialize configuration. Must be called once at startup.
pub fn init() {
    CONFIG.get_or_init(Config::load);
}

/// Get the global configuration. Panics if not initialized.
pub fn get() -> &'static Config {
    CONFIG.get().expect("config not initialized; call config::init() first")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::load();
        assert!(cfg.port > 0);
        assert!(cfg.rpc_heartbeat_interval.as_millis() > 0);
        assert!(cfg.rpc_session_keepalive > cfg.rpc_heartbeat_interval);
    }
}
