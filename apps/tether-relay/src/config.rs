use std::env;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tether_core::{RegistryConfig, SweeperConfig};

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    /// Fixed TTL from creation for device sessions.
    pub session_ttl_minutes: i64,
    /// TTL for ad-hoc support sessions.
    pub support_ttl_minutes: i64,
    /// Signals older than this are assumed consumed.
    pub signal_retention_seconds: i64,
    /// Terminal sessions older than this are hard-deleted.
    pub terminal_retention_hours: i64,
    /// A device silent for longer than this is marked offline.
    pub device_liveness_seconds: i64,
    pub sweep_interval_seconds: u64,
    /// Safety-net TTL on Redis keys, well past the sweeper's windows.
    pub store_key_ttl_seconds: u64,
    pub stun_servers: Vec<String>,
    pub turn_server: Option<String>,
    pub turn_secret: Option<String>,
    pub turn_ttl_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env::var("TETHER_RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            session_ttl_minutes: env::var("SESSION_TTL_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.session_ttl_minutes),
            support_ttl_minutes: env::var("SUPPORT_TTL_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.support_ttl_minutes),
            signal_retention_seconds: env::var("SIGNAL_RETENTION_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.signal_retention_seconds),
            terminal_retention_hours: env::var("TERMINAL_RETENTION_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.terminal_retention_hours),
            device_liveness_seconds: env::var("DEVICE_LIVENESS_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.device_liveness_seconds),
            sweep_interval_seconds: env::var("SWEEP_INTERVAL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.sweep_interval_seconds),
            store_key_ttl_seconds: env::var("STORE_KEY_TTL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.store_key_ttl_seconds),
            stun_servers: env::var("STUN_SERVERS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.stun_servers),
            turn_server: env::var("TURN_SERVER").ok().filter(|v| !v.is_empty()),
            turn_secret: env::var("TURN_SECRET").ok().filter(|v| !v.is_empty()),
            turn_ttl_seconds: env::var("TURN_TTL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.turn_ttl_seconds),
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            session_ttl: Duration::minutes(self.session_ttl_minutes),
            support_ttl: Duration::minutes(self.support_ttl_minutes),
        }
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            interval: StdDuration::from_secs(self.sweep_interval_seconds),
            signal_retention: Duration::seconds(self.signal_retention_seconds),
            terminal_retention: Duration::hours(self.terminal_retention_hours),
            device_liveness: Duration::seconds(self.device_liveness_seconds),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4600,
            redis_url: "redis://localhost:6379".to_string(),
            session_ttl_minutes: 15,
            support_ttl_minutes: 30,
            signal_retention_seconds: 60,
            terminal_retention_hours: 24,
            device_liveness_seconds: 120,
            sweep_interval_seconds: 180,
            store_key_ttl_seconds: 172_800, // 48h, past the 24h hard-delete window
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn_server: None,
            turn_secret: None,
            turn_ttl_seconds: 3600,
        }
    }
}
