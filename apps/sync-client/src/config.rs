use std::time::Duration;

use crate::channel::ChannelConfig;
use crate::delivery::DeliveryConfig;
use crate::presence::PresenceConfig;
use crate::watcher::WatcherConfig;

/// Sync client configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket endpoint of the real-time server (e.g. `ws://localhost:4002/sync`).
    pub sync_url: String,
    /// Base URL of the operation status accessor.
    pub status_url: String,
    /// Linear backoff unit: attempt `n` waits `n * reconnect_base_delay`.
    pub reconnect_base_delay: Duration,
    /// Reconnect attempts before `max_reconnect_reached` is emitted.
    pub reconnect_max_attempts: u32,
    /// How long the transport waits for the server's `ready` frame.
    pub handshake_timeout: Duration,
    /// Inactivity after which a typing mark expires.
    pub typing_ttl: Duration,
    /// How long a message may stay `sending` before it is marked `failed`.
    pub delivery_timeout: Duration,
    /// Default poll interval for tracked operations.
    pub poll_interval: Duration,
    /// Wallet account used by the demo binary.
    pub wallet_account: Option<String>,
    /// Chain id used by the demo binary.
    pub chain_id: String,
    pub display_name: Option<String>,
    pub auth_token: String,
    /// Contract addresses as `name=address` pairs.
    pub contracts: Vec<(String, String)>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            sync_url: required_var("SYNC_URL"),
            status_url: std::env::var("STATUS_URL")
                .unwrap_or_else(|_| "http://localhost:4003".to_string()),
            reconnect_base_delay: millis_var("RECONNECT_BASE_DELAY_MS", 1000),
            reconnect_max_attempts: std::env::var("RECONNECT_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            handshake_timeout: millis_var("HANDSHAKE_TIMEOUT_MS", 10_000),
            typing_ttl: millis_var("TYPING_TTL_MS", 3000),
            delivery_timeout: millis_var("DELIVERY_TIMEOUT_MS", 30_000),
            poll_interval: millis_var("POLL_INTERVAL_MS", 5000),
            wallet_account: std::env::var("WALLET_ACCOUNT").ok().filter(|s| !s.is_empty()),
            chain_id: std::env::var("CHAIN_ID").unwrap_or_else(|_| "1".to_string()),
            display_name: std::env::var("DISPLAY_NAME").ok().filter(|s| !s.is_empty()),
            auth_token: std::env::var("AUTH_TOKEN").unwrap_or_default(),
            contracts: std::env::var("CONTRACTS")
                .map(|v| parse_contracts(&v))
                .unwrap_or_default(),
        }
    }

    pub fn channel(&self) -> ChannelConfig {
        ChannelConfig {
            base_delay: self.reconnect_base_delay,
            max_attempts: self.reconnect_max_attempts,
        }
    }

    pub fn presence(&self) -> PresenceConfig {
        PresenceConfig {
            typing_ttl: self.typing_ttl,
            ..PresenceConfig::default()
        }
    }

    pub fn delivery(&self) -> DeliveryConfig {
        DeliveryConfig {
            delivery_timeout: self.delivery_timeout,
            ..DeliveryConfig::default()
        }
    }

    pub fn watcher(&self) -> WatcherConfig {
        WatcherConfig {
            default_interval: self.poll_interval,
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn millis_var(name: &str, default_ms: u64) -> Duration {
    let ms = std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}

/// Parse `name=address,name=address` into pairs, skipping malformed entries.
fn parse_contracts(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (name, address) = pair.split_once('=')?;
            let (name, address) = (name.trim(), address.trim());
            if name.is_empty() || address.is_empty() {
                return None;
            }
            Some((name.to_string(), address.to_string()))
        })
        .collect()
}
