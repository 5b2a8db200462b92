//! Runtime tunables sourced from the environment.

use std::env;
#[cfg(test)]
use std::sync::Mutex;
use std::time::Duration;

pub const DEFAULT_STORE_URL: &str = "http://127.0.0.1:8080";

/// Polling cadences and transport endpoints. Everything here has a working
/// default; the environment only overrides.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the call-session store.
    pub store_url: String,
    /// STUN servers handed to the peer connection.
    pub stun_servers: Vec<String>,
    /// Poll cadence while waiting for an incoming call.
    pub discovery_interval: Duration,
    /// Poll cadence while a call is being negotiated or active.
    pub engaged_interval: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let store_url =
            env::var("DUET_STORE_URL").unwrap_or_else(|_| DEFAULT_STORE_URL.to_string());
        let stun_servers = env::var("DUET_STUN_SERVERS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|list| !list.is_empty())
            .unwrap_or_else(default_stun_servers);
        let discovery_interval = interval_from_env("DUET_DISCOVERY_INTERVAL_MS", 2_000);
        let engaged_interval = interval_from_env("DUET_ENGAGED_INTERVAL_MS", 1_000);
        Self {
            store_url,
            stun_servers,
            discovery_interval,
            engaged_interval,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_url: DEFAULT_STORE_URL.to_string(),
            stun_servers: default_stun_servers(),
            discovery_interval: Duration::from_millis(2_000),
            engaged_interval: Duration::from_millis(1_000),
        }
    }
}

fn default_stun_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

fn interval_from_env(var: &str, default_ms: u64) -> Duration {
    let ms = env::var(var)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::LazyLock;

    // Environment variable tests must not run in parallel.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn default_config_matches_stock_endpoints() {
        let config = Config::default();
        assert_eq!(config.store_url, DEFAULT_STORE_URL);
        assert_eq!(config.stun_servers.len(), 2);
        assert_eq!(config.discovery_interval, Duration::from_millis(2_000));
        assert_eq!(config.engaged_interval, Duration::from_millis(1_000));
    }

    #[test]
    fn from_env_uses_defaults_when_unset() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::remove_var("DUET_STORE_URL");
            env::remove_var("DUET_STUN_SERVERS");
            env::remove_var("DUET_DISCOVERY_INTERVAL_MS");
            env::remove_var("DUET_ENGAGED_INTERVAL_MS");
        }
        let config = Config::from_env();
        assert_eq!(config.store_url, DEFAULT_STORE_URL);
        assert_eq!(config.engaged_interval, Duration::from_millis(1_000));
    }

    #[test]
    fn from_env_reads_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let original = env::var("DUET_STUN_SERVERS").ok();
        unsafe {
            env::set_var("DUET_STORE_URL", "https://calls.example.com");
            env::set_var(
                "DUET_STUN_SERVERS",
                "stun:one.example.com:3478, stun:two.example.com:3478",
            );
            env::set_var("DUET_DISCOVERY_INTERVAL_MS", "500");
        }
        let config = Config::from_env();
        assert_eq!(config.store_url, "https://calls.example.com");
        assert_eq!(
            config.stun_servers,
            vec![
                "stun:one.example.com:3478".to_string(),
                "stun:two.example.com:3478".to_string(),
            ]
        );
        assert_eq!(config.discovery_interval, Duration::from_millis(500));
        unsafe {
            env::remove_var("DUET_STORE_URL");
            env::remove_var("DUET_DISCOVERY_INTERVAL_MS");
            if let Some(orig) = original {
                env::set_var("DUET_STUN_SERVERS", orig);
            } else {
                env::remove_var("DUET_STUN_SERVERS");
            }
        }
    }

    #[test]
    fn garbage_interval_falls_back_to_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("DUET_ENGAGED_INTERVAL_MS", "not-a-number");
        }
        let config = Config::from_env();
        assert_eq!(config.engaged_interval, Duration::from_millis(1_000));
        unsafe {
            env::remove_var("DUET_ENGAGED_INTERVAL_MS");
        }
    }
}
