use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::circuit::CircuitScheme;
use crate::error::{GiroError, Result};

/// Exit IP refused on sight, independent of any counts
pub const DEFAULT_BLACKLISTED_IP: &str = "163.172.67.180";

/// Default endpoint that echoes the caller's external IP
pub const DEFAULT_PROBE_URL: &str = "http://localhost/raw_external_ip";

/// Default number of tracked IPs before the rate cache is compacted
pub const DEFAULT_COMPACT_THRESHOLD: usize = 500;

/// Default bound on rotate-then-probe iterations per IP change
pub const DEFAULT_MAX_CHANGE_TRIES: u32 = 7;

/// External definition of a circuit, as accepted by `add_circuit`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(rename = "type")]
    pub scheme: CircuitScheme,
    pub name: Option<String>,
    pub in_cycling_pool: bool,
    pub is_local_daemon: bool,
    /// Poll cadence override; defaulted from the daemon flag when unset
    pub poll_interval_ms: Option<u64>,
    pub heal_interval_ms: u64,
    pub heal_amount_per_interval: i32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9050,
            username: None,
            password: None,
            scheme: CircuitScheme::Socks5h,
            name: None,
            in_cycling_pool: true,
            is_local_daemon: false,
            poll_interval_ms: None,
            heal_interval_ms: 1_200_000,
            heal_amount_per_interval: 10,
        }
    }
}

/// Coordinator configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Endpoint probed through each circuit to discover its exit IP
    pub probe_url: String,
    /// Rate cache persistence file (full-file overwrites)
    pub cache_path: PathBuf,
    /// Tracked-IP count that triggers rate cache compaction
    pub compact_threshold: usize,
    /// Bound on rotate-then-probe iterations per IP change
    pub max_change_tries: u32,
    /// Executable name of the supervised onion-routing daemon
    pub daemon_command: String,
    /// Fixed sleep after spawning the daemon; there is no readiness probe
    pub startup_grace: Duration,
    /// Exit IPs that must never be used
    pub blacklist: Vec<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            probe_url: DEFAULT_PROBE_URL.to_string(),
            cache_path: default_cache_path(),
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            max_change_tries: DEFAULT_MAX_CHANGE_TRIES,
            daemon_command: "tor".to_string(),
            startup_grace: Duration::from_secs(5),
            blacklist: vec![DEFAULT_BLACKLISTED_IP.to_string()],
        }
    }
}

impl ManagerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let probe_url = get_env_or("GIRO_PROBE_URL", DEFAULT_PROBE_URL);
        Url::parse(&probe_url).map_err(|e| {
            GiroError::InvalidConfig(format!("GIRO_PROBE_URL must be a valid URL: {}", e))
        })?;

        let cache_path = match env::var("GIRO_CACHE_PATH") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => default_cache_path(),
        };

        let compact_threshold = get_env_or("GIRO_COMPACT_THRESHOLD", "500")
            .parse()
            .map_err(|_| {
                GiroError::InvalidConfig("GIRO_COMPACT_THRESHOLD must be a number".into())
            })?;

        let max_change_tries = get_env_or("GIRO_MAX_CHANGE_TRIES", "7").parse().map_err(|_| {
            GiroError::InvalidConfig("GIRO_MAX_CHANGE_TRIES must be a number".into())
        })?;

        let startup_grace_secs: u64 = get_env_or("GIRO_DAEMON_STARTUP_GRACE_SECS", "5")
            .parse()
            .map_err(|_| {
                GiroError::InvalidConfig("GIRO_DAEMON_STARTUP_GRACE_SECS must be a number".into())
            })?;

        let mut blacklist = vec![DEFAULT_BLACKLISTED_IP.to_string()];
        blacklist.extend(
            get_env_or("GIRO_BLACKLIST", "")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        );

        Ok(Self {
            probe_url,
            cache_path,
            compact_threshold,
            max_change_tries,
            daemon_command: get_env_or("GIRO_DAEMON_COMMAND", "tor"),
            startup_grace: Duration::from_secs(startup_grace_secs),
            blacklist,
        })
    }
}

/// Versioned default location of the rate cache
fn default_cache_path() -> PathBuf {
    PathBuf::from(format!(
        "proxyratecache-{}.json",
        env!("CARGO_PKG_VERSION")
    ))
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "GIRO_PROBE_URL",
        "GIRO_CACHE_PATH",
        "GIRO_COMPACT_THRESHOLD",
        "GIRO_MAX_CHANGE_TRIES",
        "GIRO_DAEMON_COMMAND",
        "GIRO_DAEMON_STARTUP_GRACE_SECS",
        "GIRO_BLACKLIST",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_circuit_config_defaults() {
        let config = CircuitConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9050);
        assert_eq!(config.scheme, CircuitScheme::Socks5h);
        assert!(config.in_cycling_pool);
        assert!(!config.is_local_daemon);
        assert_eq!(config.heal_interval_ms, 1_200_000);
        assert_eq!(config.heal_amount_per_interval, 10);
    }

    #[test]
    fn test_circuit_config_deserializes_with_defaults() {
        let config: CircuitConfig =
            serde_json::from_str(r#"{"host":"10.0.0.2","type":"http","port":3128}"#).unwrap();
        assert_eq!(config.host, "10.0.0.2");
        assert_eq!(config.port, 3128);
        assert_eq!(config.scheme, CircuitScheme::Http);
        assert!(config.in_cycling_pool);
        assert!(config.name.is_none());
    }

    #[test]
    fn test_manager_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = ManagerConfig::from_env().unwrap();
        assert_eq!(config.probe_url, DEFAULT_PROBE_URL);
        assert_eq!(config.compact_threshold, 500);
        assert_eq!(config.max_change_tries, 7);
        assert_eq!(config.daemon_command, "tor");
        assert_eq!(config.startup_grace, Duration::from_secs(5));
        assert_eq!(config.blacklist, vec![DEFAULT_BLACKLISTED_IP.to_string()]);
        assert!(config
            .cache_path
            .to_string_lossy()
            .starts_with("proxyratecache-"));
    }

    #[test]
    fn test_manager_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("GIRO_PROBE_URL", "http://probe.example/ip");
        env::set_var("GIRO_CACHE_PATH", "/tmp/rates.json");
        env::set_var("GIRO_COMPACT_THRESHOLD", "10");
        env::set_var("GIRO_MAX_CHANGE_TRIES", "3");
        env::set_var("GIRO_DAEMON_COMMAND", "onion");
        env::set_var("GIRO_DAEMON_STARTUP_GRACE_SECS", "1");
        env::set_var("GIRO_BLACKLIST", "10.0.0.9, 10.0.0.10");

        let config = ManagerConfig::from_env().unwrap();
        assert_eq!(config.probe_url, "http://probe.example/ip");
        assert_eq!(config.cache_path, PathBuf::from("/tmp/rates.json"));
        assert_eq!(config.compact_threshold, 10);
        assert_eq!(config.max_change_tries, 3);
        assert_eq!(config.daemon_command, "onion");
        assert_eq!(config.startup_grace, Duration::from_secs(1));
        assert_eq!(
            config.blacklist,
            vec![
                DEFAULT_BLACKLISTED_IP.to_string(),
                "10.0.0.9".to_string(),
                "10.0.0.10".to_string()
            ]
        );
    }

    #[test]
    fn test_manager_config_rejects_invalid_probe_url() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("GIRO_PROBE_URL", "not a url");
        let err = ManagerConfig::from_env().unwrap_err();
        assert!(matches!(err, GiroError::InvalidConfig(_)));
    }

    #[test]
    fn test_manager_config_rejects_invalid_numbers() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("GIRO_MAX_CHANGE_TRIES", "several");
        let err = ManagerConfig::from_env().unwrap_err();
        assert!(matches!(err, GiroError::InvalidConfig(_)));
    }
}
