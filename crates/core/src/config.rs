use anyhow::Context;
use axum::http::HeaderValue;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::dispatcher::DispatcherConfig;
use crate::manifest::MANIFEST_FILE_NAME;
use crate::rate_limit::RateLimitConfig;
use crate::subscriptions::SubscriptionConfig;

#[derive(Clone)]
pub struct AppConfig {
    pub port: u16,
    pub bind_address: String,
    pub cors_origins: Vec<HeaderValue>,
    pub agents_dir: PathBuf,
    pub manifest_file: String,
    pub default_timeout_ms: u64,
    pub rate_limit_max: u32,
    pub rate_limit_window_secs: u64,
    pub rate_limit_cleanup_secs: u64,
    pub max_subscriptions: usize,
    pub heartbeat_secs: u64,
}

/// Parse `name` (or `default`) and check it lies in `min..=max`.
fn ranged<T>(name: &str, default: T, min: T, max: T) -> anyhow::Result<T>
where
    T: FromStr + PartialOrd + std::fmt::Display + Copy,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value = match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Failed to parse {}", name))?,
        Err(_) => default,
    };
    if value < min || value > max {
        anyhow::bail!("{} must be between {} and {} (got {})", name, min, max, value);
    }
    Ok(value)
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let port_str = env::var("PORT").unwrap_or_else(|_| "8090".to_string());
        let port = port_str.parse::<u16>().map_err(|_| {
            anyhow::anyhow!(
                "Invalid PORT value '{}': must be an integer between 1 and 65535",
                port_str
            )
        })?;
        if port == 0 {
            anyhow::bail!("Invalid PORT value '0': must be between 1 and 65535");
        }

        // Loopback by default; set 0.0.0.0 explicitly to expose the gateway.
        let bind_address = match env::var("BIND_ADDRESS") {
            Ok(addr) => {
                addr.parse::<std::net::IpAddr>().with_context(|| {
                    format!(
                        "Invalid BIND_ADDRESS '{}': must be a valid IP address (e.g., '127.0.0.1' or '::1')",
                        addr
                    )
                })?;
                addr
            }
            Err(_) => "127.0.0.1".to_string(),
        };

        let cors_origins_str =
            env::var("CORS_ORIGINS").unwrap_or_else(|_| "http://localhost:5173".to_string());
        let cors_origins: Vec<HeaderValue> = cors_origins_str
            .split(',')
            .filter_map(|s| {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return None;
                }
                if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
                    tracing::warn!(
                        "Skipping CORS origin with invalid scheme '{}': must be http:// or https://",
                        trimmed
                    );
                    return None;
                }
                match trimmed.parse::<HeaderValue>() {
                    Ok(v) => Some(v),
                    Err(e) => {
                        tracing::warn!("Skipping invalid CORS origin '{}': {}", trimmed, e);
                        None
                    }
                }
            })
            .collect();

        let agents_dir = PathBuf::from(
            env::var("LAVS_AGENTS_DIR").unwrap_or_else(|_| "./agents".to_string()),
        );

        let manifest_file =
            env::var("LAVS_MANIFEST_FILE").unwrap_or_else(|_| MANIFEST_FILE_NAME.to_string());
        if manifest_file.is_empty()
            || manifest_file.contains('/')
            || manifest_file.contains('\\')
            || manifest_file == ".."
        {
            anyhow::bail!(
                "LAVS_MANIFEST_FILE must be a plain file name (got '{}')",
                manifest_file
            );
        }

        let default_timeout_ms = ranged("LAVS_DEFAULT_TIMEOUT_MS", 30_000u64, 1, 600_000)?;
        let rate_limit_max = ranged("LAVS_RATE_LIMIT_MAX", 60u32, 1, u32::MAX)?;
        let rate_limit_window_secs = ranged("LAVS_RATE_LIMIT_WINDOW_SECS", 60u64, 1, 86_400)?;
        let rate_limit_cleanup_secs = ranged("LAVS_RATE_LIMIT_CLEANUP_SECS", 300u64, 1, 86_400)?;
        let max_subscriptions = ranged("LAVS_MAX_SUBSCRIPTIONS", 1000usize, 1, usize::MAX)?;
        let heartbeat_secs = ranged("LAVS_HEARTBEAT_SECS", 30u64, 1, 3600)?;

        Ok(Self {
            port,
            bind_address,
            cors_origins,
            agents_dir,
            manifest_file,
            default_timeout_ms,
            rate_limit_max,
            rate_limit_window_secs,
            rate_limit_cleanup_secs,
            max_subscriptions,
            heartbeat_secs,
        })
    }

    #[must_use]
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            default_timeout_ms: self.default_timeout_ms,
            manifest_file: self.manifest_file.clone(),
            rate_limit: RateLimitConfig {
                max_requests: self.rate_limit_max,
                window: Duration::from_secs(self.rate_limit_window_secs),
            },
            subscriptions: SubscriptionConfig {
                max_subscriptions: self.max_subscriptions,
                heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests run serially (prevents parallel test interference)
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // Guard to ensure env var cleanup even on panic
    struct EnvGuard(&'static str);

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            std::env::remove_var(self.0);
        }
    }

    fn set(name: &'static str, value: &str) -> EnvGuard {
        std::env::set_var(name, value);
        EnvGuard(name)
    }

    #[test]
    fn test_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let config = AppConfig::load().unwrap();

        assert_eq!(config.manifest_file, "lavs.json");
        let dispatcher = config.dispatcher_config();
        assert_eq!(dispatcher.rate_limit.window, Duration::from_secs(config.rate_limit_window_secs));
        assert_eq!(dispatcher.subscriptions.max_subscriptions, config.max_subscriptions);
    }

    #[test]
    fn test_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _a = set("LAVS_DEFAULT_TIMEOUT_MS", "1500");
        let _b = set("LAVS_RATE_LIMIT_MAX", "5");
        let _c = set("CORS_ORIGINS", "https://a.example, file:///etc, http://b.example");

        let config = AppConfig::load().unwrap();
        assert_eq!(config.default_timeout_ms, 1500);
        assert_eq!(config.rate_limit_max, 5);
        assert_eq!(config.cors_origins.len(), 2);
    }

    #[test]
    fn test_out_of_range_values_fail() {
        let _lock = ENV_LOCK.lock().unwrap();
        {
            let _g = set("LAVS_DEFAULT_TIMEOUT_MS", "0");
            assert!(AppConfig::load().is_err());
        }
        {
            let _g = set("LAVS_HEARTBEAT_SECS", "soon");
            assert!(AppConfig::load().is_err());
        }
        {
            let _g = set("LAVS_MANIFEST_FILE", "../lavs.json");
            assert!(AppConfig::load().is_err());
        }
    }
}
