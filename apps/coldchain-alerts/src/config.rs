use crate::alert::{AlertPolicy, Thresholds};
use crate::error::ConfigError;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

const CONFIG_PATH_ENV: &str = "COLDCHAIN_CONFIG_PATH";

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_keepalive_secs: u64,
    pub topic_prefix: String,

    pub thresholds: Thresholds,
    pub recovery_hold_seconds: u64,
    pub stale_after_seconds: u64,
    pub stale_check_interval_ms: u64,

    pub alerts_per_minute: u32,
    pub publish_max_attempts: u32,
    pub publish_backoff_ms: u64,
    pub publish_backoff_max_ms: u64,
    pub publish_timeout_ms: u64,

    pub asset_queue_capacity: usize,
    pub shutdown_grace_ms: u64,
    pub http_bind: Option<String>,
}

/// Optional JSON file whose values apply wherever the matching env var is unset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileOverrides {
    #[serde(default)]
    mqtt_url: Option<String>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mqtt_client_id: Option<String>,
    #[serde(default)]
    mqtt_keepalive_secs: Option<u64>,
    #[serde(default)]
    topic_prefix: Option<String>,
    #[serde(default)]
    warning_low: Option<f64>,
    #[serde(default)]
    warning_high: Option<f64>,
    #[serde(default)]
    critical_low: Option<f64>,
    #[serde(default)]
    critical_high: Option<f64>,
    #[serde(default)]
    recovery_hold_seconds: Option<u64>,
    #[serde(default)]
    stale_after_seconds: Option<u64>,
    #[serde(default)]
    stale_check_interval_ms: Option<u64>,
    #[serde(default)]
    alerts_per_minute: Option<u32>,
    #[serde(default)]
    publish_max_attempts: Option<u32>,
    #[serde(default)]
    publish_backoff_ms: Option<u64>,
    #[serde(default)]
    publish_backoff_max_ms: Option<u64>,
    #[serde(default)]
    publish_timeout_ms: Option<u64>,
    #[serde(default)]
    asset_queue_capacity: Option<usize>,
    #[serde(default)]
    shutdown_grace_ms: Option<u64>,
    #[serde(default)]
    http_bind: Option<String>,
}

impl FileOverrides {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Config {
    /// Loads `.env`, the optional overrides file, then the process environment.
    pub fn from_env(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let path: Option<PathBuf> = config_path.map(Path::to_path_buf).or_else(|| {
            env::var(CONFIG_PATH_ENV)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        });
        let overrides = match path {
            Some(path) => {
                let loaded = FileOverrides::load(&path)?;
                tracing::info!(path = %path.display(), "loaded config overrides");
                loaded
            }
            None => FileOverrides::default(),
        };

        Self::resolve(|key| env::var(key).ok(), overrides)
    }

    pub fn resolve<F>(lookup: F, file: FileOverrides) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let settings = Settings { lookup: &lookup };

        let mqtt_url = settings.string(
            "COLDCHAIN_MQTT_URL",
            file.mqtt_url,
            "mqtt://127.0.0.1:1883",
        );
        let (mqtt_host, mqtt_port) = parse_mqtt_url(&mqtt_url)?;
        let mqtt_username = settings.optional("COLDCHAIN_MQTT_USERNAME", file.mqtt_username);
        let mqtt_password = settings.optional("COLDCHAIN_MQTT_PASSWORD", file.mqtt_password);
        let mqtt_client_id = settings.string(
            "COLDCHAIN_MQTT_CLIENT_ID",
            file.mqtt_client_id,
            &format!("coldchain-alerts-{}", std::process::id()),
        );
        let mqtt_keepalive_secs =
            settings.parse("COLDCHAIN_MQTT_KEEPALIVE_SECS", file.mqtt_keepalive_secs, 30)?;
        let topic_prefix = settings
            .string("COLDCHAIN_TOPIC_PREFIX", file.topic_prefix, "coldchain")
            .trim_matches('/')
            .to_string();
        if topic_prefix.is_empty() || topic_prefix.contains(['+', '#']) {
            return Err(ConfigError::Invalid {
                key: "COLDCHAIN_TOPIC_PREFIX",
                value: topic_prefix,
            });
        }

        let thresholds = Thresholds {
            warning_low: settings.parse("COLDCHAIN_WARNING_LOW", file.warning_low, 2.0)?,
            warning_high: settings.parse("COLDCHAIN_WARNING_HIGH", file.warning_high, 8.0)?,
            critical_low: settings.parse("COLDCHAIN_CRITICAL_LOW", file.critical_low, 0.0)?,
            critical_high: settings.parse("COLDCHAIN_CRITICAL_HIGH", file.critical_high, 10.0)?,
        };
        thresholds.validate()?;

        let recovery_hold_seconds = settings.parse(
            "COLDCHAIN_RECOVERY_HOLD_SECONDS",
            file.recovery_hold_seconds,
            30,
        )?;
        let stale_after_seconds = settings.parse(
            "COLDCHAIN_STALE_AFTER_SECONDS",
            file.stale_after_seconds,
            120,
        )?;
        let stale_check_interval_ms = settings.parse(
            "COLDCHAIN_STALE_CHECK_INTERVAL_MS",
            file.stale_check_interval_ms,
            1000,
        )?;

        let alerts_per_minute =
            settings.parse("COLDCHAIN_ALERTS_PER_MINUTE", file.alerts_per_minute, 30)?;
        let publish_max_attempts = settings.parse(
            "COLDCHAIN_PUBLISH_MAX_ATTEMPTS",
            file.publish_max_attempts,
            5,
        )?;
        let publish_backoff_ms =
            settings.parse("COLDCHAIN_PUBLISH_BACKOFF_MS", file.publish_backoff_ms, 200)?;
        let publish_backoff_max_ms = settings.parse(
            "COLDCHAIN_PUBLISH_BACKOFF_MAX_MS",
            file.publish_backoff_max_ms,
            5000,
        )?;
        let publish_timeout_ms =
            settings.parse("COLDCHAIN_PUBLISH_TIMEOUT_MS", file.publish_timeout_ms, 2000)?;

        let asset_queue_capacity = settings.parse(
            "COLDCHAIN_ASSET_QUEUE_CAPACITY",
            file.asset_queue_capacity,
            1024,
        )?;
        let shutdown_grace_ms =
            settings.parse("COLDCHAIN_SHUTDOWN_GRACE_MS", file.shutdown_grace_ms, 3000)?;

        // An explicitly empty bind (env or file) turns the HTTP surface off.
        let http_bind = match lookup("COLDCHAIN_HTTP_BIND").or(file.http_bind) {
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => Some(raw.trim().to_string()),
            None => Some("127.0.0.1:9102".to_string()),
        };

        let config = Self {
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            mqtt_keepalive_secs,
            topic_prefix,
            thresholds,
            recovery_hold_seconds,
            stale_after_seconds,
            stale_check_interval_ms,
            alerts_per_minute,
            publish_max_attempts,
            publish_backoff_ms,
            publish_backoff_max_ms,
            publish_timeout_ms,
            asset_queue_capacity,
            shutdown_grace_ms,
            http_bind,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.stale_after_seconds == 0 {
            return Err(ConfigError::NotPositive("stale_after_seconds"));
        }
        if self.stale_check_interval_ms == 0 {
            return Err(ConfigError::NotPositive("stale_check_interval_ms"));
        }
        if self.alerts_per_minute == 0 {
            return Err(ConfigError::NotPositive("alerts_per_minute"));
        }
        if self.publish_max_attempts == 0 {
            return Err(ConfigError::NotPositive("publish_max_attempts"));
        }
        if self.publish_timeout_ms == 0 {
            return Err(ConfigError::NotPositive("publish_timeout_ms"));
        }
        if self.asset_queue_capacity == 0 {
            return Err(ConfigError::NotPositive("asset_queue_capacity"));
        }
        Ok(())
    }

    pub fn alert_policy(&self) -> AlertPolicy {
        AlertPolicy {
            thresholds: self.thresholds,
            recovery_hold: chrono::Duration::seconds(self.recovery_hold_seconds as i64),
            stale_after: chrono::Duration::seconds(self.stale_after_seconds as i64),
        }
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn stale_check_interval(&self) -> Duration {
        Duration::from_millis(self.stale_check_interval_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

struct Settings<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Settings<'_> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, file: Option<String>, default: &str) -> String {
        self.raw(key)
            .or_else(|| file.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()))
            .unwrap_or_else(|| default.to_string())
    }

    fn optional(&self, key: &str, file: Option<String>) -> Option<String> {
        self.raw(key)
            .or_else(|| file.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()))
    }

    fn parse<T: FromStr>(
        &self,
        key: &'static str,
        file: Option<T>,
        default: T,
    ) -> Result<T, ConfigError> {
        match self.raw(key) {
            Some(value) => value
                .parse::<T>()
                .map_err(|_| ConfigError::Invalid { key, value }),
            None => Ok(file.unwrap_or(default)),
        }
    }
}

fn parse_mqtt_url(raw: &str) -> Result<(String, u16), ConfigError> {
    let invalid = || ConfigError::Invalid {
        key: "COLDCHAIN_MQTT_URL",
        value: raw.to_string(),
    };
    let url = Url::parse(raw).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "mqtt" | "tcp") {
        return Err(invalid());
    }
    let host = url.host_str().ok_or_else(invalid)?.to_string();
    Ok((host, url.port().unwrap_or(1883)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn resolve_with(pairs: &[(&str, &str)], file: FileOverrides) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::resolve(|key| vars.get(key).cloned(), file)
    }

    #[test]
    fn defaults_are_valid() {
        let config = resolve_with(&[], FileOverrides::default()).expect("config");
        assert_eq!(config.mqtt_host, "127.0.0.1");
        assert_eq!(config.mqtt_port, 1883);
        assert_eq!(config.topic_prefix, "coldchain");
        assert_eq!(config.thresholds.warning_low, 2.0);
        assert_eq!(config.thresholds.critical_high, 10.0);
        assert_eq!(config.recovery_hold_seconds, 30);
        assert_eq!(config.http_bind.as_deref(), Some("127.0.0.1:9102"));
    }

    #[test]
    fn parses_mqtt_url_and_credentials() {
        let config = resolve_with(
            &[
                ("COLDCHAIN_MQTT_URL", "mqtt://broker.example:2883"),
                ("COLDCHAIN_MQTT_USERNAME", " alerts "),
                ("COLDCHAIN_MQTT_PASSWORD", "secret"),
            ],
            FileOverrides::default(),
        )
        .expect("config");
        assert_eq!(config.mqtt_host, "broker.example");
        assert_eq!(config.mqtt_port, 2883);
        assert_eq!(config.mqtt_username.as_deref(), Some("alerts"));
        assert_eq!(config.mqtt_password.as_deref(), Some("secret"));
    }

    #[test]
    fn rejects_inverted_bounds() {
        let err = resolve_with(
            &[
                ("COLDCHAIN_WARNING_HIGH", "12"),
                ("COLDCHAIN_CRITICAL_HIGH", "10"),
            ],
            FileOverrides::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvertedBounds { .. }));
    }

    #[test]
    fn malformed_numbers_are_errors_not_defaults() {
        let err = resolve_with(
            &[("COLDCHAIN_RECOVERY_HOLD_SECONDS", "soon")],
            FileOverrides::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "COLDCHAIN_RECOVERY_HOLD_SECONDS",
                ..
            }
        ));
    }

    #[test]
    fn rejects_non_mqtt_url() {
        let err = resolve_with(
            &[("COLDCHAIN_MQTT_URL", "http://broker:1883")],
            FileOverrides::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn zero_stale_window_is_rejected() {
        let err = resolve_with(
            &[("COLDCHAIN_STALE_AFTER_SECONDS", "0")],
            FileOverrides::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::NotPositive("stale_after_seconds")));
    }

    #[test]
    fn empty_http_bind_disables_status_surface() {
        let config =
            resolve_with(&[("COLDCHAIN_HTTP_BIND", "")], FileOverrides::default()).expect("config");
        assert!(config.http_bind.is_none());
    }

    #[test]
    fn file_overrides_apply_where_env_is_unset() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"{{"warning_low": 3.0, "warning_high": 7.0, "recovery_hold_seconds": 90,
                "topic_prefix": "fleet/"}}"#
        )
        .expect("write");
        let overrides = FileOverrides::load(file.path()).expect("load");

        let config = resolve_with(&[("COLDCHAIN_WARNING_HIGH", "7.5")], overrides).expect("config");
        assert_eq!(config.thresholds.warning_low, 3.0);
        assert_eq!(config.thresholds.warning_high, 7.5);
        assert_eq!(config.recovery_hold_seconds, 90);
        assert_eq!(config.topic_prefix, "fleet");
    }

    #[test]
    fn unreadable_file_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = FileOverrides::load(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
