use crate::error::ConfigError;
use crate::lifecycle::Signal;
use crate::logging::{LogFormat, LogOptions};
use dashmap::DashMap;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub const SHUTDOWN_TIMEOUT: &str = "CRAB_SHUTDOWN_TIMEOUT";
pub const STARTUP_TIMEOUT: &str = "CRAB_STARTUP_TIMEOUT";
pub const GRACEFUL_MAX_WAIT: &str = "CRAB_GRACEFUL_MAX_WAIT";
pub const SIGNALS: &str = "CRAB_SIGNALS";
pub const APP_NAME: &str = "CRAB_APP_NAME";
pub const LOG_LEVEL: &str = "CRAB_LOG_LEVEL";
pub const LOG_FORMAT: &str = "CRAB_LOG_FORMAT";

/// Configuration service
///
/// Backed by a concurrent map seeded from the process environment; values can
/// be overridden with [`set`](Self::set). Typed accessors return `Ok(None)`
/// for unset keys and an error for malformed ones.
#[derive(Clone, Default)]
pub struct ConfigService {
    config: Arc<DashMap<String, String>>,
}

impl ConfigService {
    /// Load every environment variable
    pub fn new() -> Self {
        Self::from_pairs(env::vars())
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let service = Self::default();
        for (key, value) in pairs {
            service.config.insert(key.into(), value.into());
        }
        service
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.config.get(key).map(|v| v.clone())
    }

    pub fn set(&self, key: &str, value: &str) {
        self.config.insert(key.to_string(), value.to_string());
    }

    pub fn get_duration(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        self.get(key)
            .map(|raw| {
                parse_duration(&raw).map_err(|reason| ConfigError::InvalidDuration {
                    key: key.to_string(),
                    value: raw.clone(),
                    reason,
                })
            })
            .transpose()
    }

    pub fn shutdown_timeout(&self) -> Result<Option<Duration>, ConfigError> {
        self.get_duration(SHUTDOWN_TIMEOUT)
    }

    pub fn startup_timeout(&self) -> Result<Option<Duration>, ConfigError> {
        self.get_duration(STARTUP_TIMEOUT)
    }

    pub fn graceful_max_wait(&self) -> Result<Option<Duration>, ConfigError> {
        self.get_duration(GRACEFUL_MAX_WAIT)
    }

    /// Comma-separated signal names, e.g. `SIGTERM,SIGINT,SIGHUP`
    pub fn signals(&self) -> Result<Option<Vec<Signal>>, ConfigError> {
        let Some(raw) = self.get(SIGNALS) else {
            return Ok(None);
        };
        raw.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| {
                Signal::from_str(name).map_err(|_| ConfigError::InvalidSignal(name.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    pub fn app_name(&self) -> Option<String> {
        self.get(APP_NAME).filter(|name| !name.is_empty())
    }

    pub fn log_options(&self) -> Result<LogOptions, ConfigError> {
        let mut options = LogOptions::default();
        if let Some(level) = self.get(LOG_LEVEL) {
            options.level = level;
        }
        if let Some(format) = self.get(LOG_FORMAT) {
            options.format =
                LogFormat::from_str(&format).map_err(|_| ConfigError::InvalidLogFormat(format))?;
        }
        Ok(options)
    }
}

/// Parse `500ms`, `10s`, `2m`, `1h`, `250us`; a bare number means seconds
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    if number.is_empty() {
        return Err("missing number".to_string());
    }
    let value: f64 = number
        .parse()
        .map_err(|e: std::num::ParseFloatError| e.to_string())?;

    let secs = match unit.trim() {
        "" | "s" | "sec" | "secs" => value,
        "ms" => value / 1_000.0,
        "us" | "µs" => value / 1_000_000.0,
        "ns" => value / 1_000_000_000.0,
        "m" | "min" => value * 60.0,
        "h" => value * 3_600.0,
        other => return Err(format!("unknown unit '{other}'")),
    };
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("15").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("ten seconds").is_err());
        assert!(parse_duration("5 fortnights").is_err());
    }

    #[test]
    fn test_typed_accessors() {
        let config = ConfigService::from_pairs([
            (SHUTDOWN_TIMEOUT, "3s"),
            (SIGNALS, "SIGTERM, sighup"),
            (APP_NAME, "orders"),
            (LOG_FORMAT, "json"),
        ]);

        assert_eq!(
            config.shutdown_timeout().unwrap(),
            Some(Duration::from_secs(3))
        );
        assert_eq!(config.startup_timeout().unwrap(), None);
        assert_eq!(
            config.signals().unwrap(),
            Some(vec![Signal::Terminate, Signal::Hangup])
        );
        assert_eq!(config.app_name().as_deref(), Some("orders"));

        let log = config.log_options().unwrap();
        assert_eq!(log.format, LogFormat::Json);
        assert_eq!(log.level, "info");
    }

    #[test]
    fn test_malformed_values_are_reported() {
        let config = ConfigService::from_pairs([(STARTUP_TIMEOUT, "soon"), (SIGNALS, "SIGKILL")]);

        let err = config.startup_timeout().unwrap_err();
        assert!(err.to_string().contains(STARTUP_TIMEOUT));
        assert!(matches!(
            config.signals().unwrap_err(),
            ConfigError::InvalidSignal(name) if name == "SIGKILL"
        ));
    }

    #[test]
    fn test_set_overrides() {
        let config = ConfigService::from_pairs([(GRACEFUL_MAX_WAIT, "60s")]);
        config.set(GRACEFUL_MAX_WAIT, "5s");
        assert_eq!(
            config.graceful_max_wait().unwrap(),
            Some(Duration::from_secs(5))
        );
    }
}
