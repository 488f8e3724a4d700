//! Logging
//!
//! The app reports lifecycle progress through the [`Logger`] capability. The
//! default, [`TracingLogger`], emits `tracing` events (a no-op until a
//! subscriber is installed); [`NoopLogger`] silences the app entirely; any
//! other type implementing the trait can be injected.
//!
//! [`init`] installs a `tracing-subscriber` fmt subscriber for binaries that
//! do not configure one themselves:
//!
//! ```bash
//! # Compact logs (default)
//! RUST_LOG=info ./service
//!
//! # Only lifecycle events, as JSON
//! CRAB_LOG_FORMAT=json RUST_LOG=crab=debug ./service
//! ```

use serde::Serialize;
use std::fmt::Write as _;
use strum_macros::{Display, EnumString};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Structured key/value pairs attached to a log line
pub type Fields<'a> = &'a [(&'a str, String)];

/// Logging capability consumed by the lifecycle coordinator
pub trait Logger: Send + Sync {
    fn info(&self, msg: &str, fields: Fields<'_>);
    fn error(&self, msg: &str, fields: Fields<'_>);
}

/// Keys the lifecycle coordinator reports, emitted as their own `tracing` fields
const KNOWN_KEYS: [&str; 6] = ["id", "name", "cost", "error", "signal", "reason"];

/// Forwards to `tracing` under the `crab` target
///
/// Known keys become structured fields (`name`, `cost` and so on); anything
/// else is rendered into a single `fields` field.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

macro_rules! forward {
    ($level:ident, $msg:expr, $fields:expr) => {{
        let fields = $fields;
        let extra = extra(fields);
        tracing::event!(
            target: "crab",
            tracing::Level::$level,
            id = field(fields, "id"),
            name = field(fields, "name"),
            cost = field(fields, "cost"),
            error = field(fields, "error"),
            signal = field(fields, "signal"),
            reason = field(fields, "reason"),
            fields = extra.as_deref(),
            "{}",
            $msg
        )
    }};
}

impl Logger for TracingLogger {
    fn info(&self, msg: &str, fields: Fields<'_>) {
        forward!(INFO, msg, fields);
    }

    fn error(&self, msg: &str, fields: Fields<'_>) {
        forward!(ERROR, msg, fields);
    }
}

fn field<'a>(fields: Fields<'a>, key: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, value)| value.as_str())
}

fn extra(fields: Fields<'_>) -> Option<String> {
    let rest: Vec<(&str, String)> = fields
        .iter()
        .filter(|(key, _)| !KNOWN_KEYS.contains(key))
        .cloned()
        .collect();
    (!rest.is_empty()).then(|| render(&rest))
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn info(&self, _msg: &str, _fields: Fields<'_>) {}
    fn error(&self, _msg: &str, _fields: Fields<'_>) {}
}

fn render(fields: Fields<'_>) -> String {
    let mut out = String::new();
    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{key}={value}");
    }
    out
}

/// Output encoding of the fmt subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, Serialize)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Subscriber settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogOptions {
    /// Fallback filter directive when `RUST_LOG` is not set
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Install a global fmt subscriber
///
/// `RUST_LOG` wins over `options.level`. Returns `false` when a global
/// subscriber was already installed, so calling this twice is harmless.
pub fn init(options: &LogOptions) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&options.level));

    match options.format {
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().compact().with_target(false))
            .try_init()
            .is_ok(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;
    use std::str::FromStr;
    use std::sync::{Arc, Mutex};
    use tracing::field::{Field, Visit};
    use tracing_subscriber::layer::{Context, Layer};

    #[test]
    fn test_render_fields() {
        let fields = [("name", "db".to_string()), ("cost", "12ms".to_string())];
        assert_eq!(render(&fields), "name=db cost=12ms");
        assert_eq!(render(&[]), "");
    }

    type Captured = Arc<Mutex<Vec<(String, String)>>>;

    struct Capture(Captured);

    impl<S: tracing::Subscriber> Layer<S> for Capture {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            event.record(&mut Collect(&mut self.0.lock().unwrap()));
        }
    }

    struct Collect<'a>(&'a mut Vec<(String, String)>);

    impl Visit for Collect<'_> {
        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.push((field.name().to_string(), value.to_string()));
        }

        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            self.0.push((field.name().to_string(), format!("{value:?}")));
        }
    }

    fn captured(log: impl FnOnce()) -> Vec<(String, String)> {
        let events: Captured = Arc::default();
        let subscriber = tracing_subscriber::registry().with(Capture(Arc::clone(&events)));
        tracing::subscriber::with_default(subscriber, log);
        let events = events.lock().unwrap().clone();
        events
    }

    fn pair(key: &str, value: &str) -> (String, String) {
        (key.to_string(), value.to_string())
    }

    #[test]
    fn test_tracing_logger_emits_structured_fields() {
        let events = captured(|| {
            TracingLogger.info(
                "Stopped component",
                &[("name", "db".to_string()), ("cost", "12ms".to_string())],
            )
        });

        assert!(events.contains(&pair("message", "Stopped component")));
        assert!(events.contains(&pair("name", "db")));
        assert!(events.contains(&pair("cost", "12ms")));
        assert!(events.iter().all(|(key, _)| key != "fields" && key != "error"));
    }

    #[test]
    fn test_tracing_logger_renders_unknown_keys() {
        let events = captured(|| {
            TracingLogger.error(
                "Shutdown failed",
                &[("error", "boom".to_string()), ("attempt", "2".to_string())],
            )
        });

        assert!(events.contains(&pair("error", "boom")));
        assert!(events.contains(&pair("fields", "attempt=2")));
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::from_str("JSON").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("compact").unwrap(), LogFormat::Compact);
        assert!(LogFormat::from_str("xml").is_err());
    }

    #[test]
    fn test_init_is_idempotent() {
        let options = LogOptions::default();
        let _ = init(&options);
        assert!(!init(&options));
    }
}
