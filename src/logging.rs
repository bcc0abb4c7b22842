//! Tracing setup for the monitor.
//!
//! Pretty console output by default, JSON lines with `json_logs = true`.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::Level;

use crate::config::AppConfig;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    pub json: bool,
    /// Default to DEBUG for this crate instead of INFO.
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

/// HTTP stack crates this monitor drives. Their connection chatter stays at
/// WARN unless `RUST_LOG` asks for more.
const HTTP_TARGETS: &[&str] = &["reqwest", "hyper", "hyper_util", "rustls"];

/// Filter used when `RUST_LOG` is unset.
pub fn default_filter(verbose: bool) -> String {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let mut directives = vec![format!("duplicati_monitor={}", level.as_str().to_lowercase())];
    directives.extend(HTTP_TARGETS.iter().map(|target| format!("{target}=warn")));
    directives.join(",")
}

/// Install the global subscriber. Call once, after the config is loaded.
///
/// `RUST_LOG` replaces [`default_filter`], e.g.
/// `RUST_LOG=duplicati_monitor=debug,reqwest=debug` to see each request.
pub fn init(config: LogConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(config.verbose)));

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        // Targets matter once the HTTP crates are let through.
        registry.with(fmt::layer().with_target(config.verbose)).init();
    }
}

/// Gate for the "backup in progress" line emitted on every fast poll.
///
/// A line passes when its key (the vendor phase) differs from the last one
/// that passed, or when `interval` has elapsed since then.
pub struct LogThrottle {
    interval: Duration,
    last: Mutex<Option<(String, Instant)>>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let pass = match last.as_ref() {
            None => true,
            Some((previous, at)) => previous != key || now.duration_since(*at) >= self.interval,
        };
        if pass {
            *last = Some((key.to_string(), now));
        }
        pass
    }

    /// Forget the last line so the next one passes.
    pub fn reset(&self) {
        if let Ok(mut last) = self.last.lock() {
            *last = None;
        }
    }
}
