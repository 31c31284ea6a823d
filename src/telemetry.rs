/// Telemetry Module - Structured Logging with Tracing
///
/// - pretty or JSON output
/// - optional file output with rotation
/// - `RUST_LOG` overrides the configured level
/// - truncation and sampling helpers for hot-path logs

use std::sync::atomic::{AtomicU64, Ordering};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub log_level: String,
    /// Log format: "json" or "pretty"
    pub log_format: String,
    /// Optional log file path (None = console only)
    pub log_file: Option<String>,
    /// Rotation interval: "daily", "hourly", "never"
    pub rotation: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: std::env::var("BALANCEBLOX_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
            log_file: std::env::var("BALANCEBLOX_LOG_FILE").ok(),
            rotation: "daily".to_string(),
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// When logging to a file, the returned guard must be kept alive for the
/// life of the process or buffered lines are lost.
pub fn init_tracing(config: TelemetryConfig) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let json = config.log_format == "json";

    let Some(log_file_path) = config.log_file else {
        if json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_current_span(true).with_span_list(true))
                .try_init()?;
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_thread_ids(false)
                        .with_file(true)
                        .with_line_number(true),
                )
                .try_init()?;
        }
        return Ok(None);
    };

    let path = std::path::Path::new(&log_file_path);
    let directory = path.parent()
        .ok_or("Invalid log file path: no parent directory")?;
    let file_name = path.file_name()
        .and_then(|s| s.to_str())
        .ok_or("Invalid log file path: no filename")?;
    let filename_prefix = path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);

    let file_appender = match config.rotation.as_str() {
        "hourly" => rolling::hourly(directory, filename_prefix),
        "never" => rolling::never(directory, file_name),
        _ => rolling::daily(directory, filename_prefix),
    };
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(non_blocking),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_file(true)
                    .with_line_number(true)
                    .with_writer(non_blocking),
            )
            .try_init()?;
    }

    Ok(Some(guard))
}

/// Truncate hex string for logging
///
/// Txids and block hashes are logged at 16 chars, scripts at 64.
pub fn truncate_hex(hex: &str, len: usize) -> String {
    if hex.len() <= len {
        hex.to_string()
    } else {
        format!("{}...", &hex[..len])
    }
}

/// Returns true every `interval` calls, starting with the first.
pub fn should_log_progress(counter: &AtomicU64, interval: u64) -> bool {
    let count = counter.fetch_add(1, Ordering::Relaxed);
    count % interval == 0
}

/// Sampled progress counter
pub struct ProgressCounter {
    counter: AtomicU64,
    interval: u64,
}

impl ProgressCounter {
    pub fn new(interval: u64) -> Self {
        Self {
            counter: AtomicU64::new(0),
            interval: interval.max(1),
        }
    }

    pub fn should_log(&self) -> bool {
        should_log_progress(&self.counter, self.interval)
    }

    pub fn get(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_hex() {
        assert_eq!(truncate_hex("abcd", 16), "abcd");
        assert_eq!(truncate_hex("0123456789abcdef0123456789abcdef", 16), "0123456789abcdef...");
        assert_eq!(truncate_hex("", 16), "");
    }

    #[test]
    fn test_should_log_progress() {
        let counter = AtomicU64::new(0);

        assert!(should_log_progress(&counter, 10));
        for _ in 1..10 {
            assert!(!should_log_progress(&counter, 10));
        }
        assert!(should_log_progress(&counter, 10));
    }

    #[test]
    fn test_progress_counter() {
        let counter = ProgressCounter::new(3);

        assert!(counter.should_log());
        assert!(!counter.should_log());
        assert!(!counter.should_log());
        assert!(counter.should_log());
        assert_eq!(counter.get(), 4);
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let counter = ProgressCounter::new(0);
        assert!(counter.should_log());
        assert!(counter.should_log());
    }
}
