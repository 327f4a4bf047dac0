/// Telemetry - structured logging with tracing
///
/// - RUST_LOG env var takes precedence over the configured level
/// - JSON vs pretty format support
/// - Optional file logging with daily rotation

use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogSettings;

/// Initialize the tracing subscriber from the `[log]` settings.
pub fn init_tracing(settings: &LogSettings) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.level));

    if let Some(log_file_path) = &settings.file {
        let path = std::path::Path::new(log_file_path);
        let directory = path
            .parent()
            .ok_or("Invalid log file path: no parent directory")?;
        let filename_prefix = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or("Invalid log file path: no filename")?;

        let file_appender = rolling::daily(directory, filename_prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if settings.format == "json" {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_writer(non_blocking),
                )
                .init();
        }

        // Keep guard alive (otherwise logs won't flush)
        std::mem::forget(guard);
    } else if settings.format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .init();
    }

    Ok(())
}

/// Truncate a hash or address for log lines
///
/// Example: "0x0a1b2c3d4e5f67890a1b..." -> "0x0a1b2c3d4e5f6789..."
pub fn truncate_hex(hex: &str, len: usize) -> String {
    if hex.len() <= len {
        hex.to_string()
    } else {
        format!("{}...", &hex[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_hex() {
        assert_eq!(truncate_hex("abcd", 16), "abcd");
        assert_eq!(
            truncate_hex("0123456789abcdef0123456789abcdef", 16),
            "0123456789abcdef..."
        );
        assert_eq!(truncate_hex("", 16), "");
    }
}
