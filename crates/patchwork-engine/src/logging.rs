//! Tracing subscriber setup.

use patchwork_core::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;

/// Output format of the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

fn parse_format(format: &str) -> Result<LogFormat, EngineError> {
    match format.trim().to_ascii_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        other => Err(EngineError::Logging {
            message: format!("unknown log format {other:?}, expected text or json"),
        }),
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init(config: &LoggingConfig) -> Result<(), EngineError> {
    let format = parse_format(&config.format)?;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| EngineError::Logging {
            message: format!("invalid log level {:?}: {e}", config.level),
        })?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| EngineError::Logging {
        message: e.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn formats_are_case_insensitive() {
        assert_eq!(parse_format("TEXT").unwrap(), LogFormat::Text);
        assert_eq!(parse_format(" json ").unwrap(), LogFormat::Json);
    }

    #[test]
    fn unknown_formats_are_rejected() {
        assert!(matches!(
            parse_format("yaml"),
            Err(EngineError::Logging { .. })
        ));
    }
}
