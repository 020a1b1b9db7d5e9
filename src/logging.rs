use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// Unknown formats fall back to `Pretty`; the second value reports it.
    fn parse(format: &str) -> (Self, bool) {
        match format.to_ascii_lowercase().as_str() {
            "json" => (Self::Json, true),
            "pretty" | "compact" | "text" => (Self::Pretty, true),
            _ => (Self::Pretty, false),
        }
    }
}

/// Install the global subscriber on stderr, leaving stdout to command
/// output. `RUST_LOG` wins over `log_level`.
pub fn init(log_format: &str, log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let (format, known) = LogFormat::parse(log_format);

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_timer(UtcTime::rfc_3339())
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init(),
    }

    if !known {
        tracing::warn!(
            log_format = %log_format,
            "Unknown log format, using pretty (valid: json, pretty)"
        );
    }
    tracing::debug!(log_format = ?format, log_level = %log_level, "Logging initialized");
}
