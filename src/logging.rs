use crate::cli::TracingFormat;
use crate::config::Config;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Configure and initialize logging for the node.
///
/// `RUST_LOG` takes precedence when set; otherwise the configured level
/// applies to this crate's target while infrastructure noise stays at
/// warn.
pub fn setup_logging(config: &Config, tracing_format: TracingFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("warn,tokmesh={}", config.log_level))
    });

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = match tracing_format {
        TracingFormat::Pretty => Box::new(
            FmtSubscriber::builder()
                .with_target(true)
                .with_env_filter(filter)
                .finish(),
        ),
        TracingFormat::Json => Box::new(
            FmtSubscriber::builder()
                .with_target(true)
                .json()
                .with_env_filter(filter)
                .finish(),
        ),
    };

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}
