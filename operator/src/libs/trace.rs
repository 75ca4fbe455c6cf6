//! Sets up tracing for the autoscaler

use vpsie_autoscaler::conf::LogLevel;

/// Setup our stdout tracer
///
/// `RUST_LOG` wins over the configured level so a single run can be turned up
/// without editing config.
///
/// # Arguments
///
/// * `level` - The log level from the autoscaler config
pub fn setup(level: LogLevel) {
    // let the environment override the configured level
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
