use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

/// Chatty dependencies are capped at `warn` unless `RUST_LOG` says otherwise.
const QUIET_DEPS: &[&str] = &["hyper=warn", "hyper_util=warn", "reqwest=warn", "sqlx=warn"];

/// Base filter for a `-v` count: 0 → info, 1 → debug, 2+ → trace.
pub fn default_filter(verbosity: u8) -> String {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let mut directives = vec![level.to_string()];
    directives.extend(QUIET_DEPS.iter().map(|d| d.to_string()));
    directives.join(",")
}

/// Install the global fmt subscriber. `RUST_LOG` wins over the verbosity flag.
pub fn init_logging(verbosity: u8) -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity)));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}
