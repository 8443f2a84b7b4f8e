use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    EnvFilter, filter::Targets, fmt, prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
};

/// Installs the global subscriber writing to stderr. `verbose` raises the
/// level to debug, otherwise `default` applies. `RUST_LOG` overrides both.
pub fn init_logging(verbose: bool, default: LevelFilter) {
    let level_filter = if verbose { LevelFilter::DEBUG } else { default };
    let app_filter = Targets::new().with_target("fundwatch", level_filter);
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_filter.to_string()));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .pretty()
                .without_time()
                .with_writer(std::io::stderr),
        )
        .with(app_filter)
        .with(env_filter)
        .init();
}
