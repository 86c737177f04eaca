use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the stderr subscriber. Stdout stays reserved for command output.
///
/// `RUST_LOG` wins when set; otherwise `verbose` switches the crate to debug.
pub fn init_logging(verbose: bool) {
    let default_filter = if verbose { "info,bankrag=debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .with_ansi(false);

    // A second init (tests, embedding in another binary) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .try_init();
}
