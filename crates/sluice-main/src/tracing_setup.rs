use error_stack::{IntoReport, ResultExt};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// The options available for configuring logging.
#[derive(clap::Args, Debug)]
pub struct TracingOptions {
    /// Log filter configuration.
    ///
    /// Defaults to `sluice_=debug,info`, which logs `debug` from the sluice
    /// crates (`sluice_flow`, `sluice_main`, etc.) and `info` from other
    /// crates.
    #[arg(long, default_value = "sluice_=debug,info", env = "SLUICE_LOG_FILTER")]
    pub log_filters: String,
    /// Whether logs should be written as JSON.
    #[arg(long, env = "SLUICE_LOG_JSON")]
    pub log_json: bool,
    /// Whether to disable color output in logs.
    ///
    /// Set to `1` to disable color output.
    #[arg(long, default_value = "0", env = "NO_COLOR")]
    pub log_no_color: i8,
}

#[derive(derive_more::Display, Debug)]
pub enum Error {
    #[display(fmt = "invalid log filter")]
    InvalidFilter,
    #[display(fmt = "failed to install the log subscriber")]
    Install,
}

impl error_stack::Context for Error {}

/// Installs the log subscriber. Logs go to stderr so stdout carries only
/// the flow's rows.
pub fn setup_tracing(config: &TracingOptions) -> error_stack::Result<(), Error> {
    let filter = EnvFilter::try_new(&config.log_filters)
        .into_report()
        .change_context(Error::InvalidFilter)
        .attach_printable_lazy(|| config.log_filters.clone())?;
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_error::ErrorLayer::default());

    // The format layer's type depends on the log format, so each branch
    // installs its own.
    if config.log_json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr);
        registry.with(fmt_layer).try_init()
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_ansi(config.log_no_color != 1)
            .with_target(false)
            .with_writer(std::io::stderr);
        registry.with(fmt_layer).try_init()
    }
    .into_report()
    .change_context(Error::Install)
}
