#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::undocumented_unsafe_blocks
)]

use clap::{command, Parser};
use error_stack::{IntoReport, ResultExt};
use sluice_main::tracing_setup::{setup_tracing, TracingOptions};
use sluice_main::RunCommand;
use tracing::error;

/// The top-level options for using Sluice.
#[derive(clap::Parser, Debug)]
#[command(name = "sluice", rename_all = "kebab-case", version)]
pub struct SluiceOptions {
    #[command(flatten)]
    tracing_options: TracingOptions,

    #[command(subcommand)]
    command: Command,
    /// Enables a custom panic handler which logs panics.
    ///
    /// This may be disabled to get the default backtrace and re-entrant
    /// panic handler.
    #[arg(long, env = "SLUICE_DISABLE_LOG_PANIC_HANDLER")]
    disable_log_panic_handler: bool,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run a flow spec on an in-process node and print its rows.
    Run(RunCommand),
    /// Print the default cluster settings as YAML.
    Settings,
}

#[tokio::main]
#[allow(clippy::print_stderr)]
async fn main() {
    let options = SluiceOptions::parse();
    if let Err(err) = setup_tracing(&options.tracing_options) {
        eprintln!("{err:?}");
        std::process::exit(2);
    }

    if !options.disable_log_panic_handler {
        std::panic::set_hook(Box::new(logging_panic_hook));
    }

    let exit_code = if let Err(err) = main_body(options).await {
        error!("{:?}", err);
        1
    } else {
        0
    };

    std::process::exit(exit_code);
}

#[derive(derive_more::Display, Debug)]
#[display(fmt = "error running command")]
pub struct Error;

impl error_stack::Context for Error {}

#[allow(clippy::print_stdout)]
async fn main_body(options: SluiceOptions) -> error_stack::Result<(), Error> {
    match options.command {
        Command::Run(run) => run.execute().await.change_context(Error)?,
        Command::Settings => {
            let yaml = serde_yaml::to_string(&sluice_execinfra::Settings::default())
                .into_report()
                .change_context(Error)?;
            print!("{yaml}");
        }
    };

    Ok(())
}

fn logging_panic_hook(panic_info: &std::panic::PanicInfo<'_>) {
    let message = panic_info
        .payload()
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<String>()
                .map(|s| s.as_ref())
        });

    match (message, panic_info.location()) {
        (Some(message), Some(location)) => error!("Panic: {} at {}", message, location),
        (Some(message), None) => error!("Panic: {} at unknown location", message),
        (None, Some(location)) => error!("Panic: unknown at {}", location),
        (None, None) => error!("Panic: unknown at unknown location"),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli() {
        SluiceOptions::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let options = SluiceOptions::try_parse_from([
            "sluice",
            "--log-json",
            "run",
            "--vectorize",
            "auto",
            "--set",
            "sql.distsql.flow_stream_timeout=2s",
            "flow.yaml",
        ])
        .unwrap();
        assert!(options.tracing_options.log_json);
        let Command::Run(run) = options.command else {
            panic!("expected run command");
        };
        assert_eq!(run.vectorize, sluice_main::Vectorize::Auto);
        assert_eq!(run.overrides, vec!["sql.distsql.flow_stream_timeout=2s"]);
        assert_eq!(run.flow, std::path::PathBuf::from("flow.yaml"));
    }
}
