//! Tachikoma CLI
//!
//! Main entry point for the `tachikoma` binary.

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use tachikoma_cli::cli::Cli;

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_tracing(&cli);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(cli.execute()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            if let Some(hint) = e.hint() {
                eprintln!("hint: {hint}");
            }
            for suggestion in e.suggestions() {
                eprintln!("did you mean: {suggestion}");
            }
            e.exit_code()
        }
    }
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match cli.verbose {
        0 if cli.quiet => EnvFilter::new("error"),
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(cli.verbose >= 2),
        )
        .init();
}
