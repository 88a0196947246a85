//! Toolbridge entry point.
//!
//! `toolbridge` runs the gateway until SIGINT/SIGTERM; `toolbridge check`
//! validates the configuration and prints a summary.

use clap::Parser;

use toolbridge::app;
use toolbridge::cli::{Cli, Command, LogFormat};
use toolbridge::error::EXIT_OK;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let outcome = match cli.command {
        Some(Command::Check) => app::check(cli.config.as_deref()).map(|summary| print!("{summary}")),
        None => app::run(cli.config.as_deref()).await,
    };

    let code = match outcome {
        Ok(()) => EXIT_OK,
        Err(e) => {
            tracing::error!(error = %e, "toolbridge failed");
            eprintln!("toolbridge: {e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

/// Install the stderr subscriber.
///
/// `verbose` forces `debug`; otherwise `RUST_LOG` applies, defaulting to
/// `info`.
fn init_tracing(verbose: bool, format: LogFormat) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
