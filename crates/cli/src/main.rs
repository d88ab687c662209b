use std::process::ExitCode;

use tracing::Level;

fn main() -> ExitCode {
    // stdout carries the JSON result; diagnostics go to stderr.
    let level = std::env::var("ROUTEWISE_CLI_LOG_LEVEL")
        .ok()
        .and_then(|value| value.parse::<Level>().ok())
        .unwrap_or(Level::WARN);
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_max_level(level)
        .compact()
        .init();

    routewise_cli::run()
}
