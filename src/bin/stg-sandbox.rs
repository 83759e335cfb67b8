//! The sandbox process that runs concrete invocations for the test generator.
//!
//! Requests arrive as lines of JSON on standard input and responses leave on
//! standard output. Logs go to standard error.

use std::io;

use symbolic_test_generator::sandbox::child;
use tracing::info;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(io::stderr)
        .init();

    info!(pid = std::process::id(), "Starting sandbox");
    let stdin = io::stdin();
    let stdout = io::stdout();
    if let Some(code) = child::serve(stdin.lock(), stdout.lock())? {
        std::process::exit(code);
    }
    Ok(())
}
