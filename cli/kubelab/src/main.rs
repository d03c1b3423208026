//! kubelab - bring up and tear down local Kubernetes lab clusters.
//!
//! Exit codes:
//! - 0: success (`up`: every node converged)
//! - 1: `up` finished but the cluster is degraded
//! - 2: fatal error (invalid config or spec, provisioning failure, cancellation)

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod error;
mod output;

use commands::{Cli, LogFormat};

/// Exit code for fatal errors.
const EXIT_FATAL: i32 = 2;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_level(), cli.log_format());

    match cli.run().await {
        Ok(status) => std::process::exit(status.code()),
        Err(e) => {
            error::print_error(&e);
            std::process::exit(EXIT_FATAL);
        }
    }
}

/// Logs go to stderr so command output on stdout stays parseable.
fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}
