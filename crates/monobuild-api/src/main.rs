//! Builder entry point.

use std::process::ExitCode;

use clap::Parser;
use monobuild_api::process::{Options, Process};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let opt = Options::parse();

    let default_filter = if opt.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let code = Process::new(opt).run().await;
    ExitCode::from(code as u8)
}
