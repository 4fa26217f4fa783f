use anyhow::Context;
use clap::Parser;
use config::cli::CliOpt;
use tracing_subscriber::EnvFilter;

mod config;
mod scenario;
mod simulation;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = CliOpt::parse();
    let scenario = config::load_scenario(&options)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to initialize tokio")?;

    rt.block_on(simulation::run(&options, scenario))
}
