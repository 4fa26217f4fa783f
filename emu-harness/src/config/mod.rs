use crate::config::cli::{CliOpt, Command};
use crate::config::network::TopologyJson;
use crate::scenario::{self, Scenario};
use anyhow::Context;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

pub mod cli;
pub mod network;

/// Resolves the scenario selected on the command line
pub fn load_scenario(options: &CliOpt) -> anyhow::Result<Scenario> {
    match &options.command {
        Command::Csma(opt) => Ok(scenario::csma(opt)),
        Command::P2p(opt) => Ok(scenario::p2p(opt)),
        Command::Topology(opt) => load_topology(&opt.file),
    }
}

fn load_topology(path: &Path) -> anyhow::Result<Scenario> {
    let file = File::open(path)
        .with_context(|| format!("failed to open topology file at {}", path.display()))?;
    let json: TopologyJson = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("invalid JSON topology at {}", path.display()))?;
    Scenario::try_from(json).with_context(|| format!("invalid topology at {}", path.display()))
}
