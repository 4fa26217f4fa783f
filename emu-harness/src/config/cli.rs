use clap::{Parser, Subcommand};
use emu_network::network::spec::{DataRate, parse_delay};
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(about = "Bridges real host interfaces into an emulated internetwork")]
pub struct CliOpt {
    /// Simulated time at which the run stops, in seconds
    #[arg(long, global = true, default_value_t = 30.0)]
    pub stop_time: f64,

    /// Directory where captures, routing dumps and flow statistics are written
    #[arg(long, global = true, default_value = ".")]
    pub output_dir: PathBuf,

    /// Don't open the host interfaces (bridges exist in the topology but never see real traffic)
    #[arg(long, global = true)]
    pub offline: bool,

    /// Jump from event to event instead of pacing the run against the wall clock
    #[arg(long, global = true)]
    pub no_realtime: bool,

    /// Periodically send UDP probes to this address
    #[arg(long, global = true)]
    pub probe: Option<SocketAddrV4>,

    /// The node that sends the probes
    #[arg(long, global = true, default_value_t = 0)]
    pub probe_source: usize,

    /// The interval between probes, in milliseconds
    #[arg(long, global = true, default_value_t = 1000)]
    pub probe_interval_ms: u64,

    #[command(subcommand)]
    pub command: Command,
}

impl CliOpt {
    pub fn stop_time(&self) -> anyhow::Result<Duration> {
        Duration::try_from_secs_f64(self.stop_time)
            .map_err(|e| anyhow::anyhow!("invalid stop time `{}`: {e}", self.stop_time))
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Three bridged nodes on a single shared segment
    Csma(CsmaOpt),
    /// Three nodes chained by two point-to-point links, each one bridged
    P2p(P2pOpt),
    /// A topology read from a JSON file
    Topology(TopologyOpt),
}

#[derive(Parser, Debug, Clone)]
pub struct CsmaOpt {
    /// The data rate of the shared segment
    #[arg(long, default_value = "5Mbps")]
    pub data_rate: DataRate,

    /// The propagation delay of the shared segment
    #[arg(long, default_value = "20ms", value_parser = parse_delay)]
    pub data_delay: Duration,
}

#[derive(Parser, Debug, Clone)]
pub struct P2pOpt {
    /// The data rate of the link between the first and the second node
    #[arg(long, default_value = "10Mbps")]
    pub data1_rate: DataRate,

    /// The propagation delay of the link between the first and the second node
    #[arg(long, default_value = "350ms", value_parser = parse_delay)]
    pub data1_delay: Duration,

    /// The data rate of the link between the second and the third node
    #[arg(long, default_value = "10Mbps")]
    pub data2_rate: DataRate,

    /// The propagation delay of the link between the second and the third node
    #[arg(long, default_value = "150ms", value_parser = parse_delay)]
    pub data2_delay: Duration,
}

#[derive(Parser, Debug, Clone)]
pub struct TopologyOpt {
    /// Path to the JSON file describing the topology
    #[arg(long)]
    pub file: PathBuf,
}
