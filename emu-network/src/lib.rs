pub mod controller;
pub mod error;
pub mod flow_monitor;
pub mod network;
pub mod pcap_exporter;
pub mod scheduler;
pub mod traffic;

pub use controller::{RunConfig, RunController, RunState, RunSummary};
pub use error::HarnessError;
pub use network::{EmulatedNetwork, PacketDelivered};
pub use scheduler::Scheduler;
