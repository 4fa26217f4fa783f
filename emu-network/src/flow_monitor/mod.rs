//! Aggregate per-flow statistics, in the spirit of a flow monitor installed on every node
//!
//! A datagram is tracked from the moment it enters the emulated network (locally originated, or
//! received from a host through a bridge) until it leaves it (delivered locally, or sent to a host
//! through a bridge). Every node it passes through in between counts as a forwarding step.

pub mod classifier;
pub mod histogram;
mod xml;

use crate::flow_monitor::classifier::{ClassifiedFlow, Ipv4FlowClassifier};
use crate::error::HarnessError;
use crate::flow_monitor::histogram::Histogram;
use crate::network::frame::{Datagram, FlowTag};
use crate::network::node::NodeId;
use crate::network::topology::Topology;
use anyhow::Context;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct FlowMonitorConfig {
    /// Width of the delay histogram bins, in seconds
    pub delay_bin_width: f64,
    /// Width of the jitter histogram bins, in seconds
    pub jitter_bin_width: f64,
    /// Width of the packet size histogram bins, in bytes
    pub packet_size_bin_width: f64,
    /// Packets that have been in flight for longer than this are considered lost
    pub max_per_hop_delay: Duration,
}

impl Default for FlowMonitorConfig {
    fn default() -> Self {
        Self {
            delay_bin_width: 0.001,
            jitter_bin_width: 0.001,
            packet_size_bin_width: 20.0,
            max_per_hop_delay: Duration::from_secs(10),
        }
    }
}

/// Why a monitored packet was dropped
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DropReason {
    NoRoute,
    TtlExpired,
    ForwardingDisabled,
    /// The next hop is not held by any device on the outgoing segment
    NeighbourUnreachable,
}

impl DropReason {
    pub fn code(&self) -> usize {
        match self {
            DropReason::NoRoute => 0,
            DropReason::TtlExpired => 1,
            DropReason::ForwardingDisabled => 2,
            DropReason::NeighbourUnreachable => 3,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FlowStats {
    pub time_first_tx_packet: Duration,
    pub time_first_rx_packet: Duration,
    pub time_last_tx_packet: Duration,
    pub time_last_rx_packet: Duration,
    pub delay_sum: Duration,
    pub jitter_sum: Duration,
    pub last_delay: Duration,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub lost_packets: u64,
    pub times_forwarded: u64,
    pub delay_histogram: Histogram,
    pub jitter_histogram: Histogram,
    pub packet_size_histogram: Histogram,
    /// Dropped packets, indexed by [`DropReason::code`]
    pub packets_dropped: Vec<u64>,
    /// Dropped bytes, indexed by [`DropReason::code`]
    pub bytes_dropped: Vec<u64>,
}

impl FlowStats {
    fn new(config: &FlowMonitorConfig) -> Self {
        Self {
            time_first_tx_packet: Duration::ZERO,
            time_first_rx_packet: Duration::ZERO,
            time_last_tx_packet: Duration::ZERO,
            time_last_rx_packet: Duration::ZERO,
            delay_sum: Duration::ZERO,
            jitter_sum: Duration::ZERO,
            last_delay: Duration::ZERO,
            tx_bytes: 0,
            rx_bytes: 0,
            tx_packets: 0,
            rx_packets: 0,
            lost_packets: 0,
            times_forwarded: 0,
            delay_histogram: Histogram::new(config.delay_bin_width),
            jitter_histogram: Histogram::new(config.jitter_bin_width),
            packet_size_histogram: Histogram::new(config.packet_size_bin_width),
            packets_dropped: Vec::new(),
            bytes_dropped: Vec::new(),
        }
    }
}

/// What a single node observed of a flow
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProbeFlowStats {
    pub packets: u64,
    pub bytes: u64,
    pub delay_from_first_probe_sum: Duration,
    pub packets_dropped: Vec<u64>,
    pub bytes_dropped: Vec<u64>,
}

struct TrackedPacket {
    first_seen: Duration,
    last_seen: Duration,
    times_forwarded: u64,
}

struct FlowMonitorInner {
    config: FlowMonitorConfig,
    classifier: Ipv4FlowClassifier,
    flows: BTreeMap<u32, FlowStats>,
    /// Packets in flight, per flow and by sequence number
    tracked: HashMap<u32, BTreeMap<u64, TrackedPacket>>,
    next_seq: HashMap<u32, u64>,
    /// One probe per node
    probes: Vec<BTreeMap<u32, ProbeFlowStats>>,
}

/// Shared accumulator of flow statistics
#[derive(Clone)]
pub struct FlowMonitor {
    inner: Arc<Mutex<FlowMonitorInner>>,
}

/// Installs a flow monitor covering every node of the topology
pub fn attach_flow_monitor(
    topology: &Topology,
    config: FlowMonitorConfig,
) -> Result<FlowMonitor, HarnessError> {
    for (name, width) in [
        ("delay", config.delay_bin_width),
        ("jitter", config.jitter_bin_width),
        ("packet size", config.packet_size_bin_width),
    ] {
        if !(width.is_finite() && width > 0.0) {
            return Err(HarnessError::InvalidFlowMonitorConfig {
                reason: format!("{name} histogram bin width must be positive, got {width}"),
            });
        }
    }

    info!(
        "monitoring flows on {} nodes (delay bins {}s, jitter bins {}s, size bins {}B)",
        topology.nodes().len(),
        config.delay_bin_width,
        config.jitter_bin_width,
        config.packet_size_bin_width
    );

    Ok(FlowMonitor {
        inner: Arc::new(Mutex::new(FlowMonitorInner {
            config,
            classifier: Ipv4FlowClassifier::default(),
            flows: BTreeMap::new(),
            tracked: HashMap::new(),
            next_seq: HashMap::new(),
            probes: vec![BTreeMap::new(); topology.nodes().len()],
        })),
    })
}

impl FlowMonitor {
    /// Records a datagram entering the network at `node`, tagging it for the rest of its journey
    pub(crate) fn report_first_tx(&self, node: NodeId, now: Duration, datagram: &mut Datagram) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        let flow_id = inner.classifier.classify(datagram);
        let seq = inner.next_seq.entry(flow_id).or_insert(0);
        let tag = FlowTag {
            flow_id,
            seq: *seq,
        };
        *seq += 1;
        datagram.tag = Some(tag);

        let size = datagram.len() as u64;
        let stats = inner
            .flows
            .entry(flow_id)
            .or_insert_with(|| FlowStats::new(&inner.config));
        if stats.tx_packets == 0 {
            stats.time_first_tx_packet = now;
        }
        stats.tx_packets += 1;
        stats.tx_bytes += size;
        stats.time_last_tx_packet = now;

        inner.tracked.entry(flow_id).or_default().insert(
            tag.seq,
            TrackedPacket {
                first_seen: now,
                last_seen: now,
                times_forwarded: 0,
            },
        );

        inner.probe(node, flow_id, size, Duration::ZERO);
    }

    /// Records a datagram being forwarded by an intermediate node
    pub(crate) fn report_forwarding(&self, node: NodeId, now: Duration, datagram: &Datagram) {
        let Some(tag) = datagram.tag else {
            return;
        };

        let mut inner = self.inner.lock();
        let Some(tracked) = inner
            .tracked
            .get_mut(&tag.flow_id)
            .and_then(|packets| packets.get_mut(&tag.seq))
        else {
            return;
        };

        tracked.times_forwarded += 1;
        tracked.last_seen = now;
        let delay = now.saturating_sub(tracked.first_seen);
        inner.probe(node, tag.flow_id, datagram.len() as u64, delay);
    }

    /// Records a datagram leaving the network at `node`
    ///
    /// Earlier packets of the same flow that are still in flight have been overtaken, and are
    /// counted as lost. Should they arrive later on, they are ignored.
    pub(crate) fn report_last_rx(&self, node: NodeId, now: Duration, datagram: &Datagram) {
        let Some(tag) = datagram.tag else {
            return;
        };

        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let Some(tracked) = inner.untrack(tag) else {
            return;
        };

        let overtaken = match inner.tracked.get_mut(&tag.flow_id) {
            Some(packets) => {
                let newer = packets.split_off(&tag.seq);
                std::mem::replace(packets, newer).len() as u64
            }
            None => 0,
        };

        let size = datagram.len() as u64;
        let delay = now.saturating_sub(tracked.first_seen);
        let Some(stats) = inner.flows.get_mut(&tag.flow_id) else {
            return;
        };

        if overtaken > 0 {
            debug!(
                "{:.6}s flow {} packet {} overtook {overtaken} earlier packets",
                now.as_secs_f64(),
                tag.flow_id,
                tag.seq
            );
            stats.lost_packets += overtaken;
        }

        if stats.rx_packets > 0 {
            let jitter = stats.last_delay.abs_diff(delay);
            stats.jitter_sum += jitter;
            stats.jitter_histogram.add_value(jitter.as_secs_f64());
        }
        stats.last_delay = delay;

        stats.delay_sum += delay;
        stats.delay_histogram.add_value(delay.as_secs_f64());
        stats.packet_size_histogram.add_value(size as f64);
        stats.rx_bytes += size;
        stats.rx_packets += 1;
        if stats.rx_packets == 1 {
            stats.time_first_rx_packet = now;
        }
        stats.time_last_rx_packet = now;
        stats.times_forwarded += tracked.times_forwarded;

        inner.probe(node, tag.flow_id, size, delay);
    }

    /// Records an explicit drop, which also counts the packet as lost
    pub(crate) fn report_drop(
        &self,
        node: NodeId,
        now: Duration,
        datagram: &Datagram,
        reason: DropReason,
    ) {
        let Some(tag) = datagram.tag else {
            return;
        };

        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        if inner.untrack(tag).is_none() {
            return;
        }

        let size = datagram.len() as u64;
        if let Some(stats) = inner.flows.get_mut(&tag.flow_id) {
            stats.lost_packets += 1;
            count_drop(&mut stats.packets_dropped, &mut stats.bytes_dropped, reason, size);
        }

        if let Some(probe) = inner.probes.get_mut(node.0) {
            let stats = probe.entry(tag.flow_id).or_default();
            count_drop(&mut stats.packets_dropped, &mut stats.bytes_dropped, reason, size);
        }

        debug!(
            "{:.6}s flow {} packet {} dropped at {node} ({reason:?})",
            now.as_secs_f64(),
            tag.flow_id,
            tag.seq
        );
    }

    /// Counts packets that have not been seen for longer than the configured maximum per-hop
    /// delay as lost
    pub fn check_for_lost_packets(&self, now: Duration) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let max_delay = inner.config.max_per_hop_delay;

        for (flow_id, packets) in &mut inner.tracked {
            let before = packets.len();
            packets.retain(|_, packet| now.saturating_sub(packet.last_seen) < max_delay);
            let expired = (before - packets.len()) as u64;
            if expired > 0 {
                if let Some(stats) = inner.flows.get_mut(flow_id) {
                    stats.lost_packets += expired;
                }
            }
        }
        inner.tracked.retain(|_, packets| !packets.is_empty());
    }

    /// Counts every packet still in flight as lost
    ///
    /// Once the run is over nothing else can be delivered, so afterwards every transmitted packet
    /// is either received or lost.
    pub fn account_for_in_flight_packets(&self) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        for (flow_id, packets) in inner.tracked.drain() {
            if let Some(stats) = inner.flows.get_mut(&flow_id) {
                stats.lost_packets += packets.len() as u64;
            }
        }
    }

    /// A copy of the per-flow statistics, ordered by flow id
    pub fn flow_stats(&self) -> BTreeMap<u32, FlowStats> {
        self.inner.lock().flows.clone()
    }

    pub fn classified_flows(&self) -> Vec<ClassifiedFlow> {
        self.inner.lock().classifier.flows().to_vec()
    }

    pub fn probe_stats(&self, node: NodeId) -> BTreeMap<u32, ProbeFlowStats> {
        self.inner
            .lock()
            .probes
            .get(node.0)
            .cloned()
            .unwrap_or_default()
    }

    /// Packets currently in flight
    pub fn tracked_packets(&self) -> usize {
        self.inner.lock().tracked.values().map(BTreeMap::len).sum()
    }

    /// Serializes the current statistics as an XML document
    pub fn to_xml(&self) -> anyhow::Result<String> {
        let inner = self.inner.lock();
        let snapshot = xml::Snapshot {
            flows: &inner.flows,
            classifier: &inner.classifier,
            probes: &inner.probes,
        };

        snapshot.serialize()
    }

    /// Writes the current statistics to `path`
    ///
    /// Calling this before the run is over produces a well-formed document with whatever has
    /// been observed so far.
    pub fn finalize(&self, path: &Path) -> anyhow::Result<()> {
        let document = self.to_xml()?;
        fs::write(path, document)
            .with_context(|| format!("failed to write flow statistics to {}", path.display()))?;

        let flows = self.inner.lock().flows.len();
        if flows == 0 {
            warn!("no flows observed, {} is empty", path.display());
        } else {
            info!("wrote statistics of {flows} flows to {}", path.display());
        }

        Ok(())
    }
}

impl FlowMonitorInner {
    fn untrack(&mut self, tag: FlowTag) -> Option<TrackedPacket> {
        let packets = self.tracked.get_mut(&tag.flow_id)?;
        let packet = packets.remove(&tag.seq)?;
        if packets.is_empty() {
            self.tracked.remove(&tag.flow_id);
        }
        Some(packet)
    }

    fn probe(&mut self, node: NodeId, flow_id: u32, size: u64, delay_from_first_probe: Duration) {
        let Some(probe) = self.probes.get_mut(node.0) else {
            return;
        };

        let stats = probe.entry(flow_id).or_default();
        stats.packets += 1;
        stats.bytes += size;
        stats.delay_from_first_probe_sum += delay_from_first_probe;
    }
}

fn count_drop(packets: &mut Vec<u64>, bytes: &mut Vec<u64>, reason: DropReason, size: u64) {
    let code = reason.code();
    if packets.len() <= code {
        packets.resize(code + 1, 0);
        bytes.resize(code + 1, 0);
    }

    packets[code] += 1;
    bytes[code] += size;
}
