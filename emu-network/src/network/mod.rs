//! Emulated internetwork
//!
//! Simulated nodes are wired together by shared and point-to-point links, and bridged to real
//! host interfaces. IPv4 datagrams are forwarded hop by hop according to routing tables computed
//! by a global oracle, and every link imposes its rate and propagation delay.

pub mod addressing;
pub mod bridge;
pub mod device;
pub mod frame;
pub mod ip;
pub mod link;
pub mod node;
pub mod route;
pub mod spec;
pub mod topology;

use crate::error::HarnessError;
use crate::flow_monitor::{self, DropReason, FlowMonitor, FlowMonitorConfig};
use crate::network::addressing::AddressPlan;
use crate::network::bridge::{
    BridgeDevice, HostChannel, HostChannelFactory, HostFrame, NeighbourCache,
};
use crate::network::device::{DeviceId, DeviceKind, MacAddress};
use crate::network::frame::{Datagram, Frame, LinkLayer};
use crate::network::link::LinkId;
use crate::network::node::NodeId;
use crate::network::route::RoutingTables;
use crate::network::topology::Topology;
use crate::pcap_exporter::{PcapExporter, PcapExporterFactory};
use crate::scheduler::{Event, Scheduler};
use crate::traffic::UdpProbe;
use anyhow::Context;
use pcap_file::DataLink;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// A datagram that reached its destination node
#[derive(Clone, Debug)]
pub struct PacketDelivered {
    pub node: NodeId,
    pub time: Duration,
    pub datagram: Datagram,
}

pub type DeliveryHandler = Box<dyn FnMut(&PacketDelivered)>;

/// Counters of what happened to datagrams in the network
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ForwardingStats {
    pub originated: u64,
    pub received_from_hosts: u64,
    pub sent_to_hosts: u64,
    pub delivered: u64,
    pub forwarded: u64,
    pub dropped: u64,
}

struct DeviceCapture {
    device: DeviceId,
    promiscuous: bool,
    exporter: PcapExporter,
}

struct ProbeState {
    probe: UdpProbe,
    next_seq: u64,
}

pub struct EmulatedNetwork {
    topology: Topology,
    addresses: AddressPlan,
    routes: RoutingTables,
    neighbours: NeighbourCache,
    captures: Vec<DeviceCapture>,
    flow_monitor: Option<FlowMonitor>,
    host_channels: HashMap<DeviceId, Box<dyn HostChannel>>,
    delivery_handlers: Vec<DeliveryHandler>,
    probes: Vec<ProbeState>,
    route_dumps: HashMap<PathBuf, File>,
    stats: ForwardingStats,
}

impl EmulatedNetwork {
    /// Creates the network and resolves its routing tables
    pub fn new(topology: Topology, addresses: AddressPlan) -> Self {
        let routes = RoutingTables::resolve(&topology, &addresses);
        Self {
            topology,
            addresses,
            routes,
            neighbours: NeighbourCache::default(),
            captures: Vec::new(),
            flow_monitor: None,
            host_channels: HashMap::new(),
            delivery_handlers: Vec::new(),
            probes: Vec::new(),
            route_dumps: HashMap::new(),
            stats: ForwardingStats::default(),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn addresses(&self) -> &AddressPlan {
        &self.addresses
    }

    pub fn routes(&self) -> &RoutingTables {
        &self.routes
    }

    pub fn stats(&self) -> &ForwardingStats {
        &self.stats
    }

    pub fn flow_monitor(&self) -> Option<&FlowMonitor> {
        self.flow_monitor.as_ref()
    }

    /// Re-resolves the routing tables from the current topology and addresses
    pub fn recompute_routes(&mut self) {
        self.routes = RoutingTables::resolve(&self.topology, &self.addresses);
        debug!("routing tables recomputed");
    }

    /// Starts capturing the traffic of `device` into `<prefix>-<node>-<device index>.pcap`
    ///
    /// A promiscuous capture records every frame seen by the device (link-layer header
    /// included), otherwise only the IPv4 packets the device sends or accepts are recorded.
    pub fn attach_capture(
        &mut self,
        factory: &dyn PcapExporterFactory,
        device: DeviceId,
        prefix: &str,
        promiscuous: bool,
    ) -> anyhow::Result<String> {
        if !self.topology.contains_device(device) {
            return Err(HarnessError::invalid_spec(format!(
                "cannot capture traffic of unknown {device}"
            ))
            .into());
        }

        let device_info = self.topology.device(device);
        let file_name = format!(
            "{prefix}-{}-{}.pcap",
            device_info.node().0,
            device_info.index_on_node()
        );

        let datalink = match (promiscuous, device_info.kind()) {
            (false, _) => DataLink::IPV4,
            (true, DeviceKind::PointToPoint { .. }) => DataLink::PPP,
            (true, DeviceKind::Shared { .. } | DeviceKind::Bridge { .. }) => DataLink::ETHERNET,
        };

        let exporter = factory.create_pcap_exporter(&file_name, datalink)?;
        info!(
            "capturing {} traffic of {} {device} into {file_name}",
            device_info.role(),
            device_info.node()
        );

        self.captures.push(DeviceCapture {
            device,
            promiscuous,
            exporter,
        });

        Ok(file_name)
    }

    /// Captures every device of every node, as `<prefix>-<node>-<device index>.pcap`
    pub fn attach_capture_all(
        &mut self,
        factory: &dyn PcapExporterFactory,
        prefix: &str,
        promiscuous: bool,
    ) -> anyhow::Result<Vec<String>> {
        let devices: Vec<_> = self.topology.devices().iter().map(|d| d.id()).collect();
        devices
            .into_iter()
            .map(|device| self.attach_capture(factory, device, prefix, promiscuous))
            .collect()
    }

    /// Installs a flow monitor covering every node, replacing any previous one
    pub fn attach_flow_monitor(
        &mut self,
        config: FlowMonitorConfig,
    ) -> Result<FlowMonitor, HarnessError> {
        let monitor = flow_monitor::attach_flow_monitor(&self.topology, config)?;
        self.flow_monitor = Some(monitor.clone());
        Ok(monitor)
    }

    /// Registers a handler invoked from the dispatch loop for every datagram delivered to a node
    pub fn on_packet_delivered(&mut self, handler: impl FnMut(&PacketDelivered) + 'static) {
        self.delivery_handlers.push(Box::new(handler));
    }

    pub(crate) fn add_probe(&mut self, probe: UdpProbe) -> usize {
        self.probes.push(ProbeState { probe, next_seq: 0 });
        self.probes.len() - 1
    }

    pub(crate) fn open_host_channels(
        &mut self,
        factory: &dyn HostChannelFactory,
        ingress: &UnboundedSender<HostFrame>,
    ) -> Result<(), HarnessError> {
        let bridges: Vec<_> = self
            .topology
            .bridge_devices()
            .filter_map(BridgeDevice::from_device)
            .collect();

        for bridge in bridges {
            let channel = factory.open(&bridge, ingress.clone())?;
            self.host_channels.insert(bridge.device, channel);
        }

        Ok(())
    }

    pub(crate) fn close_host_channels(&mut self) {
        for (_, mut channel) in self.host_channels.drain() {
            channel.close();
        }
    }

    pub(crate) fn flush_captures(&mut self) -> anyhow::Result<()> {
        for capture in &mut self.captures {
            capture.exporter.flush()?;
            debug!(
                "{} holds {} records",
                capture.exporter.file_name(),
                capture.exporter.total_tracked_packets()
            );
        }

        self.route_dumps.clear();
        Ok(())
    }

    /// Writes the current routing tables to `path`
    ///
    /// The first dump to a path during a run truncates the file, later ones append to it.
    pub fn dump_routes(&mut self, path: &Path, now: Duration) -> anyhow::Result<()> {
        let file = match self.route_dumps.entry(path.to_path_buf()) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let file = fs::File::create(path)
                    .with_context(|| format!("failed to open {} for writing", path.display()))?;
                entry.insert(file)
            }
        };

        let mut buffer = Vec::new();
        self.routes.dump(&mut buffer, now)?;
        file.write_all(&buffer)
            .and_then(|_| file.flush())
            .with_context(|| format!("failed to write routing tables to {}", path.display()))?;

        info!(
            "{:.6}s routing tables written to {}",
            now.as_secs_f64(),
            path.display()
        );
        Ok(())
    }

    pub(crate) fn dispatch(&mut self, sched: &mut Scheduler, event: Event) {
        match event {
            Event::FrameArrival { device, frame } => self.handle_frame_arrival(sched, device, frame),
            Event::HostFrame(frame) => self.handle_host_frame(sched, frame),
            Event::RoutingDump { path } => {
                if let Err(e) = self.dump_routes(&path, sched.now()) {
                    error!("{e:?}");
                }
            }
            Event::RecomputeRoutes => self.recompute_routes(),
            Event::ProbeTick { probe } => self.probe_tick(sched, probe),
            Event::Action(action) => action(self, sched),
        }
    }

    /// Sends `datagram` from `node` as if generated by one of its applications
    pub fn originate(&mut self, sched: &mut Scheduler, node: NodeId, mut datagram: Datagram) {
        if !self.topology.contains_node(node) {
            debug!("dropping datagram originated by unknown {node}");
            return;
        }

        self.stats.originated += 1;
        if let Some(monitor) = &self.flow_monitor {
            monitor.report_first_tx(node, sched.now(), &mut datagram);
        }

        if self.addresses.is_local(node, datagram.destination()) {
            self.deliver_locally(sched, node, datagram);
        } else {
            self.route_and_send(sched, node, datagram);
        }
    }

    fn probe_tick(&mut self, sched: &mut Scheduler, probe: usize) {
        let Some(state) = self.probes.get_mut(probe) else {
            debug!("ignoring tick of unknown probe {probe}");
            return;
        };

        let node = state.probe.source;
        let seq = state.next_seq;
        state.next_seq += 1;
        let next_tick = state.probe.next_tick(sched.now());

        let Some(source) = self.addresses.primary_address(node) else {
            warn!("probe {probe} cannot send: {node} has no address");
            return;
        };

        let datagram = state.probe.datagram(source, seq, sched.now());
        if let Some(at) = next_tick {
            sched.schedule(at, Event::ProbeTick { probe });
        }

        self.originate(sched, node, datagram);
    }

    fn handle_host_frame(&mut self, sched: &mut Scheduler, host_frame: HostFrame) {
        let HostFrame { bridge, bytes } = host_frame;
        if !self.topology.contains_device(bridge) || !self.topology.device(bridge).is_bridge() {
            debug!("dropping host frame for unknown bridge {bridge}");
            return;
        }

        let frame = Frame::from_host(bytes);
        let accepted = self.is_addressed_to(bridge, &frame);
        self.capture(sched.now(), bridge, &frame, accepted);
        if !accepted {
            return;
        }

        let source_mac = frame.source_mac();
        let Some(mut datagram) = frame.into_datagram() else {
            debug!("ignoring non-IPv4 frame from the host at {bridge}");
            return;
        };

        if let Some(mac) = source_mac {
            self.neighbours.learn(bridge, datagram.source(), mac);
        }

        let node = self.topology.device(bridge).node();
        self.stats.received_from_hosts += 1;
        if let Some(monitor) = &self.flow_monitor {
            monitor.report_first_tx(node, sched.now(), &mut datagram);
        }

        self.receive_datagram(sched, node, datagram, false);
    }

    fn handle_frame_arrival(&mut self, sched: &mut Scheduler, device: DeviceId, frame: Frame) {
        if !self.topology.contains_device(device) {
            debug!("dropping frame for vanished {device}");
            return;
        }

        let accepted = self.is_addressed_to(device, &frame);
        self.capture(sched.now(), device, &frame, accepted);
        if !accepted {
            return;
        }

        let link_broadcast = frame.destination_mac().is_some_and(|mac| mac.is_multicast());
        let Some(datagram) = frame.into_datagram() else {
            debug!("dropping malformed frame at {device}");
            return;
        };

        let node = self.topology.device(device).node();
        if link_broadcast && !self.addresses.is_local(node, datagram.destination()) {
            debug!(
                "{node} ignores link-layer broadcast for {} at {device}",
                datagram.destination()
            );
            return;
        }

        self.receive_datagram(sched, node, datagram, true);
    }

    fn is_addressed_to(&self, device: DeviceId, frame: &Frame) -> bool {
        match frame.destination_mac() {
            None => frame.link_layer() == LinkLayer::Ppp,
            Some(mac) => mac.is_multicast() || mac == self.topology.device(device).mac(),
        }
    }

    /// Handles a datagram that reached `node` from one of its devices
    fn receive_datagram(
        &mut self,
        sched: &mut Scheduler,
        node: NodeId,
        mut datagram: Datagram,
        count_forwarding: bool,
    ) {
        if self.addresses.is_local(node, datagram.destination()) {
            self.deliver_locally(sched, node, datagram);
            return;
        }

        if !self.topology.node(node).ip_forwarding() {
            self.drop_datagram(sched, node, &datagram, DropReason::ForwardingDisabled);
            return;
        }

        if !datagram.decrement_ttl() {
            self.drop_datagram(sched, node, &datagram, DropReason::TtlExpired);
            return;
        }

        self.stats.forwarded += 1;
        if count_forwarding {
            if let Some(monitor) = &self.flow_monitor {
                monitor.report_forwarding(node, sched.now(), &datagram);
            }
        }

        self.route_and_send(sched, node, datagram);
    }

    fn route_and_send(&mut self, sched: &mut Scheduler, node: NodeId, datagram: Datagram) {
        let destination = datagram.destination();
        let Some(route) = self.routes.lookup(node, destination) else {
            self.drop_datagram(sched, node, &datagram, DropReason::NoRoute);
            return;
        };

        let device = route.device;
        let next_hop = route.next_hop(destination);
        self.transmit(sched, device, next_hop, datagram);
    }

    fn transmit(
        &mut self,
        sched: &mut Scheduler,
        device: DeviceId,
        next_hop: Ipv4Addr,
        datagram: Datagram,
    ) {
        let now = sched.now();
        let sender = self.topology.device(device);
        let node = sender.node();
        let own_mac = sender.mac();

        match sender.kind().clone() {
            DeviceKind::Bridge { interface_name } => {
                if let Some(monitor) = &self.flow_monitor {
                    monitor.report_last_rx(node, now, &datagram);
                }

                let destination_mac = self.neighbours.resolve(device, next_hop);
                let frame = datagram.into_frame(LinkLayer::Ethernet, own_mac, destination_mac);
                self.capture(now, device, &frame, true);
                self.stats.sent_to_hosts += 1;

                match self.host_channels.get_mut(&device) {
                    Some(channel) => {
                        if let Err(e) = channel.send(frame.bytes()) {
                            warn!("{e:?}");
                        }
                    }
                    None => debug!("no open channel on `{interface_name}`, frame discarded"),
                }
            }
            DeviceKind::Shared { link, .. } => {
                let Some(destination_mac) = self.link_neighbour_mac(device, next_hop) else {
                    self.drop_datagram(sched, node, &datagram, DropReason::NeighbourUnreachable);
                    return;
                };
                let frame = datagram.into_frame(LinkLayer::Ethernet, own_mac, destination_mac);
                self.put_on_link(sched, device, link, frame);
            }
            DeviceKind::PointToPoint { link, .. } => {
                let frame = datagram.into_frame(LinkLayer::Ppp, own_mac, MacAddress::BROADCAST);
                self.put_on_link(sched, device, link, frame);
            }
        }
    }

    /// The hardware address of the device holding `next_hop` on the same segment as `device`
    fn link_neighbour_mac(&self, device: DeviceId, next_hop: Ipv4Addr) -> Option<MacAddress> {
        let link = self.topology.device(device).link();
        self.addresses
            .device_owning(next_hop)
            .map(|owner| self.topology.device(owner))
            .filter(|owner| owner.link().is_some() && owner.link() == link)
            .map(|owner| owner.mac())
    }

    fn put_on_link(
        &mut self,
        sched: &mut Scheduler,
        device: DeviceId,
        link: LinkId,
        frame: Frame,
    ) {
        let now = sched.now();
        self.capture(now, device, &frame, true);

        let link = self.topology.link_mut(link);
        let transmission = link.transmit(device, now, frame.bytes().len());
        let receivers: Vec<_> = link.receivers_of(device).collect();

        debug!(
            "{:.6}s {device} sends {} bytes on {} (arrives at {:.6}s)",
            now.as_secs_f64(),
            frame.bytes().len(),
            link.id(),
            transmission.arrival.as_secs_f64()
        );

        for receiver in receivers {
            sched.schedule(
                transmission.arrival,
                Event::FrameArrival {
                    device: receiver,
                    frame: frame.clone(),
                },
            );
        }
    }

    fn deliver_locally(&mut self, sched: &mut Scheduler, node: NodeId, datagram: Datagram) {
        let now = sched.now();
        if let Some(monitor) = &self.flow_monitor {
            monitor.report_last_rx(node, now, &datagram);
        }

        self.stats.delivered += 1;
        debug!(
            "{:.6}s {node} received {} bytes from {}",
            now.as_secs_f64(),
            datagram.len(),
            datagram.source()
        );

        let event = PacketDelivered {
            node,
            time: now,
            datagram,
        };

        for handler in &mut self.delivery_handlers {
            handler(&event);
        }
    }

    fn drop_datagram(
        &mut self,
        sched: &mut Scheduler,
        node: NodeId,
        datagram: &Datagram,
        reason: DropReason,
    ) {
        warn!(
            "{:.6}s {node} dropped datagram {} -> {} ({reason:?})",
            sched.now().as_secs_f64(),
            datagram.source(),
            datagram.destination()
        );

        self.stats.dropped += 1;
        if let Some(monitor) = &self.flow_monitor {
            monitor.report_drop(node, sched.now(), datagram, reason);
        }
    }

    fn capture(&mut self, now: Duration, device: DeviceId, frame: &Frame, addressed: bool) {
        for capture in self.captures.iter_mut().filter(|c| c.device == device) {
            let data = if capture.promiscuous {
                Some(frame.bytes())
            } else if addressed {
                frame.ipv4_payload()
            } else {
                None
            };

            let Some(data) = data else {
                continue;
            };

            if let Err(e) = capture.exporter.track_packet(now, data) {
                warn!("{e:?}");
            }
        }
    }
}
