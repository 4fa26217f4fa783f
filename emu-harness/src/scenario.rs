use crate::config::cli::{CsmaOpt, P2pOpt};
use anyhow::Context;
use emu_network::EmulatedNetwork;
use emu_network::network::addressing::{self, BridgeAddress, LinkSubnet};
use emu_network::network::bridge;
use emu_network::network::device::{DeviceId, MacAddress};
use emu_network::network::link::LinkId;
use emu_network::network::node::NodeId;
use emu_network::network::spec::LinkSpec;
use emu_network::network::topology::Topology;
use emu_network::pcap_exporter::PcapExporterFactory;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

pub const ROUTES_FILE: &str = "routes_emu.routes";
pub const FLOW_MONITOR_FILE: &str = "flowmon-results.xml";

const MASK_24: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Everything needed to set up a run, before any of it is instantiated
#[derive(Clone, Debug)]
pub struct Scenario {
    pub name: String,
    pub node_count: usize,
    pub links: Vec<ScenarioLink>,
    pub bridges: Vec<ScenarioBridge>,
    pub captures: Vec<CaptureSpec>,
    pub routing_dump: Option<RoutingDump>,
    pub flow_monitor: bool,
}

#[derive(Clone, Debug)]
pub struct ScenarioLink {
    pub spec: LinkSpec,
    /// Network address and mask of the subnet, if the link is addressed at all
    pub subnet: Option<(Ipv4Addr, Ipv4Addr)>,
}

#[derive(Clone, Debug)]
pub struct ScenarioBridge {
    pub node: usize,
    pub interface: String,
    pub address: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub mac: Option<MacAddress>,
}

#[derive(Clone, Debug)]
pub struct CaptureSpec {
    pub prefix: String,
    pub target: CaptureTarget,
    pub promiscuous: bool,
}

#[derive(Clone, Debug)]
pub enum CaptureTarget {
    /// The device at `index` on `node`
    Device { node: usize, index: usize },
    /// Every device attached to the link
    Link(usize),
    /// Every device of every node
    All,
}

#[derive(Clone, Debug)]
pub struct RoutingDump {
    pub at: Duration,
    pub file: PathBuf,
}

impl Scenario {
    /// Builds the topology, binds the bridges and assigns every address
    pub fn build(&self) -> anyhow::Result<EmulatedNetwork> {
        let specs: Vec<_> = self.links.iter().map(|l| l.spec.clone()).collect();
        let mut topology = Topology::build(self.node_count, &specs)?;

        let mut bridge_addresses = Vec::with_capacity(self.bridges.len());
        for bridge in &self.bridges {
            let device = bridge::bind(&mut topology, NodeId(bridge.node), &bridge.interface, bridge.mac)?;
            bridge_addresses.push(BridgeAddress {
                bridge: device,
                address: bridge.address,
                mask: bridge.mask,
            });
        }

        let link_subnets: Vec<_> = self
            .links
            .iter()
            .enumerate()
            .filter_map(|(i, link)| {
                link.subnet.map(|(base, mask)| LinkSubnet {
                    link: LinkId(i),
                    base,
                    mask,
                })
            })
            .collect();

        let plan = addressing::assign(&mut topology, &link_subnets, &bridge_addresses)?;
        Ok(EmulatedNetwork::new(topology, plan))
    }

    pub fn attach_captures(
        &self,
        network: &mut EmulatedNetwork,
        factory: &dyn PcapExporterFactory,
    ) -> anyhow::Result<Vec<String>> {
        let mut file_names = Vec::new();
        for capture in &self.captures {
            for device in self.capture_devices(network, &capture.target)? {
                let file_name = network
                    .attach_capture(factory, device, &capture.prefix, capture.promiscuous)
                    .with_context(|| format!("failed to start capture `{}`", capture.prefix))?;
                file_names.push(file_name);
            }
        }

        Ok(file_names)
    }

    fn capture_devices(
        &self,
        network: &EmulatedNetwork,
        target: &CaptureTarget,
    ) -> anyhow::Result<Vec<DeviceId>> {
        let topology = network.topology();
        let devices = match *target {
            CaptureTarget::Device { node, index } => {
                let device = topology
                    .device_at(NodeId(node), index)
                    .with_context(|| format!("node {node} has no device at index {index}"))?;
                vec![device.id()]
            }
            CaptureTarget::Link(link) => {
                anyhow::ensure!(
                    link < topology.links().len(),
                    "cannot capture unknown link {link}"
                );
                topology.link(LinkId(link)).devices().to_vec()
            }
            CaptureTarget::All => topology.devices().iter().map(|d| d.id()).collect(),
        };

        Ok(devices)
    }
}

/// Three nodes on one shared segment, each bridged to a host interface
pub fn csma(options: &CsmaOpt) -> Scenario {
    let bridges = [("enp0s8", 29), ("enp0s9", 30), ("enp0s10", 31)]
        .into_iter()
        .enumerate()
        .map(|(node, (interface, subnet))| ScenarioBridge {
            node,
            interface: interface.to_string(),
            address: Ipv4Addr::new(10, 161, subnet, 20),
            mask: MASK_24,
            mac: None,
        })
        .collect();

    // Bridge devices come after the shared device on each node
    let mut captures = Vec::new();
    for (node, side) in ["left", "middle", "right"].into_iter().enumerate() {
        for (prefix, index) in [("fd", 1), ("csma", 0)] {
            captures.push(CaptureSpec {
                prefix: format!("{prefix}-{side}"),
                target: CaptureTarget::Device { node, index },
                promiscuous: true,
            });
        }
    }

    Scenario {
        name: "csma".to_string(),
        node_count: 3,
        links: vec![ScenarioLink {
            spec: LinkSpec::shared([0, 1, 2], options.data_rate, options.data_delay),
            subnet: Some((Ipv4Addr::new(192, 134, 135, 0), MASK_24)),
        }],
        bridges,
        captures,
        routing_dump: Some(RoutingDump {
            at: Duration::from_secs(15),
            file: PathBuf::from(ROUTES_FILE),
        }),
        flow_monitor: true,
    }
}

/// Three nodes chained by point-to-point links, each bridged to a host interface
pub fn p2p(options: &P2pOpt) -> Scenario {
    let bridges = [
        ("enp0s8", 29, MacAddress([0x08, 0x00, 0x27, 0xb3, 0xa5, 0x82])),
        ("enp0s9", 30, MacAddress([0x08, 0x00, 0x27, 0x7f, 0xd9, 0x0c])),
        ("enp0s10", 31, MacAddress([0x08, 0x00, 0x27, 0xdc, 0x60, 0x80])),
    ]
    .into_iter()
    .enumerate()
    .map(|(node, (interface, subnet, mac))| ScenarioBridge {
        node,
        interface: interface.to_string(),
        address: Ipv4Addr::new(10, 161, subnet, 20),
        mask: MASK_24,
        mac: Some(mac),
    })
    .collect();

    Scenario {
        name: "p2p".to_string(),
        node_count: 3,
        links: vec![
            ScenarioLink {
                spec: LinkSpec::point_to_point(0, 1, options.data1_rate, options.data1_delay),
                subnet: Some((Ipv4Addr::new(192, 134, 135, 0), MASK_24)),
            },
            ScenarioLink {
                spec: LinkSpec::point_to_point(1, 2, options.data2_rate, options.data2_delay),
                subnet: Some((Ipv4Addr::new(198, 134, 135, 0), MASK_24)),
            },
        ],
        bridges,
        captures: vec![
            CaptureSpec {
                prefix: "ptop1".to_string(),
                target: CaptureTarget::Link(0),
                promiscuous: true,
            },
            CaptureSpec {
                prefix: "ptop2".to_string(),
                target: CaptureTarget::Link(1),
                promiscuous: true,
            },
        ],
        routing_dump: Some(RoutingDump {
            at: Duration::from_secs(1),
            file: PathBuf::from(ROUTES_FILE),
        }),
        flow_monitor: true,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use emu_network::network::spec::DataRate;
    use emu_network::pcap_exporter::InMemoryPcapExporterFactory;

    fn csma_options() -> CsmaOpt {
        CsmaOpt {
            data_rate: DataRate::from_mbps(5),
            data_delay: Duration::from_millis(20),
        }
    }

    fn p2p_options() -> P2pOpt {
        P2pOpt {
            data1_rate: DataRate::from_mbps(10),
            data1_delay: Duration::from_millis(350),
            data2_rate: DataRate::from_mbps(10),
            data2_delay: Duration::from_millis(150),
        }
    }

    #[test]
    fn test_csma_captures() {
        let scenario = csma(&csma_options());
        let mut network = scenario.build().unwrap();
        let factory = InMemoryPcapExporterFactory::default();
        let file_names = scenario.attach_captures(&mut network, &factory).unwrap();

        assert_eq!(
            file_names,
            [
                "fd-left-0-1.pcap",
                "csma-left-0-0.pcap",
                "fd-middle-1-1.pcap",
                "csma-middle-1-0.pcap",
                "fd-right-2-1.pcap",
                "csma-right-2-0.pcap",
            ]
        );
    }

    #[test]
    fn test_p2p_bridges_keep_their_hardware_addresses() {
        let scenario = p2p(&p2p_options());
        let network = scenario.build().unwrap();
        let topology = network.topology();

        let macs: Vec<_> = topology
            .bridge_devices()
            .map(|d| d.mac().to_string())
            .collect();
        assert_eq!(
            macs,
            ["08:00:27:b3:a5:82", "08:00:27:7f:d9:0c", "08:00:27:dc:60:80"]
        );

        // Two point-to-point devices and a bridge
        assert_eq!(topology.node(NodeId(1)).devices().len(), 3);
    }

    #[test]
    fn test_p2p_captures_follow_links() {
        let scenario = p2p(&p2p_options());
        let mut network = scenario.build().unwrap();
        let factory = InMemoryPcapExporterFactory::default();
        let file_names = scenario.attach_captures(&mut network, &factory).unwrap();

        assert_eq!(
            file_names,
            [
                "ptop1-0-0.pcap",
                "ptop1-1-0.pcap",
                "ptop2-1-1.pcap",
                "ptop2-2-0.pcap",
            ]
        );
    }

    #[test]
    fn test_unknown_capture_targets_are_rejected() {
        let mut scenario = csma(&csma_options());
        scenario.captures = vec![CaptureSpec {
            prefix: "nope".to_string(),
            target: CaptureTarget::Device { node: 0, index: 7 },
            promiscuous: false,
        }];

        let mut network = scenario.build().unwrap();
        let error = scenario
            .attach_captures(&mut network, &InMemoryPcapExporterFactory::default())
            .unwrap_err();
        assert_eq!(error.to_string(), "node 0 has no device at index 7");
    }
}
