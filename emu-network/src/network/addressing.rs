use crate::error::HarnessError;
use crate::network::bridge::BridgeDevice;
use crate::network::device::DeviceId;
use crate::network::ip::Ipv4Subnet;
use crate::network::link::LinkId;
use crate::network::node::NodeId;
use crate::network::topology::Topology;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use tracing::debug;

/// The subnet from which the devices of a link get their addresses
#[derive(Copy, Clone, Debug)]
pub struct LinkSubnet {
    pub link: LinkId,
    pub base: Ipv4Addr,
    pub mask: Ipv4Addr,
}

/// An explicit address for a bridge device
#[derive(Clone, Debug)]
pub struct BridgeAddress {
    pub bridge: BridgeDevice,
    pub address: Ipv4Addr,
    pub mask: Ipv4Addr,
}

/// An address configured on a device
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub node: NodeId,
    pub address: Ipv4Addr,
    pub subnet: Ipv4Subnet,
}

/// The addresses of every device, indexed by device id
#[derive(Clone, Debug, Default)]
pub struct AddressPlan {
    interfaces: Vec<Option<InterfaceAddress>>,
}

/// Assigns addresses to link and bridge devices and enables IP forwarding where needed
///
/// Devices of a link get sequential host addresses (starting at `.1`) in creation order. Nodes
/// with more than one device, or with a bridge, get IP forwarding enabled. Overlapping subnets
/// across links are not detected.
pub fn assign(
    topology: &mut Topology,
    per_link: &[LinkSubnet],
    per_bridge: &[BridgeAddress],
) -> Result<AddressPlan, HarnessError> {
    let mut plan = AddressPlan {
        interfaces: vec![None; topology.devices().len()],
    };

    let mut assigned_links = HashSet::new();
    for link_subnet in per_link {
        let LinkSubnet { link, base, mask } = *link_subnet;
        if link.0 >= topology.links().len() {
            return Err(HarnessError::invalid_spec(format!(
                "cannot assign addresses to unknown {link}"
            )));
        }

        if !assigned_links.insert(link) {
            return Err(HarnessError::invalid_spec(format!(
                "{link} has been assigned more than one subnet"
            )));
        }

        let subnet = Ipv4Subnet::with_mask(base, mask)
            .map_err(|e| HarnessError::invalid_spec(format!("subnet for {link}: {e}")))?;

        let devices = topology.link(link).devices();
        if (devices.len() as u64) > subnet.usable_hosts() {
            return Err(HarnessError::invalid_spec(format!(
                "subnet {subnet} is too small for the {} devices of {link}",
                devices.len()
            )));
        }

        for (i, &device) in devices.iter().enumerate() {
            let address = subnet.host(i as u64).ok_or_else(|| {
                HarnessError::invalid_spec(format!("subnet {subnet} ran out of host addresses"))
            })?;
            plan.set(topology, device, address, subnet);
        }
    }

    for bridge_address in per_bridge {
        let bridge = &bridge_address.bridge;
        let is_bridge_of_node = topology.contains_device(bridge.device)
            && topology.device(bridge.device).is_bridge()
            && topology.device(bridge.device).node() == bridge.node;
        if !is_bridge_of_node {
            return Err(HarnessError::invalid_spec(format!(
                "{} is not a bridge device of {}",
                bridge.device, bridge.node
            )));
        }

        let subnet = Ipv4Subnet::with_mask(bridge_address.address, bridge_address.mask).map_err(
            |e| HarnessError::invalid_spec(format!("address of bridge `{}`: {e}", bridge.interface)),
        )?;

        plan.set(topology, bridge.device, bridge_address.address, subnet);
    }

    let forwarding_nodes: Vec<_> = topology
        .nodes()
        .iter()
        .filter(|node| {
            node.devices().len() > 1
                || topology.devices_of(node.id()).any(|device| device.is_bridge())
        })
        .map(|node| node.id())
        .collect();

    for node in forwarding_nodes {
        debug!("{node} forwards IP traffic");
        topology.set_ip_forwarding(node, true);
    }

    Ok(plan)
}

impl AddressPlan {
    fn set(&mut self, topology: &Topology, device: DeviceId, address: Ipv4Addr, subnet: Ipv4Subnet) {
        let node = topology.device(device).node();
        debug!("{node} {device} gets address {address} in {subnet}");
        self.interfaces[device.0] = Some(InterfaceAddress {
            node,
            address,
            subnet,
        });
    }

    pub fn interface(&self, device: DeviceId) -> Option<&InterfaceAddress> {
        self.interfaces.get(device.0)?.as_ref()
    }

    pub fn address_of(&self, device: DeviceId) -> Option<Ipv4Addr> {
        self.interface(device).map(|i| i.address)
    }

    pub fn subnet_of(&self, device: DeviceId) -> Option<Ipv4Subnet> {
        self.interface(device).map(|i| i.subnet)
    }

    /// Every addressed device, in creation order
    pub fn addressed_devices(&self) -> impl Iterator<Item = (DeviceId, &InterfaceAddress)> + '_ {
        self.interfaces
            .iter()
            .enumerate()
            .filter_map(|(i, iface)| Some((DeviceId(i), iface.as_ref()?)))
    }

    /// Every destination subnet together with the devices attached to it, ordered by the
    /// creation order of each subnet's first device
    pub fn subnets(&self) -> Vec<(Ipv4Subnet, Vec<DeviceId>)> {
        let mut subnets: Vec<(Ipv4Subnet, Vec<DeviceId>)> = Vec::new();
        for (device, iface) in self.addressed_devices() {
            match subnets.iter_mut().find(|(s, _)| *s == iface.subnet) {
                Some((_, devices)) => devices.push(device),
                None => subnets.push((iface.subnet, vec![device])),
            }
        }

        subnets
    }

    /// The device configured with `address`, if any
    pub fn device_owning(&self, address: Ipv4Addr) -> Option<DeviceId> {
        self.addressed_devices()
            .find(|(_, iface)| iface.address == address)
            .map(|(device, _)| device)
    }

    /// Whether a datagram sent to `address` is meant for `node` itself (one of its addresses, or
    /// a broadcast on one of its subnets)
    pub fn is_local(&self, node: NodeId, address: Ipv4Addr) -> bool {
        address == Ipv4Addr::BROADCAST
            || self.addressed_devices().any(|(_, iface)| {
                iface.node == node
                    && (iface.address == address
                        || (iface.subnet.prefix_len() < 31 && iface.subnet.broadcast() == address))
            })
    }

    /// The first address configured on `node`, used as the source of locally originated traffic
    pub fn primary_address(&self, node: NodeId) -> Option<Ipv4Addr> {
        self.addressed_devices()
            .find(|(_, iface)| iface.node == node)
            .map(|(_, iface)| iface.address)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::network::bridge;
    use crate::network::spec::{DataRate, LinkSpec};
    use std::time::Duration;

    fn chain() -> Topology {
        Topology::build(
            3,
            &[
                LinkSpec::point_to_point(0, 1, DataRate::from_mbps(10), Duration::ZERO),
                LinkSpec::point_to_point(1, 2, DataRate::from_mbps(10), Duration::ZERO),
            ],
        )
        .unwrap()
    }

    fn mask24() -> Ipv4Addr {
        Ipv4Addr::new(255, 255, 255, 0)
    }

    #[test]
    fn test_sequential_host_addresses() {
        let mut topology = Topology::build(
            3,
            &[LinkSpec::shared([0, 1, 2], DataRate::from_mbps(5), Duration::ZERO)],
        )
        .unwrap();

        let plan = assign(
            &mut topology,
            &[LinkSubnet {
                link: LinkId(0),
                base: Ipv4Addr::new(192, 134, 135, 0),
                mask: mask24(),
            }],
            &[],
        )
        .unwrap();

        let addresses: Vec<_> = (0..3)
            .map(|i| plan.address_of(DeviceId(i)).unwrap().to_string())
            .collect();
        assert_eq!(
            addresses,
            ["192.134.135.1", "192.134.135.2", "192.134.135.3"]
        );

        // Single-device nodes don't forward
        assert!(topology.nodes().iter().all(|n| !n.ip_forwarding()));
    }

    #[test]
    fn test_forwarding_enabled_on_middle_and_bridged_nodes() {
        let mut topology = chain();
        let bridge = bridge::bind(&mut topology, NodeId(2), "enp0s10", None).unwrap();

        let plan = assign(
            &mut topology,
            &[
                LinkSubnet {
                    link: LinkId(0),
                    base: Ipv4Addr::new(192, 134, 135, 0),
                    mask: mask24(),
                },
                LinkSubnet {
                    link: LinkId(1),
                    base: Ipv4Addr::new(198, 134, 135, 0),
                    mask: mask24(),
                },
            ],
            &[BridgeAddress {
                bridge: bridge.clone(),
                address: Ipv4Addr::new(10, 161, 31, 20),
                mask: mask24(),
            }],
        )
        .unwrap();

        let forwarding: Vec<_> = topology.nodes().iter().map(|n| n.ip_forwarding()).collect();
        assert_eq!(forwarding, [false, true, true]);

        assert_eq!(
            plan.address_of(bridge.device),
            Some(Ipv4Addr::new(10, 161, 31, 20))
        );
        assert!(plan.is_local(NodeId(2), Ipv4Addr::new(10, 161, 31, 20)));
        assert!(plan.is_local(NodeId(2), Ipv4Addr::new(10, 161, 31, 255)));
        assert!(!plan.is_local(NodeId(1), Ipv4Addr::new(10, 161, 31, 20)));
        assert_eq!(plan.subnets().len(), 3);
    }

    #[test]
    fn test_invalid_assignments() {
        let link0 = |base: Ipv4Addr, mask: Ipv4Addr| LinkSubnet {
            link: LinkId(0),
            base,
            mask,
        };

        let cases = [
            vec![LinkSubnet {
                link: LinkId(7),
                base: Ipv4Addr::new(10, 0, 0, 0),
                mask: mask24(),
            }],
            vec![
                link0(Ipv4Addr::new(10, 0, 0, 0), mask24()),
                link0(Ipv4Addr::new(10, 0, 1, 0), mask24()),
            ],
            vec![link0(Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(255, 0, 255, 0))],
            vec![link0(Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(255, 255, 255, 255))],
        ];

        for case in cases {
            let mut topology = chain();
            let result = assign(&mut topology, &case, &[]);
            assert!(matches!(
                result,
                Err(HarnessError::InvalidTopologySpec { .. })
            ));
        }
    }

    #[test]
    fn test_bridge_address_must_name_a_bridge_of_the_node() {
        let mut topology = chain();
        let mut bridge = bridge::bind(&mut topology, NodeId(0), "enp0s8", None).unwrap();
        bridge.node = NodeId(1);

        let result = assign(
            &mut topology,
            &[],
            &[BridgeAddress {
                bridge,
                address: Ipv4Addr::new(10, 161, 29, 20),
                mask: mask24(),
            }],
        );
        assert!(matches!(
            result,
            Err(HarnessError::InvalidTopologySpec { .. })
        ));
    }

    #[test]
    fn test_overlapping_subnets_are_accepted() {
        let mut topology = chain();
        let same = |link| LinkSubnet {
            link: LinkId(link),
            base: Ipv4Addr::new(10, 0, 0, 0),
            mask: mask24(),
        };

        let plan = assign(&mut topology, &[same(0), same(1)], &[]).unwrap();
        assert_eq!(plan.address_of(DeviceId(0)), plan.address_of(DeviceId(2)));
    }
}
