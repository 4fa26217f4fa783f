use crate::error::HarnessError;
use crate::network::device::{Device, DeviceId, DeviceKind, MacAddress, MacAllocator};
use crate::network::link::{LinkId, NetworkLink};
use crate::network::node::{Node, NodeId};
use crate::network::spec::{LinkKind, LinkSpec};
use std::collections::HashSet;
use tracing::debug;

/// The node/device/link graph of the emulated network
///
/// Nodes, devices and links are identified by their dense index, so ids are stable for the
/// lifetime of the topology (nothing is ever removed).
pub struct Topology {
    pub(crate) nodes: Vec<Node>,
    pub(crate) devices: Vec<Device>,
    pub(crate) links: Vec<NetworkLink>,
    mac_allocator: MacAllocator,
}

impl Topology {
    /// Creates `node_count` nodes and wires them together according to `links`
    pub fn build(node_count: usize, links: &[LinkSpec]) -> Result<Self, HarnessError> {
        let mut topology = Topology {
            nodes: (0..node_count).map(|i| Node::new(NodeId(i))).collect(),
            devices: Vec::new(),
            links: Vec::new(),
            mac_allocator: MacAllocator::default(),
        };

        for (i, spec) in links.iter().enumerate() {
            topology.validate_link_spec(i, spec)?;
            topology.install_link(spec);
        }

        debug!(
            nodes = topology.nodes.len(),
            devices = topology.devices.len(),
            links = topology.links.len(),
            "topology built"
        );

        Ok(topology)
    }

    fn validate_link_spec(&self, index: usize, spec: &LinkSpec) -> Result<(), HarnessError> {
        let kind = spec.model.kind;
        match kind {
            LinkKind::PointToPoint if spec.nodes.len() != 2 => {
                return Err(HarnessError::invalid_spec(format!(
                    "point-to-point link {index} must connect exactly 2 nodes, but {} were given",
                    spec.nodes.len()
                )));
            }
            LinkKind::Shared if spec.nodes.is_empty() => {
                return Err(HarnessError::invalid_spec(format!(
                    "shared link {index} has no participants"
                )));
            }
            _ => {}
        }

        let mut seen = HashSet::new();
        for &node in &spec.nodes {
            if node >= self.nodes.len() {
                return Err(HarnessError::invalid_spec(format!(
                    "{} link {index} references node {node}, but only {} nodes exist",
                    kind.as_str(),
                    self.nodes.len()
                )));
            }

            if !seen.insert(node) {
                return Err(HarnessError::invalid_spec(format!(
                    "{} link {index} lists node {node} more than once",
                    kind.as_str()
                )));
            }
        }

        Ok(())
    }

    fn install_link(&mut self, spec: &LinkSpec) {
        let link_id = LinkId(self.links.len());
        let first_device = self.devices.len();
        let device_ids: Vec<_> = (0..spec.nodes.len())
            .map(|i| DeviceId(first_device + i))
            .collect();

        for (i, &node) in spec.nodes.iter().enumerate() {
            let kind = match spec.model.kind {
                LinkKind::Shared => DeviceKind::Shared {
                    link: link_id,
                    model: spec.model.clone(),
                },
                LinkKind::PointToPoint => DeviceKind::PointToPoint {
                    link: link_id,
                    model: spec.model.clone(),
                    peer: device_ids[1 - i],
                },
            };

            let mac = self.mac_allocator.allocate();
            self.attach_device(NodeId(node), mac, kind);
        }

        self.links
            .push(NetworkLink::new(link_id, spec.model.clone(), device_ids));
    }

    pub(crate) fn attach_device(
        &mut self,
        node: NodeId,
        mac: MacAddress,
        kind: DeviceKind,
    ) -> DeviceId {
        let id = DeviceId(self.devices.len());
        let owner = &mut self.nodes[node.0];
        let index_on_node = owner.devices.len();
        owner.devices.push(id);

        self.devices.push(Device {
            id,
            node,
            index_on_node,
            mac,
            kind,
        });

        id
    }

    pub(crate) fn allocate_mac(&mut self) -> MacAddress {
        self.mac_allocator.allocate()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn links(&self) -> &[NetworkLink] {
        &self.links
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn device(&self, id: DeviceId) -> &Device {
        &self.devices[id.0]
    }

    pub fn link(&self, id: LinkId) -> &NetworkLink {
        &self.links[id.0]
    }

    pub(crate) fn link_mut(&mut self, id: LinkId) -> &mut NetworkLink {
        &mut self.links[id.0]
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        id.0 < self.nodes.len()
    }

    pub fn contains_device(&self, id: DeviceId) -> bool {
        id.0 < self.devices.len()
    }

    /// The devices of `node`, in creation order
    pub fn devices_of(&self, node: NodeId) -> impl Iterator<Item = &Device> + '_ {
        self.nodes[node.0]
            .devices
            .iter()
            .map(|&id| &self.devices[id.0])
    }

    /// The device of `node` at position `index`, if any
    pub fn device_at(&self, node: NodeId, index: usize) -> Option<&Device> {
        self.nodes
            .get(node.0)?
            .devices
            .get(index)
            .map(|&id| &self.devices[id.0])
    }

    /// Every `(own device, remote device)` pair through which `node` reaches a neighbour,
    /// ordered by own device index and then by remote device creation order
    pub fn adjacencies(&self, node: NodeId) -> Vec<(DeviceId, DeviceId)> {
        let mut adjacencies = Vec::new();
        for device in self.devices_of(node) {
            let Some(link) = device.link() else {
                continue;
            };

            for remote in self.links[link.0].receivers_of(device.id) {
                adjacencies.push((device.id, remote));
            }
        }

        adjacencies
    }

    pub fn bridge_devices(&self) -> impl Iterator<Item = &Device> + '_ {
        self.devices.iter().filter(|d| d.is_bridge())
    }

    pub(crate) fn set_ip_forwarding(&mut self, node: NodeId, enabled: bool) {
        self.nodes[node.0].ip_forwarding = enabled;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::network::spec::DataRate;
    use std::time::Duration;

    fn rate() -> DataRate {
        DataRate::from_mbps(10)
    }

    #[test]
    fn test_shared_link_attaches_one_device_per_node() {
        let topology = Topology::build(
            3,
            &[LinkSpec::shared([0, 1, 2], rate(), Duration::from_millis(20))],
        )
        .unwrap();

        assert_eq!(topology.links().len(), 1);
        assert_eq!(topology.devices().len(), 3);
        for node in topology.nodes() {
            assert_eq!(node.devices().len(), 1);
            let device = topology.device(node.devices()[0]);
            assert!(matches!(device.kind(), DeviceKind::Shared { .. }));
        }
    }

    #[test]
    fn test_chained_point_to_point_links_keep_middle_devices_apart() {
        let topology = Topology::build(
            3,
            &[
                LinkSpec::point_to_point(0, 1, rate(), Duration::from_millis(350)),
                LinkSpec::point_to_point(1, 2, rate(), Duration::from_millis(150)),
            ],
        )
        .unwrap();

        let middle = topology.node(NodeId(1));
        assert_eq!(middle.devices().len(), 2);
        assert_ne!(middle.devices()[0], middle.devices()[1]);

        let first = topology.device(middle.devices()[0]);
        let second = topology.device(middle.devices()[1]);
        assert_eq!(first.link(), Some(LinkId(0)));
        assert_eq!(second.link(), Some(LinkId(1)));

        // Devices are paired with their peers
        let DeviceKind::PointToPoint { peer, .. } = first.kind() else {
            panic!("expected point-to-point device");
        };
        assert_eq!(topology.device(*peer).node(), NodeId(0));
    }

    #[test]
    fn test_device_count_matches_links_touching_node() {
        let links = [
            LinkSpec::point_to_point(0, 1, rate(), Duration::ZERO),
            LinkSpec::point_to_point(1, 2, rate(), Duration::ZERO),
            LinkSpec::shared([0, 2, 3], rate(), Duration::ZERO),
            LinkSpec::point_to_point(3, 0, rate(), Duration::ZERO),
        ];
        let topology = Topology::build(4, &links).unwrap();

        for node in topology.nodes() {
            let touching = links
                .iter()
                .filter(|l| l.nodes.contains(&node.id().0))
                .count();
            assert_eq!(node.devices().len(), touching, "{}", node.id());
        }
    }

    #[test]
    fn test_invalid_specs_are_rejected() {
        let invalid = [
            LinkSpec {
                nodes: vec![0, 1, 2],
                ..LinkSpec::point_to_point(0, 1, rate(), Duration::ZERO)
            },
            LinkSpec::point_to_point(0, 3, rate(), Duration::ZERO),
            LinkSpec::point_to_point(1, 1, rate(), Duration::ZERO),
            LinkSpec::shared(Vec::new(), rate(), Duration::ZERO),
        ];

        for spec in invalid {
            let result = Topology::build(3, &[spec]);
            assert!(
                matches!(result, Err(HarnessError::InvalidTopologySpec { .. })),
                "expected invalid topology"
            );
        }
    }

    #[test]
    fn test_adjacencies_are_ordered_by_device_index() {
        let topology = Topology::build(
            3,
            &[
                LinkSpec::point_to_point(1, 2, rate(), Duration::ZERO),
                LinkSpec::point_to_point(0, 1, rate(), Duration::ZERO),
            ],
        )
        .unwrap();

        let adjacencies = topology.adjacencies(NodeId(1));
        let neighbours: Vec<_> = adjacencies
            .iter()
            .map(|(_, remote)| topology.device(*remote).node())
            .collect();
        assert_eq!(neighbours, vec![NodeId(2), NodeId(0)]);
    }
}
