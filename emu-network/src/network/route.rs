use crate::network::addressing::AddressPlan;
use crate::network::device::DeviceId;
use crate::network::ip::Ipv4Subnet;
use crate::network::node::NodeId;
use crate::network::topology::Topology;
use std::collections::VecDeque;
use std::io::Write;
use std::net::Ipv4Addr;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteEntry {
    pub destination: Ipv4Subnet,
    /// `None` when the destination is directly attached
    pub gateway: Option<Ipv4Addr>,
    pub device: DeviceId,
    /// Index of `device` on its node
    pub interface: usize,
    pub metric: u32,
}

impl RouteEntry {
    /// The address a datagram for `destination` should be handed to
    pub fn next_hop(&self, destination: Ipv4Addr) -> Ipv4Addr {
        self.gateway.unwrap_or(destination)
    }
}

/// Routes of every node, computed by a global oracle over the whole topology
#[derive(Clone, Debug, Default)]
pub struct RoutingTables {
    tables: Vec<Vec<RouteEntry>>,
}

/// The way out of the source node along a shortest path
#[derive(Copy, Clone)]
struct FirstHop {
    own_device: DeviceId,
    remote_device: DeviceId,
}

impl RoutingTables {
    /// Computes a route from every node to every subnet it can reach
    ///
    /// Paths are found with a breadth-first search over addressed links. Among equally short
    /// paths, the one leaving through the lowest device index wins, and then the one through the
    /// lowest neighbour node id.
    pub fn resolve(topology: &Topology, plan: &AddressPlan) -> Self {
        let subnets = plan.subnets();
        let tables = topology
            .nodes()
            .iter()
            .map(|node| resolve_for_node(topology, plan, &subnets, node.id()))
            .collect();

        Self { tables }
    }

    pub fn table(&self, node: NodeId) -> &[RouteEntry] {
        self.tables.get(node.0).map(Vec::as_slice).unwrap_or_default()
    }

    /// The most specific route towards `destination`, preferring lower metrics among equally
    /// specific ones
    pub fn lookup(&self, node: NodeId, destination: Ipv4Addr) -> Option<&RouteEntry> {
        let mut best: Option<&RouteEntry> = None;
        for route in self.table(node) {
            if !route.destination.contains(destination) {
                continue;
            }

            best = match best {
                Some(current)
                    if (current.destination.prefix_len(), std::cmp::Reverse(current.metric))
                        >= (route.destination.prefix_len(), std::cmp::Reverse(route.metric)) =>
                {
                    Some(current)
                }
                _ => Some(route),
            };
        }

        best
    }

    /// Writes the tables of all nodes in a human-readable form
    pub fn dump(&self, w: &mut impl Write, now: Duration) -> std::io::Result<()> {
        for (node, table) in self.tables.iter().enumerate() {
            writeln!(w, "Node: {node}, Time: {}s", now.as_secs_f64())?;
            writeln!(
                w,
                "{:<16}{:<16}{:<16}{:<7}{}",
                "Destination", "Gateway", "Genmask", "Iface", "Metric"
            )?;

            for route in table {
                writeln!(
                    w,
                    "{:<16}{:<16}{:<16}{:<7}{}",
                    route.destination.network().to_string(),
                    route.gateway.unwrap_or(Ipv4Addr::UNSPECIFIED).to_string(),
                    route.destination.mask().to_string(),
                    route.interface,
                    route.metric
                )?;
            }

            writeln!(w)?;
        }

        Ok(())
    }
}

fn resolve_for_node(
    topology: &Topology,
    plan: &AddressPlan,
    subnets: &[(Ipv4Subnet, Vec<DeviceId>)],
    source: NodeId,
) -> Vec<RouteEntry> {
    let node_count = topology.nodes().len();
    let mut distance: Vec<Option<u32>> = vec![None; node_count];
    let mut first_hop: Vec<Option<FirstHop>> = vec![None; node_count];
    // Nodes in the order they were reached, which is also the order of preference among nodes at
    // the same distance
    let mut reached = Vec::with_capacity(node_count);

    distance[source.0] = Some(0);
    let mut queue = VecDeque::from([source]);
    while let Some(node) = queue.pop_front() {
        reached.push(node);
        let hops = distance[node.0].unwrap_or_default();

        for (own_device, remote_device) in addressed_adjacencies(topology, plan, node) {
            let neighbour = topology.device(remote_device).node();
            if distance[neighbour.0].is_some() {
                continue;
            }

            distance[neighbour.0] = Some(hops + 1);
            first_hop[neighbour.0] = match first_hop[node.0] {
                Some(hop) => Some(hop),
                None => Some(FirstHop {
                    own_device,
                    remote_device,
                }),
            };
            queue.push_back(neighbour);
        }
    }

    let mut routes = Vec::new();
    for (subnet, attached) in subnets {
        // Directly attached subnets go out through the lowest own device
        if let Some(&device) = attached
            .iter()
            .find(|&&d| topology.device(d).node() == source)
        {
            routes.push(RouteEntry {
                destination: *subnet,
                gateway: None,
                device,
                interface: topology.device(device).index_on_node(),
                metric: 0,
            });
            continue;
        }

        let nearest = reached.iter().copied().find(|&node| {
            attached
                .iter()
                .any(|&d| topology.device(d).node() == node)
        });

        let Some(nearest) = nearest else {
            continue;
        };

        let (Some(hop), Some(metric)) = (first_hop[nearest.0], distance[nearest.0]) else {
            continue;
        };

        routes.push(RouteEntry {
            destination: *subnet,
            gateway: plan.address_of(hop.remote_device),
            device: hop.own_device,
            interface: topology.device(hop.own_device).index_on_node(),
            metric,
        });
    }

    routes
}

/// Adjacencies of `node` where both ends have an address, ordered by own device index and then by
/// neighbour node id
fn addressed_adjacencies(
    topology: &Topology,
    plan: &AddressPlan,
    node: NodeId,
) -> Vec<(DeviceId, DeviceId)> {
    let mut adjacencies: Vec<_> = topology
        .adjacencies(node)
        .into_iter()
        .filter(|(own, remote)| plan.address_of(*own).is_some() && plan.address_of(*remote).is_some())
        .collect();

    adjacencies.sort_by_key(|(own, remote)| {
        (
            topology.device(*own).index_on_node(),
            topology.device(*remote).node(),
        )
    });

    adjacencies
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::network::addressing::{self, BridgeAddress, LinkSubnet};
    use crate::network::bridge;
    use crate::network::link::LinkId;
    use crate::network::spec::{DataRate, LinkSpec};

    fn mask24() -> Ipv4Addr {
        Ipv4Addr::new(255, 255, 255, 0)
    }

    fn subnet(link: usize, a: u8, b: u8, c: u8) -> LinkSubnet {
        LinkSubnet {
            link: LinkId(link),
            base: Ipv4Addr::new(a, b, c, 0),
            mask: mask24(),
        }
    }

    /// 0 -- 1 -- 2 with a bridge on 0 and 2
    fn chain() -> (Topology, AddressPlan) {
        let rate = DataRate::from_mbps(10);
        let mut topology = Topology::build(
            3,
            &[
                LinkSpec::point_to_point(0, 1, rate, Duration::from_millis(350)),
                LinkSpec::point_to_point(1, 2, rate, Duration::from_millis(150)),
            ],
        )
        .unwrap();

        let left = bridge::bind(&mut topology, NodeId(0), "enp0s8", None).unwrap();
        let right = bridge::bind(&mut topology, NodeId(2), "enp0s10", None).unwrap();
        let plan = addressing::assign(
            &mut topology,
            &[subnet(0, 192, 134, 135), subnet(1, 198, 134, 135)],
            &[
                BridgeAddress {
                    bridge: left,
                    address: Ipv4Addr::new(10, 161, 29, 20),
                    mask: mask24(),
                },
                BridgeAddress {
                    bridge: right,
                    address: Ipv4Addr::new(10, 161, 31, 20),
                    mask: mask24(),
                },
            ],
        )
        .unwrap();

        (topology, plan)
    }

    #[test]
    fn test_chain_routes() {
        let (topology, plan) = chain();
        let tables = RoutingTables::resolve(&topology, &plan);

        let route = tables
            .lookup(NodeId(0), Ipv4Addr::new(10, 161, 31, 7))
            .unwrap();
        assert_eq!(route.gateway, Some(Ipv4Addr::new(192, 134, 135, 2)));
        assert_eq!(route.interface, 0);
        assert_eq!(route.metric, 2);

        let route = tables
            .lookup(NodeId(0), Ipv4Addr::new(198, 134, 135, 2))
            .unwrap();
        assert_eq!(route.metric, 1);

        let route = tables
            .lookup(NodeId(2), Ipv4Addr::new(10, 161, 31, 7))
            .unwrap();
        assert_eq!(route.gateway, None);
        assert_eq!(route.interface, 1);
        assert_eq!(route.metric, 0);

        assert!(
            tables
                .lookup(NodeId(1), Ipv4Addr::new(8, 8, 8, 8))
                .is_none()
        );
    }

    #[test]
    fn test_every_node_reaches_every_subnet() {
        let (topology, plan) = chain();
        let tables = RoutingTables::resolve(&topology, &plan);
        for node in topology.nodes() {
            assert_eq!(tables.table(node.id()).len(), 4, "{}", node.id());
        }
    }

    #[test]
    fn test_hop_count_matches_shortest_path() {
        // A ring of five nodes, where the shortest path sometimes goes "backwards"
        let rate = DataRate::from_mbps(1);
        let links: Vec<_> = (0..5)
            .map(|i| LinkSpec::point_to_point(i, (i + 1) % 5, rate, Duration::ZERO))
            .collect();
        let mut topology = Topology::build(5, &links).unwrap();
        let subnets: Vec<_> = (0..5).map(|i| subnet(i, 10, 0, i as u8)).collect();
        let plan = addressing::assign(&mut topology, &subnets, &[]).unwrap();
        let tables = RoutingTables::resolve(&topology, &plan);

        // Link i connects node i and node i + 1
        let expected = |source: usize, link: usize| -> u32 {
            let distance = |a: usize, b: usize| {
                let d = a.abs_diff(b);
                d.min(5 - d) as u32
            };
            distance(source, link).min(distance(source, (link + 1) % 5))
        };

        for source in 0..5 {
            for link in 0..5 {
                let destination = Ipv4Addr::new(10, 0, link as u8, 1);
                let route = tables.lookup(NodeId(source), destination).unwrap();
                assert_eq!(route.metric, expected(source, link), "{source} -> {link}");
            }
        }
    }

    #[test]
    fn test_ties_prefer_lowest_device_index() {
        // 0 reaches 3 through both 1 and 2, and only 3 has a bridge
        let rate = DataRate::from_mbps(1);
        let mut topology = Topology::build(
            4,
            &[
                LinkSpec::point_to_point(0, 2, rate, Duration::ZERO),
                LinkSpec::point_to_point(0, 1, rate, Duration::ZERO),
                LinkSpec::point_to_point(1, 3, rate, Duration::ZERO),
                LinkSpec::point_to_point(2, 3, rate, Duration::ZERO),
            ],
        )
        .unwrap();
        let bridge = bridge::bind(&mut topology, NodeId(3), "eth0", None).unwrap();
        let subnets: Vec<_> = (0..4).map(|i| subnet(i, 10, 0, i as u8)).collect();
        let plan = addressing::assign(
            &mut topology,
            &subnets,
            &[BridgeAddress {
                bridge,
                address: Ipv4Addr::new(10, 9, 9, 1),
                mask: mask24(),
            }],
        )
        .unwrap();
        let tables = RoutingTables::resolve(&topology, &plan);

        // Both paths take two hops; device 0 (towards node 2) wins
        let route = tables
            .lookup(NodeId(0), Ipv4Addr::new(10, 9, 9, 1))
            .unwrap();
        assert_eq!(route.metric, 2);
        assert_eq!(route.interface, 0);
        assert_eq!(route.gateway, Some(Ipv4Addr::new(10, 0, 0, 2)));

        // The subnet between 1 and 3 is only one hop away through node 1
        let route = tables
            .lookup(NodeId(0), Ipv4Addr::new(10, 0, 2, 2))
            .unwrap();
        assert_eq!(route.metric, 1);
        assert_eq!(route.interface, 1);
        assert_eq!(route.gateway, Some(Ipv4Addr::new(10, 0, 1, 2)));
    }

    #[test]
    fn test_lookup_prefers_longest_prefix() {
        let device = DeviceId(0);
        let route = |destination: &str, metric| RouteEntry {
            destination: destination.parse().unwrap(),
            gateway: None,
            device,
            interface: 0,
            metric,
        };

        let tables = RoutingTables {
            tables: vec![vec![
                route("0.0.0.0/0", 0),
                route("10.0.0.0/8", 3),
                route("10.1.0.0/16", 5),
                route("10.1.0.0/16", 4),
            ]],
        };

        let best = tables.lookup(NodeId(0), Ipv4Addr::new(10, 1, 2, 3)).unwrap();
        assert_eq!(best.destination.prefix_len(), 16);
        assert_eq!(best.metric, 4);

        let best = tables.lookup(NodeId(0), Ipv4Addr::new(10, 2, 2, 3)).unwrap();
        assert_eq!(best.destination.prefix_len(), 8);

        let best = tables.lookup(NodeId(0), Ipv4Addr::new(1, 1, 1, 1)).unwrap();
        assert_eq!(best.destination.prefix_len(), 0);
    }

    #[test]
    fn test_dump_format() {
        let (topology, plan) = chain();
        let tables = RoutingTables::resolve(&topology, &plan);

        let mut first = Vec::new();
        tables.dump(&mut first, Duration::from_secs(1)).unwrap();
        let mut second = Vec::new();
        tables.dump(&mut second, Duration::from_secs(1)).unwrap();
        assert_eq!(first, second);

        let text = String::from_utf8(first).unwrap();
        let node0: Vec<_> = text.lines().take(6).collect();
        assert_eq!(
            node0,
            [
                "Node: 0, Time: 1s",
                "Destination     Gateway         Genmask         Iface  Metric",
                "192.134.135.0   0.0.0.0         255.255.255.0   0      0",
                "198.134.135.0   192.134.135.2   255.255.255.0   0      1",
                "10.161.29.0     0.0.0.0         255.255.255.0   1      0",
                "10.161.31.0     192.134.135.2   255.255.255.0   0      2",
            ]
        );
    }
}
