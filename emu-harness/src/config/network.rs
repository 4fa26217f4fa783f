use crate::scenario::{
    CaptureSpec, CaptureTarget, RoutingDump, Scenario, ScenarioBridge, ScenarioLink,
};
use emu_network::network::device::MacAddress;
use emu_network::network::spec::{DataRate, LinkSpec};
use serde::Deserialize;
use serde_with::{DisplayFromStr, serde_as};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TopologyJson {
    #[serde(default = "default_topology_name")]
    name: String,
    /// The number of simulated nodes, identified by their index
    nodes: usize,
    links: Vec<LinkJson>,
    #[serde(default)]
    bridges: Vec<BridgeJson>,
    #[serde(default)]
    captures: Vec<CaptureJson>,
    routing_dump: Option<RoutingDumpJson>,
    #[serde(default = "default_flow_monitor")]
    flow_monitor: bool,
}

fn default_topology_name() -> String {
    "topology".to_string()
}

fn default_flow_monitor() -> bool {
    true
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "camelCase")]
enum LinkKindJson {
    Shared,
    PointToPoint,
}

#[serde_as]
#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct LinkJson {
    kind: LinkKindJson,
    nodes: Vec<usize>,
    /// The link's data rate, e.g. `5Mbps`
    #[serde_as(as = "DisplayFromStr")]
    rate: DataRate,
    /// The propagation delay of the link, in milliseconds
    delay_ms: u64,
    subnet: Option<SubnetJson>,
}

#[serde_as]
#[derive(Deserialize, Clone)]
struct SubnetJson {
    #[serde_as(as = "DisplayFromStr")]
    base: Ipv4Addr,
    #[serde_as(as = "DisplayFromStr")]
    mask: Ipv4Addr,
}

#[serde_as]
#[derive(Deserialize, Clone)]
struct BridgeJson {
    node: usize,
    interface: String,
    #[serde_as(as = "DisplayFromStr")]
    address: Ipv4Addr,
    #[serde_as(as = "DisplayFromStr")]
    mask: Ipv4Addr,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    mac: Option<MacAddress>,
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct CaptureJson {
    prefix: String,
    node: Option<usize>,
    device: Option<usize>,
    link: Option<usize>,
    #[serde(default)]
    promiscuous: bool,
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct RoutingDumpJson {
    at_ms: u64,
    file: Option<PathBuf>,
}

impl TryFrom<TopologyJson> for Scenario {
    type Error = anyhow::Error;

    fn try_from(json: TopologyJson) -> anyhow::Result<Self> {
        let links = json
            .links
            .into_iter()
            .map(|l| {
                let delay = Duration::from_millis(l.delay_ms);
                let spec = match l.kind {
                    LinkKindJson::Shared => LinkSpec::shared(l.nodes, l.rate, delay),
                    LinkKindJson::PointToPoint => {
                        let [a, b] = l.nodes[..] else {
                            anyhow::bail!(
                                "point-to-point links connect exactly 2 nodes, but {} were given",
                                l.nodes.len()
                            );
                        };
                        LinkSpec::point_to_point(a, b, l.rate, delay)
                    }
                };

                Ok(ScenarioLink {
                    spec,
                    subnet: l.subnet.map(|s| (s.base, s.mask)),
                })
            })
            .collect::<anyhow::Result<_>>()?;

        let bridges = json
            .bridges
            .into_iter()
            .map(|b| ScenarioBridge {
                node: b.node,
                interface: b.interface,
                address: b.address,
                mask: b.mask,
                mac: b.mac,
            })
            .collect();

        let captures = json
            .captures
            .into_iter()
            .map(|c| {
                let target = match (c.node, c.device, c.link) {
                    (Some(node), Some(index), None) => CaptureTarget::Device { node, index },
                    (None, None, Some(link)) => CaptureTarget::Link(link),
                    (None, None, None) => CaptureTarget::All,
                    _ => anyhow::bail!(
                        "capture `{}` must name either a node and a device, or a link",
                        c.prefix
                    ),
                };

                Ok(CaptureSpec {
                    prefix: c.prefix,
                    target,
                    promiscuous: c.promiscuous,
                })
            })
            .collect::<anyhow::Result<_>>()?;

        let routing_dump = json.routing_dump.map(|d| RoutingDump {
            at: Duration::from_millis(d.at_ms),
            file: d
                .file
                .unwrap_or_else(|| PathBuf::from(crate::scenario::ROUTES_FILE)),
        });

        Ok(Scenario {
            name: json.name,
            node_count: json.nodes,
            links,
            bridges,
            captures,
            routing_dump,
            flow_monitor: json.flow_monitor,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_topology() {
        let json = r#"{
            "name": "ring",
            "nodes": 3,
            "links": [
                { "kind": "shared", "nodes": [0, 1, 2], "rate": "5Mbps", "delayMs": 20,
                  "subnet": { "base": "192.134.135.0", "mask": "255.255.255.0" } }
            ],
            "bridges": [
                { "node": 0, "interface": "enp0s8", "address": "10.161.29.20",
                  "mask": "255.255.255.0", "mac": "08:00:27:b3:a5:82" }
            ],
            "captures": [
                { "prefix": "csma", "link": 0, "promiscuous": true },
                { "prefix": "all" }
            ],
            "routingDump": { "atMs": 15000 }
        }"#;

        let topology: TopologyJson = serde_json::from_str(json).unwrap();
        let scenario = Scenario::try_from(topology).unwrap();

        assert_eq!(scenario.name, "ring");
        assert_eq!(scenario.links[0].spec.nodes, [0, 1, 2]);
        assert_eq!(scenario.links[0].spec.model.rate, DataRate::from_mbps(5));
        assert_eq!(
            scenario.bridges[0].mac.unwrap().to_string(),
            "08:00:27:b3:a5:82"
        );
        assert!(matches!(scenario.captures[0].target, CaptureTarget::Link(0)));
        assert!(matches!(scenario.captures[1].target, CaptureTarget::All));

        let dump = scenario.routing_dump.unwrap();
        assert_eq!(dump.at, Duration::from_secs(15));
        assert_eq!(dump.file, PathBuf::from("routes_emu.routes"));
        assert!(scenario.flow_monitor);
    }

    #[test]
    fn test_point_to_point_links_need_two_nodes() {
        let json = r#"{
            "nodes": 3,
            "links": [{ "kind": "pointToPoint", "nodes": [0, 1, 2], "rate": "1Mbps", "delayMs": 1 }]
        }"#;

        let topology: TopologyJson = serde_json::from_str(json).unwrap();
        let error = Scenario::try_from(topology).unwrap_err();
        assert!(error.to_string().contains("exactly 2 nodes"));
    }
}
