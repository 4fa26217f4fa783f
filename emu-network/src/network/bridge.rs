//! Bridge devices relay frames between a simulated node and a real host interface

use crate::error::HarnessError;
use crate::network::device::{Device, DeviceId, DeviceKind, MacAddress};
use crate::network::node::NodeId;
use crate::network::topology::Topology;
use anyhow::{Context, anyhow};
use parking_lot::Mutex;
use pnet_datalink::{Channel, DataLinkReceiver, DataLinkSender};
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// How long a reader thread blocks on the host interface before checking for shutdown
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// A handle to a bridge device, naming the host interface it is bound to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeDevice {
    pub device: DeviceId,
    pub node: NodeId,
    pub interface: String,
    pub mac: MacAddress,
}

impl BridgeDevice {
    pub fn from_device(device: &Device) -> Option<Self> {
        let DeviceKind::Bridge { interface_name } = device.kind() else {
            return None;
        };

        Some(Self {
            device: device.id(),
            node: device.node(),
            interface: interface_name.clone(),
            mac: device.mac(),
        })
    }
}

/// Attaches a bridge device for `interface` to `node`
///
/// The interface itself is only opened when the run starts. It is expected to exist and to be in
/// promiscuous mode already. When `mac` is provided, it is used verbatim as the bridge's hardware
/// address.
pub fn bind(
    topology: &mut Topology,
    node: NodeId,
    interface: &str,
    mac: Option<MacAddress>,
) -> Result<BridgeDevice, HarnessError> {
    if !topology.contains_node(node) {
        return Err(HarnessError::invalid_spec(format!(
            "cannot bind `{interface}` to unknown {node}"
        )));
    }

    if interface.trim().is_empty() {
        return Err(HarnessError::interface_unavailable(
            interface,
            "the interface name is empty",
        ));
    }

    let mac = match mac {
        Some(mac) => mac,
        None => topology.allocate_mac(),
    };

    let device = topology.attach_device(
        node,
        mac,
        DeviceKind::Bridge {
            interface_name: interface.to_string(),
        },
    );

    info!("bound {node} to host interface `{interface}` ({mac})");

    Ok(BridgeDevice {
        device,
        node,
        interface: interface.to_string(),
        mac,
    })
}

/// A frame read from a host interface
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostFrame {
    pub bridge: DeviceId,
    pub bytes: Vec<u8>,
}

/// The live side of a bridge
pub trait HostChannel {
    fn send(&mut self, frame: &[u8]) -> anyhow::Result<()>;
    fn close(&mut self);
}

/// Opens the channel of a bridge, forwarding frames read from the host to `ingress`
pub trait HostChannelFactory {
    fn open(
        &self,
        bridge: &BridgeDevice,
        ingress: UnboundedSender<HostFrame>,
    ) -> Result<Box<dyn HostChannel>, HarnessError>;
}

/// Opens raw link-layer sockets on real interfaces
pub struct RawSocketChannelFactory;

impl HostChannelFactory for RawSocketChannelFactory {
    fn open(
        &self,
        bridge: &BridgeDevice,
        ingress: UnboundedSender<HostFrame>,
    ) -> Result<Box<dyn HostChannel>, HarnessError> {
        let interface = pnet_datalink::interfaces()
            .into_iter()
            .find(|i| i.name == bridge.interface)
            .ok_or_else(|| {
                HarnessError::interface_unavailable(&bridge.interface, "no such interface")
            })?;

        let config = pnet_datalink::Config {
            read_timeout: Some(READ_TIMEOUT),
            promiscuous: true,
            ..Default::default()
        };

        let (tx, rx) = match pnet_datalink::channel(&interface, config) {
            Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
            Ok(_) => {
                return Err(HarnessError::interface_unavailable(
                    &bridge.interface,
                    "unsupported channel type",
                ));
            }
            Err(e) => return Err(HarnessError::interface_unavailable(&bridge.interface, e)),
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let reader = std::thread::Builder::new()
            .name(format!("bridge-{}", bridge.interface))
            .spawn({
                let shutdown = shutdown.clone();
                let bridge = bridge.clone();
                move || read_host_frames(bridge, rx, ingress, shutdown)
            })
            .map_err(|e| HarnessError::interface_unavailable(&bridge.interface, e))?;

        info!("opened raw channel on `{}`", bridge.interface);

        Ok(Box::new(RawSocketChannel {
            interface: bridge.interface.clone(),
            tx,
            shutdown,
            reader: Some(reader),
        }))
    }
}

fn read_host_frames(
    bridge: BridgeDevice,
    mut rx: Box<dyn DataLinkReceiver>,
    ingress: UnboundedSender<HostFrame>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match rx.next() {
            Ok(bytes) => {
                let frame = HostFrame {
                    bridge: bridge.device,
                    bytes: bytes.to_vec(),
                };

                if ingress.send(frame).is_err() {
                    // The run is over
                    break;
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {}
            Err(e) => {
                warn!("reading from `{}` failed: {e}", bridge.interface);
                break;
            }
        }
    }

    debug!("reader for `{}` stopped", bridge.interface);
}

struct RawSocketChannel {
    interface: String,
    tx: Box<dyn DataLinkSender>,
    shutdown: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl HostChannel for RawSocketChannel {
    fn send(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        self.tx
            .send_to(frame, None)
            .ok_or_else(|| anyhow!("no room in the send buffer"))?
            .with_context(|| format!("failed to send frame on `{}`", self.interface))
    }

    fn close(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("reader for `{}` panicked", self.interface);
            }
        }
    }
}

/// Channels that never touch the host, for tests and offline runs
///
/// Frames sent by bridges are recorded, and host frames can be injected through the run
/// controller.
#[derive(Clone, Default)]
pub struct OfflineChannelFactory {
    unavailable: HashSet<String>,
    egress: Arc<Mutex<Vec<HostFrame>>>,
}

impl OfflineChannelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes opening the named interface fail, as if it didn't exist
    pub fn with_unavailable(mut self, interface: &str) -> Self {
        self.unavailable.insert(interface.to_string());
        self
    }

    /// Frames sent towards the host so far, in order
    pub fn egress(&self) -> Vec<HostFrame> {
        self.egress.lock().clone()
    }
}

impl HostChannelFactory for OfflineChannelFactory {
    fn open(
        &self,
        bridge: &BridgeDevice,
        _ingress: UnboundedSender<HostFrame>,
    ) -> Result<Box<dyn HostChannel>, HarnessError> {
        if self.unavailable.contains(&bridge.interface) {
            return Err(HarnessError::interface_unavailable(
                &bridge.interface,
                "no such interface",
            ));
        }

        Ok(Box::new(OfflineChannel {
            bridge: bridge.device,
            egress: self.egress.clone(),
        }))
    }
}

struct OfflineChannel {
    bridge: DeviceId,
    egress: Arc<Mutex<Vec<HostFrame>>>,
}

impl HostChannel for OfflineChannel {
    fn send(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        self.egress.lock().push(HostFrame {
            bridge: self.bridge,
            bytes: frame.to_vec(),
        });
        Ok(())
    }

    fn close(&mut self) {}
}

/// Hardware addresses of hosts seen behind each bridge
///
/// Learned passively from frames entering the simulation, so egress frames can carry a unicast
/// destination. Unknown neighbours are reached through broadcast.
#[derive(Debug, Default)]
pub struct NeighbourCache {
    entries: HashMap<(DeviceId, Ipv4Addr), MacAddress>,
}

impl NeighbourCache {
    pub fn learn(&mut self, bridge: DeviceId, address: Ipv4Addr, mac: MacAddress) {
        if mac.is_multicast() || address.is_unspecified() {
            return;
        }

        if self.entries.insert((bridge, address), mac) != Some(mac) {
            debug!("learned neighbour {address} at {mac} behind {bridge}");
        }
    }

    pub fn resolve(&self, bridge: DeviceId, address: Ipv4Addr) -> MacAddress {
        self.entries
            .get(&(bridge, address))
            .copied()
            .unwrap_or(MacAddress::BROADCAST)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::network::spec::{DataRate, LinkSpec};
    use std::str::FromStr;

    fn topology() -> Topology {
        Topology::build(
            2,
            &[LinkSpec::point_to_point(
                0,
                1,
                DataRate::from_mbps(10),
                Duration::ZERO,
            )],
        )
        .unwrap()
    }

    #[test]
    fn test_bind_appends_bridge_device() {
        let mut topology = topology();
        let mac = MacAddress::from_str("08:00:27:b3:a5:82").unwrap();
        let bridge = bind(&mut topology, NodeId(0), "enp0s8", Some(mac)).unwrap();

        assert_eq!(bridge.mac, mac);
        assert_eq!(topology.node(NodeId(0)).devices().len(), 2);
        let device = topology.device(bridge.device);
        assert!(device.is_bridge());
        assert_eq!(device.index_on_node(), 1);
        assert_eq!(device.mac(), mac);
        assert_eq!(BridgeDevice::from_device(device), Some(bridge));
    }

    #[test]
    fn test_bind_allocates_default_mac() {
        let mut topology = topology();
        let bridge = bind(&mut topology, NodeId(1), "enp0s9", None).unwrap();

        // Two point-to-point devices got the first addresses
        assert_eq!(bridge.mac.to_string(), "00:00:00:00:00:03");
    }

    #[test]
    fn test_bind_errors() {
        let mut topology = topology();
        assert!(matches!(
            bind(&mut topology, NodeId(5), "enp0s8", None),
            Err(HarnessError::InvalidTopologySpec { .. })
        ));
        assert!(matches!(
            bind(&mut topology, NodeId(0), "", None),
            Err(HarnessError::InterfaceUnavailable { .. })
        ));
    }

    #[test]
    fn test_offline_channels() {
        let mut topology = topology();
        let bridge = bind(&mut topology, NodeId(0), "enp0s8", None).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        let factory = OfflineChannelFactory::new().with_unavailable("enp0s8");
        let Err(err) = factory.open(&bridge, tx.clone()) else {
            panic!("expected the interface to be unavailable");
        };
        assert!(err.to_string().contains("enp0s8"));

        let factory = OfflineChannelFactory::new();
        let mut channel = factory.open(&bridge, tx).unwrap();
        channel.send(&[1, 2, 3]).unwrap();
        channel.close();
        assert_eq!(
            factory.egress(),
            vec![HostFrame {
                bridge: bridge.device,
                bytes: vec![1, 2, 3]
            }]
        );
    }

    #[test]
    fn test_neighbour_cache_falls_back_to_broadcast() {
        let mut cache = NeighbourCache::default();
        let host = Ipv4Addr::new(10, 161, 29, 5);
        assert_eq!(cache.resolve(DeviceId(0), host), MacAddress::BROADCAST);

        let mac = MacAddress([0x08, 0, 0x27, 1, 2, 3]);
        cache.learn(DeviceId(0), host, mac);
        assert_eq!(cache.resolve(DeviceId(0), host), mac);
        assert_eq!(cache.resolve(DeviceId(1), host), MacAddress::BROADCAST);

        // Multicast sources are never learned
        cache.learn(DeviceId(1), host, MacAddress::BROADCAST);
        assert_eq!(cache.resolve(DeviceId(1), host), MacAddress::BROADCAST);
    }
}
