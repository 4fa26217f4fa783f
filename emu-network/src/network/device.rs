use crate::network::link::LinkId;
use crate::network::node::NodeId;
use crate::network::spec::LinkModel;
use anyhow::{Context, bail};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub usize);

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

/// A network interface attached to exactly one node
#[derive(Clone, Debug)]
pub struct Device {
    pub(crate) id: DeviceId,
    pub(crate) node: NodeId,
    /// Position of this device in its node's device list
    pub(crate) index_on_node: usize,
    pub(crate) mac: MacAddress,
    pub(crate) kind: DeviceKind,
}

#[derive(Clone, Debug)]
pub enum DeviceKind {
    /// Attached to a broadcast segment
    Shared { link: LinkId, model: LinkModel },
    /// One end of a point-to-point link
    PointToPoint {
        link: LinkId,
        model: LinkModel,
        peer: DeviceId,
    },
    /// Relays frames between the simulation and a real host interface
    Bridge { interface_name: String },
}

impl Device {
    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn index_on_node(&self) -> usize {
        self.index_on_node
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    pub fn link(&self) -> Option<LinkId> {
        match &self.kind {
            DeviceKind::Shared { link, .. } | DeviceKind::PointToPoint { link, .. } => Some(*link),
            DeviceKind::Bridge { .. } => None,
        }
    }

    pub fn is_bridge(&self) -> bool {
        matches!(self.kind, DeviceKind::Bridge { .. })
    }

    /// A short description of the device's role, used in logs
    pub fn role(&self) -> String {
        match &self.kind {
            DeviceKind::Shared { .. } => "shared".to_string(),
            DeviceKind::PointToPoint { .. } => "p2p".to_string(),
            DeviceKind::Bridge { interface_name } => format!("bridge({interface_name})"),
        }
    }
}

/// A 48-bit hardware address
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl From<MacAddress> for pnet_base::MacAddr {
    fn from(mac: MacAddress) -> Self {
        let [a, b, c, d, e, f] = mac.0;
        pnet_base::MacAddr::new(a, b, c, d, e, f)
    }
}

impl From<pnet_base::MacAddr> for MacAddress {
    fn from(mac: pnet_base::MacAddr) -> Self {
        MacAddress([mac.0, mac.1, mac.2, mac.3, mac.4, mac.5])
    }
}

impl Display for MacAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .with_context(|| format!("hardware address `{s}` has fewer than 6 octets"))?;
            *octet = u8::from_str_radix(part, 16)
                .with_context(|| format!("invalid octet `{part}` in hardware address `{s}`"))?;
        }

        if parts.next().is_some() {
            bail!("hardware address `{s}` has more than 6 octets");
        }

        Ok(MacAddress(octets))
    }
}

/// Hands out sequential hardware addresses with the unassigned `00:00:00` vendor prefix
#[derive(Debug, Default)]
pub(crate) struct MacAllocator {
    next: u64,
}

impl MacAllocator {
    pub(crate) fn allocate(&mut self) -> MacAddress {
        self.next += 1;
        let bytes = self.next.to_be_bytes();
        MacAddress([0, 0, 0, bytes[5], bytes[6], bytes[7]])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mac_round_trip_through_text() {
        let mac = MacAddress::from_str("08:00:27:b3:a5:82").unwrap();
        assert_eq!(mac.octets(), [0x08, 0x00, 0x27, 0xb3, 0xa5, 0x82]);
        assert_eq!(mac.to_string(), "08:00:27:b3:a5:82");
    }

    #[test]
    fn test_mac_rejects_malformed_input() {
        for input in ["", "08:00:27", "08:00:27:b3:a5:82:00", "zz:00:27:b3:a5:82"] {
            assert!(MacAddress::from_str(input).is_err(), "{input}");
        }
    }

    #[test]
    fn test_allocator_uses_unassigned_oui() {
        let mut allocator = MacAllocator::default();
        assert_eq!(allocator.allocate().to_string(), "00:00:00:00:00:01");
        assert_eq!(allocator.allocate().to_string(), "00:00:00:00:00:02");
        for _ in 0..253 {
            allocator.allocate();
        }
        assert_eq!(allocator.allocate().to_string(), "00:00:00:00:01:00");
    }

    #[test]
    fn test_broadcast_is_multicast() {
        assert!(MacAddress::BROADCAST.is_broadcast());
        assert!(MacAddress::BROADCAST.is_multicast());
        assert!(!MacAddress([0, 0, 0, 0, 0, 1]).is_multicast());
    }
}
