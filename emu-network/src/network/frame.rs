//! Link-layer framing and the handful of IPv4 header operations the forwarding engine needs

use crate::network::device::MacAddress;
use pnet_packet::Packet;
use pnet_packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv4::{Ipv4Packet, MutableIpv4Packet};
use pnet_packet::tcp::TcpPacket;
use pnet_packet::udp::{MutableUdpPacket, UdpPacket};
use pnet_packet::{ipv4, udp};
use std::fmt::{Display, Formatter};
use std::net::{Ipv4Addr, SocketAddrV4};

const ETHERNET_HEADER_LEN: usize = 14;
const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// Address, control and protocol fields of a PPP frame carrying IPv4 (HDLC-like framing)
const PPP_IPV4_HEADER: [u8; 4] = [0xff, 0x03, 0x00, 0x21];

/// The link-layer encapsulation used on a device
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkLayer {
    Ethernet,
    Ppp,
}

/// Identifies a single packet of a monitored flow while it travels through the network
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FlowTag {
    pub flow_id: u32,
    pub seq: u64,
}

/// An IPv4 packet travelling through the emulated network
#[derive(Clone, Debug)]
pub struct Datagram {
    pub(crate) bytes: Vec<u8>,
    pub(crate) tag: Option<FlowTag>,
}

/// A datagram wrapped in a link-layer header, as it appears on a link
#[derive(Clone, Debug)]
pub struct Frame {
    pub(crate) bytes: Vec<u8>,
    pub(crate) link_layer: LinkLayer,
    pub(crate) tag: Option<FlowTag>,
}

/// The 5-tuple identifying a flow
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiveTuple {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub protocol: u8,
    pub source_port: u16,
    pub destination_port: u16,
}

impl Display for FiveTuple {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} (proto {})",
            self.source, self.source_port, self.destination, self.destination_port, self.protocol
        )
    }
}

impl Datagram {
    /// Wraps raw IPv4 bytes, returning `None` if they don't hold a well-formed IPv4 header
    pub fn parse(mut bytes: Vec<u8>) -> Option<Self> {
        let packet = Ipv4Packet::new(&bytes)?;
        let header_len = packet.get_header_length() as usize * 4;
        let total_len = packet.get_total_length() as usize;
        if packet.get_version() != 4
            || header_len < IPV4_HEADER_LEN
            || total_len < header_len
            || bytes.len() < total_len
        {
            return None;
        }

        // Drop link-layer padding
        bytes.truncate(total_len);
        Some(Self { bytes, tag: None })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn tag(&self) -> Option<FlowTag> {
        self.tag
    }

    fn header(&self) -> Ipv4Packet<'_> {
        // Validated at construction
        Ipv4Packet::new(&self.bytes).expect("datagram holds a valid IPv4 header")
    }

    pub fn source(&self) -> Ipv4Addr {
        self.header().get_source()
    }

    pub fn destination(&self) -> Ipv4Addr {
        self.header().get_destination()
    }

    pub fn ttl(&self) -> u8 {
        self.header().get_ttl()
    }

    pub fn dscp(&self) -> u8 {
        self.header().get_dscp()
    }

    /// The flow this datagram belongs to; transport ports are zero for protocols other than UDP
    /// and TCP
    pub fn five_tuple(&self) -> FiveTuple {
        let header = self.header();
        let protocol = header.get_next_level_protocol();
        let (source_port, destination_port) = match protocol {
            IpNextHeaderProtocols::Udp => UdpPacket::new(header.payload())
                .map(|udp| (udp.get_source(), udp.get_destination()))
                .unwrap_or_default(),
            IpNextHeaderProtocols::Tcp => TcpPacket::new(header.payload())
                .map(|tcp| (tcp.get_source(), tcp.get_destination()))
                .unwrap_or_default(),
            _ => (0, 0),
        };

        FiveTuple {
            source: header.get_source(),
            destination: header.get_destination(),
            protocol: protocol.0,
            source_port,
            destination_port,
        }
    }

    /// Decrements the TTL and fixes up the header checksum, returning `false` (and leaving the
    /// datagram untouched) when the TTL would expire
    pub(crate) fn decrement_ttl(&mut self) -> bool {
        let ttl = self.ttl();
        if ttl <= 1 {
            return false;
        }

        let mut header =
            MutableIpv4Packet::new(&mut self.bytes).expect("datagram holds a valid IPv4 header");
        header.set_ttl(ttl - 1);
        let checksum = ipv4::checksum(&header.to_immutable());
        header.set_checksum(checksum);
        true
    }

    pub(crate) fn into_frame(self, link_layer: LinkLayer, src: MacAddress, dst: MacAddress) -> Frame {
        let bytes = match link_layer {
            LinkLayer::Ethernet => ethernet_frame(src, dst, &self.bytes),
            LinkLayer::Ppp => {
                let mut bytes = Vec::with_capacity(PPP_IPV4_HEADER.len() + self.bytes.len());
                bytes.extend_from_slice(&PPP_IPV4_HEADER);
                bytes.extend_from_slice(&self.bytes);
                bytes
            }
        };

        Frame {
            bytes,
            link_layer,
            tag: self.tag,
        }
    }
}

impl Frame {
    /// Wraps a frame received from a host interface
    pub(crate) fn from_host(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            link_layer: LinkLayer::Ethernet,
            tag: None,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn link_layer(&self) -> LinkLayer {
        self.link_layer
    }

    /// The destination hardware address, if the encapsulation carries one
    pub fn destination_mac(&self) -> Option<MacAddress> {
        match self.link_layer {
            LinkLayer::Ethernet => {
                EthernetPacket::new(&self.bytes).map(|eth| eth.get_destination().into())
            }
            LinkLayer::Ppp => None,
        }
    }

    pub fn source_mac(&self) -> Option<MacAddress> {
        match self.link_layer {
            LinkLayer::Ethernet => EthernetPacket::new(&self.bytes).map(|eth| eth.get_source().into()),
            LinkLayer::Ppp => None,
        }
    }

    /// The IPv4 payload of the frame, if it carries one
    pub fn ipv4_payload(&self) -> Option<&[u8]> {
        match self.link_layer {
            LinkLayer::Ethernet => {
                let eth = EthernetPacket::new(&self.bytes)?;
                (eth.get_ethertype() == EtherTypes::Ipv4).then(|| &self.bytes[ETHERNET_HEADER_LEN..])
            }
            LinkLayer::Ppp => self
                .bytes
                .strip_prefix(PPP_IPV4_HEADER.as_slice()),
        }
    }

    /// Strips the link-layer header, keeping the flow tag
    pub(crate) fn into_datagram(self) -> Option<Datagram> {
        let payload = self.ipv4_payload()?.to_vec();
        let mut datagram = Datagram::parse(payload)?;
        datagram.tag = self.tag;
        Some(datagram)
    }
}

pub(crate) fn ethernet_frame(src: MacAddress, dst: MacAddress, payload: &[u8]) -> Vec<u8> {
    let mut buffer = vec![0; ETHERNET_HEADER_LEN + payload.len()];
    let mut eth = MutableEthernetPacket::new(&mut buffer).expect("buffer fits an ethernet header");
    eth.set_destination(dst.into());
    eth.set_source(src.into());
    eth.set_ethertype(EtherTypes::Ipv4);
    eth.set_payload(payload);
    buffer
}

/// Builds an IPv4/UDP datagram with valid checksums
pub fn udp_datagram(source: SocketAddrV4, destination: SocketAddrV4, payload: &[u8], ttl: u8) -> Datagram {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let ip_len = IPV4_HEADER_LEN + udp_len;
    let mut buffer = vec![0; ip_len];

    // Wrap the data in a UDP packet
    {
        let mut udp_writer = MutableUdpPacket::new(&mut buffer[IPV4_HEADER_LEN..])
            .expect("buffer fits a udp header");
        udp_writer.set_source(source.port());
        udp_writer.set_destination(destination.port());
        udp_writer.set_length(udp_len as u16);
        udp_writer.set_payload(payload);
        let checksum = udp::ipv4_checksum(&udp_writer.to_immutable(), source.ip(), destination.ip());
        udp_writer.set_checksum(checksum);
    }

    // Wrap the UDP packet in an IP packet
    {
        let mut ip_writer = MutableIpv4Packet::new(&mut buffer).expect("buffer fits an ipv4 header");
        ip_writer.set_version(4);
        ip_writer.set_header_length(5); // We don't use options
        ip_writer.set_dscp(0);
        ip_writer.set_identification(0); // We never fragment
        ip_writer.set_flags(0b010); // We never fragment
        ip_writer.set_fragment_offset(0);
        ip_writer.set_ttl(ttl);
        ip_writer.set_next_level_protocol(IpNextHeaderProtocol::new(17)); // 17 = UDP
        ip_writer.set_source(*source.ip());
        ip_writer.set_destination(*destination.ip());
        ip_writer.set_total_length(ip_len as u16);
        let checksum = ipv4::checksum(&ip_writer.to_immutable());
        ip_writer.set_checksum(checksum);
    }

    Datagram {
        bytes: buffer,
        tag: None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn datagram() -> Datagram {
        udp_datagram(
            "10.161.29.5:5000".parse().unwrap(),
            "10.161.31.5:6000".parse().unwrap(),
            b"hello",
            64,
        )
    }

    #[test]
    fn test_udp_datagram_has_valid_checksums() {
        let datagram = datagram();
        let header = Ipv4Packet::new(datagram.bytes()).unwrap();
        assert_eq!(header.get_total_length() as usize, 20 + 8 + 5);
        assert_eq!(header.get_checksum(), ipv4::checksum(&header));

        let udp = UdpPacket::new(header.payload()).unwrap();
        assert_eq!(
            udp.get_checksum(),
            udp::ipv4_checksum(&udp, &header.get_source(), &header.get_destination())
        );
        assert_eq!(udp.payload(), b"hello");
    }

    #[test]
    fn test_five_tuple() {
        let tuple = datagram().five_tuple();
        assert_eq!(tuple.source, Ipv4Addr::new(10, 161, 29, 5));
        assert_eq!(tuple.destination, Ipv4Addr::new(10, 161, 31, 5));
        assert_eq!(tuple.protocol, 17);
        assert_eq!(tuple.source_port, 5000);
        assert_eq!(tuple.destination_port, 6000);
    }

    #[test]
    fn test_decrement_ttl_recomputes_checksum() {
        let mut datagram = udp_datagram(
            "10.0.0.1:1".parse().unwrap(),
            "10.0.1.1:2".parse().unwrap(),
            &[],
            2,
        );

        assert!(datagram.decrement_ttl());
        assert_eq!(datagram.ttl(), 1);
        let header = Ipv4Packet::new(datagram.bytes()).unwrap();
        assert_eq!(header.get_checksum(), ipv4::checksum(&header));

        // The next hop would see an expired packet
        assert!(!datagram.decrement_ttl());
        assert_eq!(datagram.ttl(), 1);
    }

    #[test]
    fn test_ethernet_framing() {
        let src = MacAddress([0, 0, 0, 0, 0, 1]);
        let dst = MacAddress::BROADCAST;
        let original = datagram();
        let frame = original.clone().into_frame(LinkLayer::Ethernet, src, dst);

        assert_eq!(frame.bytes().len(), 14 + original.len());
        assert_eq!(frame.source_mac(), Some(src));
        assert_eq!(frame.destination_mac(), Some(dst));
        assert_eq!(frame.into_datagram().unwrap().bytes(), original.bytes());
    }

    #[test]
    fn test_ppp_framing() {
        let original = datagram();
        let frame = original.clone().into_frame(
            LinkLayer::Ppp,
            MacAddress([0; 6]),
            MacAddress([0; 6]),
        );

        assert_eq!(&frame.bytes()[..4], &[0xff, 0x03, 0x00, 0x21]);
        assert_eq!(frame.destination_mac(), None);
        assert_eq!(frame.ipv4_payload(), Some(original.bytes()));
    }

    #[test]
    fn test_non_ipv4_frames_are_ignored() {
        let mut bytes = ethernet_frame(MacAddress([0; 6]), MacAddress::BROADCAST, &[0; 28]);
        // ARP
        bytes[12] = 0x08;
        bytes[13] = 0x06;
        let frame = Frame::from_host(bytes);
        assert!(frame.ipv4_payload().is_none());
        assert!(frame.into_datagram().is_none());
    }
}
