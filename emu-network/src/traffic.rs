//! Synthetic traffic originated by simulated nodes
//!
//! Probes give the flow monitor something to measure when no live host is sending traffic through
//! the bridges.

use crate::network::frame::{Datagram, udp_datagram};
use crate::network::node::NodeId;
use pnet_packet::Packet;
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::udp::UdpPacket;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

const DEFAULT_TTL: u8 = 64;

/// Seq number (8 bytes) and send time in nanoseconds (8 bytes)
const PROBE_HEADER_LEN: usize = 16;

/// Periodically sends UDP datagrams from a simulated node
#[derive(Clone, Debug)]
pub struct UdpProbe {
    pub source: NodeId,
    pub source_port: u16,
    pub destination: SocketAddrV4,
    pub interval: Duration,
    /// UDP payload size, never smaller than the probe header
    pub payload_size: usize,
    pub start: Duration,
    /// No datagrams are sent at or after this time (the run's stop time applies regardless)
    pub stop: Option<Duration>,
}

impl UdpProbe {
    pub fn new(source: NodeId, destination: SocketAddrV4) -> Self {
        Self {
            source,
            source_port: 49152,
            destination,
            interval: Duration::from_secs(1),
            payload_size: 56,
            start: Duration::from_secs(1),
            stop: None,
        }
    }

    /// The time of the tick after the one at `now`, if the probe keeps running
    pub(crate) fn next_tick(&self, now: Duration) -> Option<Duration> {
        let next = now + self.interval;
        match self.stop {
            Some(stop) if next >= stop => None,
            _ if self.interval.is_zero() => None,
            _ => Some(next),
        }
    }

    pub(crate) fn datagram(&self, source: Ipv4Addr, seq: u64, now: Duration) -> Datagram {
        let mut payload = vec![0; self.payload_size.max(PROBE_HEADER_LEN)];
        payload[..8].copy_from_slice(&seq.to_be_bytes());
        payload[8..16].copy_from_slice(&(now.as_nanos() as u64).to_be_bytes());

        udp_datagram(
            SocketAddrV4::new(source, self.source_port),
            self.destination,
            &payload,
            DEFAULT_TTL,
        )
    }
}

/// The header carried by every probe datagram
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProbePayload {
    pub seq: u64,
    pub sent_at: Duration,
}

impl ProbePayload {
    /// Reads the probe header of a UDP datagram, if it looks like one
    pub fn decode(datagram: &Datagram) -> Option<Self> {
        let ip = Ipv4Packet::new(datagram.bytes())?;
        let udp = UdpPacket::new(ip.payload())?;
        let payload = udp.payload();
        if payload.len() < PROBE_HEADER_LEN {
            return None;
        }

        let seq = u64::from_be_bytes(payload[..8].try_into().ok()?);
        let nanos = u64::from_be_bytes(payload[8..16].try_into().ok()?);
        Some(Self {
            seq,
            sent_at: Duration::from_nanos(nanos),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_probe_payload_round_trip() {
        let probe = UdpProbe::new(NodeId(0), "10.161.31.5:7".parse().unwrap());
        let datagram = probe.datagram(Ipv4Addr::new(10, 161, 29, 20), 3, Duration::from_millis(1500));

        assert_eq!(datagram.len(), 20 + 8 + 56);
        assert_eq!(datagram.destination(), Ipv4Addr::new(10, 161, 31, 5));
        assert_eq!(
            ProbePayload::decode(&datagram),
            Some(ProbePayload {
                seq: 3,
                sent_at: Duration::from_millis(1500),
            })
        );
    }

    #[test]
    fn test_small_payloads_still_carry_the_header() {
        let mut probe = UdpProbe::new(NodeId(0), "10.0.0.1:7".parse().unwrap());
        probe.payload_size = 0;
        let datagram = probe.datagram(Ipv4Addr::new(10, 0, 0, 2), 0, Duration::ZERO);
        assert_eq!(datagram.len(), 20 + 8 + 16);
    }

    #[test]
    fn test_ticks_stop_before_stop_time() {
        let mut probe = UdpProbe::new(NodeId(0), "10.0.0.1:7".parse().unwrap());
        probe.stop = Some(Duration::from_secs(3));
        assert_eq!(
            probe.next_tick(Duration::from_secs(1)),
            Some(Duration::from_secs(2))
        );
        assert_eq!(probe.next_tick(Duration::from_secs(2)), None);
    }
}
