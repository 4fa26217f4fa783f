use crate::network::device::DeviceId;
use crate::network::spec::{DataRate, LinkKind, LinkModel};
use std::fmt::{Display, Formatter};
use std::time::Duration;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub usize);

impl Display for LinkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

pub struct NetworkLink {
    pub(crate) id: LinkId,
    pub(crate) model: LinkModel,
    /// Attached devices, in creation order
    pub(crate) devices: Vec<DeviceId>,
    /// A shared medium has a single pacer; a point-to-point link has one per direction, indexed
    /// like `devices`
    pacers: Vec<PacketPacer>,
}

/// When a frame put on a link starts and finishes its journey
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScheduledTransmission {
    pub started: Duration,
    pub arrival: Duration,
}

impl NetworkLink {
    pub(crate) fn new(id: LinkId, model: LinkModel, devices: Vec<DeviceId>) -> Self {
        let pacer_count = match model.kind {
            LinkKind::Shared => 1,
            LinkKind::PointToPoint => devices.len(),
        };

        Self {
            id,
            pacers: (0..pacer_count)
                .map(|_| PacketPacer::new(model.rate))
                .collect(),
            model,
            devices,
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn model(&self) -> &LinkModel {
        &self.model
    }

    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    /// Devices that receive a frame sent by `sender`
    pub fn receivers_of(&self, sender: DeviceId) -> impl Iterator<Item = DeviceId> + '_ {
        self.devices.iter().copied().filter(move |&d| d != sender)
    }

    /// Puts a frame of `size_bytes` on the wire, waiting for earlier frames from the same
    /// transmitter (or anyone on a shared medium) to finish serializing
    pub(crate) fn transmit(
        &mut self,
        sender: DeviceId,
        now: Duration,
        size_bytes: usize,
    ) -> ScheduledTransmission {
        let pacer_index = match self.model.kind {
            LinkKind::Shared => 0,
            LinkKind::PointToPoint => self
                .devices
                .iter()
                .position(|&d| d == sender)
                .expect("sender must be attached to the link"),
        };

        let pacer = &mut self.pacers[pacer_index];
        let started = pacer.next_send_time(now);
        let send_done = pacer.track_send(started, size_bytes);

        ScheduledTransmission {
            started,
            arrival: send_done + self.model.delay,
        }
    }
}

// Ensures that only a single frame at a time is being serialized
struct PacketPacer {
    rate: DataRate,
    last_send_done: Option<Duration>,
}

impl PacketPacer {
    fn new(rate: DataRate) -> Self {
        Self {
            rate,
            last_send_done: None,
        }
    }

    fn next_send_time(&self, now: Duration) -> Duration {
        match self.last_send_done {
            // No frame has been sent yet
            None => now,
            Some(send_done) => send_done.max(now),
        }
    }

    fn track_send(&mut self, start: Duration, packet_size_bytes: usize) -> Duration {
        let send_done = start + self.rate.transmission_time(packet_size_bytes);
        self.last_send_done = Some(send_done);
        send_done
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn link(kind: LinkKind) -> NetworkLink {
        NetworkLink::new(
            LinkId(0),
            LinkModel {
                rate: DataRate::from_mbps(10),
                delay: Duration::from_millis(20),
                kind,
            },
            vec![DeviceId(0), DeviceId(1), DeviceId(2)],
        )
    }

    #[test]
    fn test_frames_are_serialized_back_to_back() {
        let mut link = link(LinkKind::Shared);

        // 1250 bytes take 1 ms at 10 Mbps
        let first = link.transmit(DeviceId(0), Duration::ZERO, 1250);
        assert_eq!(first.started, Duration::ZERO);
        assert_eq!(first.arrival, Duration::from_millis(21));

        // The medium is busy, so another sender has to wait
        let second = link.transmit(DeviceId(1), Duration::ZERO, 1250);
        assert_eq!(second.started, Duration::from_millis(1));
        assert_eq!(second.arrival, Duration::from_millis(22));

        // An idle medium sends right away
        let third = link.transmit(DeviceId(2), Duration::from_secs(1), 1250);
        assert_eq!(third.started, Duration::from_secs(1));
    }

    #[test]
    fn test_point_to_point_directions_are_independent() {
        let mut link = link(LinkKind::PointToPoint);

        let forward = link.transmit(DeviceId(0), Duration::ZERO, 1250);
        let backward = link.transmit(DeviceId(1), Duration::ZERO, 1250);
        assert_eq!(forward.started, Duration::ZERO);
        assert_eq!(backward.started, Duration::ZERO);
    }

    #[test]
    fn test_receivers_exclude_sender() {
        let link = link(LinkKind::Shared);
        let receivers: Vec<_> = link.receivers_of(DeviceId(1)).collect();
        assert_eq!(receivers, vec![DeviceId(0), DeviceId(2)]);
    }
}
