use crate::network::EmulatedNetwork;
use crate::network::bridge::HostFrame;
use crate::network::device::DeviceId;
use crate::network::frame::Frame;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// A one-shot action run from the dispatch loop
pub type Action = Box<dyn FnOnce(&mut EmulatedNetwork, &mut Scheduler)>;

pub(crate) enum Event {
    /// A frame finished propagating over a link and reaches `device`
    FrameArrival { device: DeviceId, frame: Frame },
    /// A frame read from a host interface enters the simulation
    HostFrame(HostFrame),
    RoutingDump { path: PathBuf },
    RecomputeRoutes,
    ProbeTick { probe: usize },
    Action(Action),
}

impl Event {
    fn name(&self) -> &'static str {
        match self {
            Event::FrameArrival { .. } => "frame arrival",
            Event::HostFrame(_) => "host frame",
            Event::RoutingDump { .. } => "routing dump",
            Event::RecomputeRoutes => "route recomputation",
            Event::ProbeTick { .. } => "probe tick",
            Event::Action(_) => "action",
        }
    }
}

/// The simulated clock together with the queue of pending events
///
/// Events run in nondecreasing time order, and events scheduled for the same instant run in the
/// order they were scheduled. Only events strictly before the stop time are ever dispatched.
pub struct Scheduler {
    now: Duration,
    stop_time: Duration,
    queue: BinaryHeap<ScheduledEvent>,
    next_seq: u64,
    dispatched: u64,
}

impl Scheduler {
    pub fn new(stop_time: Duration) -> Self {
        Self {
            now: Duration::ZERO,
            stop_time,
            queue: BinaryHeap::new(),
            next_seq: 0,
            dispatched: 0,
        }
    }

    /// Simulated time since the start of the run
    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn stop_time(&self) -> Duration {
        self.stop_time
    }

    /// Events waiting to be dispatched, including those that never will be
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    pub fn schedule_action(&mut self, at: Duration, action: Action) {
        self.schedule(at, Event::Action(action));
    }

    /// Schedules `event` at `at`, or right away if `at` is already in the past
    pub(crate) fn schedule(&mut self, at: Duration, event: Event) {
        let at = at.max(self.now);
        if at >= self.stop_time {
            debug!(
                "{} scheduled at {:.6}s will not run (stop time is {:.6}s)",
                event.name(),
                at.as_secs_f64(),
                self.stop_time.as_secs_f64()
            );
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(ScheduledEvent { at, seq, event });
    }

    /// The time of the next event that will be dispatched, if any
    pub(crate) fn next_event_time(&self) -> Option<Duration> {
        self.queue
            .peek()
            .map(|next| next.at)
            .filter(|&at| at < self.stop_time)
    }

    /// Pops the next event if it is due at or before `until`, advancing the clock to it
    pub(crate) fn pop_due(&mut self, until: Duration) -> Option<Event> {
        let at = self.next_event_time()?;
        if at > until {
            return None;
        }

        let next = self.queue.pop()?;
        self.now = next.at;
        self.dispatched += 1;
        Some(next.event)
    }

    /// Moves the clock forward, never past the stop time
    pub(crate) fn advance_to(&mut self, time: Duration) {
        self.now = self.now.max(time.min(self.stop_time));
    }
}

// Scheduled events, sorted by time and then by insertion order
struct ScheduledEvent {
    at: Duration,
    seq: u64,
    event: Event,
}

impl Eq for ScheduledEvent {}

impl PartialEq<Self> for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl PartialOrd<Self> for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Note: the order is reversed, so the "max" event is the next one to be dispatched
        other.at.cmp(&self.at).then(other.seq.cmp(&self.seq))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dump(name: &str) -> Event {
        Event::RoutingDump {
            path: PathBuf::from(name),
        }
    }

    fn dump_name(event: Event) -> String {
        match event {
            Event::RoutingDump { path } => path.display().to_string(),
            other => panic!("unexpected {}", other.name()),
        }
    }

    #[test]
    fn test_events_run_in_time_order_with_fifo_ties() {
        let mut scheduler = Scheduler::new(Duration::from_secs(30));
        scheduler.schedule(Duration::from_secs(2), dump("c"));
        scheduler.schedule(Duration::from_secs(1), dump("a"));
        scheduler.schedule(Duration::from_secs(1), dump("b"));

        let mut order = Vec::new();
        while let Some(event) = scheduler.pop_due(Duration::MAX) {
            order.push((scheduler.now(), dump_name(event)));
        }

        assert_eq!(
            order,
            [
                (Duration::from_secs(1), "a".to_string()),
                (Duration::from_secs(1), "b".to_string()),
                (Duration::from_secs(2), "c".to_string()),
            ]
        );
        assert_eq!(scheduler.dispatched(), 3);
    }

    #[test]
    fn test_events_at_or_after_stop_time_never_run() {
        let mut scheduler = Scheduler::new(Duration::from_secs(10));
        scheduler.schedule(Duration::from_secs(10), dump("at-stop"));
        scheduler.schedule(Duration::from_secs(11), dump("after-stop"));

        assert_eq!(scheduler.next_event_time(), None);
        assert!(scheduler.pop_due(Duration::MAX).is_none());
        assert_eq!(scheduler.pending(), 2);

        scheduler.advance_to(Duration::from_secs(60));
        assert_eq!(scheduler.now(), Duration::from_secs(10));
    }

    #[test]
    fn test_past_events_run_now() {
        let mut scheduler = Scheduler::new(Duration::from_secs(10));
        scheduler.advance_to(Duration::from_secs(5));
        scheduler.schedule(Duration::from_secs(1), dump("late"));
        assert_eq!(scheduler.next_event_time(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_pop_due_respects_deadline() {
        let mut scheduler = Scheduler::new(Duration::from_secs(10));
        scheduler.schedule(Duration::from_secs(3), dump("later"));
        assert!(scheduler.pop_due(Duration::from_secs(2)).is_none());
        assert_eq!(scheduler.now(), Duration::ZERO);
        assert!(scheduler.pop_due(Duration::from_secs(3)).is_some());
        assert_eq!(scheduler.now(), Duration::from_secs(3));
    }
}
