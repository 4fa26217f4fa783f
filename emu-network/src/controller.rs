//! Lifecycle of a run: setup, dispatch until the stop time, teardown
//!
//! The controller owns the [`EmulatedNetwork`] and the [`Scheduler`], and moves through
//! `Configured → Running → Stopped → Destroyed`. Artifacts are written exactly once, at teardown.

use crate::error::HarnessError;
use crate::network::bridge::{HostChannelFactory, HostFrame};
use crate::network::device::DeviceId;
use crate::network::{EmulatedNetwork, ForwardingStats, PacketDelivered};
use crate::scheduler::{Action, Event, Scheduler};
use crate::traffic::UdpProbe;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunState {
    Configured,
    Running,
    Stopped,
    Destroyed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Configured => "configured",
            RunState::Running => "running",
            RunState::Stopped => "stopped",
            RunState::Destroyed => "destroyed",
        }
    }
}

impl Display for RunState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug)]
pub struct RunConfig {
    pub stop_time: Duration,
    /// Pace dispatch against the wall clock, which is needed when bridges talk to real hosts
    pub realtime: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            stop_time: Duration::from_secs(30),
            realtime: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunSummary {
    pub dispatched_events: u64,
    pub simulated_time: Duration,
    pub stats: ForwardingStats,
}

pub struct RunController {
    network: EmulatedNetwork,
    scheduler: Scheduler,
    config: RunConfig,
    state: RunState,
    channel_factory: Box<dyn HostChannelFactory>,
    host_tx: UnboundedSender<HostFrame>,
    host_rx: UnboundedReceiver<HostFrame>,
}

impl RunController {
    pub fn new(
        network: EmulatedNetwork,
        config: RunConfig,
        channel_factory: Box<dyn HostChannelFactory>,
    ) -> Self {
        let (host_tx, host_rx) = tokio::sync::mpsc::unbounded_channel();
        Self {
            network,
            scheduler: Scheduler::new(config.stop_time),
            config,
            state: RunState::Configured,
            channel_factory,
            host_tx,
            host_rx,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn network(&self) -> &EmulatedNetwork {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut EmulatedNetwork {
        &mut self.network
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Writes the routing tables of every node to `path` at simulated time `at`
    pub fn schedule_routing_dump(&mut self, at: Duration, path: impl Into<PathBuf>) {
        self.scheduler
            .schedule(at, Event::RoutingDump { path: path.into() });
    }

    pub fn schedule_route_recompute(&mut self, at: Duration) {
        self.scheduler.schedule(at, Event::RecomputeRoutes);
    }

    pub fn schedule_action(
        &mut self,
        at: Duration,
        action: impl FnOnce(&mut EmulatedNetwork, &mut Scheduler) + 'static,
    ) {
        let action: Action = Box::new(action);
        self.scheduler.schedule_action(at, action);
    }

    /// Feeds a frame into `bridge` as if it had been read from its host interface at `at`
    pub fn inject_host_frame(
        &mut self,
        at: Duration,
        bridge: DeviceId,
        bytes: Vec<u8>,
    ) -> Result<(), HarnessError> {
        let topology = self.network.topology();
        if !topology.contains_device(bridge) || !topology.device(bridge).is_bridge() {
            return Err(HarnessError::invalid_spec(format!(
                "{bridge} is not a bridge device"
            )));
        }

        self.scheduler
            .schedule(at, Event::HostFrame(HostFrame { bridge, bytes }));
        Ok(())
    }

    pub fn add_probe(&mut self, probe: UdpProbe) -> Result<(), HarnessError> {
        if !self.network.topology().contains_node(probe.source) {
            return Err(HarnessError::invalid_spec(format!(
                "probe source {} does not exist",
                probe.source
            )));
        }

        let start = probe.start;
        let index = self.network.add_probe(probe);
        self.scheduler
            .schedule(start, Event::ProbeTick { probe: index });
        Ok(())
    }

    pub fn on_packet_delivered(&mut self, handler: impl FnMut(&PacketDelivered) + 'static) {
        self.network.on_packet_delivered(handler);
    }

    /// Runs the simulation until the stop time
    ///
    /// Host channels are opened first, and failing to open any of them aborts the run.
    pub async fn run(&mut self) -> Result<RunSummary, HarnessError> {
        if self.state != RunState::Configured {
            return Err(HarnessError::InvalidRunState {
                operation: "run",
                state: self.state.as_str(),
            });
        }

        if let Err(e) = self
            .network
            .open_host_channels(self.channel_factory.as_ref(), &self.host_tx)
        {
            self.network.close_host_channels();
            return Err(e);
        }

        self.state = RunState::Running;
        info!(
            "running until {:.3}s ({})",
            self.config.stop_time.as_secs_f64(),
            if self.config.realtime {
                "realtime"
            } else {
                "as fast as possible"
            }
        );

        if self.config.realtime {
            self.run_realtime().await;
        } else {
            self.run_as_fast_as_possible();
        }

        self.state = RunState::Stopped;
        let summary = RunSummary {
            dispatched_events: self.scheduler.dispatched(),
            simulated_time: self.scheduler.now(),
            stats: self.network.stats().clone(),
        };

        info!(
            "run stopped at {:.3}s after {} events ({} left undispatched)",
            summary.simulated_time.as_secs_f64(),
            summary.dispatched_events,
            self.scheduler.pending()
        );

        Ok(summary)
    }

    async fn run_realtime(&mut self) {
        let stop_time = self.config.stop_time;
        let start = Instant::now();
        let deadline = start + stop_time;

        loop {
            let elapsed = start.elapsed().min(stop_time);
            while let Some(event) = self.scheduler.pop_due(elapsed) {
                self.network.dispatch(&mut self.scheduler, event);
            }
            self.scheduler.advance_to(elapsed);

            if elapsed >= stop_time {
                break;
            }

            let wake_up = self
                .scheduler
                .next_event_time()
                .map(|at| start + at)
                .unwrap_or(deadline)
                .min(deadline);

            tokio::select! {
                _ = tokio::time::sleep_until(wake_up) => {}
                frame = self.host_rx.recv() => {
                    if let Some(frame) = frame {
                        let at = start.elapsed();
                        self.scheduler.schedule(at, Event::HostFrame(frame));
                    }
                }
            }
        }
    }

    fn run_as_fast_as_possible(&mut self) {
        loop {
            self.drain_host_frames();
            let Some(event) = self.scheduler.pop_due(Duration::MAX) else {
                break;
            };

            self.network.dispatch(&mut self.scheduler, event);
        }

        self.scheduler.advance_to(self.config.stop_time);
    }

    fn drain_host_frames(&mut self) {
        loop {
            match self.host_rx.try_recv() {
                Ok(frame) => {
                    let now = self.scheduler.now();
                    self.scheduler.schedule(now, Event::HostFrame(frame));
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Flushes every artifact and releases the host interfaces
    ///
    /// The flow statistics are written to `flow_output` when a flow monitor is attached.
    pub fn teardown(&mut self, flow_output: Option<&Path>) -> anyhow::Result<()> {
        if !matches!(self.state, RunState::Configured | RunState::Stopped) {
            return Err(HarnessError::InvalidRunState {
                operation: "tear down",
                state: self.state.as_str(),
            }
            .into());
        }

        self.state = RunState::Destroyed;
        self.network.close_host_channels();
        self.network.flush_captures()?;

        if let Some(monitor) = self.network.flow_monitor() {
            monitor.check_for_lost_packets(self.scheduler.now());
            monitor.account_for_in_flight_packets();
            match flow_output {
                Some(path) => monitor.finalize(path)?,
                None => debug!("flow monitor attached but no output path given"),
            }
        }

        info!("teardown complete");
        Ok(())
    }
}
