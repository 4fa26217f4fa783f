use crate::config::cli::CliOpt;
use crate::scenario::{FLOW_MONITOR_FILE, Scenario};
use anyhow::Context;
use emu_network::flow_monitor::FlowMonitorConfig;
use emu_network::network::bridge::{
    HostChannelFactory, OfflineChannelFactory, RawSocketChannelFactory,
};
use emu_network::network::node::NodeId;
use emu_network::pcap_exporter::FileBasedPcapExporterFactory;
use emu_network::traffic::{ProbePayload, UdpProbe};
use emu_network::{RunConfig, RunController};
use std::time::Duration;
use tracing::info;

pub async fn run(options: &CliOpt, scenario: Scenario) -> anyhow::Result<()> {
    let stop_time = options.stop_time()?;
    let output_dir = options.output_dir.clone();
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("failed to create output directory {}", output_dir.display()))?;

    println!("--- Params ---");
    println!("* Scenario: {}", scenario.name);
    println!("* Stop time: {:.3}s", stop_time.as_secs_f64());
    println!("* Output directory: {}", output_dir.display());
    println!(
        "* Host interfaces: {}",
        if options.offline { "offline" } else { "raw sockets" }
    );

    let mut network = scenario.build()?;

    println!("--- Network ---");
    for node in network.topology().nodes() {
        let devices: Vec<_> = network
            .topology()
            .devices_of(node.id())
            .map(|device| {
                let address = network
                    .addresses()
                    .address_of(device.id())
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "unaddressed".to_string());
                format!("{} ({address})", device.role())
            })
            .collect();
        println!("* {}: {}", node.id(), devices.join(", "));
    }

    let pcap_factory = FileBasedPcapExporterFactory {
        directory: output_dir.clone(),
    };
    let captures = scenario.attach_captures(&mut network, &pcap_factory)?;
    info!("{} captures started", captures.len());

    if scenario.flow_monitor {
        network.attach_flow_monitor(FlowMonitorConfig::default())?;
    }

    let channel_factory: Box<dyn HostChannelFactory> = if options.offline {
        Box::new(OfflineChannelFactory::new())
    } else {
        Box::new(RawSocketChannelFactory)
    };

    let mut controller = RunController::new(
        network,
        RunConfig {
            stop_time,
            realtime: !options.no_realtime,
        },
        channel_factory,
    );

    if let Some(dump) = &scenario.routing_dump {
        controller.schedule_routing_dump(dump.at, output_dir.join(&dump.file));
    }

    if let Some(destination) = options.probe {
        let probe = UdpProbe {
            interval: Duration::from_millis(options.probe_interval_ms),
            ..UdpProbe::new(NodeId(options.probe_source), destination)
        };
        controller.add_probe(probe)?;
    }

    controller.on_packet_delivered(|event| {
        if let Some(probe) = ProbePayload::decode(&event.datagram) {
            info!(
                "{:.6}s probe {} from {} reached {} after {:.3}ms",
                event.time.as_secs_f64(),
                probe.seq,
                event.datagram.source(),
                event.node,
                event.time.saturating_sub(probe.sent_at).as_secs_f64() * 1000.0
            );
        }
    });

    let summary = controller.run().await?;

    let flow_output = output_dir.join(FLOW_MONITOR_FILE);
    controller.teardown(scenario.flow_monitor.then_some(flow_output.as_path()))?;

    println!("--- Stats ---");
    println!("* Simulated time: {:.3}s", summary.simulated_time.as_secs_f64());
    println!("* Dispatched events: {}", summary.dispatched_events);
    println!("* Datagrams originated: {}", summary.stats.originated);
    println!("* Datagrams from hosts: {}", summary.stats.received_from_hosts);
    println!("* Datagrams to hosts: {}", summary.stats.sent_to_hosts);
    println!("* Datagrams delivered: {}", summary.stats.delivered);
    println!("* Datagrams forwarded: {}", summary.stats.forwarded);
    println!("* Datagrams dropped: {}", summary.stats.dropped);

    Ok(())
}
