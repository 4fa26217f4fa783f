use crate::flow_monitor::classifier::Ipv4FlowClassifier;
use crate::flow_monitor::histogram::Histogram;
use crate::flow_monitor::{FlowStats, ProbeFlowStats};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use std::collections::BTreeMap;
use std::time::Duration;

pub(super) struct Snapshot<'a> {
    pub(super) flows: &'a BTreeMap<u32, FlowStats>,
    pub(super) classifier: &'a Ipv4FlowClassifier,
    pub(super) probes: &'a [BTreeMap<u32, ProbeFlowStats>],
}

impl Snapshot<'_> {
    pub(super) fn serialize(&self) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", None, None)))?;
        writer.write_event(Event::Start(BytesStart::new("FlowMonitor")))?;

        self.write_flow_stats(&mut writer)?;
        self.write_classifier(&mut writer)?;
        self.write_probes(&mut writer)?;

        writer.write_event(Event::End(BytesEnd::new("FlowMonitor")))?;

        let mut document = String::from_utf8(writer.into_inner())?;
        document.push('\n');
        Ok(document)
    }

    fn write_flow_stats(&self, writer: &mut Writer<Vec<u8>>) -> anyhow::Result<()> {
        writer.write_event(Event::Start(BytesStart::new("FlowStats")))?;

        for (flow_id, stats) in self.flows {
            let mut flow = BytesStart::new("Flow");
            flow.push_attribute(("flowId", flow_id.to_string().as_str()));
            for (name, time) in [
                ("timeFirstTxPacket", stats.time_first_tx_packet),
                ("timeFirstRxPacket", stats.time_first_rx_packet),
                ("timeLastTxPacket", stats.time_last_tx_packet),
                ("timeLastRxPacket", stats.time_last_rx_packet),
                ("delaySum", stats.delay_sum),
                ("jitterSum", stats.jitter_sum),
                ("lastDelay", stats.last_delay),
            ] {
                flow.push_attribute((name, format_time(time).as_str()));
            }

            for (name, value) in [
                ("txBytes", stats.tx_bytes),
                ("rxBytes", stats.rx_bytes),
                ("txPackets", stats.tx_packets),
                ("rxPackets", stats.rx_packets),
                ("lostPackets", stats.lost_packets),
                ("timesForwarded", stats.times_forwarded),
            ] {
                flow.push_attribute((name, value.to_string().as_str()));
            }

            writer.write_event(Event::Start(flow))?;

            write_drops(writer, &stats.packets_dropped, &stats.bytes_dropped)?;
            write_histogram(writer, "delayHistogram", &stats.delay_histogram)?;
            write_histogram(writer, "jitterHistogram", &stats.jitter_histogram)?;
            write_histogram(writer, "packetSizeHistogram", &stats.packet_size_histogram)?;

            writer.write_event(Event::End(BytesEnd::new("Flow")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("FlowStats")))?;
        Ok(())
    }

    fn write_classifier(&self, writer: &mut Writer<Vec<u8>>) -> anyhow::Result<()> {
        writer.write_event(Event::Start(BytesStart::new("Ipv4FlowClassifier")))?;

        for flow in self.classifier.flows() {
            let tuple = flow.tuple;
            let mut element = BytesStart::new("Flow");
            element.push_attribute(("flowId", flow.id.to_string().as_str()));
            element.push_attribute(("sourceAddress", tuple.source.to_string().as_str()));
            element.push_attribute((
                "destinationAddress",
                tuple.destination.to_string().as_str(),
            ));
            element.push_attribute(("protocol", tuple.protocol.to_string().as_str()));
            element.push_attribute(("sourcePort", tuple.source_port.to_string().as_str()));
            element.push_attribute((
                "destinationPort",
                tuple.destination_port.to_string().as_str(),
            ));
            writer.write_event(Event::Start(element))?;

            for (dscp, packets) in &flow.dscp_packets {
                let mut element = BytesStart::new("Dscp");
                element.push_attribute(("value", format!("{dscp:#x}").as_str()));
                element.push_attribute(("packets", packets.to_string().as_str()));
                writer.write_event(Event::Empty(element))?;
            }

            writer.write_event(Event::End(BytesEnd::new("Flow")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("Ipv4FlowClassifier")))?;
        Ok(())
    }

    fn write_probes(&self, writer: &mut Writer<Vec<u8>>) -> anyhow::Result<()> {
        writer.write_event(Event::Start(BytesStart::new("FlowProbes")))?;

        for (index, probe) in self.probes.iter().enumerate() {
            let mut element = BytesStart::new("FlowProbe");
            element.push_attribute(("index", index.to_string().as_str()));
            writer.write_event(Event::Start(element))?;

            for (flow_id, stats) in probe {
                let mut element = BytesStart::new("FlowStats");
                element.push_attribute(("flowId", flow_id.to_string().as_str()));
                element.push_attribute(("packets", stats.packets.to_string().as_str()));
                element.push_attribute(("bytes", stats.bytes.to_string().as_str()));
                element.push_attribute((
                    "delayFromFirstProbeSum",
                    format_time(stats.delay_from_first_probe_sum).as_str(),
                ));
                writer.write_event(Event::Start(element))?;
                write_drops(writer, &stats.packets_dropped, &stats.bytes_dropped)?;
                writer.write_event(Event::End(BytesEnd::new("FlowStats")))?;
            }

            writer.write_event(Event::End(BytesEnd::new("FlowProbe")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("FlowProbes")))?;
        Ok(())
    }
}

fn write_drops(
    writer: &mut Writer<Vec<u8>>,
    packets_dropped: &[u64],
    bytes_dropped: &[u64],
) -> anyhow::Result<()> {
    for (reason_code, packets) in packets_dropped.iter().enumerate() {
        let mut element = BytesStart::new("packetsDropped");
        element.push_attribute(("reasonCode", reason_code.to_string().as_str()));
        element.push_attribute(("number", packets.to_string().as_str()));
        writer.write_event(Event::Empty(element))?;
    }

    for (reason_code, bytes) in bytes_dropped.iter().enumerate() {
        let mut element = BytesStart::new("bytesDropped");
        element.push_attribute(("reasonCode", reason_code.to_string().as_str()));
        element.push_attribute(("bytes", bytes.to_string().as_str()));
        writer.write_event(Event::Empty(element))?;
    }

    Ok(())
}

fn write_histogram(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    histogram: &Histogram,
) -> anyhow::Result<()> {
    let mut element = BytesStart::new(name);
    element.push_attribute(("nBins", histogram.n_bins().to_string().as_str()));
    writer.write_event(Event::Start(element))?;

    for (index, count) in histogram.non_empty_bins() {
        let mut bin = BytesStart::new("bin");
        bin.push_attribute(("index", index.to_string().as_str()));
        bin.push_attribute(("start", histogram.bin_start(index).to_string().as_str()));
        bin.push_attribute(("width", histogram.bin_width().to_string().as_str()));
        bin.push_attribute(("count", count.to_string().as_str()));
        writer.write_event(Event::Empty(bin))?;
    }

    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

/// Times are written in nanoseconds with an explicit sign, e.g. `+20000000.0ns`
fn format_time(time: Duration) -> String {
    format!("+{}.0ns", time.as_nanos())
}
