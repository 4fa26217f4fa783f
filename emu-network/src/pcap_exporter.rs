use anyhow::Context;
use parking_lot::Mutex;
use pcap_file::DataLink;
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub trait PcapExporterFactory {
    fn create_pcap_exporter(
        &self,
        file_name: &str,
        datalink: DataLink,
    ) -> anyhow::Result<PcapExporter>;
}

pub struct NoOpPcapExporterFactory;
impl PcapExporterFactory for NoOpPcapExporterFactory {
    fn create_pcap_exporter(&self, file_name: &str, datalink: DataLink) -> anyhow::Result<PcapExporter> {
        PcapExporter::new(file_name, datalink, std::io::sink())
    }
}

/// Writes captures to files in `directory`
pub struct FileBasedPcapExporterFactory {
    pub directory: PathBuf,
}

impl PcapExporterFactory for FileBasedPcapExporterFactory {
    fn create_pcap_exporter(&self, file_name: &str, datalink: DataLink) -> anyhow::Result<PcapExporter> {
        let path = self.directory.join(file_name);
        let pcap_file = fs::File::create(&path)
            .with_context(|| format!("failed to open {} for writing", path.display()))?;
        PcapExporter::new(file_name, datalink, pcap_file)
    }
}

/// Keeps captures in memory, so they can be inspected after the run
#[derive(Clone, Default)]
pub struct InMemoryPcapExporterFactory {
    captures: Arc<Mutex<BTreeMap<String, SharedBuffer>>>,
}

impl InMemoryPcapExporterFactory {
    /// The bytes written so far to the named capture
    pub fn contents(&self, file_name: &str) -> Option<Vec<u8>> {
        self.captures
            .lock()
            .get(file_name)
            .map(|buffer| buffer.0.lock().clone())
    }

    pub fn file_names(&self) -> Vec<String> {
        self.captures.lock().keys().cloned().collect()
    }
}

impl PcapExporterFactory for InMemoryPcapExporterFactory {
    fn create_pcap_exporter(&self, file_name: &str, datalink: DataLink) -> anyhow::Result<PcapExporter> {
        let buffer = SharedBuffer::default();
        self.captures
            .lock()
            .insert(file_name.to_string(), buffer.clone());
        PcapExporter::new(file_name, datalink, buffer)
    }
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

/// Buffered output shared between the pcap writer and its exporter, which flushes it
#[derive(Clone)]
struct CaptureSink(Arc<Mutex<BufWriter<Box<dyn Write + Send + 'static>>>>);

impl Write for CaptureSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.0.lock().write_all(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().flush()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A classic pcap capture of a single device
pub struct PcapExporter {
    file_name: String,
    datalink: DataLink,
    total_tracked_packets: u64,
    writer: PcapWriter<CaptureSink>,
    sink: CaptureSink,
}

impl PcapExporter {
    /// Starts a capture, writing the global header right away
    pub fn new(
        file_name: &str,
        datalink: DataLink,
        writer: impl Write + Send + 'static,
    ) -> anyhow::Result<Self> {
        let writer: Box<dyn Write + Send + 'static> = Box::new(writer);
        let sink = CaptureSink(Arc::new(Mutex::new(BufWriter::new(writer))));
        let writer = PcapWriter::with_header(
            sink.clone(),
            PcapHeader {
                datalink,
                snaplen: 65535,
                ..Default::default()
            },
        )
        .with_context(|| format!("failed to write the pcap header of {file_name}"))?;

        let mut exporter = Self {
            file_name: file_name.to_string(),
            datalink,
            total_tracked_packets: 0,
            writer,
            sink,
        };

        exporter.flush()?;
        Ok(exporter)
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn datalink(&self) -> DataLink {
        self.datalink
    }

    pub fn total_tracked_packets(&self) -> u64 {
        self.total_tracked_packets
    }

    /// Appends a record stamped with the simulated time `timestamp`
    pub fn track_packet(&mut self, timestamp: Duration, data: &[u8]) -> anyhow::Result<()> {
        self.writer
            .write_packet(&PcapPacket::new(timestamp, data.len() as u32, data))
            .with_context(|| format!("failed to write packet to {}", self.file_name))?;
        self.total_tracked_packets += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        self.sink
            .flush()
            .with_context(|| format!("failed to flush {}", self.file_name))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pcap_file::pcap::PcapReader;

    #[test]
    fn test_records_carry_simulated_time() {
        let factory = InMemoryPcapExporterFactory::default();
        let mut exporter = factory
            .create_pcap_exporter("csma-left-0-0.pcap", DataLink::ETHERNET)
            .unwrap();

        exporter
            .track_packet(Duration::from_millis(1500), &[1, 2, 3, 4])
            .unwrap();
        exporter.flush().unwrap();
        assert_eq!(exporter.total_tracked_packets(), 1);

        let contents = factory.contents("csma-left-0-0.pcap").unwrap();
        let mut reader = PcapReader::new(contents.as_slice()).unwrap();
        assert_eq!(reader.header().datalink, DataLink::ETHERNET);

        let packet = reader.next_packet().unwrap().unwrap();
        assert_eq!(packet.timestamp, Duration::from_millis(1500));
        assert_eq!(packet.orig_len, 4);
        assert_eq!(&packet.data[..], &[1, 2, 3, 4]);
        assert!(reader.next_packet().is_none());
    }

    #[test]
    fn test_header_is_written_on_creation() {
        let factory = InMemoryPcapExporterFactory::default();
        let mut exporter = factory
            .create_pcap_exporter("ptop1-0-0.pcap", DataLink::PPP)
            .unwrap();
        exporter.flush().unwrap();

        // 24-byte global header, no records
        let contents = factory.contents("ptop1-0-0.pcap").unwrap();
        assert_eq!(contents.len(), 24);
        assert_eq!(factory.file_names(), ["ptop1-0-0.pcap"]);
    }

    #[test]
    fn test_flush_reaches_the_file() {
        let directory = std::env::temp_dir().join(format!("emu-pcap-{}", std::process::id()));
        fs::create_dir_all(&directory).unwrap();
        let factory = FileBasedPcapExporterFactory {
            directory: directory.clone(),
        };

        let mut exporter = factory
            .create_pcap_exporter("fd-left-0-1.pcap", DataLink::ETHERNET)
            .unwrap();
        exporter
            .track_packet(Duration::from_secs(2), &[0xaa; 60])
            .unwrap();
        exporter.flush().unwrap();

        // The exporter is still alive, so only the explicit flush got the record on disk
        let contents = fs::read(directory.join("fd-left-0-1.pcap")).unwrap();
        assert_eq!(contents.len(), 24 + 16 + 60);
        assert_eq!(exporter.total_tracked_packets(), 1);

        drop(exporter);
        fs::remove_dir_all(&directory).unwrap();
    }
}
