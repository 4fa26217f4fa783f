use anyhow::{Context, anyhow, bail};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

/// The physical-layer model of a link
#[derive(Clone, Debug, PartialEq)]
pub struct LinkModel {
    pub rate: DataRate,
    pub delay: Duration,
    pub kind: LinkKind,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkKind {
    /// A broadcast segment shared by every participant
    Shared,
    /// A dedicated link between exactly two participants
    PointToPoint,
}

impl LinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkKind::Shared => "shared",
            LinkKind::PointToPoint => "point-to-point",
        }
    }
}

/// A link to be created by the topology builder, naming its participants by node index
#[derive(Clone, Debug)]
pub struct LinkSpec {
    pub nodes: Vec<usize>,
    pub model: LinkModel,
}

impl LinkSpec {
    pub fn shared(nodes: impl Into<Vec<usize>>, rate: DataRate, delay: Duration) -> Self {
        Self {
            nodes: nodes.into(),
            model: LinkModel {
                rate,
                delay,
                kind: LinkKind::Shared,
            },
        }
    }

    pub fn point_to_point(a: usize, b: usize, rate: DataRate, delay: Duration) -> Self {
        Self {
            nodes: vec![a, b],
            model: LinkModel {
                rate,
                delay,
                kind: LinkKind::PointToPoint,
            },
        }
    }
}

/// A transmission rate, in bits per second
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DataRate {
    bits_per_second: u64,
}

impl DataRate {
    pub fn from_bps(bits_per_second: u64) -> Self {
        Self { bits_per_second }
    }

    pub fn from_mbps(megabits_per_second: u64) -> Self {
        Self::from_bps(megabits_per_second * 1_000_000)
    }

    pub fn bps(&self) -> u64 {
        self.bits_per_second
    }

    /// The time it takes to put `size_bytes` on the wire, rounded up to the next nanosecond
    pub fn transmission_time(&self, size_bytes: usize) -> Duration {
        let bits = size_bytes as u128 * 8;
        let bps = self.bits_per_second as u128;
        let nanos = (bits * 1_000_000_000).div_ceil(bps);
        Duration::from_nanos(nanos as u64)
    }
}

impl Display for DataRate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let bps = self.bits_per_second;
        if bps >= 1_000_000_000 && bps % 1_000_000_000 == 0 {
            write!(f, "{}Gbps", bps / 1_000_000_000)
        } else if bps >= 1_000_000 && bps % 1_000_000 == 0 {
            write!(f, "{}Mbps", bps / 1_000_000)
        } else if bps >= 1_000 && bps % 1_000 == 0 {
            write!(f, "{}kbps", bps / 1_000)
        } else {
            write!(f, "{bps}bps")
        }
    }
}

impl FromStr for DataRate {
    type Err = anyhow::Error;

    // Accepts the usual notations, e.g. `5Mbps`, `10Mb/s`, `100kbps` or `2MB/s`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, unit) = split_number(s)?;

        let bits_per_unit: f64 = match unit {
            "bps" | "b/s" => 1.0,
            "Bps" | "B/s" => 8.0,
            "kbps" | "Kbps" | "kb/s" | "Kb/s" => 1e3,
            "kBps" | "KBps" | "kB/s" | "KB/s" => 8e3,
            "Mbps" | "Mb/s" => 1e6,
            "MBps" | "MB/s" => 8e6,
            "Gbps" | "Gb/s" => 1e9,
            "GBps" | "GB/s" => 8e9,
            "" => bail!("data rate `{s}` is missing a unit (e.g. `Mbps`)"),
            other => bail!("unknown data rate unit `{other}` in `{s}`"),
        };

        let bits_per_second = (value * bits_per_unit).round();
        if bits_per_second < 1.0 {
            bail!("data rate `{s}` must be at least 1 bps");
        }

        Ok(Self::from_bps(bits_per_second as u64))
    }
}

/// Parses a delay such as `20ms`, `1.5s` or `150us` (a bare number is interpreted as seconds)
pub fn parse_delay(s: &str) -> anyhow::Result<Duration> {
    let (value, unit) = split_number(s)?;
    let nanos_per_unit = match unit {
        "ns" => 1.0,
        "us" => 1e3,
        "ms" => 1e6,
        "s" | "" => 1e9,
        "min" => 60e9,
        other => bail!("unknown time unit `{other}` in `{s}`"),
    };

    let nanos = (value * nanos_per_unit).round();
    if nanos > u64::MAX as f64 {
        bail!("delay `{s}` is too large");
    }

    Ok(Duration::from_nanos(nanos as u64))
}

fn split_number(s: &str) -> anyhow::Result<(f64, &str)> {
    let s = s.trim().trim_start_matches('+');
    let split_at = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split_at);
    if number.is_empty() {
        return Err(anyhow!("`{s}` does not start with a number"));
    }

    let value: f64 = number
        .parse()
        .with_context(|| format!("`{number}` is not a valid number"))?;
    if value.is_sign_negative() {
        bail!("`{s}` must not be negative");
    }

    Ok((value, unit))
}
