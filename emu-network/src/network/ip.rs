use anyhow::{Context, anyhow, bail};
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

/// An IPv4 network, always stored in its canonical form (host bits cleared)
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv4Subnet {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Subnet {
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> anyhow::Result<Self> {
        if prefix_len > 32 {
            bail!("network prefix cannot be higher than 32");
        }

        Ok(Self {
            network: Ipv4Addr::from_bits(address.to_bits() & prefix_mask(prefix_len)),
            prefix_len,
        })
    }

    /// Builds a subnet from an address and a dotted mask (e.g. `255.255.255.0`)
    pub fn with_mask(address: Ipv4Addr, mask: Ipv4Addr) -> anyhow::Result<Self> {
        let mask_bits = mask.to_bits();
        let prefix_len = mask_bits.leading_ones();
        if mask_bits.checked_shl(prefix_len).unwrap_or(0) != 0 {
            bail!("mask {mask} is not contiguous");
        }

        Self::new(address, prefix_len as u8)
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn mask(&self) -> Ipv4Addr {
        Ipv4Addr::from_bits(prefix_mask(self.prefix_len))
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from_bits(self.network.to_bits() | !prefix_mask(self.prefix_len))
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        address.to_bits() & prefix_mask(self.prefix_len) == self.network.to_bits()
    }

    /// The number of addresses that can be handed out to devices (network and broadcast
    /// addresses excluded, except for /31 and /32)
    pub fn usable_hosts(&self) -> u64 {
        let total = 1u64 << (32 - self.prefix_len as u32);
        if self.prefix_len >= 31 { total } else { total - 2 }
    }

    /// The n-th usable host address (zero-based), if the subnet is large enough
    pub fn host(&self, n: u64) -> Option<Ipv4Addr> {
        if n >= self.usable_hosts() {
            return None;
        }

        let offset = if self.prefix_len >= 31 { n } else { n + 1 };
        Some(Ipv4Addr::from_bits(
            self.network.to_bits() + offset as u32,
        ))
    }
}

fn prefix_mask(prefix_len: u8) -> u32 {
    u32::MAX.checked_shl(32 - prefix_len as u32).unwrap_or(0)
}

impl Display for Ipv4Subnet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for Ipv4Subnet {
    type Err = anyhow::Error;

    // Parse ranges in CIDR syntax (e.g. 10.0.0.0/24)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        let base_ip: IpAddr = parts
            .next()
            .ok_or(anyhow!("empty string"))?
            .parse()
            .context("invalid ip address in subnet")?;

        let IpAddr::V4(base_ip) = base_ip else {
            bail!("only IPv4 supported at the moment");
        };

        // A missing network prefix is interpreted as /32 (i.e. a single address)
        let network_prefix: u8 = parts
            .next()
            .unwrap_or("32")
            .parse()
            .context("the provided network prefix is not a valid unsigned integer")?;

        if parts.next().is_some() {
            bail!("subnet contains trailing characters");
        }

        Self::new(base_ip, network_prefix)
    }
}
