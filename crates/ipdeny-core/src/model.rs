//! Domain model
//!
//! Plain value types for the three persisted entities (countries, blocks and
//! observed addresses) plus the helpers every component shares: CIDR parsing,
//! address family tagging and the deterministic cover selection rule.
//!
//! Nothing in here performs I/O. Related rows are referenced by id and must
//! be fetched explicitly through a [`BlockStore`](crate::traits::BlockStore).

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Surrogate key of a country row
pub type CountryId = i64;

/// Surrogate key of a block row
pub type BlockId = i64;

/// Surrogate key of an observed address row
pub type AddressId = i64;

/// Address family of a block or address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl AddressFamily {
    /// Both families, in the order a full run processes them
    pub const ALL: [AddressFamily; 2] = [AddressFamily::V4, AddressFamily::V6];

    /// Family of a network
    pub fn of_net(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => AddressFamily::V4,
            IpNet::V6(_) => AddressFamily::V6,
        }
    }

    /// Family of an address
    pub fn of_addr(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    /// Numeric tag (4 or 6) as stored in the relational schema
    pub fn as_u8(self) -> u8 {
        match self {
            AddressFamily::V4 => 4,
            AddressFamily::V6 => 6,
        }
    }

    /// The network covering the whole family (`0.0.0.0/0` or `::/0`)
    ///
    /// The sentinel country holds one of these per family as the catch-all
    /// that orphaned addresses are re-homed to.
    pub fn catch_all(self) -> IpNet {
        match self {
            AddressFamily::V4 => IpNet::V4(Ipv4Net::default()),
            AddressFamily::V6 => IpNet::V6(Ipv6Net::default()),
        }
    }
}

impl TryFrom<u8> for AddressFamily {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            4 => Ok(AddressFamily::V4),
            6 => Ok(AddressFamily::V6),
            other => Err(Error::invalid_input(format!(
                "address family must be 4 or 6, got {}",
                other
            ))),
        }
    }
}

impl FromStr for AddressFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "4" | "v4" | "ipv4" => Ok(AddressFamily::V4),
            "6" | "v6" | "ipv6" => Ok(AddressFamily::V6),
            other => Err(Error::invalid_input(format!(
                "unknown address family '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => f.write_str("ipv4"),
            AddressFamily::V6 => f.write_str("ipv6"),
        }
    }
}

/// Two-letter country code, always uppercase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CountryCode([u8; 2]);

impl CountryCode {
    /// The reserved "unallocated" country that receives orphaned addresses
    pub const SENTINEL: CountryCode = CountryCode(*b"ZZ");

    /// Parse a code, uppercasing it
    ///
    /// Archive member names are lowercase (`us.zone`) while the stored form is
    /// uppercase, so every code entering the system goes through here.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let bytes = raw.as_bytes();
        if bytes.len() != 2 || !bytes.iter().all(u8::is_ascii_alphabetic) {
            return Err(Error::invalid_input(format!(
                "country code must be two ASCII letters, got '{}'",
                raw
            )));
        }
        Ok(Self([
            bytes[0].to_ascii_uppercase(),
            bytes[1].to_ascii_uppercase(),
        ]))
    }

    /// The code as a string slice
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or_default()
    }

    /// Whether this is the sentinel code
    pub fn is_sentinel(&self) -> bool {
        *self == Self::SENTINEL
    }
}

impl FromStr for CountryCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CountryCode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<CountryCode> for String {
    fn from(code: CountryCode) -> Self {
        code.as_str().to_string()
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored country
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Country {
    pub id: CountryId,
    pub code: CountryCode,
    pub name: String,
}

/// A country that has not been persisted yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCountry {
    pub code: CountryCode,
    pub name: String,
}

impl NewCountry {
    /// Create a new country row from its required fields
    pub fn new(code: &str, name: &str) -> Result<Self> {
        let code = CountryCode::parse(code)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::invalid_input(format!(
                "country {} has an empty name",
                code
            )));
        }
        Ok(Self {
            code,
            name: name.to_string(),
        })
    }
}

/// A stored CIDR block owned by one country
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub country_id: CountryId,
    pub network: IpNet,
}

impl Block {
    /// Family derived from the network itself
    pub fn family(&self) -> AddressFamily {
        AddressFamily::of_net(&self.network)
    }

    /// Whether the block's range contains the address (families must match)
    pub fn covers(&self, addr: &IpAddr) -> bool {
        self.network.contains(addr)
    }

    /// Whether the block's range contains the whole network
    pub fn contains_net(&self, net: &IpNet) -> bool {
        self.network.contains(net)
    }
}

/// A previously looked-up address, pinned to the block covering it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObservedAddress {
    pub id: AddressId,
    pub block_id: BlockId,
    pub address: IpAddr,
}

/// Parse a CIDR string into its canonical network
///
/// A bare address is accepted as a host route. Host bits set below the
/// prefix are rejected, matching what the relational `CIDR` type accepts,
/// so the same text always maps to the same set element.
pub fn parse_cidr(raw: &str) -> Result<IpNet> {
    let raw = raw.trim();
    let net = match raw.parse::<IpNet>() {
        Ok(net) => net,
        Err(_) => match raw.parse::<IpAddr>() {
            Ok(addr) => host_net(addr),
            Err(_) => {
                return Err(Error::invalid_input(format!("invalid CIDR '{}'", raw)));
            }
        },
    };

    if net.addr() != net.network() {
        return Err(Error::invalid_input(format!(
            "CIDR '{}' has host bits set (network is {})",
            raw,
            net.trunc()
        )));
    }

    Ok(net)
}

/// The single-address network for an address (`/32` or `/128`)
pub fn host_net(addr: IpAddr) -> IpNet {
    match addr {
        IpAddr::V4(v4) => IpNet::V4(Ipv4Net::from(v4)),
        IpAddr::V6(v6) => IpNet::V6(Ipv6Net::from(v6)),
    }
}

/// Pick the cover to use among several candidate blocks
///
/// The most specific block (longest prefix) wins; equal prefixes fall back
/// to the lowest id. Lookups and address migration both go through this so
/// the same stored state always yields the same answer.
pub fn select_cover<'a, I>(candidates: I) -> Option<&'a Block>
where
    I: IntoIterator<Item = &'a Block>,
{
    candidates.into_iter().min_by(|a, b| {
        b.network
            .prefix_len()
            .cmp(&a.network.prefix_len())
            .then(a.id.cmp(&b.id))
    })
}

/// The complete published block list of one address family, per country
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    family: AddressFamily,
    countries: BTreeMap<CountryCode, BTreeSet<IpNet>>,
}

impl Snapshot {
    /// Create an empty snapshot for a family
    pub fn new(family: AddressFamily) -> Self {
        Self {
            family,
            countries: BTreeMap::new(),
        }
    }

    /// The family every block in this snapshot belongs to
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Register a country, even if it publishes no blocks
    pub fn add_country(&mut self, code: CountryCode) {
        self.countries.entry(code).or_default();
    }

    /// Add one block to a country's set
    pub fn insert(&mut self, code: CountryCode, network: IpNet) -> Result<()> {
        if AddressFamily::of_net(&network) != self.family {
            return Err(Error::invalid_input(format!(
                "{} is not an {} network",
                network, self.family
            )));
        }
        self.countries.entry(code).or_default().insert(network);
        Ok(())
    }

    /// Countries with their block sets, in code order
    pub fn iter(&self) -> impl Iterator<Item = (&CountryCode, &BTreeSet<IpNet>)> {
        self.countries.iter()
    }

    /// The block set published for one country
    pub fn blocks_for(&self, code: &CountryCode) -> Option<&BTreeSet<IpNet>> {
        self.countries.get(code)
    }

    /// Number of countries present
    pub fn country_count(&self) -> usize {
        self.countries.len()
    }

    /// Total number of blocks across all countries
    pub fn block_count(&self) -> usize {
        self.countries.values().map(BTreeSet::len).sum()
    }
}
