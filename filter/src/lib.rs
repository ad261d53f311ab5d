//! Ingress Filter - Userspace loader and kernel map interface
//!
//! Wraps the XDP firewall program and provides an API for:
//! - Decoding the fixed-layout packet records emitted on the perf ring
//! - Parsing block values (IP, CIDR, MAC) into typed kernel map keys
//! - Loading/attaching the XDP program and updating the indicator maps

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

pub mod kernel;

pub use kernel::{IngressFilter, KernelConfig, RuleSink, XdpMode};

// =============================================================================
// Errors
// =============================================================================

/// Errors surfaced by the kernel-facing layer.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    /// The configured network interface does not exist on this host.
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    /// The XDP program could not be attached in any supported mode.
    #[error("failed to attach XDP program:\n{0}")]
    AttachFailed(String),

    /// A rule value that is neither an IP, a CIDR, nor a MAC address.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// A map declared by the kernel contract is missing from the object.
    #[error("map not found in eBPF object: {0}")]
    MapNotFound(&'static str),

    /// The entry program is missing from the object.
    #[error("program not found in eBPF object: {0}")]
    ProgramNotFound(&'static str),

    /// Map update attempted while the XDP stack is not loaded.
    #[error("XDP stack is not running")]
    NotRunning,

    #[error("failed to enumerate online cpus: {0}")]
    OnlineCpus(String),

    #[error(transparent)]
    Bpf(#[from] aya::EbpfError),

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),

    #[error(transparent)]
    Program(#[from] aya::programs::ProgramError),

    #[error(transparent)]
    Perf(#[from] aya::maps::perf::PerfBufferError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Packet records (perf ring wire format)
// =============================================================================

/// Match verdict recorded by the XDP program for a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MatchType {
    None = 0,
    Ip4Exact = 1,
    Ip4Cidr = 2,
    Ip6Exact = 3,
    Ip6Cidr = 4,
    Mac = 5,
}

impl MatchType {
    /// Decode the raw map value; unknown values degrade to `None`.
    pub fn from_u32(value: u32) -> MatchType {
        match value {
            1 => MatchType::Ip4Exact,
            2 => MatchType::Ip4Cidr,
            3 => MatchType::Ip6Exact,
            4 => MatchType::Ip6Cidr,
            5 => MatchType::Mac,
            _ => MatchType::None,
        }
    }
}

/// Ethertype of IPv4 as stored by the XDP program (host byte order).
pub const ETH_PROTO_IPV4: u16 = 0x0800;
/// Ethertype of IPv6 as stored by the XDP program (host byte order).
pub const ETH_PROTO_IPV6: u16 = 0x86DD;

/// One packet record as emitted by the XDP program on the `events` perf ring.
///
/// The field order and widths are the kernel contract; records are produced
/// on the same host, so native byte order is the wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PacketInfo {
    pub src_ip: [u8; 4],
    pub dst_ip: [u8; 4],
    pub src_ipv6: [u8; 16],
    pub dst_ipv6: [u8; 16],
    pub src_port: u16,
    pub dst_port: u16,
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub eth_proto: u16,
    pub ip_proto: u16,
    pub pkt_size: u32,
    pub match_type: u32,
}

/// The record size is fixed by the kernel contract.
pub const PACKET_INFO_SIZE: usize = 68;
const _: () = assert!(std::mem::size_of::<PacketInfo>() == PACKET_INFO_SIZE);

impl PacketInfo {
    /// Decode a raw perf record. Returns `None` for short reads.
    pub fn from_bytes(data: &[u8]) -> Option<PacketInfo> {
        if data.len() < PACKET_INFO_SIZE {
            return None;
        }
        // The layout is asserted above; unaligned read handles the
        // perf buffer's arbitrary record offsets.
        Some(unsafe { std::ptr::read_unaligned(data.as_ptr() as *const PacketInfo) })
    }

    pub fn match_type(&self) -> MatchType {
        MatchType::from_u32(self.match_type)
    }

    /// Source address according to the ethertype, if the record carries one.
    pub fn src_addr(&self) -> Option<IpAddr> {
        match self.eth_proto {
            ETH_PROTO_IPV4 => Some(IpAddr::V4(Ipv4Addr::from(self.src_ip))),
            ETH_PROTO_IPV6 => Some(IpAddr::V6(Ipv6Addr::from(self.src_ipv6))),
            _ => None,
        }
    }

    /// Destination address according to the ethertype.
    pub fn dst_addr(&self) -> Option<IpAddr> {
        match self.eth_proto {
            ETH_PROTO_IPV4 => Some(IpAddr::V4(Ipv4Addr::from(self.dst_ip))),
            ETH_PROTO_IPV6 => Some(IpAddr::V6(Ipv6Addr::from(self.dst_ipv6))),
            _ => None,
        }
    }
}

/// Render a MAC address as lowercase colon-separated hex.
pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

// =============================================================================
// Rule values
// =============================================================================

/// A parsed block value. Each variant maps to exactly one kernel map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleValue {
    V4(Ipv4Addr),
    V4Cidr(Ipv4Net),
    V6(Ipv6Addr),
    V6Cidr(Ipv6Net),
    Mac([u8; 6]),
}

impl RuleValue {
    /// The match type the XDP program reports for this value.
    pub fn match_type(&self) -> MatchType {
        match self {
            RuleValue::V4(_) => MatchType::Ip4Exact,
            RuleValue::V4Cidr(_) => MatchType::Ip4Cidr,
            RuleValue::V6(_) => MatchType::Ip6Exact,
            RuleValue::V6Cidr(_) => MatchType::Ip6Cidr,
            RuleValue::Mac(_) => MatchType::Mac,
        }
    }
}

impl FromStr for RuleValue {
    type Err = FilterError;

    fn from_str(value: &str) -> Result<RuleValue, FilterError> {
        let value = value.trim();
        if value.contains('/') {
            // CIDR networks are stored masked; host bits are discarded.
            return match value.parse::<IpNet>() {
                Ok(IpNet::V4(net)) => Ok(RuleValue::V4Cidr(net.trunc())),
                Ok(IpNet::V6(net)) => Ok(RuleValue::V6Cidr(net.trunc())),
                Err(_) => Err(FilterError::InvalidValue(value.to_string())),
            };
        }
        if let Ok(addr) = value.parse::<IpAddr>() {
            return Ok(match addr {
                IpAddr::V4(v4) => RuleValue::V4(v4),
                IpAddr::V6(v6) => RuleValue::V6(v6),
            });
        }
        parse_mac(value)
            .map(RuleValue::Mac)
            .ok_or_else(|| FilterError::InvalidValue(value.to_string()))
    }
}

impl fmt::Display for RuleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleValue::V4(addr) => write!(f, "{addr}"),
            RuleValue::V4Cidr(net) => write!(f, "{net}"),
            RuleValue::V6(addr) => write!(f, "{addr}"),
            RuleValue::V6Cidr(net) => write!(f, "{net}"),
            RuleValue::Mac(mac) => write!(f, "{}", format_mac(mac)),
        }
    }
}

/// Parse a six-octet MAC address, accepting `:` or `-` separators.
fn parse_mac(value: &str) -> Option<[u8; 6]> {
    let sep = if value.contains(':') { ':' } else { '-' };
    let mut octets = [0u8; 6];
    let mut count = 0;
    for part in value.split(sep) {
        if count == 6 || part.len() != 2 {
            return None;
        }
        octets[count] = u8::from_str_radix(part, 16).ok()?;
        count += 1;
    }
    (count == 6).then_some(octets)
}

// =============================================================================
// Tests
// =============================================================================
