//! Per-peer node records and the reachability state machine.
//!
//! Every endpoint the seeder has ever heard about is tracked as a [`Node`],
//! keyed by its canonical `host:port` string. A node moves between four
//! status classes as crawl attempts succeed or fail, and carries a fixed
//! DNS class derived from its address family and port.

use std::fmt;
use std::net::IpAddr;

use crate::wire::NetAddress;

/// A node whose rating reaches this ceiling is marked non-working.
pub const RATING_CEILING: u32 = 100;

/// Reachability status classes.
///
/// New nodes start as `Rg` and are promoted to `Cg` by a crawl that returns
/// gossip. `Wg` marks a crawl in flight; `Ng` is terminal for dispatch but
/// the node stays in the directory until evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Reachable, quality unknown.
    Rg = 0,
    /// Currently good: the last crawl completed with gossip.
    Cg = 1,
    /// Working: a crawl task owns this node right now.
    Wg = 2,
    /// Non-working: rating hit the ceiling.
    Ng = 3,
}

impl Status {
    /// Number of status classes, for sizing per-class arrays.
    pub const COUNT: usize = 4;

    /// Index into per-class arrays (`max_start`, `delay`, counters).
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Rg => "RG",
            Status::Cg => "CG",
            Status::Wg => "WG",
            Status::Ng => "NG",
        }
    }
}

/// DNS export class: address family crossed with standard/non-standard port.
///
/// Derived from the address once, at insertion. Only the standard-port
/// classes are projected into DNS answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsClass {
    V4Std = 0,
    V4Non = 1,
    V6Std = 2,
    V6Non = 3,
}

impl DnsClass {
    pub const COUNT: usize = 4;

    /// Classify an endpoint against the network's canonical port.
    pub fn classify(ip: IpAddr, port: u16, std_port: u16) -> Self {
        match (ip, port == std_port) {
            (IpAddr::V4(_), true) => DnsClass::V4Std,
            (IpAddr::V4(_), false) => DnsClass::V4Non,
            (IpAddr::V6(_), true) => DnsClass::V6Std,
            (IpAddr::V6(_), false) => DnsClass::V6Non,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DnsClass::V4Std => "v4 standard port",
            DnsClass::V4Non => "v4 non-standard port",
            DnsClass::V6Std => "v6 standard port",
            DnsClass::V6Non => "v6 non-standard port",
        }
    }
}

/// Service bits a peer may advertise in its version message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceFlags(pub u64);

/// NODE_NETWORK: full chain available.
pub const NODE_NETWORK: u64 = 1;
/// NODE_GETUTXO.
pub const NODE_GETUTXO: u64 = 2;
/// NODE_BLOOM: bloom-filtered connections.
pub const NODE_BLOOM: u64 = 4;
/// NODE_WITNESS: segregated witness support.
pub const NODE_WITNESS: u64 = 8;
/// NODE_COMPACT_FILTERS: BIP-157/158 filter serving.
pub const NODE_COMPACT_FILTERS: u64 = 64;
/// NODE_NETWORK_LIMITED: pruned node serving recent blocks.
pub const NODE_NETWORK_LIMITED: u64 = 1024;
/// NODE_MWEB_LIGHT_CLIENT.
pub const NODE_MWEB_LIGHT_CLIENT: u64 = 1 << 23;
/// NODE_MWEB: MimbleWimble extension block support.
pub const NODE_MWEB: u64 = 1 << 24;

const FLAG_NAMES: &[(u64, &str)] = &[
    (NODE_NETWORK, "NODE_NETWORK"),
    (NODE_GETUTXO, "NODE_GETUTXO"),
    (NODE_BLOOM, "NODE_BLOOM"),
    (NODE_WITNESS, "NODE_WITNESS"),
    (NODE_COMPACT_FILTERS, "NODE_COMPACT_FILTERS"),
    (NODE_NETWORK_LIMITED, "NODE_NETWORK_LIMITED"),
    (NODE_MWEB_LIGHT_CLIENT, "NODE_MWEB_LIGHT_CLIENT"),
    (NODE_MWEB, "NODE_MWEB"),
];

impl ServiceFlags {
    /// True when every flag in `required` shares at least one bit with us.
    ///
    /// Entries may be combinations; each entry must independently match.
    pub fn has_all(self, required: &[u64]) -> bool {
        required.iter().all(|&f| self.0 & f != 0)
    }
}

impl fmt::Display for ServiceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "0x0");
        }
        let mut rest = self.0;
        let mut parts = Vec::new();
        for &(bit, name) in FLAG_NAMES {
            if rest & bit == bit {
                parts.push(name.to_string());
                rest &= !bit;
            }
        }
        if rest != 0 {
            parts.push(format!("0x{rest:x}"));
        }
        write!(f, "{}", parts.join("|"))
    }
}

/// One entry in the address directory.
#[derive(Debug, Clone)]
pub struct Node {
    /// Address details as gossiped or seeded.
    pub na: NetAddress,
    /// Last time we completed a handshake, unix seconds.
    pub last_connect: Option<u64>,
    /// Last time a crawl was dispatched for this node, unix seconds.
    pub last_try: u64,
    /// When the most recent crawl started, unix seconds.
    pub crawl_start: u64,
    /// Human-readable note from the last crawl ("ok", error text, ...).
    pub status_note: String,
    /// Remote user agent from the version message.
    pub user_agent: String,
    /// Remote advertised service bits.
    pub services: ServiceFlags,
    /// Consecutive failed connection attempts.
    pub connect_fails: u32,
    /// Remote protocol version.
    pub version: i32,
    /// Remote best-block height.
    pub last_block: i32,
    /// Current status class.
    pub status: Status,
    /// Failure rating; reaching [`RATING_CEILING`] demotes to NG.
    pub rating: u32,
    /// DNS export class, fixed at insertion.
    pub dns_class: DnsClass,
    /// Set while a crawl task owns this node.
    pub crawl_active: bool,
}

impl Node {
    pub fn new(na: NetAddress, dns_class: DnsClass) -> Self {
        Self {
            na,
            last_connect: None,
            last_try: 0,
            crawl_start: 0,
            status_note: "new".to_string(),
            user_agent: String::new(),
            services: ServiceFlags::default(),
            connect_fails: 0,
            version: 0,
            last_block: 0,
            status: Status::Rg,
            rating: 0,
            dns_class,
            crawl_active: false,
        }
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
