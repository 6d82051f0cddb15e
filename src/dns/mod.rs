//! DNS view construction and the process-wide record store.
//!
//! The directory is projected into subdomain-keyed record sets on a periodic
//! rebuild: one key per `[prefix.]host.QTYPE` combination, where the prefix
//! selects peers by advertised service bits. The published store is global
//! with its own lock so the query hot path never touches a directory lock.

pub mod server;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{LazyLock, RwLock};

use tracing::debug;

use crate::node::{
    DnsClass, Status, NODE_BLOOM, NODE_COMPACT_FILTERS, NODE_GETUTXO, NODE_MWEB,
    NODE_MWEB_LIGHT_CLIENT, NODE_NETWORK, NODE_NETWORK_LIMITED, NODE_WITNESS,
};
use crate::seeder::{Seeder, SharedSeeder};

/// Record types we export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Aaaa,
}

impl RecordType {
    pub fn qtype(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Aaaa => 28,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
        }
    }
}

/// One published DNS answer.
#[derive(Debug, Clone)]
pub struct DnsRecord {
    /// Fully qualified owner name, with trailing dot.
    pub name: String,
    pub rtype: RecordType,
    pub ttl: u32,
    pub ip: IpAddr,
}

/// A subdomain prefix and the service bits a peer must advertise for it.
pub struct ServiceDef {
    pub prefix: &'static str,
    pub flags: &'static [u64],
}

/// Prefixes are labels, not bitmask encodings of the required set; every
/// listed flag must independently overlap the peer's services.
pub const SERVICE_DEFS: &[ServiceDef] = &[
    // (none): no special services required
    ServiceDef { prefix: "", flags: &[] },
    // NETWORK
    ServiceDef { prefix: "x1", flags: &[NODE_NETWORK] },
    // NETWORK | GETUTXO
    ServiceDef { prefix: "x3", flags: &[NODE_NETWORK, NODE_GETUTXO] },
    // NETWORK | BLOOM
    ServiceDef { prefix: "x5", flags: &[NODE_NETWORK, NODE_BLOOM] },
    // NETWORK | WITNESS
    ServiceDef { prefix: "x9", flags: &[NODE_NETWORK, NODE_WITNESS] },
    // NETWORK | BLOOM | WITNESS
    ServiceDef { prefix: "xd", flags: &[NODE_NETWORK, NODE_BLOOM, NODE_WITNESS] },
    // NETWORK | COMPACT_FILTERS
    ServiceDef { prefix: "x41", flags: &[NODE_NETWORK, NODE_COMPACT_FILTERS] },
    // NETWORK | WITNESS | COMPACT_FILTERS
    ServiceDef { prefix: "x49", flags: &[NODE_NETWORK, NODE_WITNESS, NODE_COMPACT_FILTERS] },
    // NETWORK_LIMITED
    ServiceDef { prefix: "x400", flags: &[NODE_NETWORK_LIMITED] },
    // NETWORK_LIMITED | GETUTXO
    ServiceDef { prefix: "x403", flags: &[NODE_NETWORK_LIMITED, NODE_GETUTXO] },
    // NETWORK_LIMITED | BLOOM
    ServiceDef { prefix: "x404", flags: &[NODE_NETWORK_LIMITED, NODE_BLOOM] },
    // NETWORK_LIMITED | WITNESS
    ServiceDef { prefix: "x408", flags: &[NODE_NETWORK_LIMITED, NODE_WITNESS] },
    // NETWORK_LIMITED | BLOOM | WITNESS
    ServiceDef { prefix: "x40c", flags: &[NODE_NETWORK_LIMITED, NODE_BLOOM, NODE_WITNESS] },
    // NETWORK_LIMITED | COMPACT_FILTERS
    ServiceDef { prefix: "x440", flags: &[NODE_NETWORK_LIMITED, NODE_COMPACT_FILTERS] },
    // NETWORK_LIMITED | WITNESS | COMPACT_FILTERS
    ServiceDef { prefix: "x448", flags: &[NODE_NETWORK_LIMITED, NODE_WITNESS, NODE_COMPACT_FILTERS] },
    // NETWORK | WITNESS | MWEB
    ServiceDef { prefix: "x1000009", flags: &[NODE_NETWORK, NODE_WITNESS, NODE_MWEB] },
    // NETWORK | WITNESS | COMPACT_FILTERS | MWEB
    ServiceDef { prefix: "x1000049", flags: &[NODE_NETWORK, NODE_WITNESS, NODE_COMPACT_FILTERS, NODE_MWEB] },
    // NETWORK_LIMITED | WITNESS | MWEB
    ServiceDef { prefix: "x1000408", flags: &[NODE_NETWORK_LIMITED, NODE_WITNESS, NODE_MWEB] },
    // NETWORK_LIMITED | WITNESS | COMPACT_FILTERS | MWEB
    ServiceDef { prefix: "x1000448", flags: &[NODE_NETWORK_LIMITED, NODE_WITNESS, NODE_COMPACT_FILTERS, NODE_MWEB] },
    // NETWORK | WITNESS | COMPACT_FILTERS | MWEB | MWEB_LIGHT_CLIENT
    ServiceDef { prefix: "x1800049", flags: &[NODE_NETWORK, NODE_WITNESS, NODE_COMPACT_FILTERS, NODE_MWEB, NODE_MWEB_LIGHT_CLIENT] },
    // NETWORK_LIMITED | WITNESS | COMPACT_FILTERS | MWEB | MWEB_LIGHT_CLIENT
    ServiceDef { prefix: "x1800448", flags: &[NODE_NETWORK_LIMITED, NODE_WITNESS, NODE_COMPACT_FILTERS, NODE_MWEB, NODE_MWEB_LIGHT_CLIENT] },
];

static RECORDS: LazyLock<RwLock<HashMap<String, Vec<DnsRecord>>>> =
    LazyLock::new(Default::default);

/// Replace the affected keys in the shared record store.
pub fn publish(updates: HashMap<String, Vec<DnsRecord>>) {
    let mut map = RECORDS.write().expect("dns store lock");
    for (key, records) in updates {
        map.insert(key, records);
    }
}

/// Copy the record list for a lookup key; unknown keys yield empty.
pub fn lookup(key: &str) -> Vec<DnsRecord> {
    RECORDS
        .read()
        .expect("dns store lock")
        .get(key)
        .cloned()
        .unwrap_or_default()
}

/// Map a wire qtype to the string used in lookup keys.
pub fn qtype_string(qtype: u16) -> &'static str {
    match qtype {
        1 => "A",
        28 => "AAAA",
        16 => "TXT",
        15 => "MX",
        2 => "NS",
        _ => "UNKNOWN",
    }
}

/// Rebuild and publish the DNS view for one network.
pub async fn update_records(seeder: &SharedSeeder) {
    let records = {
        let s = seeder.read().await;
        build_records(&s)
    };
    for (key, list) in &records {
        debug!("{key}: {} records", list.len());
    }
    publish(records);
}

/// Pure projection of the directory: CG nodes on standard ports, filtered
/// through every matching service definition, under both `x…` and `0x…`
/// prefix spellings.
pub fn build_records(s: &Seeder) -> HashMap<String, Vec<DnsRecord>> {
    let mut records: HashMap<String, Vec<DnsRecord>> = HashMap::new();

    for nd in s.nodes() {
        if nd.status != Status::Cg {
            continue;
        }
        let rtype = match nd.dns_class {
            DnsClass::V4Std => RecordType::A,
            DnsClass::V6Std => RecordType::Aaaa,
            _ => continue,
        };

        for def in SERVICE_DEFS {
            if !nd.services.has_all(def.flags) {
                continue;
            }
            add_record(&mut records, def.prefix, &s.cfg.dns_host, nd.na.ip, rtype, s.cfg.ttl);
            if !def.prefix.is_empty() {
                let alias = format!("0{}", def.prefix);
                add_record(&mut records, &alias, &s.cfg.dns_host, nd.na.ip, rtype, s.cfg.ttl);
            }
        }
    }

    records
}

fn add_record(
    records: &mut HashMap<String, Vec<DnsRecord>>,
    prefix: &str,
    host: &str,
    ip: IpAddr,
    rtype: RecordType,
    ttl: u32,
) {
    let name = if prefix.is_empty() {
        format!("{host}.")
    } else {
        format!("{prefix}.{host}.")
    };
    let key = format!("{name}{}", rtype.as_str());
    records.entry(key).or_default().push(DnsRecord {
        name,
        rtype,
        ttl,
        ip,
    });
}
