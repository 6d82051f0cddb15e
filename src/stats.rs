//! Per-network query counters and the periodic stats reporter.
//!
//! Counters live in a process-wide registry keyed by seeded hostname so the
//! DNS hot path can attribute a query without touching any directory lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, LazyLock, RwLock};
use std::time::Duration;

use tracing::info;

use crate::node::{DnsClass, Status};
use crate::seeder::SharedSeeder;

/// Seconds between stats reports.
const REPORT_SECS: u64 = 60;

/// Query counters for one seeded hostname, indexed by DNS class.
#[derive(Default)]
pub struct QueryCounts {
    counts: [AtomicU32; DnsClass::COUNT],
}

impl QueryCounts {
    pub fn bump(&self, class: DnsClass) {
        self.counts[class.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, class: DnsClass) -> u32 {
        self.counts[class.index()].load(Ordering::Relaxed)
    }
}

static REGISTRY: LazyLock<RwLock<HashMap<String, Arc<QueryCounts>>>> =
    LazyLock::new(Default::default);

/// Register a seeded hostname; queries under it are counted from then on.
pub fn register(host: &str) -> Arc<QueryCounts> {
    let counts = Arc::new(QueryCounts::default());
    REGISTRY
        .write()
        .expect("stats registry lock")
        .insert(host.to_lowercase(), counts.clone());
    counts
}

/// Attribute one answered query to its seeded hostname, if any.
///
/// `qname` arrives lowercased with a trailing dot; subdomain prefixes are
/// matched by suffix.
pub fn record_query(qname: &str, qtype: &str) {
    let class = match qtype {
        "A" => DnsClass::V4Std,
        "AAAA" => DnsClass::V6Std,
        _ => return,
    };
    let name = qname.strip_suffix('.').unwrap_or(qname);
    let registry = REGISTRY.read().expect("stats registry lock");
    for (host, counts) in registry.iter() {
        if name == host || name.ends_with(&format!(".{host}")) {
            counts.bump(class);
            break;
        }
    }
}

/// Periodic counter logging, enabled by `--stats`.
pub async fn run_reporter(seeder: SharedSeeder, counts: Arc<QueryCounts>) -> anyhow::Result<()> {
    let mut tick = tokio::time::interval(Duration::from_secs(REPORT_SECS));
    loop {
        tick.tick().await;
        let s = seeder.read().await;
        let nd = s.status_counts();
        let starts = s.start_counts();
        info!(
            "{}: {} nodes (RG {} CG {} WG {} NG {}), starts RG {} CG {} NG {}, queries A {} AAAA {}",
            s.cfg.name,
            s.len(),
            nd[Status::Rg.index()],
            nd[Status::Cg.index()],
            nd[Status::Wg.index()],
            nd[Status::Ng.index()],
            starts[Status::Rg.index()],
            starts[Status::Cg.index()],
            starts[Status::Ng.index()],
            counts.get(DnsClass::V4Std),
            counts.get(DnsClass::V6Std),
        );
    }
}
