//! Address directory for one seeded network.
//!
//! Holds every known peer keyed by canonical `host:port`, enforces the
//! capacity and deduplication rules on insertion, and applies crawl results
//! to the per-node state machine. The directory is shared behind a single
//! readers-writer lock; the DNS view builder iterates under the read side,
//! crawl result merging happens under the write side.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::crawl::client::CrawlOutcome;
use crate::node::{unix_now, DnsClass, Node, Status, RATING_CEILING};
use crate::wire::NetAddress;

/// NG nodes with at least this many consecutive failures are evicted when
/// the directory is at capacity.
const EVICT_FAILS: u32 = 4;

/// Shared handle to one network's directory.
pub type SharedSeeder = Arc<RwLock<Seeder>>;

/// The address directory and its per-network parameters.
pub struct Seeder {
    pub cfg: NetworkConfig,
    /// Known peers keyed by canonical `host:port`.
    list: HashMap<String, Node>,
    /// Crawl dispatches per status class since startup.
    starts: [u32; Status::COUNT],
}

impl Seeder {
    pub fn new(cfg: NetworkConfig) -> Self {
        Self {
            cfg,
            list: HashMap::new(),
            starts: [0; Status::COUNT],
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.list.get(key)
    }

    /// Iterate all nodes; callers hold the read lock.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.list.values()
    }

    /// Attempt to insert a peer.
    ///
    /// Returns false when the directory is full or the endpoint is already
    /// known; both are normal outcomes, not errors.
    pub fn add_na(&mut self, na: &NetAddress) -> bool {
        if self.list.len() >= self.cfg.max_size {
            return false;
        }
        let key = na.key();
        if self.list.contains_key(&key) {
            return false;
        }
        let class = DnsClass::classify(na.ip, na.port, self.cfg.port);
        self.list.insert(key, Node::new(na.clone(), class));
        true
    }

    /// Keys of nodes eligible for dispatch, grouped by status class: not
    /// crawl-active and past the pacing floor for their class.
    pub fn startable(&self, now: u64) -> [Vec<String>; Status::COUNT] {
        let mut out: [Vec<String>; Status::COUNT] = Default::default();
        for (key, nd) in &self.list {
            if nd.crawl_active || nd.status == Status::Wg {
                continue;
            }
            let idx = nd.status.index();
            if now.saturating_sub(nd.last_try) >= self.cfg.delay[idx] {
                out[idx].push(key.clone());
            }
        }
        out
    }

    /// Flag a node as owned by a crawl task. Only the scheduler calls this;
    /// only [`Seeder::merge`] clears the flag.
    pub fn mark_dispatched(&mut self, key: &str, prev_status: Status, now: u64) {
        if let Some(nd) = self.list.get_mut(key) {
            nd.crawl_active = true;
            nd.status = Status::Wg;
            nd.last_try = now;
            nd.crawl_start = now;
            nd.status_note = "crawling".to_string();
        }
        self.starts[prev_status.index()] += 1;
    }

    /// Apply a finished crawl to the probed node, then admit its gossip.
    ///
    /// Returns the number of newly inserted peers.
    pub fn merge(&mut self, key: &str, prev_status: Status, outcome: &CrawlOutcome) -> usize {
        let now = unix_now();
        let Some(nd) = self.list.get_mut(key) else {
            return 0;
        };
        nd.crawl_active = false;

        match &outcome.error {
            None if !outcome.addrs.is_empty() => {
                nd.status = Status::Cg;
                nd.rating = 0;
                nd.connect_fails = 0;
                nd.version = outcome.meta.version;
                nd.services = outcome.meta.services;
                nd.last_block = outcome.meta.last_block;
                nd.user_agent = outcome.meta.user_agent.clone();
                nd.last_connect = Some(now);
                nd.status_note = "ok".to_string();
                debug!(
                    "{}: {key} ok - {} ({})",
                    self.cfg.name, nd.user_agent, nd.services
                );
            }
            None => {
                // Handshake reached verack but produced no gossip: keep a
                // currently-good node good, otherwise mark reachable.
                nd.status = if prev_status == Status::Cg {
                    Status::Cg
                } else {
                    Status::Rg
                };
                nd.version = outcome.meta.version;
                nd.services = outcome.meta.services;
                nd.last_block = outcome.meta.last_block;
                nd.user_agent = outcome.meta.user_agent.clone();
                nd.last_connect = Some(now);
                nd.status_note = "ok - no gossip".to_string();
            }
            Some(e) => {
                nd.connect_fails += 1;
                nd.rating = nd.rating.saturating_add(e.kind.penalty());
                nd.status_note = e.to_string();
                nd.status = if nd.rating >= RATING_CEILING {
                    Status::Ng
                } else {
                    prev_status
                };
            }
        }

        let mut added = 0;
        for na in &outcome.addrs {
            if self.add_na(na) {
                added += 1;
            }
        }
        added
    }

    /// Evict hopeless NG nodes once the directory is at capacity, making
    /// room for fresh gossip.
    pub fn audit(&mut self) -> usize {
        if self.list.len() < self.cfg.max_size {
            return 0;
        }
        let doomed: Vec<String> = self
            .list
            .iter()
            .filter(|(_, nd)| {
                nd.status == Status::Ng && !nd.crawl_active && nd.connect_fails >= EVICT_FAILS
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            self.list.remove(key);
            debug!("{}: evicted {}", self.cfg.name, key);
        }
        doomed.len()
    }

    /// Node counts per status class.
    pub fn status_counts(&self) -> [u32; Status::COUNT] {
        let mut counts = [0u32; Status::COUNT];
        for nd in self.list.values() {
            counts[nd.status.index()] += 1;
        }
        counts
    }

    /// Crawl dispatches per status class since startup.
    pub fn start_counts(&self) -> [u32; Status::COUNT] {
        self.starts
    }
}

/// Seed the directory from the configured initial IPs and fallback DNS
/// seeder hostnames. Resolution happens outside any lock.
pub async fn bootstrap(seeder: &SharedSeeder) {
    let (name, port, initial_ips, fallbacks) = {
        let s = seeder.read().await;
        (
            s.cfg.name.clone(),
            s.cfg.port,
            s.cfg.initial_ips.clone(),
            s.cfg.seeders.clone(),
        )
    };

    let mut found: Vec<NetAddress> = Vec::new();
    for ip_str in &initial_ips {
        match ip_str.parse::<IpAddr>() {
            Ok(ip) => found.push(NetAddress::new(ip, port, 0)),
            Err(e) => warn!("{name}: bad initial IP {ip_str}: {e}"),
        }
    }

    for host in &fallbacks {
        match tokio::net::lookup_host((host.as_str(), port)).await {
            Ok(addrs) => {
                for sa in addrs {
                    found.push(NetAddress::new(sa.ip(), sa.port(), 0));
                }
            }
            Err(e) => warn!("{name}: fallback seeder {host} failed: {e}"),
        }
    }

    let mut s = seeder.write().await;
    let mut added = 0;
    for na in &found {
        if s.add_na(na) {
            added += 1;
        }
    }
    info!(
        "{name}: bootstrap added {added} peers ({} known)",
        s.len()
    );
}
