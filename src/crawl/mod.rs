//! Crawl scheduling for one seeded network.
//!
//! The scheduler keeps a steady stream of crawl tasks flowing without
//! exceeding the per-class parallelism caps or per-node pacing floors.
//! Results come back over a completions channel and are merged into the
//! directory; the DNS view is rebuilt on a slower cadence from the same
//! loop.

pub mod client;
mod driver;

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info};

use crate::node::{unix_now, Status};
use crate::seeder::{self, SharedSeeder};

use client::{crawl_address, CrawlContext, CrawlOutcome};

/// Seconds between dispatch passes.
const CRAWL_TICK_SECS: u64 = 10;

/// Seconds between DNS view rebuilds.
const DNS_REBUILD_SECS: u64 = 120;

/// Re-run bootstrap when the directory shrinks below this many nodes.
const RESEED_FLOOR: usize = 10;

/// Status classes considered for dispatch, probed in this order.
const DISPATCH_CLASSES: [Status; 3] = [Status::Cg, Status::Rg, Status::Ng];

/// What a finished crawl task delivers back to the scheduler.
struct Completion {
    key: String,
    prev_status: Status,
    outcome: CrawlOutcome,
}

/// Drive one network's crawl loop forever.
pub async fn run(seeder: SharedSeeder, io_timeout_secs: u64) -> anyhow::Result<()> {
    let (name, ctx) = {
        let s = seeder.read().await;
        (
            s.cfg.name.clone(),
            CrawlContext::new(s.cfg.magic, s.cfg.pver, io_timeout_secs),
        )
    };
    info!("{name}: crawl scheduler starting");

    seeder::bootstrap(&seeder).await;

    let (tx, mut rx) = mpsc::channel::<Completion>(256);
    let mut in_flight = [0u32; Status::COUNT];
    let mut crawl_tick = interval(Duration::from_secs(CRAWL_TICK_SECS));
    let mut dns_tick = interval(Duration::from_secs(DNS_REBUILD_SECS));

    loop {
        tokio::select! {
            _ = crawl_tick.tick() => {
                let low = { seeder.read().await.len() < RESEED_FLOOR };
                if low {
                    seeder::bootstrap(&seeder).await;
                }
                dispatch(&seeder, &ctx, &tx, &mut in_flight).await;
            }
            Some(done) = rx.recv() => {
                in_flight[done.prev_status.index()] =
                    in_flight[done.prev_status.index()].saturating_sub(1);
                let mut s = seeder.write().await;
                let added = s.merge(&done.key, done.prev_status, &done.outcome);
                if added > 0 {
                    debug!("{name}: {} gossiped {added} new peers", done.key);
                }
            }
            _ = dns_tick.tick() => {
                crate::dns::update_records(&seeder).await;
            }
        }
    }
}

/// One dispatch pass: evict hopeless nodes if full, then start crawls up to
/// each class's cap. WG is set under the write lock before the task spawns.
async fn dispatch(
    seeder: &SharedSeeder,
    ctx: &CrawlContext,
    tx: &mpsc::Sender<Completion>,
    in_flight: &mut [u32; Status::COUNT],
) {
    let now = unix_now();
    let mut s = seeder.write().await;
    s.audit();

    let skip_getaddr = s.len() >= s.cfg.max_size;
    let classes = s.startable(now);

    for class in DISPATCH_CLASSES {
        let idx = class.index();
        let budget = s.cfg.max_start[idx].saturating_sub(in_flight[idx]) as usize;
        for key in classes[idx].iter().take(budget) {
            let Some(addr) = s.get(key).map(|nd| nd.na.socket_addr()) else {
                continue;
            };
            s.mark_dispatched(key, class, now);
            in_flight[idx] += 1;

            let ctx = ctx.clone();
            let tx = tx.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let outcome = crawl_address(&ctx, addr, skip_getaddr).await;
                let _ = tx
                    .send(Completion {
                        key,
                        prev_status: class,
                        outcome,
                    })
                    .await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::seeder::Seeder;
    use crate::wire::NetAddress;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use tokio::sync::RwLock;

    fn test_cfg(max_start_per_class: u32) -> NetworkConfig {
        NetworkConfig {
            name: "testnet".to_string(),
            desc: String::new(),
            magic: 0xfbc0_b6db,
            port: 29333,
            pver: 70016,
            dns_host: "crawl-test.example.com".to_string(),
            ttl: 60,
            initial_ips: Vec::new(),
            seeders: Vec::new(),
            max_size: 100,
            max_start: [max_start_per_class; 4],
            // Zero pacing so fresh nodes are immediately dispatchable.
            delay: [0, 0, 0, 0],
        }
    }

    fn fast_ctx() -> CrawlContext {
        CrawlContext {
            magic: 0xfbc0_b6db,
            pver: 70016,
            dial_timeout: Duration::from_millis(500),
            verack_timeout: Duration::from_millis(100),
            addr_timeout: Duration::from_millis(100),
            io_timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_dispatch_respects_class_caps() {
        let shared = Arc::new(RwLock::new(Seeder::new(test_cfg(2))));
        {
            let mut s = shared.write().await;
            // Loopback ports with nothing listening: dials fail fast.
            for i in 1..=5u16 {
                let na = NetAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), i, 0);
                assert!(s.add_na(&na));
            }
        }

        let (tx, mut rx) = mpsc::channel(16);
        let mut in_flight = [0u32; Status::COUNT];
        dispatch(&shared, &fast_ctx(), &tx, &mut in_flight).await;

        assert_eq!(in_flight[Status::Rg.index()], 2);
        {
            let s = shared.read().await;
            assert_eq!(s.status_counts()[Status::Wg.index()], 2);
            assert_eq!(s.start_counts()[Status::Rg.index()], 2);
        }

        // Both refused dials come back as classified failures and clear WG.
        for _ in 0..2 {
            let done = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("completion in time")
                .expect("completion");
            assert_eq!(done.prev_status, Status::Rg);
            assert!(done.outcome.error.is_some());
            in_flight[done.prev_status.index()] -= 1;
            let mut s = shared.write().await;
            s.merge(&done.key, done.prev_status, &done.outcome);
        }

        let s = shared.read().await;
        assert_eq!(s.status_counts()[Status::Wg.index()], 0);
        assert_eq!(in_flight[Status::Rg.index()], 0);
    }

    #[tokio::test]
    async fn test_dispatch_skips_in_flight_nodes() {
        let shared = Arc::new(RwLock::new(Seeder::new(test_cfg(10))));
        {
            let mut s = shared.write().await;
            let na = NetAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9, 0);
            assert!(s.add_na(&na));
            s.mark_dispatched(&na.key(), Status::Rg, unix_now());
        }

        let (tx, _rx) = mpsc::channel(16);
        let mut in_flight = [0u32; Status::COUNT];
        in_flight[Status::Rg.index()] = 1;
        dispatch(&shared, &fast_ctx(), &tx, &mut in_flight).await;

        // Nothing new dispatched: the only node is already owned by a task.
        assert_eq!(in_flight[Status::Rg.index()], 1);
    }
}
