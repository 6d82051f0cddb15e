//! Event-driven outbound peer used by the primary crawl strategy.
//!
//! A reader task decodes incoming messages and surfaces handshake events
//! through single-slot channels: one verack signal and one addr delivery.
//! Surplus addr messages are dropped on the floor; the protocol sends many
//! and only the first non-empty batch matters. The remote version is acked
//! automatically and its fields stashed for the caller.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

use crate::wire::{self, Message, NetAddress};

use super::client::{build_version, CrawlContext, CrawlOutcome, PeerMeta};

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Try the driver strategy against a live TCP endpoint.
///
/// `None` means the strategy is abandoned and the caller should fall back to
/// the manual wire exchange; it is not a classified failure.
pub(crate) async fn fetch(
    ctx: &CrawlContext,
    remote: SocketAddr,
    skip_getaddr: bool,
) -> Option<CrawlOutcome> {
    let stream = timeout(ctx.dial_timeout, TcpStream::connect(remote))
        .await
        .ok()?
        .ok()?;
    drive(ctx, stream, remote, skip_getaddr).await
}

/// Run the handshake over any byte stream; split out for tests.
pub(crate) async fn drive<S>(
    ctx: &CrawlContext,
    stream: S,
    remote: SocketAddr,
    skip_getaddr: bool,
) -> Option<CrawlOutcome>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut peer = OutboundPeer::start(stream, ctx.magic);

    let ours = Message::Version(Box::new(build_version(ctx, remote)));
    if peer.send(&ours).await.is_err() {
        peer.disconnect();
        return None;
    }

    if !peer.wait_verack(ctx.verack_timeout).await {
        debug!(%remote, "driver: no verack");
        peer.disconnect();
        return None;
    }
    let meta = peer.meta();

    if skip_getaddr {
        peer.disconnect();
        return Some(CrawlOutcome {
            meta,
            verack: true,
            addrs: Vec::new(),
            error: None,
        });
    }

    if peer.send(&Message::GetAddr).await.is_err() {
        peer.disconnect();
        return None;
    }

    match peer.next_addrs(ctx.addr_timeout).await {
        Some(addrs) if !addrs.is_empty() => {
            debug!(%remote, count = addrs.len(), "driver: addr");
            peer.disconnect();
            Some(CrawlOutcome {
                meta,
                verack: true,
                addrs,
                error: None,
            })
        }
        _ => {
            debug!(%remote, "driver: addr timeout or empty");
            peer.disconnect();
            None
        }
    }
}

/// Outbound peer connection with a background reader.
struct OutboundPeer {
    magic: u32,
    writer: SharedWriter,
    verack_rx: mpsc::Receiver<()>,
    addr_rx: mpsc::Receiver<Vec<NetAddress>>,
    meta: Arc<StdMutex<PeerMeta>>,
    reader: JoinHandle<()>,
}

impl OutboundPeer {
    fn start<S>(stream: S, magic: u32) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (rd, wr) = tokio::io::split(stream);
        let writer: SharedWriter = Arc::new(Mutex::new(Box::new(wr)));
        let (verack_tx, verack_rx) = mpsc::channel(1);
        let (addr_tx, addr_rx) = mpsc::channel(1);
        let meta = Arc::new(StdMutex::new(PeerMeta::default()));

        let reader = tokio::spawn(run_reader(
            rd,
            magic,
            writer.clone(),
            verack_tx,
            addr_tx,
            meta.clone(),
        ));

        Self {
            magic,
            writer,
            verack_rx,
            addr_rx,
            meta,
            reader,
        }
    }

    async fn send(&self, msg: &Message) -> std::io::Result<()> {
        let mut w = self.writer.lock().await;
        wire::write_message(&mut *w, self.magic, msg).await
    }

    async fn wait_verack(&mut self, dur: Duration) -> bool {
        matches!(timeout(dur, self.verack_rx.recv()).await, Ok(Some(())))
    }

    async fn next_addrs(&mut self, dur: Duration) -> Option<Vec<NetAddress>> {
        timeout(dur, self.addr_rx.recv()).await.ok().flatten()
    }

    fn meta(&self) -> PeerMeta {
        self.meta.lock().expect("meta lock").clone()
    }

    fn disconnect(self) {
        self.reader.abort();
    }
}

async fn run_reader<R: AsyncRead + Send + Unpin>(
    mut rd: R,
    magic: u32,
    writer: SharedWriter,
    verack_tx: mpsc::Sender<()>,
    addr_tx: mpsc::Sender<Vec<NetAddress>>,
    meta: Arc<StdMutex<PeerMeta>>,
) {
    loop {
        match wire::read_message(&mut rd, magic).await {
            Ok(Message::Version(v)) => {
                meta.lock().expect("meta lock").record(&v);
                let mut w = writer.lock().await;
                if wire::write_message(&mut *w, magic, &Message::Verack)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(Message::Verack) => {
                let _ = verack_tx.try_send(());
            }
            Ok(Message::Addr(list)) => {
                // Single slot: surplus deliveries are dropped.
                let _ = addr_tx.try_send(list);
            }
            Ok(Message::Reject {
                message,
                code,
                reason,
            }) => {
                debug!(message, code, reason, "driver: reject");
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => continue,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::VersionMessage;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::DuplexStream;

    const MAGIC: u32 = 0xfbc0_b6db;

    fn test_ctx() -> CrawlContext {
        CrawlContext {
            magic: MAGIC,
            pver: 70016,
            dial_timeout: Duration::from_millis(200),
            verack_timeout: Duration::from_millis(200),
            addr_timeout: Duration::from_millis(200),
            io_timeout: Duration::from_millis(200),
        }
    }

    fn remote() -> SocketAddr {
        "1.2.3.4:9333".parse().unwrap()
    }

    fn peer_version() -> Message {
        Message::Version(Box::new(VersionMessage {
            version: 70015,
            services: 9,
            timestamp: 1_700_000_000,
            addr_recv: NetAddress::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, 0),
            addr_from: NetAddress::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, 0),
            nonce: 1,
            user_agent: "/peer:1.0/".to_string(),
            start_height: 500,
            relay: false,
        }))
    }

    fn gossip(n: u8) -> Vec<NetAddress> {
        (0..n)
            .map(|i| NetAddress {
                timestamp: 0,
                services: 1,
                ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, i + 1)),
                port: 9333,
            })
            .collect()
    }

    async fn well_behaved_peer(mut side: DuplexStream, addrs: Vec<NetAddress>) {
        let _ = wire::read_message(&mut side, MAGIC).await.unwrap();
        wire::write_message(&mut side, MAGIC, &peer_version())
            .await
            .unwrap();
        wire::write_message(&mut side, MAGIC, &Message::Verack)
            .await
            .unwrap();
        loop {
            match wire::read_message(&mut side, MAGIC).await {
                Ok(Message::GetAddr) => break,
                Ok(_) => continue,
                Err(_) => return,
            }
        }
        wire::write_message(&mut side, MAGIC, &Message::Addr(addrs))
            .await
            .unwrap();
        // Stay open until the driver disconnects.
        let _ = wire::read_message(&mut side, MAGIC).await;
    }

    #[tokio::test]
    async fn test_drive_happy_path() {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        tokio::spawn(well_behaved_peer(theirs, gossip(2)));

        let ctx = test_ctx();
        let outcome = drive(&ctx, ours, remote(), false).await.expect("outcome");
        assert!(outcome.verack);
        assert_eq!(outcome.addrs.len(), 2);
        assert_eq!(outcome.meta.version, 70015);
        assert_eq!(outcome.meta.services.0, 9);
        assert_eq!(outcome.meta.user_agent, "/peer:1.0/");
    }

    #[tokio::test]
    async fn test_drive_abandons_without_verack() {
        let (ours, mut theirs) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let _ = wire::read_message(&mut theirs, MAGIC).await;
            wire::write_message(&mut theirs, MAGIC, &peer_version())
                .await
                .unwrap();
            // No verack; hold the pipe open.
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let ctx = test_ctx();
        assert!(drive(&ctx, ours, remote(), false).await.is_none());
    }

    #[tokio::test]
    async fn test_drive_abandons_on_empty_gossip() {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        tokio::spawn(well_behaved_peer(theirs, Vec::new()));

        let ctx = test_ctx();
        assert!(drive(&ctx, ours, remote(), false).await.is_none());
    }

    #[tokio::test]
    async fn test_drive_capacity_shortcut() {
        let (ours, mut theirs) = tokio::io::duplex(64 * 1024);
        let peer = tokio::spawn(async move {
            let _ = wire::read_message(&mut theirs, MAGIC).await.unwrap();
            wire::write_message(&mut theirs, MAGIC, &peer_version())
                .await
                .unwrap();
            wire::write_message(&mut theirs, MAGIC, &Message::Verack)
                .await
                .unwrap();
            let mut saw_getaddr = false;
            loop {
                match wire::read_message(&mut theirs, MAGIC).await {
                    Ok(Message::GetAddr) => saw_getaddr = true,
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
            saw_getaddr
        });

        let ctx = test_ctx();
        let outcome = drive(&ctx, ours, remote(), true).await.expect("outcome");
        assert!(outcome.verack);
        assert!(outcome.addrs.is_empty());
        assert_eq!(outcome.meta.version, 70015);

        // The drive() call aborted its reader and dropped the write half.
        assert!(!peer.await.unwrap(), "getaddr must not be sent when full");
    }
}
