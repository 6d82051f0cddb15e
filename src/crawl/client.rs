//! One crawl attempt against a single peer.
//!
//! Two strategies are tried in order: the event-driven outbound peer in
//! [`super::driver`], and a manual wire exchange kept for peers whose
//! handshake diverges from the driver's expectations. Both share the result
//! schema but not the connection lifecycle.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::node::{unix_now, ServiceFlags, NODE_NETWORK};
use crate::wire::{self, Message, NetAddress, VersionMessage};

use super::driver;

/// Wall-time bound on establishing a TCP connection.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the driver strategy waits for the remote verack.
pub const VERACK_TIMEOUT: Duration = Duration::from_secs(3);

/// How long the driver strategy waits for the first addr delivery.
pub const PEER_ADDR_TIMEOUT: Duration = Duration::from_secs(6);

/// Messages the manual strategy reads while hunting for a verack.
pub const MANUAL_MSG_LIMIT: usize = 20;

/// Messages the manual strategy reads while accumulating gossip.
pub const MAX_ADDR_MESSAGES: usize = 50;

/// Fixed nonce carried in our version message.
const HANDSHAKE_NONCE: u64 = 0x0539_a019_ca55_0825;

const USER_AGENT: &str = concat!("/dnsseedd:", env!("CARGO_PKG_VERSION"), "/");

/// Classified crawl failure causes, each with a rating penalty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Dial,
    Deadline,
    ProtocolWrite,
    ProtocolRead,
    UnexpectedMessage,
    VerackTimeout,
    AddrTimeout,
    EmptyGossip,
}

impl ErrorKind {
    /// Rating added to a node for a failure of this kind. Transient network
    /// faults cost less than protocol violations.
    pub fn penalty(self) -> u32 {
        match self {
            ErrorKind::Dial | ErrorKind::Deadline => 20,
            ErrorKind::ProtocolWrite | ErrorKind::ProtocolRead => 25,
            ErrorKind::UnexpectedMessage => 30,
            ErrorKind::VerackTimeout => 25,
            ErrorKind::AddrTimeout | ErrorKind::EmptyGossip => 15,
        }
    }
}

/// A crawl failure tagged with the handshake phase it occurred in.
#[derive(Debug, Clone, Error)]
#[error("crawl error at {loc}: {detail}")]
pub struct CrawlError {
    pub loc: &'static str,
    pub kind: ErrorKind,
    pub detail: String,
}

impl CrawlError {
    pub fn new(loc: &'static str, kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            loc,
            kind,
            detail: detail.into(),
        }
    }
}

/// Fields lifted from the remote version message.
#[derive(Debug, Clone, Default)]
pub struct PeerMeta {
    pub version: i32,
    pub services: ServiceFlags,
    pub last_block: i32,
    pub user_agent: String,
}

impl PeerMeta {
    pub fn record(&mut self, v: &VersionMessage) {
        self.version = v.version;
        self.services = ServiceFlags(v.services);
        self.last_block = v.start_height;
        self.user_agent = v.user_agent.clone();
    }
}

/// What a crawl task reports back to the scheduler.
#[derive(Debug, Default)]
pub struct CrawlOutcome {
    pub meta: PeerMeta,
    /// True when the handshake reached verack.
    pub verack: bool,
    /// Gossiped addresses; empty on failure or capacity shortcut.
    pub addrs: Vec<NetAddress>,
    pub error: Option<CrawlError>,
}

impl CrawlOutcome {
    fn failed(error: CrawlError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Per-network parameters a crawl task needs, with all timeouts explicit so
/// tests can shrink them.
#[derive(Debug, Clone)]
pub struct CrawlContext {
    pub magic: u32,
    pub pver: u32,
    pub dial_timeout: Duration,
    pub verack_timeout: Duration,
    pub addr_timeout: Duration,
    /// Per-I/O deadline for the manual strategy, from `--io-timeout`.
    pub io_timeout: Duration,
}

impl CrawlContext {
    pub fn new(magic: u32, pver: u32, io_timeout_secs: u64) -> Self {
        Self {
            magic,
            pver,
            dial_timeout: DIAL_TIMEOUT,
            verack_timeout: VERACK_TIMEOUT,
            addr_timeout: PEER_ADDR_TIMEOUT,
            io_timeout: Duration::from_secs(io_timeout_secs),
        }
    }
}

/// Crawl one endpoint: driver strategy first, manual wire fallback second.
///
/// With `skip_getaddr` set the gossip request is omitted after verack and an
/// empty, acknowledged outcome is returned.
pub async fn crawl_address(
    ctx: &CrawlContext,
    remote: SocketAddr,
    skip_getaddr: bool,
) -> CrawlOutcome {
    if let Some(outcome) = driver::fetch(ctx, remote, skip_getaddr).await {
        return outcome;
    }

    let mut stream = match timeout(ctx.dial_timeout, TcpStream::connect(remote)).await {
        Err(_) => {
            return CrawlOutcome::failed(CrawlError::new(
                "manual dial",
                ErrorKind::Dial,
                "connect timed out",
            ))
        }
        Ok(Err(e)) => {
            return CrawlOutcome::failed(CrawlError::new(
                "manual dial",
                ErrorKind::Dial,
                e.to_string(),
            ))
        }
        Ok(Ok(s)) => s,
    };

    match manual_handshake(ctx, &mut stream, remote, skip_getaddr).await {
        Ok(outcome) => outcome,
        Err(e) => CrawlOutcome::failed(e),
    }
}

/// Our version message for a given remote endpoint.
pub(crate) fn build_version(ctx: &CrawlContext, remote: SocketAddr) -> VersionMessage {
    VersionMessage {
        version: ctx.pver as i32,
        services: 0,
        timestamp: unix_now() as i64,
        addr_recv: NetAddress::new(remote.ip(), remote.port(), NODE_NETWORK),
        addr_from: NetAddress::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, NODE_NETWORK),
        nonce: HANDSHAKE_NONCE,
        user_agent: USER_AGENT.to_string(),
        start_height: 0,
        relay: true,
    }
}

/// Manual wire fallback: sequential reads for peers the driver cannot talk to.
pub(crate) async fn manual_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &CrawlContext,
    stream: &mut S,
    remote: SocketAddr,
    skip_getaddr: bool,
) -> Result<CrawlOutcome, CrawlError> {
    let mut meta = PeerMeta::default();

    let ours = Message::Version(Box::new(build_version(ctx, remote)));
    write_step(ctx, stream, &ours, "write version").await?;

    match read_step(ctx, stream, "read version").await? {
        Message::Version(v) => meta.record(&v),
        other => {
            return Err(CrawlError::new(
                "version type",
                ErrorKind::UnexpectedMessage,
                format!("got {other:?}"),
            ))
        }
    }

    write_step(ctx, stream, &Message::Verack, "write verack").await?;

    let mut acked = false;
    for _ in 0..MANUAL_MSG_LIMIT {
        match timeout(ctx.io_timeout, wire::read_message(stream, ctx.magic)).await {
            Err(_) => {
                return Err(CrawlError::new(
                    "verack wait",
                    ErrorKind::VerackTimeout,
                    "deadline expired",
                ))
            }
            Ok(Err(_)) => continue,
            Ok(Ok(Message::Verack)) => {
                acked = true;
                break;
            }
            Ok(Ok(Message::Reject {
                message,
                code,
                reason,
            })) => {
                debug!(%remote, message, code, reason, "reject during verack wait");
                continue;
            }
            Ok(Ok(_)) => continue,
        }
    }
    if !acked {
        return Err(CrawlError::new(
            "verack wait",
            ErrorKind::VerackTimeout,
            format!("verack not received in {MANUAL_MSG_LIMIT} msgs"),
        ));
    }

    if skip_getaddr {
        return Ok(CrawlOutcome {
            meta,
            verack: true,
            addrs: Vec::new(),
            error: None,
        });
    }

    write_step(ctx, stream, &Message::GetAddr, "write getaddr").await?;

    let mut peers: Vec<NetAddress> = Vec::new();
    let mut timed_out = false;
    for _ in 0..MAX_ADDR_MESSAGES {
        match timeout(ctx.io_timeout, wire::read_message(stream, ctx.magic)).await {
            Err(_) => {
                timed_out = true;
                break;
            }
            Ok(Err(_)) => continue,
            Ok(Ok(Message::Addr(list))) => {
                debug!(%remote, count = list.len(), "addr");
                peers.extend(list);
                if peers.len() > 1 {
                    break;
                }
            }
            Ok(Ok(_)) => continue,
        }
    }

    if peers.is_empty() {
        return Err(if timed_out {
            CrawlError::new("collect addrs", ErrorKind::AddrTimeout, "deadline expired")
        } else {
            CrawlError::new(
                "no addrs",
                ErrorKind::EmptyGossip,
                "no peers after manual fetch",
            )
        });
    }

    Ok(CrawlOutcome {
        meta,
        verack: true,
        addrs: peers,
        error: None,
    })
}

async fn write_step<S: AsyncWrite + Unpin>(
    ctx: &CrawlContext,
    stream: &mut S,
    msg: &Message,
    loc: &'static str,
) -> Result<(), CrawlError> {
    match timeout(ctx.io_timeout, wire::write_message(stream, ctx.magic, msg)).await {
        Err(_) => Err(CrawlError::new(loc, ErrorKind::Deadline, "deadline expired")),
        Ok(Err(e)) => Err(CrawlError::new(loc, ErrorKind::ProtocolWrite, e.to_string())),
        Ok(Ok(())) => Ok(()),
    }
}

async fn read_step<S: AsyncRead + Unpin>(
    ctx: &CrawlContext,
    stream: &mut S,
    loc: &'static str,
) -> Result<Message, CrawlError> {
    match timeout(ctx.io_timeout, wire::read_message(stream, ctx.magic)).await {
        Err(_) => Err(CrawlError::new(loc, ErrorKind::Deadline, "deadline expired")),
        Ok(Err(e)) => Err(CrawlError::new(loc, ErrorKind::ProtocolRead, e.to_string())),
        Ok(Ok(msg)) => Ok(msg),
    }
}
