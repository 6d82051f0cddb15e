//! Peer-protocol message codec.
//!
//! Implements the Litecoin-family p2p framing: a 24-byte header carrying the
//! network magic, a zero-padded command, the payload length and a double-SHA256
//! checksum, followed by the payload. Only the handshake subset is decoded
//! (`version`, `verack`, `getaddr`, `addr`, `reject`); everything else is
//! surfaced as [`Message::Unknown`] with its payload consumed.
//!
//! Reads and writes are generic over any async byte stream so tests can run
//! against in-memory duplex pipes.

use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length of the command field in a message header.
pub const COMMAND_SIZE: usize = 12;

/// Total header length: magic + command + length + checksum.
pub const HEADER_SIZE: usize = 24;

/// Largest payload we are willing to read.
pub const MAX_PAYLOAD_SIZE: u32 = 2 * 1024 * 1024;

/// Protocol cap on addresses per `addr` message.
pub const MAX_ADDR_PER_MSG: u64 = 1000;

const MAX_USER_AGENT_LEN: u64 = 256;
const MAX_REJECT_STR_LEN: u64 = 256;

/// A network endpoint as carried in `addr` messages and version handshakes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetAddress {
    /// Last-seen time, unix seconds. Zero inside version messages.
    pub timestamp: u32,
    /// Advertised service bits.
    pub services: u64,
    pub ip: IpAddr,
    pub port: u16,
}

impl NetAddress {
    pub fn new(ip: IpAddr, port: u16, services: u64) -> Self {
        Self {
            timestamp: 0,
            services,
            ip,
            port,
        }
    }

    /// Canonical `host:port` form; IPv6 hosts are bracketed.
    pub fn key(&self) -> String {
        SocketAddr::new(self.ip, self.port).to_string()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Fields of a `version` message.
#[derive(Debug, Clone)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetAddress,
    pub addr_from: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

/// Decoded handshake message.
#[derive(Debug, Clone)]
pub enum Message {
    Version(Box<VersionMessage>),
    Verack,
    GetAddr,
    Addr(Vec<NetAddress>),
    Reject {
        message: String,
        code: u8,
        reason: String,
    },
    Unknown {
        command: String,
    },
}

impl Message {
    fn command(&self) -> &str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::GetAddr => "getaddr",
            Message::Addr(_) => "addr",
            Message::Reject { .. } => "reject",
            Message::Unknown { command } => command,
        }
    }
}

/// First four bytes of SHA256(SHA256(payload)).
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let first = Sha256::digest(payload);
    let second = Sha256::digest(first);
    [second[0], second[1], second[2], second[3]]
}

/// Frame and write one message.
pub async fn write_message<W: AsyncWrite + Unpin>(
    w: &mut W,
    magic: u32,
    msg: &Message,
) -> io::Result<()> {
    let payload = encode_payload(msg);
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&magic.to_le_bytes());

    let mut command = [0u8; COMMAND_SIZE];
    let name = msg.command().as_bytes();
    command[..name.len()].copy_from_slice(name);
    frame.extend_from_slice(&command);

    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum(&payload));
    frame.extend_from_slice(&payload);

    w.write_all(&frame).await?;
    w.flush().await
}

/// Read and decode one message, validating magic and checksum.
pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R, magic: u32) -> io::Result<Message> {
    let mut header = [0u8; HEADER_SIZE];
    r.read_exact(&mut header).await?;

    let got_magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if got_magic != magic {
        return Err(invalid(format!(
            "bad magic: expected {magic:#010x}, got {got_magic:#010x}"
        )));
    }

    let command = parse_command(&header[4..16])?;
    let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
    if length > MAX_PAYLOAD_SIZE {
        return Err(invalid(format!("payload too large: {length} bytes")));
    }
    let want_sum = [header[20], header[21], header[22], header[23]];

    let mut payload = vec![0u8; length as usize];
    r.read_exact(&mut payload).await?;
    if checksum(&payload) != want_sum {
        return Err(invalid(format!("checksum mismatch on {command}")));
    }

    decode_payload(&command, &payload)
}

fn parse_command(raw: &[u8]) -> io::Result<String> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    if raw[end..].iter().any(|&b| b != 0) {
        return Err(invalid("non-zero padding in command"));
    }
    std::str::from_utf8(&raw[..end])
        .map(|s| s.to_string())
        .map_err(|_| invalid("non-ascii command"))
}

fn encode_payload(msg: &Message) -> Vec<u8> {
    let mut buf = Vec::new();
    match msg {
        Message::Version(v) => {
            buf.extend_from_slice(&v.version.to_le_bytes());
            buf.extend_from_slice(&v.services.to_le_bytes());
            buf.extend_from_slice(&v.timestamp.to_le_bytes());
            put_netaddress(&mut buf, &v.addr_recv, false);
            put_netaddress(&mut buf, &v.addr_from, false);
            buf.extend_from_slice(&v.nonce.to_le_bytes());
            put_varstr(&mut buf, &v.user_agent);
            buf.extend_from_slice(&v.start_height.to_le_bytes());
            buf.push(v.relay as u8);
        }
        Message::Verack | Message::GetAddr | Message::Unknown { .. } => {}
        Message::Addr(list) => {
            put_varint(&mut buf, list.len() as u64);
            for na in list {
                put_netaddress(&mut buf, na, true);
            }
        }
        Message::Reject {
            message,
            code,
            reason,
        } => {
            put_varstr(&mut buf, message);
            buf.push(*code);
            put_varstr(&mut buf, reason);
        }
    }
    buf
}

fn decode_payload(command: &str, payload: &[u8]) -> io::Result<Message> {
    let mut cur = Cursor::new(payload);
    match command {
        "version" => {
            let version = cur.i32_le()?;
            let services = cur.u64_le()?;
            let timestamp = cur.i64_le()?;
            let addr_recv = cur.netaddress(false)?;
            let addr_from = cur.netaddress(false)?;
            let nonce = cur.u64_le()?;
            let user_agent = cur.varstr(MAX_USER_AGENT_LEN)?;
            let start_height = cur.i32_le()?;
            // Older peers omit the relay flag.
            let relay = cur.remaining() > 0 && cur.u8()? != 0;
            Ok(Message::Version(Box::new(VersionMessage {
                version,
                services,
                timestamp,
                addr_recv,
                addr_from,
                nonce,
                user_agent,
                start_height,
                relay,
            })))
        }
        "verack" => Ok(Message::Verack),
        "getaddr" => Ok(Message::GetAddr),
        "addr" => {
            let count = cur.varint()?;
            if count > MAX_ADDR_PER_MSG {
                return Err(invalid(format!("addr count {count} exceeds protocol cap")));
            }
            let mut list = Vec::with_capacity(count as usize);
            for _ in 0..count {
                list.push(cur.netaddress(true)?);
            }
            Ok(Message::Addr(list))
        }
        "reject" => {
            let message = cur.varstr(MAX_REJECT_STR_LEN)?;
            let code = cur.u8()?;
            let reason = cur.varstr(MAX_REJECT_STR_LEN)?;
            Ok(Message::Reject {
                message,
                code,
                reason,
            })
        }
        other => Ok(Message::Unknown {
            command: other.to_string(),
        }),
    }
}

fn put_netaddress(buf: &mut Vec<u8>, na: &NetAddress, with_time: bool) {
    if with_time {
        buf.extend_from_slice(&na.timestamp.to_le_bytes());
    }
    buf.extend_from_slice(&na.services.to_le_bytes());
    let v6 = match na.ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    };
    buf.extend_from_slice(&v6.octets());
    buf.extend_from_slice(&na.port.to_be_bytes());
}

fn put_varint(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x10000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

fn put_varstr(buf: &mut Vec<u8>, s: &str) {
    put_varint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Bounds-checked reader over a payload slice.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(invalid("truncated payload"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16_be(&mut self) -> io::Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u16_le(&mut self) -> io::Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32_le(&mut self) -> io::Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32_le(&mut self) -> io::Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64_le(&mut self) -> io::Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn i64_le(&mut self) -> io::Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn varint(&mut self) -> io::Result<u64> {
        match self.u8()? {
            0xfd => Ok(self.u16_le()? as u64),
            0xfe => Ok(self.u32_le()? as u64),
            0xff => self.u64_le(),
            n => Ok(n as u64),
        }
    }

    fn varstr(&mut self, max_len: u64) -> io::Result<String> {
        let len = self.varint()?;
        if len > max_len {
            return Err(invalid(format!("string length {len} exceeds cap")));
        }
        let raw = self.take(len as usize)?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    fn netaddress(&mut self, with_time: bool) -> io::Result<NetAddress> {
        let timestamp = if with_time { self.u32_le()? } else { 0 };
        let services = self.u64_le()?;
        let mut octets = [0u8; 16];
        octets.copy_from_slice(self.take(16)?);
        let v6 = Ipv6Addr::from(octets);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        let port = self.u16_be()?;
        Ok(NetAddress {
            timestamp,
            services,
            ip,
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const MAGIC: u32 = 0xfbc0_b6db;

    fn sample_version() -> VersionMessage {
        VersionMessage {
            version: 70016,
            services: 0x409,
            timestamp: 1_700_000_000,
            addr_recv: NetAddress::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 9333, 1),
            addr_from: NetAddress::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, 1),
            nonce: 0x0539_a019_ca55_0825,
            user_agent: "/test:0.1.0/".to_string(),
            start_height: 250_000,
            relay: true,
        }
    }

    #[test]
    fn test_varint_boundaries() {
        for n in [0u64, 1, 0xfc, 0xfd, 0xffff, 0x10000, 0xffff_ffff, u64::MAX] {
            let mut buf = Vec::new();
            put_varint(&mut buf, n);
            let mut cur = Cursor::new(&buf);
            assert_eq!(cur.varint().unwrap(), n);
            assert_eq!(cur.remaining(), 0);
        }
    }

    #[test]
    fn test_checksum_of_empty_payload() {
        // Well-known double-SHA256 of the empty string.
        assert_eq!(checksum(&[]), [0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[tokio::test]
    async fn test_version_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let msg = Message::Version(Box::new(sample_version()));
        write_message(&mut a, MAGIC, &msg).await.unwrap();

        match read_message(&mut b, MAGIC).await.unwrap() {
            Message::Version(v) => {
                assert_eq!(v.version, 70016);
                assert_eq!(v.services, 0x409);
                assert_eq!(v.user_agent, "/test:0.1.0/");
                assert_eq!(v.start_height, 250_000);
                assert!(v.relay);
                assert_eq!(v.addr_recv.ip, IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)));
                assert_eq!(v.addr_recv.port, 9333);
            }
            other => panic!("expected version, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_addr_round_trip() {
        let list = vec![
            NetAddress {
                timestamp: 1_700_000_000,
                services: 1,
                ip: IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8)),
                port: 9333,
            },
            NetAddress {
                timestamp: 1_700_000_001,
                services: 9,
                ip: "2001:db8::1".parse().unwrap(),
                port: 19335,
            },
        ];

        let (mut a, mut b) = tokio::io::duplex(4096);
        write_message(&mut a, MAGIC, &Message::Addr(list.clone()))
            .await
            .unwrap();

        match read_message(&mut b, MAGIC).await.unwrap() {
            Message::Addr(got) => assert_eq!(got, list),
            other => panic!("expected addr, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_payload_messages() {
        let (mut a, mut b) = tokio::io::duplex(256);
        write_message(&mut a, MAGIC, &Message::Verack).await.unwrap();
        write_message(&mut a, MAGIC, &Message::GetAddr).await.unwrap();

        assert!(matches!(
            read_message(&mut b, MAGIC).await.unwrap(),
            Message::Verack
        ));
        assert!(matches!(
            read_message(&mut b, MAGIC).await.unwrap(),
            Message::GetAddr
        ));
    }

    #[tokio::test]
    async fn test_wrong_magic_rejected() {
        let (mut a, mut b) = tokio::io::duplex(256);
        write_message(&mut a, MAGIC, &Message::Verack).await.unwrap();
        let err = read_message(&mut b, 0xdead_beef).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_corrupt_checksum_rejected() {
        let payload = encode_payload(&Message::Version(Box::new(sample_version())));
        let mut frame = Vec::new();
        frame.extend_from_slice(&MAGIC.to_le_bytes());
        let mut command = [0u8; COMMAND_SIZE];
        command[..7].copy_from_slice(b"version");
        frame.extend_from_slice(&command);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&[0, 0, 0, 0]); // bogus checksum
        frame.extend_from_slice(&payload);

        let (mut a, mut b) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut a, &frame)
            .await
            .unwrap();
        let err = read_message(&mut b, MAGIC).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_unknown_command_consumes_payload() {
        // A ping and then a verack; the ping must not poison the stream.
        let nonce = 42u64.to_le_bytes().to_vec();
        let mut frame = Vec::new();
        frame.extend_from_slice(&MAGIC.to_le_bytes());
        let mut command = [0u8; COMMAND_SIZE];
        command[..4].copy_from_slice(b"ping");
        frame.extend_from_slice(&command);
        frame.extend_from_slice(&(nonce.len() as u32).to_le_bytes());
        frame.extend_from_slice(&checksum(&nonce));
        frame.extend_from_slice(&nonce);

        let (mut a, mut b) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut a, &frame)
            .await
            .unwrap();
        write_message(&mut a, MAGIC, &Message::Verack).await.unwrap();

        match read_message(&mut b, MAGIC).await.unwrap() {
            Message::Unknown { command } => assert_eq!(command, "ping"),
            other => panic!("expected unknown, got {other:?}"),
        }
        assert!(matches!(
            read_message(&mut b, MAGIC).await.unwrap(),
            Message::Verack
        ));
    }

    #[test]
    fn test_netaddress_key_brackets_ipv6() {
        let v4 = NetAddress::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 9333, 0);
        assert_eq!(v4.key(), "1.2.3.4:9333");

        let v6 = NetAddress::new("2001:db8::1".parse().unwrap(), 9333, 0);
        assert_eq!(v6.key(), "[2001:db8::1]:9333");
    }
}
