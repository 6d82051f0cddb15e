//! DNS server loop.
//!
//! Answers A and AAAA queries for every seeded hostname from the published
//! record store. Replies are always authoritative and non-recursive; an
//! unknown name or unsupported query type gets an authoritative empty
//! answer rather than an error.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::net::UdpSocket;
use tracing::{debug, error, info};

use super::{lookup, qtype_string, DnsRecord, RecordType};

/// DNS packet constants
const DNS_HEADER_SIZE: usize = 12;
const DNS_MAX_PACKET_SIZE: usize = 512;

/// DNS flags
const FLAG_QR: u16 = 0x8000; // Query/Response
const FLAG_AA: u16 = 0x0400; // Authoritative Answer
const FLAG_RD: u16 = 0x0100; // Recursion Desired

/// Run the DNS server on the given UDP port.
pub async fn run(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = Arc::new(UdpSocket::bind(addr).await?);

    info!("DNS server listening on {addr}");

    loop {
        let mut buf = [0u8; DNS_MAX_PACKET_SIZE];
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => {
                let request = buf[..len].to_vec();
                let socket = socket.clone();

                tokio::spawn(async move {
                    if let Err(e) = handle_query(socket.as_ref(), src, &request).await {
                        debug!("DNS query error from {src}: {e}");
                    }
                });
            }
            Err(e) => {
                error!("DNS socket error: {e}");
            }
        }
    }
}

/// Handle a single DNS query datagram.
async fn handle_query(socket: &UdpSocket, src: SocketAddr, request: &[u8]) -> anyhow::Result<()> {
    if request.len() < DNS_HEADER_SIZE {
        return Ok(()); // Ignore malformed packets
    }

    let id = u16::from_be_bytes([request[0], request[1]]);
    let flags = u16::from_be_bytes([request[2], request[3]]);
    let qdcount = u16::from_be_bytes([request[4], request[5]]);

    if qdcount == 0 {
        return Ok(()); // No questions
    }

    // Only the first question is answered.
    let (qname, qtype, _offset) = parse_question(&request[DNS_HEADER_SIZE..])?;

    debug!("DNS query: {qname} type {qtype} from {src}");

    let qtype_str = qtype_string(qtype);
    let mut answers = lookup(&format!("{qname}{qtype_str}"));

    // Rotate so successive clients see different samples.
    answers.shuffle(&mut rand::thread_rng());

    let response = build_response(id, flags, &qname, qtype, &answers);
    socket.send_to(&response, src).await?;

    tokio::spawn(async move {
        crate::stats::record_query(&qname, qtype_str);
    });

    Ok(())
}

/// Parse the question section: labels into a lowercased, dot-terminated
/// name plus the query type.
fn parse_question(data: &[u8]) -> anyhow::Result<(String, u16, usize)> {
    let mut name = String::new();
    let mut offset = 0;

    loop {
        if offset >= data.len() {
            anyhow::bail!("truncated question");
        }

        let len = data[offset] as usize;
        if len == 0 {
            offset += 1;
            break;
        }

        if len > 63 {
            anyhow::bail!("invalid label length");
        }

        offset += 1;
        if offset + len > data.len() {
            anyhow::bail!("truncated label");
        }

        let label = std::str::from_utf8(&data[offset..offset + len])?;
        name.push_str(&label.to_lowercase());
        name.push('.');
        offset += len;
    }

    if offset + 4 > data.len() {
        anyhow::bail!("truncated question");
    }

    let qtype = u16::from_be_bytes([data[offset], data[offset + 1]]);
    let _qclass = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
    offset += 4;

    Ok((name, qtype, offset))
}

/// Build an authoritative response packet. Answers that would overflow the
/// packet are dropped; the answer count always matches what was written.
fn build_response(
    id: u16,
    request_flags: u16,
    qname: &str,
    qtype: u16,
    answers: &[DnsRecord],
) -> Vec<u8> {
    let mut response = Vec::with_capacity(DNS_MAX_PACKET_SIZE);

    // Header; recursion is never available, only echoed as desired.
    let flags = FLAG_QR | FLAG_AA | (request_flags & FLAG_RD);
    response.extend_from_slice(&id.to_be_bytes());
    response.extend_from_slice(&flags.to_be_bytes());
    response.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    let ancount_at = response.len();
    response.extend_from_slice(&0u16.to_be_bytes()); // ancount, patched below
    response.extend_from_slice(&0u16.to_be_bytes()); // nscount
    response.extend_from_slice(&0u16.to_be_bytes()); // arcount

    // Question section (echo back)
    let qname_offset = response.len();
    for part in qname.trim_end_matches('.').split('.') {
        if part.is_empty() {
            continue;
        }
        response.push(part.len() as u8);
        response.extend_from_slice(part.as_bytes());
    }
    response.push(0);
    response.extend_from_slice(&qtype.to_be_bytes());
    response.extend_from_slice(&1u16.to_be_bytes()); // IN class

    // Answer section, names compressed to a pointer at the question.
    let name_ptr = 0xC000 | (qname_offset as u16);
    let mut ancount = 0u16;
    for rec in answers {
        let rdata: Vec<u8> = match (rec.rtype, rec.ip) {
            (RecordType::A, IpAddr::V4(v4)) => v4.octets().to_vec(),
            (RecordType::Aaaa, IpAddr::V6(v6)) => v6.octets().to_vec(),
            _ => continue,
        };

        let rr_len = 2 + 2 + 2 + 4 + 2 + rdata.len();
        if response.len() + rr_len > DNS_MAX_PACKET_SIZE {
            break;
        }

        response.extend_from_slice(&name_ptr.to_be_bytes());
        response.extend_from_slice(&rec.rtype.qtype().to_be_bytes());
        response.extend_from_slice(&1u16.to_be_bytes()); // IN class
        response.extend_from_slice(&rec.ttl.to_be_bytes());
        response.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        response.extend_from_slice(&rdata);
        ancount += 1;
    }

    response[ancount_at..ancount_at + 2].copy_from_slice(&ancount.to_be_bytes());
    response
}
