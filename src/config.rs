//! Network definition loading.
//!
//! Each seeded network is described by a JSON file naming the chain magic,
//! canonical port, protocol version, the DNS hostname to answer under, and
//! the bootstrap sources (initial IPs plus fallback seeder hostnames).
//! A file that fails validation aborts only that network, not the process.

use std::path::Path;

use serde::Deserialize;
use tracing::{error, warn};

/// Directory capacity per network.
pub const DEFAULT_MAX_SIZE: usize = 1250;

/// Per-status-class parallelism caps for crawl dispatch.
pub const DEFAULT_MAX_START: [u32; 4] = [20, 20, 20, 30];

/// Per-status-class pacing floors, seconds between crawls of one node.
pub const DEFAULT_DELAY: [u64; 4] = [210, 789, 234, 1876];

/// Floor applied to configured record TTLs.
pub const MIN_TTL: u32 = 60;

/// On-disk JSON shape of a network definition file.
#[derive(Debug, Deserialize)]
pub struct NetworkFile {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Desc", default)]
    pub desc: String,
    /// Chain magic, decimal or `0x`-prefixed hex.
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Pver")]
    pub pver: u32,
    #[serde(rename = "DNSName")]
    pub dns_name: String,
    #[serde(rename = "TTL", default)]
    pub ttl: u32,
    #[serde(rename = "InitialIPs", default)]
    pub initial_ips: Vec<String>,
    #[serde(rename = "Seeders", default)]
    pub seeders: Vec<String>,
}

/// Validated parameters for one seeded network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub name: String,
    pub desc: String,
    /// Wire magic identifying the network.
    pub magic: u32,
    /// Canonical p2p port; defines the standard-port DNS classes.
    pub port: u16,
    /// Protocol version we speak in our version message.
    pub pver: u32,
    /// Hostname whose A/AAAA queries we answer, lowercased.
    pub dns_host: String,
    /// Record TTL, clamped to at least [`MIN_TTL`].
    pub ttl: u32,
    pub initial_ips: Vec<String>,
    /// Fallback DNS seeder hostnames used for bootstrap.
    pub seeders: Vec<String>,
    pub max_size: usize,
    pub max_start: [u32; 4],
    pub delay: [u64; 4],
}

/// Load and validate one network definition file.
pub fn load_network(path: &Path) -> anyhow::Result<NetworkConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("error reading network file {}: {e}", path.display()))?;
    let jnw: NetworkFile = serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("error decoding network file {}: {e}", path.display()))?;
    init_network(jnw)
}

fn init_network(jnw: NetworkFile) -> anyhow::Result<NetworkConfig> {
    if jnw.port == 0 {
        anyhow::bail!("invalid port supplied: {}", jnw.port);
    }
    if jnw.dns_name.is_empty() {
        anyhow::bail!("no dns hostname supplied");
    }

    let magic = parse_magic(&jnw.id)
        .map_err(|e| anyhow::anyhow!("error converting network magic number: {e}"))?;

    let mut ttl = jnw.ttl;
    if ttl < MIN_TTL {
        if ttl != 0 {
            warn!(
                "TTL {} below minimum for {}, clamping to {}",
                ttl, jnw.name, MIN_TTL
            );
        }
        ttl = MIN_TTL;
    }

    Ok(NetworkConfig {
        name: jnw.name,
        desc: jnw.desc,
        magic,
        port: jnw.port,
        pver: jnw.pver,
        dns_host: jnw.dns_name.to_lowercase(),
        ttl,
        initial_ips: jnw.initial_ips,
        seeders: jnw.seeders,
        max_size: DEFAULT_MAX_SIZE,
        max_start: DEFAULT_MAX_START,
        delay: DEFAULT_DELAY,
    })
}

/// Parse a chain magic given as decimal or `0x`-prefixed hex.
fn parse_magic(id: &str) -> Result<u32, std::num::ParseIntError> {
    if let Some(hex) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        id.parse::<u32>()
    }
}

/// Load every network file, skipping ones that fail validation and rejecting
/// duplicates (same name or DNS host) across files.
pub fn load_networks(paths: &[std::path::PathBuf]) -> Vec<NetworkConfig> {
    let mut configs: Vec<NetworkConfig> = Vec::new();
    for path in paths {
        match load_network(path) {
            Ok(cfg) => {
                if let Some(prev) = configs
                    .iter()
                    .find(|c| c.name == cfg.name || c.dns_host == cfg.dns_host)
                {
                    error!(
                        "skipping {}: duplicate seeder (clashes with {})",
                        path.display(),
                        prev.name
                    );
                    continue;
                }
                configs.push(cfg);
            }
            Err(e) => {
                error!("skipping {}: {e}", path.display());
            }
        }
    }
    configs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn file_with(json: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(json.as_bytes()).unwrap();
        f
    }

    const GOOD: &str = r#"{
        "Name": "litecoin-main",
        "Desc": "Litecoin mainnet",
        "ID": "0xfbc0b6db",
        "Port": 9333,
        "Pver": 70016,
        "DNSName": "Seed.Example.COM",
        "TTL": 600,
        "InitialIPs": ["203.0.113.5"],
        "Seeders": ["dnsseed.other.example.org"]
    }"#;

    #[test]
    fn test_load_valid_network() {
        let f = file_with(GOOD);
        let cfg = load_network(f.path()).unwrap();
        assert_eq!(cfg.name, "litecoin-main");
        assert_eq!(cfg.magic, 0xfbc0_b6db);
        assert_eq!(cfg.port, 9333);
        assert_eq!(cfg.pver, 70016);
        assert_eq!(cfg.dns_host, "seed.example.com");
        assert_eq!(cfg.ttl, 600);
        assert_eq!(cfg.max_size, DEFAULT_MAX_SIZE);
        assert_eq!(cfg.max_start, DEFAULT_MAX_START);
        assert_eq!(cfg.delay, DEFAULT_DELAY);
    }

    #[test]
    fn test_decimal_magic_accepted() {
        let f = file_with(
            r#"{"Name":"t","ID":"4223710939","Port":9333,"Pver":70016,"DNSName":"seed.example.com"}"#,
        );
        let cfg = load_network(f.path()).unwrap();
        assert_eq!(cfg.magic, 4_223_710_939);
    }

    #[test]
    fn test_zero_port_rejected() {
        let f = file_with(
            r#"{"Name":"t","ID":"0x01","Port":0,"Pver":1,"DNSName":"seed.example.com"}"#,
        );
        let err = load_network(f.path()).unwrap_err().to_string();
        assert!(err.contains("invalid port"), "{err}");
    }

    #[test]
    fn test_missing_dns_name_rejected() {
        let f = file_with(r#"{"Name":"t","ID":"0x01","Port":9333,"Pver":1,"DNSName":""}"#);
        let err = load_network(f.path()).unwrap_err().to_string();
        assert!(err.contains("dns hostname"), "{err}");
    }

    #[test]
    fn test_bad_magic_rejected() {
        let f = file_with(
            r#"{"Name":"t","ID":"not-a-number","Port":9333,"Pver":1,"DNSName":"seed.example.com"}"#,
        );
        assert!(load_network(f.path()).is_err());
    }

    #[test]
    fn test_ttl_clamped_to_minimum() {
        let f = file_with(
            r#"{"Name":"t","ID":"0x01","Port":9333,"Pver":1,"DNSName":"seed.example.com","TTL":5}"#,
        );
        let cfg = load_network(f.path()).unwrap();
        assert_eq!(cfg.ttl, MIN_TTL);
    }

    #[test]
    fn test_duplicate_seeder_skipped() {
        let a = file_with(GOOD);
        let b = file_with(GOOD);
        let configs = load_networks(&[a.path().to_path_buf(), b.path().to_path_buf()]);
        assert_eq!(configs.len(), 1);
    }

    #[test]
    fn test_unreadable_file_skipped() {
        let configs = load_networks(&[std::path::PathBuf::from("/no/such/file.json")]);
        assert!(configs.is_empty());
    }
}
