// Bitcoin P2P version/verack handshake.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use chrono::Utc;
use tracing::debug;

use super::{AdapterInfo, Pattern, ProtocolAdapter};
use crate::probe::codec::{checksum4, put_compact_size, put_padded_ascii, Reader};
use crate::probe::error::ProbeError;
use crate::probe::request::ProbeParams;
use crate::probe::results::{Payload, ProbeStage, TransportKind};
use crate::probe::transport::Connection;

pub const HEADER_LEN: usize = 24;
pub const PROTOCOL_VERSION: i32 = 70016;
const MAX_PAYLOAD: usize = 32 * 1024 * 1024;
const MAX_MESSAGES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet3,
    Testnet4,
    Signet,
    Regtest,
}

impl Network {
    pub const ALL: [Network; 5] = [
        Network::Mainnet,
        Network::Testnet3,
        Network::Testnet4,
        Network::Signet,
        Network::Regtest,
    ];

    pub fn magic(self) -> [u8; 4] {
        match self {
            Network::Mainnet => [0xf9, 0xbe, 0xb4, 0xd9],
            Network::Testnet3 => [0x0b, 0x11, 0x09, 0x07],
            Network::Testnet4 => [0x1c, 0x16, 0x3f, 0x28],
            Network::Signet => [0x0a, 0x03, 0xcf, 0x40],
            Network::Regtest => [0xfa, 0xbf, 0xb5, 0xda],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet3 => "testnet3",
            Network::Testnet4 => "testnet4",
            Network::Signet => "signet",
            Network::Regtest => "regtest",
        }
    }

    pub fn parse(name: &str) -> Option<Network> {
        match name.to_ascii_lowercase().as_str() {
            "main" | "mainnet" | "bitcoin" => Some(Network::Mainnet),
            "test" | "testnet" | "testnet3" => Some(Network::Testnet3),
            "testnet4" => Some(Network::Testnet4),
            "signet" => Some(Network::Signet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }

    /// Network implied by a well-known port; mainnet otherwise.
    pub fn for_port(port: u16) -> Network {
        match port {
            18333 => Network::Testnet3,
            48333 => Network::Testnet4,
            38333 => Network::Signet,
            18444 => Network::Regtest,
            _ => Network::Mainnet,
        }
    }

    pub fn from_magic(magic: &[u8]) -> Option<Network> {
        Network::ALL.into_iter().find(|n| n.magic() == magic)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    pub command: String,
    pub length: usize,
    pub checksum: [u8; 4],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitcoinMessage {
    pub command: String,
    pub payload: Vec<u8>,
}

pub fn encode_message(network: Network, command: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&network.magic());
    put_padded_ascii(&mut out, command, 12);
    out.put_u32_le(payload.len() as u32);
    out.extend_from_slice(&checksum4(payload));
    out.extend_from_slice(payload);
    out.to_vec()
}

pub fn decode_header(raw: &[u8], network: Network) -> Result<MessageHeader, ProbeError> {
    let mut r = Reader::new(raw);
    let magic = r.take(4)?;
    if magic != network.magic() {
        return Err(match Network::from_magic(magic) {
            Some(other) => ProbeError::mismatch(format!(
                "peer is on {} but {} was expected",
                other.name(),
                network.name()
            )),
            None => ProbeError::mismatch("bad Bitcoin network magic"),
        });
    }
    let command_raw = r.take(12)?;
    let end = command_raw.iter().position(|&b| b == 0).unwrap_or(12);
    if command_raw[end..].iter().any(|&b| b != 0) || !command_raw[..end].iter().all(u8::is_ascii_graphic) {
        return Err(ProbeError::malformed("command field is not NUL-padded ASCII"));
    }
    let length = r.u32_le()? as usize;
    if length > MAX_PAYLOAD {
        return Err(ProbeError::malformed("payload length exceeds protocol maximum"));
    }
    let c = r.take(4)?;
    Ok(MessageHeader {
        magic: network.magic(),
        command: String::from_utf8_lossy(&command_raw[..end]).into_owned(),
        length,
        checksum: [c[0], c[1], c[2], c[3]],
    })
}

/// Decodes one complete message, verifying magic, framing and checksum.
pub fn decode_message(raw: &[u8], network: Network) -> Result<BitcoinMessage, ProbeError> {
    let header = decode_header(raw, network)?;
    let payload = Reader::new(&raw[HEADER_LEN.min(raw.len())..]).take(header.length)?.to_vec();
    verify_checksum(&header, &payload)?;
    Ok(BitcoinMessage {
        command: header.command,
        payload,
    })
}

pub fn verify_checksum(header: &MessageHeader, payload: &[u8]) -> Result<(), ProbeError> {
    if checksum4(payload) != header.checksum {
        return Err(ProbeError::mismatch(format!("checksum mismatch on '{}' message", header.command)));
    }
    Ok(())
}

fn put_net_addr(out: &mut BytesMut, addr: Option<SocketAddr>) {
    out.put_u64_le(0); // services
    match addr.map(|a| (a.ip(), a.port())) {
        Some((IpAddr::V4(ip), port)) => {
            out.extend_from_slice(&ip.to_ipv6_mapped().octets());
            out.put_u16(port);
        }
        Some((IpAddr::V6(ip), port)) => {
            out.extend_from_slice(&ip.octets());
            out.put_u16(port);
        }
        None => out.put_bytes(0, 18),
    }
}

pub fn build_version_payload(peer: SocketAddr, nonce: u64, timestamp: i64, user_agent: &str) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(128);
    out.put_i32_le(PROTOCOL_VERSION);
    out.put_u64_le(0); // services: none
    out.put_i64_le(timestamp);
    put_net_addr(&mut out, Some(peer));
    put_net_addr(&mut out, None);
    out.put_u64_le(nonce);
    put_compact_size(&mut out, user_agent.len() as u64);
    out.extend_from_slice(user_agent.as_bytes());
    out.put_i32_le(0); // start height
    out.put_u8(0); // relay
    out.to_vec()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerVersion {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub nonce: Option<u64>,
    pub user_agent: Option<String>,
    pub start_height: Option<i32>,
    pub relay: Option<bool>,
}

pub fn parse_version(payload: &[u8]) -> Result<PeerVersion, ProbeError> {
    let mut r = Reader::new(payload);
    let version = r.i32_le()?;
    let services = r.u64_le()?;
    let timestamp = r.i64_le()?;
    r.skip(26)?; // addr_recv
    let mut peer = PeerVersion {
        version,
        services,
        timestamp,
        nonce: None,
        user_agent: None,
        start_height: None,
        relay: None,
    };
    // Fields after addr_recv were added in protocol 106.
    if version < 106 || r.is_empty() {
        return Ok(peer);
    }
    r.skip(26)?; // addr_from
    peer.nonce = Some(r.u64_le()?);
    let ua_len = r.compact_size()? as usize;
    if ua_len > 256 {
        return Err(ProbeError::malformed("user agent longer than 256 bytes"));
    }
    peer.user_agent = Some(String::from_utf8_lossy(r.take(ua_len)?).into_owned());
    peer.start_height = Some(r.i32_le()?);
    if version >= 70001 && !r.is_empty() {
        peer.relay = Some(r.u8()? != 0);
    }
    Ok(peer)
}

pub fn service_names(services: u64) -> Vec<&'static str> {
    const FLAGS: &[(u64, &str)] = &[
        (1, "NETWORK"),
        (1 << 2, "BLOOM"),
        (1 << 3, "WITNESS"),
        (1 << 6, "COMPACT_FILTERS"),
        (1 << 10, "NETWORK_LIMITED"),
        (1 << 11, "P2P_V2"),
    ];
    FLAGS
        .iter()
        .filter(|(bit, _)| services & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

async fn read_message(conn: &mut Connection, network: Network) -> Result<BitcoinMessage, ProbeError> {
    let raw = conn.read_exact(HEADER_LEN).await?;
    let header = decode_header(&raw, network)?;
    let payload = conn.read_exact(header.length).await?;
    verify_checksum(&header, &payload)?;
    debug!(command = %header.command, bytes = header.length, "bitcoin message");
    Ok(BitcoinMessage {
        command: header.command,
        payload,
    })
}

pub struct BitcoinAdapter;

#[async_trait]
impl ProtocolAdapter for BitcoinAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "bitcoin",
            name: "Bitcoin P2P",
            default_port: 8333,
            transport: TransportKind::Tcp,
            pattern: Pattern::BinaryHandshake,
            aliases: &["btc"],
        }
    }

    fn validate(&self, params: &ProbeParams) -> Result<(), ProbeError> {
        match params.get("network") {
            Some(name) if Network::parse(name).is_none() => Err(ProbeError::InvalidRequest(format!(
                "unknown bitcoin network '{}'",
                name
            ))),
            _ => Ok(()),
        }
    }

    async fn probe(&self, conn: &mut Connection, params: &ProbeParams) -> Result<Payload, ProbeError> {
        let network = params
            .get("network")
            .and_then(Network::parse)
            .unwrap_or_else(|| Network::for_port(conn.peer().port()));
        let nonce = rand::random::<u64>();
        let user_agent = format!("/protoprobe:{}/", env!("CARGO_PKG_VERSION"));
        let version = build_version_payload(conn.peer(), nonce, Utc::now().timestamp(), &user_agent);
        conn.send(&encode_message(network, "version", &version)).await?;

        let mut peer: Option<PeerVersion> = None;
        let mut got_verack = false;
        for _ in 0..MAX_MESSAGES {
            let msg = read_message(conn, network).await?;
            match msg.command.as_str() {
                "version" => {
                    if peer.is_some() {
                        return Err(ProbeError::mismatch("peer sent a second version message"));
                    }
                    let parsed = parse_version(&msg.payload)?;
                    if parsed.nonce == Some(nonce) {
                        return Err(ProbeError::mismatch("connected to ourselves"));
                    }
                    peer = Some(parsed);
                    conn.enter(ProbeStage::Querying);
                    conn.send(&encode_message(network, "verack", &[])).await?;
                }
                "verack" => got_verack = true,
                "reject" => {
                    return Err(ProbeError::ServiceError("peer rejected our version message".to_string()));
                }
                // sendaddrv2, wtxidrelay, sendheaders, ping ... are fine during the handshake.
                _ => {}
            }
            if let (Some(peer), true) = (&peer, got_verack) {
                return Ok(Payload::new()
                    .with("network", network.name())
                    .with("handshakeComplete", true)
                    .with("protocolVersion", peer.version)
                    .with("userAgent", peer.user_agent.clone())
                    .with("startHeight", peer.start_height)
                    .with("services", format!("0x{:016x}", peer.services))
                    .with("serviceFlags", service_names(peer.services))
                    .with("relay", peer.relay)
                    .with("clockSkewSeconds", peer.timestamp - Utc::now().timestamp()));
            }
        }
        Err(ProbeError::mismatch("version/verack handshake did not complete"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::codec::to_hex;

    #[test]
    fn test_encode_verack() {
        let msg = encode_message(Network::Mainnet, "verack", &[]);
        assert_eq!(
            to_hex(&msg),
            "f9beb4d976657261636b000000000000000000005df6e0e2"
        );
        let decoded = decode_message(&msg, Network::Mainnet).unwrap();
        assert_eq!(decoded.command, "verack");
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_corrupted_checksum_rejected() {
        let payload = build_version_payload("127.0.0.1:8333".parse().unwrap(), 1, 1_700_000_000, "/t/");
        let mut msg = encode_message(Network::Regtest, "version", &payload);
        msg[20] ^= 0xff;
        let err = decode_message(&msg, Network::Regtest).unwrap_err();
        assert!(matches!(err, ProbeError::ProtocolMismatch(_)));
    }

    #[test]
    fn test_wrong_network_named() {
        let msg = encode_message(Network::Testnet3, "verack", &[]);
        match decode_message(&msg, Network::Mainnet) {
            Err(ProbeError::ProtocolMismatch(m)) => assert!(m.contains("testnet3")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let msg = encode_message(Network::Mainnet, "ping", &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(matches!(decode_message(&msg[..28], Network::Mainnet), Err(ProbeError::Malformed(_))));
    }

    #[test]
    fn test_version_payload_roundtrip_fields() {
        let payload = build_version_payload("10.0.0.1:8333".parse().unwrap(), 42, 1_700_000_000, "/protoprobe:0.1.0/");
        let parsed = parse_version(&payload).unwrap();
        assert_eq!(parsed.version, PROTOCOL_VERSION);
        assert_eq!(parsed.nonce, Some(42));
        assert_eq!(parsed.user_agent.as_deref(), Some("/protoprobe:0.1.0/"));
        assert_eq!(parsed.relay, Some(false));
        // IPv4-mapped receiver address.
        assert_eq!(&payload[20 + 8..20 + 20], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff]);
    }

    #[test]
    fn test_network_selection() {
        assert_eq!(Network::for_port(18444), Network::Regtest);
        assert_eq!(Network::parse("TestNet"), Some(Network::Testnet3));
        assert_eq!(Network::from_magic(&[0x1c, 0x16, 0x3f, 0x28]), Some(Network::Testnet4));
        assert_eq!(service_names(1 | 8 | 1024), vec!["NETWORK", "WITNESS", "NETWORK_LIMITED"]);
    }
}
