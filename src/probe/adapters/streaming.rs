// Streaming servers: RTMP simple handshake and RTSP OPTIONS.

use async_trait::async_trait;
use rand::RngCore;

use super::{AdapterInfo, Pattern, ProtocolAdapter};
use crate::probe::codec::Reader;
use crate::probe::error::ProbeError;
use crate::probe::request::ProbeParams;
use crate::probe::results::{Payload, ProbeStage, TransportKind};
use crate::probe::transport::Connection;

// ---------------------------------------------------------------------------
// RTMP

pub const RTMP_VERSION: u8 = 3;
pub const RTMP_HANDSHAKE_SIZE: usize = 1536;

/// C1: four bytes of time, four zero bytes, random filler.
pub fn build_c1() -> Vec<u8> {
    let mut c1 = vec![0u8; RTMP_HANDSHAKE_SIZE];
    rand::thread_rng().fill_bytes(&mut c1[8..]);
    c1
}

#[derive(Debug, PartialEq, Eq)]
pub struct RtmpServerHello {
    pub version: u8,
    pub server_time: u32,
    pub server_version: Option<String>,
    pub echo_ok: bool,
}

/// Checks S0+S1+S2 (3073 bytes) against the C1 we sent.
pub fn check_server_hello(s0s1s2: &[u8], c1: &[u8]) -> Result<RtmpServerHello, ProbeError> {
    let mut r = Reader::new(s0s1s2);
    let version = r.u8()?;
    if version != RTMP_VERSION {
        return Err(ProbeError::mismatch(format!("unexpected RTMP version byte 0x{:02x}", version)));
    }
    let s1 = r.take(RTMP_HANDSHAKE_SIZE)?;
    let s2 = r.take(RTMP_HANDSHAKE_SIZE)?;

    let mut s1r = Reader::new(s1);
    let server_time = s1r.u32_be()?;
    let v = s1r.take(4)?;
    let server_version = (v != [0, 0, 0, 0]).then(|| format!("{}.{}.{}.{}", v[0], v[1], v[2], v[3]));

    Ok(RtmpServerHello {
        version,
        server_time,
        server_version,
        echo_ok: s2[8..] == c1[8..],
    })
}

pub struct RtmpAdapter;

#[async_trait]
impl ProtocolAdapter for RtmpAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "rtmp",
            name: "Real-Time Messaging Protocol",
            default_port: 1935,
            transport: TransportKind::Tcp,
            pattern: Pattern::BinaryHandshake,
            aliases: &[],
        }
    }

    async fn probe(&self, conn: &mut Connection, _params: &ProbeParams) -> Result<Payload, ProbeError> {
        let c1 = build_c1();
        let mut c0c1 = Vec::with_capacity(1 + RTMP_HANDSHAKE_SIZE);
        c0c1.push(RTMP_VERSION);
        c0c1.extend_from_slice(&c1);
        conn.send(&c0c1).await?;

        let reply = conn.read_exact(1 + 2 * RTMP_HANDSHAKE_SIZE).await?;
        let hello = check_server_hello(&reply, &c1)?;
        if !hello.echo_ok {
            return Err(ProbeError::mismatch("S2 does not echo C1"));
        }

        conn.enter(ProbeStage::Querying);
        // C2 echoes S1.
        conn.send(&reply[1..1 + RTMP_HANDSHAKE_SIZE]).await?;

        Ok(Payload::new()
            .with("version", hello.version)
            .with("serverTime", hello.server_time)
            .with("serverVersion", hello.server_version)
            .with("handshakeComplete", true))
    }
}

// ---------------------------------------------------------------------------
// RTSP

#[derive(Debug, PartialEq)]
pub struct RtspResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl RtspResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub fn build_options(url: &str, cseq: u32) -> String {
    format!(
        "OPTIONS {} RTSP/1.0\r\nCSeq: {}\r\nUser-Agent: protoprobe/{}\r\n\r\n",
        url,
        cseq,
        env!("CARGO_PKG_VERSION")
    )
}

pub fn parse_rtsp_head(head: &str) -> Result<RtspResponse, ProbeError> {
    let mut lines = head.lines();
    let status_line = lines.next().unwrap_or("");
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    if !version.starts_with("RTSP/") {
        return Err(ProbeError::mismatch(format!("not an RTSP status line: {:?}", status_line)));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProbeError::malformed("RTSP status code is not numeric"))?;
    let reason = parts.next().unwrap_or("").trim().to_string();
    let headers = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    Ok(RtspResponse { status, reason, headers })
}

pub struct RtspAdapter;

#[async_trait]
impl ProtocolAdapter for RtspAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "rtsp",
            name: "Real Time Streaming Protocol",
            default_port: 554,
            transport: TransportKind::Tcp,
            pattern: Pattern::TextCommand,
            aliases: &[],
        }
    }

    async fn probe(&self, conn: &mut Connection, params: &ProbeParams) -> Result<Payload, ProbeError> {
        let path = params.get_or("path", "/");
        let url = format!("rtsp://{}:{}{}", conn.host(), conn.peer().port(), path);
        let cseq = 1 + rand::random::<u16>() as u32;
        conn.send(build_options(&url, cseq).as_bytes()).await?;

        let head = conn.read_until(b"\r\n\r\n", 16 * 1024).await?;
        let response = parse_rtsp_head(&String::from_utf8_lossy(&head))?;
        if let Some(echoed) = response.header("CSeq") {
            if echoed.trim().parse::<u32>().ok() != Some(cseq) {
                return Err(ProbeError::mismatch("RTSP CSeq not echoed"));
            }
        }

        match response.status {
            200..=299 => {}
            401 => {
                let scheme = response
                    .header("WWW-Authenticate")
                    .and_then(|v| v.split_whitespace().next())
                    .unwrap_or("unknown");
                return Err(ProbeError::AuthRequired(format!("RTSP server requests {} authentication", scheme)));
            }
            status => return Err(ProbeError::ServiceError(format!("RTSP {} {}", status, response.reason))),
        }

        let methods: Vec<String> = response
            .header("Public")
            .map(|p| p.split(',').map(|m| m.trim().to_string()).filter(|m| !m.is_empty()).collect())
            .unwrap_or_default();
        Ok(Payload::new()
            .with("status", response.status)
            .with("server", response.header("Server"))
            .with("methods", methods))
    }
}
