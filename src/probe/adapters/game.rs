// Game servers: Source engine A2S_INFO (UDP) and Minecraft server list ping.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use super::{AdapterInfo, Pattern, ProtocolAdapter};
use crate::probe::codec::{put_varint, put_varint_i32, Reader};
use crate::probe::error::ProbeError;
use crate::probe::request::ProbeParams;
use crate::probe::results::{Payload, ProbeStage, TransportKind};
use crate::probe::transport::Connection;

// ---------------------------------------------------------------------------
// Source A2S_INFO

const SIMPLE_HEADER: [u8; 4] = [0xff, 0xff, 0xff, 0xff];
const SPLIT_HEADER: [u8; 4] = [0xfe, 0xff, 0xff, 0xff];
const A2S_INFO: &[u8] = b"\xff\xff\xff\xffTSource Engine Query\0";
const S2C_CHALLENGE: u8 = b'A';
const S2A_INFO_SRC: u8 = b'I';
const S2A_INFO_GOLDSRC: u8 = b'm';
const MAX_CHALLENGES: usize = 2;

pub fn build_a2s_info(challenge: Option<[u8; 4]>) -> Vec<u8> {
    let mut packet = A2S_INFO.to_vec();
    if let Some(challenge) = challenge {
        packet.extend_from_slice(&challenge);
    }
    packet
}

#[derive(Debug, PartialEq)]
pub enum A2sReply {
    Challenge([u8; 4]),
    Info(Payload),
}

fn server_type(b: u8) -> &'static str {
    match b.to_ascii_lowercase() {
        b'd' => "dedicated",
        b'l' => "listen",
        b'p' => "sourcetv",
        _ => "unknown",
    }
}

fn environment(b: u8) -> &'static str {
    match b.to_ascii_lowercase() {
        b'l' => "linux",
        b'w' => "windows",
        b'm' | b'o' => "mac",
        _ => "unknown",
    }
}

fn parse_source_info(r: &mut Reader<'_>) -> Result<Payload, ProbeError> {
    let protocol = r.u8()?;
    let name = r.cstr()?;
    let map = r.cstr()?;
    let folder = r.cstr()?;
    let game = r.cstr()?;
    let app_id = r.u16_le()?;
    let players = r.u8()?;
    let max_players = r.u8()?;
    let bots = r.u8()?;
    let kind = r.u8()?;
    let env = r.u8()?;
    let visibility = r.u8()?;
    let vac = r.u8()?;
    let version = r.cstr()?;

    let mut payload = Payload::new()
        .with("engine", "source")
        .with("protocol", protocol)
        .with("name", name)
        .with("map", map)
        .with("folder", folder)
        .with("game", game)
        .with("appId", app_id)
        .with("players", players)
        .with("maxPlayers", max_players)
        .with("bots", bots)
        .with("serverType", server_type(kind))
        .with("environment", environment(env))
        .with("passwordProtected", visibility == 1)
        .with("vacSecured", vac == 1)
        .with("version", version);

    // Extra data flag fields are optional.
    if let Ok(edf) = r.u8() {
        if edf & 0x80 != 0 {
            payload.insert("gamePort", r.u16_le()?);
        }
        if edf & 0x10 != 0 {
            payload.insert("steamId", r.u64_le()?.to_string());
        }
        if edf & 0x40 != 0 {
            payload.insert("sourceTvPort", r.u16_le()?);
            payload.insert("sourceTvName", r.cstr()?);
        }
        if edf & 0x20 != 0 {
            payload.insert("keywords", r.cstr()?);
        }
    }
    Ok(payload)
}

fn parse_goldsrc_info(r: &mut Reader<'_>) -> Result<Payload, ProbeError> {
    let address = r.cstr()?;
    let name = r.cstr()?;
    let map = r.cstr()?;
    let folder = r.cstr()?;
    let game = r.cstr()?;
    let players = r.u8()?;
    let max_players = r.u8()?;
    let protocol = r.u8()?;
    Ok(Payload::new()
        .with("engine", "goldsrc")
        .with("address", address)
        .with("name", name)
        .with("map", map)
        .with("folder", folder)
        .with("game", game)
        .with("players", players)
        .with("maxPlayers", max_players)
        .with("protocol", protocol))
}

pub fn parse_a2s_reply(datagram: &[u8]) -> Result<A2sReply, ProbeError> {
    let mut r = Reader::new(datagram);
    let header = r.take(4)?;
    if header == SPLIT_HEADER {
        return Err(ProbeError::mismatch("split A2S responses are not supported"));
    }
    if header != SIMPLE_HEADER {
        return Err(ProbeError::mismatch("missing A2S 0xFFFFFFFF header"));
    }
    match r.u8()? {
        S2C_CHALLENGE => {
            let c = r.take(4)?;
            Ok(A2sReply::Challenge([c[0], c[1], c[2], c[3]]))
        }
        S2A_INFO_SRC => Ok(A2sReply::Info(parse_source_info(&mut r)?)),
        S2A_INFO_GOLDSRC => Ok(A2sReply::Info(parse_goldsrc_info(&mut r)?)),
        other => Err(ProbeError::mismatch(format!("unexpected A2S reply type 0x{:02x}", other))),
    }
}

pub struct SourceAdapter;

#[async_trait]
impl ProtocolAdapter for SourceAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "source",
            name: "Source engine query (A2S_INFO)",
            default_port: 27015,
            transport: TransportKind::Udp,
            pattern: Pattern::Datagram,
            aliases: &["a2s", "srcds"],
        }
    }

    async fn probe(&self, conn: &mut Connection, _params: &ProbeParams) -> Result<Payload, ProbeError> {
        let mut challenge = None;
        for _ in 0..=MAX_CHALLENGES {
            conn.send(&build_a2s_info(challenge)).await?;
            let datagram = conn.recv_datagram().await?;
            match parse_a2s_reply(&datagram)? {
                A2sReply::Info(payload) => return Ok(payload.with("challenged", challenge.is_some())),
                A2sReply::Challenge(c) => {
                    debug!("a2s challenge received");
                    conn.enter(ProbeStage::Querying);
                    challenge = Some(c);
                }
            }
        }
        Err(ProbeError::mismatch("server kept answering with challenges"))
    }
}

// ---------------------------------------------------------------------------
// Minecraft Java edition server list ping

const MC_DEFAULT_PROTOCOL: i32 = 767;

pub fn frame_mc_packet(body: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(body.len() + 5);
    put_varint(&mut out, body.len() as u64);
    out.extend_from_slice(body);
    out.to_vec()
}

pub fn build_mc_handshake(host: &str, port: u16, protocol: i32) -> Vec<u8> {
    let mut body = BytesMut::new();
    put_varint(&mut body, 0x00);
    put_varint_i32(&mut body, protocol);
    put_varint(&mut body, host.len() as u64);
    body.extend_from_slice(host.as_bytes());
    body.put_u16(port);
    put_varint(&mut body, 1); // next state: status
    frame_mc_packet(&body)
}

async fn read_mc_varint(conn: &mut Connection) -> Result<u32, ProbeError> {
    let mut value = 0u32;
    for i in 0..5 {
        let byte = conn.read_exact(1).await?[0];
        value |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(ProbeError::malformed("varint longer than 5 bytes"))
}

async fn read_mc_packet(conn: &mut Connection) -> Result<(u32, Vec<u8>), ProbeError> {
    let len = read_mc_varint(conn).await? as usize;
    if len == 0 || len > 2 * 1024 * 1024 {
        return Err(ProbeError::mismatch(format!("implausible Minecraft packet length {}", len)));
    }
    let body = conn.read_exact(len).await?;
    let mut r = Reader::new(&body);
    let id = r.varint_u32()?;
    Ok((id, r.rest().to_vec()))
}

/// Flattens a chat component (string or `{text, extra}` tree) to plain text.
pub fn chat_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => {
            let mut out = map.get("text").map(chat_text).unwrap_or_default();
            if let Some(Value::Array(extra)) = map.get("extra") {
                for part in extra {
                    out.push_str(&chat_text(part));
                }
            }
            out
        }
        Value::Array(parts) => parts.iter().map(chat_text).collect(),
        _ => String::new(),
    }
}

pub fn parse_mc_status(json: &str) -> Result<Payload, ProbeError> {
    let status: Value =
        serde_json::from_str(json).map_err(|_| ProbeError::malformed("status response is not JSON"))?;
    if !status.is_object() {
        return Err(ProbeError::malformed("status response is not a JSON object"));
    }
    Ok(Payload::new()
        .with("version", status["version"]["name"].clone())
        .with("protocol", status["version"]["protocol"].clone())
        .with("playersOnline", status["players"]["online"].clone())
        .with("playersMax", status["players"]["max"].clone())
        .with("motd", chat_text(&status["description"]))
        .with("hasFavicon", status.get("favicon").is_some())
        .with("enforcesSecureChat", status.get("enforcesSecureChat").cloned()))
}

pub struct MinecraftAdapter;

#[async_trait]
impl ProtocolAdapter for MinecraftAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "minecraft",
            name: "Minecraft server list ping",
            default_port: 25565,
            transport: TransportKind::Tcp,
            pattern: Pattern::BinaryHandshake,
            aliases: &["mc"],
        }
    }

    fn validate(&self, params: &ProbeParams) -> Result<(), ProbeError> {
        params.parse::<i32>("protocol").map(|_| ())
    }

    async fn probe(&self, conn: &mut Connection, params: &ProbeParams) -> Result<Payload, ProbeError> {
        let protocol = params.parse::<i32>("protocol")?.unwrap_or(MC_DEFAULT_PROTOCOL);
        let host = conn.host().to_string();
        let port = conn.peer().port();

        let mut hello = build_mc_handshake(&host, port, protocol);
        hello.extend_from_slice(&frame_mc_packet(&[0x00]));
        conn.send(&hello).await?;

        let (id, body) = read_mc_packet(conn).await?;
        if id != 0x00 {
            return Err(ProbeError::mismatch(format!("expected status response, got packet 0x{:02x}", id)));
        }
        let mut r = Reader::new(&body);
        let len = r.varint_u32()? as usize;
        let payload = parse_mc_status(&String::from_utf8_lossy(r.take(len)?))?;

        conn.enter(ProbeStage::Querying);
        let token = rand::random::<i64>();
        let mut ping = BytesMut::new();
        ping.put_u8(0x01);
        ping.put_i64(token);
        let sent = Instant::now();
        conn.send(&frame_mc_packet(&ping)).await?;
        let (id, body) = read_mc_packet(conn).await?;
        let latency = sent.elapsed();
        if id != 0x01 || Reader::new(&body).i64_be()? != token {
            return Err(ProbeError::mismatch("pong did not echo the ping payload"));
        }

        Ok(payload.with("latencyMs", latency.as_secs_f64() * 1000.0))
    }
}
