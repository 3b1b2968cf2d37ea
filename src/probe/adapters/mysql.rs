// MySQL / MariaDB: protocol v10 greeting and optional caching_sha2_password
// login.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{AdapterInfo, Pattern, ProtocolAdapter};
use crate::probe::codec::{put_cstr, Reader};
use crate::probe::error::ProbeError;
use crate::probe::request::ProbeParams;
use crate::probe::results::{Payload, ProbeStage, TransportKind};
use crate::probe::transport::Connection;

const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
const CLIENT_SSL: u32 = 0x0000_0800;
const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;

const CACHING_SHA2: &str = "caching_sha2_password";
const UTF8MB4_GENERAL_CI: u8 = 45;
const MAX_PACKET: u32 = 16 * 1024 * 1024;
const ER_ACCESS_DENIED: u16 = 1045;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MysqlGreeting {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub capabilities: u32,
    pub charset: Option<u8>,
    pub status: Option<u16>,
    pub nonce: Vec<u8>,
    pub auth_plugin: Option<String>,
}

impl MysqlGreeting {
    pub fn supports(&self, flag: u32) -> bool {
        self.capabilities & flag != 0
    }

    pub fn is_mariadb(&self) -> bool {
        self.server_version.contains("MariaDB")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MysqlError {
    pub code: u16,
    pub sql_state: Option<String>,
    pub message: String,
}

impl MysqlError {
    fn into_probe_error(self) -> ProbeError {
        let text = format!("{} ({})", self.message, self.code);
        match self.code {
            ER_ACCESS_DENIED => ProbeError::AuthFailed(text),
            _ => ProbeError::ServiceError(text),
        }
    }
}

/// Parses an ERR packet payload (leading 0xff included).
pub fn parse_err_packet(payload: &[u8]) -> Result<MysqlError, ProbeError> {
    let mut r = Reader::new(payload);
    if r.u8()? != 0xff {
        return Err(ProbeError::mismatch("not a MySQL ERR packet"));
    }
    let code = r.u16_le()?;
    let sql_state = if r.peek_u8().ok() == Some(b'#') {
        r.skip(1)?;
        Some(String::from_utf8_lossy(r.take(5)?).into_owned())
    } else {
        None
    };
    Ok(MysqlError {
        code,
        sql_state,
        message: String::from_utf8_lossy(r.rest()).into_owned(),
    })
}

pub fn parse_greeting(payload: &[u8]) -> Result<MysqlGreeting, ProbeError> {
    let mut r = Reader::new(payload);
    let protocol_version = r.u8()?;
    if protocol_version != 10 {
        return Err(ProbeError::mismatch(format!(
            "unsupported MySQL handshake protocol version {}",
            protocol_version
        )));
    }
    let server_version = r.cstr()?;
    let connection_id = r.u32_le()?;
    let mut nonce = r.take(8)?.to_vec();
    r.skip(1)?;
    let mut capabilities = u32::from(r.u16_le()?);

    let mut greeting = MysqlGreeting {
        protocol_version,
        server_version,
        connection_id,
        capabilities,
        charset: None,
        status: None,
        nonce: Vec::new(),
        auth_plugin: None,
    };
    if r.is_empty() {
        greeting.nonce = nonce;
        return Ok(greeting);
    }

    greeting.charset = Some(r.u8()?);
    greeting.status = Some(r.u16_le()?);
    capabilities |= u32::from(r.u16_le()?) << 16;
    greeting.capabilities = capabilities;
    let auth_data_len = r.u8()?;
    r.skip(10)?;

    if greeting.supports(CLIENT_SECURE_CONNECTION) {
        let part2 = usize::from(auth_data_len).saturating_sub(8).max(13);
        let data = r.take(part2.min(r.remaining()))?;
        nonce.extend_from_slice(data.strip_suffix(&[0]).unwrap_or(data));
    }
    if greeting.supports(CLIENT_PLUGIN_AUTH) && !r.is_empty() {
        let rest = r.rest();
        let name = rest.strip_suffix(&[0]).unwrap_or(rest);
        greeting.auth_plugin = Some(String::from_utf8_lossy(name).into_owned());
    }
    greeting.nonce = nonce;
    Ok(greeting)
}

/// `XOR(SHA256(pw), SHA256(SHA256(SHA256(pw)) || nonce))`; empty for an empty password.
pub fn scramble_caching_sha2(password: &str, nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha256::digest(password.as_bytes());
    let stage2 = Sha256::digest(stage1);
    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(nonce);
    let stage3 = hasher.finalize();
    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

pub fn build_handshake_response(user: &str, auth: &[u8], database: Option<&str>) -> Vec<u8> {
    let mut capabilities = CLIENT_LONG_PASSWORD | CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH;
    if database.is_some() {
        capabilities |= CLIENT_CONNECT_WITH_DB;
    }
    let mut out = BytesMut::new();
    out.put_u32_le(capabilities);
    out.put_u32_le(MAX_PACKET);
    out.put_u8(UTF8MB4_GENERAL_CI);
    out.put_bytes(0, 23);
    put_cstr(&mut out, user);
    out.put_u8(auth.len() as u8);
    out.extend_from_slice(auth);
    if let Some(db) = database {
        put_cstr(&mut out, db);
    }
    put_cstr(&mut out, CACHING_SHA2);
    out.to_vec()
}

pub fn frame_packet(seq: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.extend_from_slice(&len.to_le_bytes()[..3]);
    out.push(seq);
    out.extend_from_slice(payload);
    out
}

async fn read_packet(conn: &mut Connection) -> Result<(u8, Vec<u8>), ProbeError> {
    let header = conn.read_exact(4).await?;
    let mut r = Reader::new(&header);
    let len = r.u24_le()? as usize;
    let seq = r.u8()?;
    if len == 0 {
        return Err(ProbeError::malformed("empty MySQL packet"));
    }
    Ok((seq, conn.read_exact(len).await?))
}

pub struct MysqlAdapter;

impl MysqlAdapter {
    async fn login(
        conn: &mut Connection,
        greeting: &MysqlGreeting,
        user: &str,
        password: &str,
        database: Option<&str>,
    ) -> Result<(), ProbeError> {
        let auth = scramble_caching_sha2(password, &greeting.nonce);
        let mut seq = 1u8;
        conn.send(&frame_packet(seq, &build_handshake_response(user, &auth, database)))
            .await?;
        let mut switched = false;

        loop {
            let (reply_seq, payload) = read_packet(conn).await?;
            seq = reply_seq.wrapping_add(1);
            match payload[0] {
                0x00 => return Ok(()),
                0xff => return Err(parse_err_packet(&payload)?.into_probe_error()),
                // AuthMoreData: 0x03 fast-auth success, 0x04 full auth needed.
                0x01 => match payload.get(1) {
                    Some(0x03) => continue,
                    Some(0x04) => {
                        return Err(ProbeError::AuthRequired(
                            "caching_sha2_password full authentication requires TLS or RSA key exchange".to_string(),
                        ))
                    }
                    _ => return Err(ProbeError::mismatch("unexpected AuthMoreData payload")),
                },
                0xfe if !switched => {
                    switched = true;
                    let mut r = Reader::new(&payload[1..]);
                    let plugin = r.cstr()?;
                    if plugin != CACHING_SHA2 {
                        return Err(ProbeError::AuthRequired(format!("server requires unsupported auth plugin {}", plugin)));
                    }
                    let data = r.rest();
                    let nonce = data.strip_suffix(&[0]).unwrap_or(data);
                    debug!("mysql auth switch to caching_sha2_password");
                    conn.send(&frame_packet(seq, &scramble_caching_sha2(password, nonce)))
                        .await?;
                }
                other => return Err(ProbeError::mismatch(format!("unexpected MySQL auth reply 0x{:02x}", other))),
            }
        }
    }
}

#[async_trait]
impl ProtocolAdapter for MysqlAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "mysql",
            name: "MySQL / MariaDB",
            default_port: 3306,
            transport: TransportKind::Tcp,
            pattern: Pattern::ChallengeResponse,
            aliases: &["mariadb"],
        }
    }

    fn validate(&self, params: &ProbeParams) -> Result<(), ProbeError> {
        if params.get("password").is_some() && params.get("user").is_none() {
            return Err(ProbeError::InvalidRequest("MySQL password requires a user".to_string()));
        }
        if params.get("user").map_or(false, |u| u.len() > 255) {
            return Err(ProbeError::InvalidRequest("MySQL user name too long".to_string()));
        }
        Ok(())
    }

    async fn probe(&self, conn: &mut Connection, params: &ProbeParams) -> Result<Payload, ProbeError> {
        let (_, payload) = read_packet(conn).await?;
        if payload[0] == 0xff {
            // e.g. "Host is not allowed to connect" sent in place of a greeting.
            return Err(parse_err_packet(&payload)?.into_probe_error());
        }
        let greeting = parse_greeting(&payload)?;

        let mut result = Payload::new()
            .with("serverVersion", greeting.server_version.as_str())
            .with("mariadb", greeting.is_mariadb())
            .with("connectionId", greeting.connection_id)
            .with("capabilities", format!("0x{:08x}", greeting.capabilities))
            .with("sslSupported", greeting.supports(CLIENT_SSL))
            .with("authPlugin", greeting.auth_plugin.clone());

        if let Some(user) = params.get("user") {
            conn.enter(ProbeStage::Querying);
            Self::login(conn, &greeting, user, params.get_or("password", ""), params.get("database")).await?;
            result.insert("authenticated", true);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::codec::to_hex;

    fn greeting_payload() -> Vec<u8> {
        let mut p = BytesMut::new();
        p.put_u8(10);
        put_cstr(&mut p, "8.0.36");
        p.put_u32_le(42);
        p.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        p.put_u8(0);
        let caps = CLIENT_PROTOCOL_41 | CLIENT_SSL | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH;
        p.put_u16_le(caps as u16);
        p.put_u8(255);
        p.put_u16_le(2);
        p.put_u16_le((caps >> 16) as u16);
        p.put_u8(21);
        p.put_bytes(0, 10);
        p.extend_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 0]);
        put_cstr(&mut p, CACHING_SHA2);
        p.to_vec()
    }

    #[test]
    fn test_parse_greeting() {
        let greeting = parse_greeting(&greeting_payload()).unwrap();
        assert_eq!(greeting.server_version, "8.0.36");
        assert_eq!(greeting.connection_id, 42);
        assert_eq!(greeting.nonce, (1..=20).collect::<Vec<u8>>());
        assert!(greeting.supports(CLIENT_SSL));
        assert_eq!(greeting.auth_plugin.as_deref(), Some(CACHING_SHA2));
    }

    #[test]
    fn test_truncated_greeting_is_malformed() {
        let payload = greeting_payload();
        assert!(matches!(parse_greeting(&payload[..12]), Err(ProbeError::Malformed(_))));
    }

    #[test]
    fn test_caching_sha2_scramble() {
        let nonce: Vec<u8> = (1..=20).collect();
        assert_eq!(
            to_hex(&scramble_caching_sha2("secret", &nonce)),
            "746ebe205d56a0707acb3e796e834e0dd7b1d61743b26bd5202c7a623230c7c9"
        );
        assert!(scramble_caching_sha2("", &nonce).is_empty());
    }

    #[test]
    fn test_err_packet_classification() {
        let mut p = vec![0xff];
        p.extend_from_slice(&ER_ACCESS_DENIED.to_le_bytes());
        p.extend_from_slice(b"#28000Access denied for user 'x'");
        let err = parse_err_packet(&p).unwrap();
        assert_eq!(err.sql_state.as_deref(), Some("28000"));
        assert!(matches!(err.into_probe_error(), ProbeError::AuthFailed(_)));
    }

    #[test]
    fn test_handshake_response_layout() {
        let packet = frame_packet(1, &build_handshake_response("root", &[0xaa; 32], Some("test")));
        assert_eq!(packet[3], 1);
        let len = u32::from_le_bytes([packet[0], packet[1], packet[2], 0]) as usize;
        assert_eq!(len, packet.len() - 4);
        // 4 + 4 + 1 + 23 filler, then the user name.
        assert_eq!(&packet[4 + 32..4 + 37], b"root\0");
        assert_eq!(packet[4 + 37], 32);
        assert!(packet.ends_with(b"caching_sha2_password\0"));
    }
}
