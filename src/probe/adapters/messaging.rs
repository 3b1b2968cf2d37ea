// Message brokers: MQTT, AMQP 0-9-1, STOMP, NATS, Kafka and beanstalkd.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{AdapterInfo, Pattern, ProtocolAdapter};
use crate::probe::codec::{put_varint, Reader};
use crate::probe::error::{CodecError, ProbeError};
use crate::probe::request::ProbeParams;
use crate::probe::results::{Payload, ProbeStage, TransportKind};
use crate::probe::transport::Connection;

const CLIENT_NAME: &str = "protoprobe";

/// Credentials problems are "required" when none were supplied.
fn auth_error(supplied: bool, message: impl Into<String>) -> ProbeError {
    if supplied {
        ProbeError::AuthFailed(message.into())
    } else {
        ProbeError::AuthRequired(message.into())
    }
}

// ---------------------------------------------------------------------------
// MQTT 3.1.1

pub struct MqttAdapter;

/// MQTT strings carry a u16 length prefix.
fn mqtt_string_len(name: &str, value: &str) -> Result<u16, ProbeError> {
    u16::try_from(value.len())
        .map_err(|_| ProbeError::InvalidRequest(format!("MQTT {} longer than 65535 bytes", name)))
}

pub fn build_mqtt_connect(
    client_id: &str,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<Vec<u8>, ProbeError> {
    let mut body = BytesMut::new();
    body.put_u16(4);
    body.extend_from_slice(b"MQTT");
    body.put_u8(4); // protocol level 3.1.1
    let mut flags = 0x02; // clean session
    if username.is_some() {
        flags |= 0x80;
        if password.is_some() {
            flags |= 0x40;
        }
    }
    body.put_u8(flags);
    body.put_u16(60);
    let fields = [("client_id", Some(client_id)), ("username", username), ("password", username.and(password))];
    for (name, field) in fields {
        let Some(field) = field else { continue };
        body.put_u16(mqtt_string_len(name, field)?);
        body.extend_from_slice(field.as_bytes());
    }

    let mut packet = BytesMut::with_capacity(body.len() + 5);
    packet.put_u8(0x10);
    put_varint(&mut packet, body.len() as u64);
    packet.extend_from_slice(&body);
    Ok(packet.to_vec())
}

/// Returns `(session_present, return_code)` from a 4-byte CONNACK.
pub fn parse_connack(packet: &[u8]) -> Result<(bool, u8), ProbeError> {
    let mut r = Reader::new(packet);
    let header = r.u8()?;
    if header != 0x20 {
        return Err(ProbeError::mismatch(format!("expected CONNACK, got packet type 0x{:02x}", header)));
    }
    if r.u8()? != 2 {
        return Err(ProbeError::malformed("CONNACK remaining length must be 2"));
    }
    let flags = r.u8()?;
    Ok((flags & 0x01 != 0, r.u8()?))
}

fn connack_reason(code: u8) -> &'static str {
    match code {
        1 => "unacceptable protocol version",
        2 => "client identifier rejected",
        3 => "server unavailable",
        4 => "bad user name or password",
        5 => "not authorized",
        _ => "unknown return code",
    }
}

#[async_trait]
impl ProtocolAdapter for MqttAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "mqtt",
            name: "MQTT 3.1.1",
            default_port: 1883,
            transport: TransportKind::Tcp,
            pattern: Pattern::BinaryHandshake,
            aliases: &[],
        }
    }

    fn validate(&self, params: &ProbeParams) -> Result<(), ProbeError> {
        if params.get("password").is_some() && params.get("username").is_none() {
            return Err(ProbeError::InvalidRequest("MQTT password requires a username".to_string()));
        }
        for name in ["client_id", "username", "password"] {
            if let Some(value) = params.get(name) {
                mqtt_string_len(name, value)?;
            }
        }
        Ok(())
    }

    async fn probe(&self, conn: &mut Connection, params: &ProbeParams) -> Result<Payload, ProbeError> {
        let default_id = format!("{}-{:08x}", CLIENT_NAME, rand::random::<u32>());
        let client_id = params.get_or("client_id", &default_id);
        let username = params.get("username");
        let connect = build_mqtt_connect(client_id, username, params.get("password"))?;

        conn.send(&connect).await?;
        let connack = conn.read_exact(4).await?;
        let (session_present, code) = parse_connack(&connack)?;

        match code {
            0 => {}
            4 | 5 => return Err(auth_error(username.is_some(), connack_reason(code))),
            1..=3 => return Err(ProbeError::ServiceError(connack_reason(code).to_string())),
            _ => return Err(ProbeError::mismatch(format!("invalid CONNACK return code {}", code))),
        }

        conn.send(&[0xe0, 0x00]).await?;
        Ok(Payload::new()
            .with("accepted", true)
            .with("returnCode", code)
            .with("sessionPresent", session_present)
            .with("clientId", client_id))
    }
}

// ---------------------------------------------------------------------------
// AMQP 0-9-1

pub struct AmqpAdapter;

pub const AMQP_HEADER: &[u8; 8] = b"AMQP\x00\x00\x09\x01";
const AMQP_FRAME_END: u8 = 0xce;
const FIELD_TABLE_DEPTH: usize = 8;

#[derive(Debug, PartialEq)]
pub struct ConnectionStart {
    pub version_major: u8,
    pub version_minor: u8,
    pub server_properties: Map<String, Value>,
    pub mechanisms: Vec<String>,
    pub locales: Vec<String>,
}

fn field_value(r: &mut Reader<'_>, depth: usize) -> Result<Value, CodecError> {
    let value = match r.u8()? {
        b't' => Value::from(r.u8()? != 0),
        b'b' => Value::from(r.i8()?),
        b'B' => Value::from(r.u8()?),
        b's' => Value::from(r.i16_be()?),
        b'u' => Value::from(r.u16_be()?),
        b'I' => Value::from(r.i32_be()?),
        b'i' => Value::from(r.u32_be()?),
        b'l' => Value::from(r.i64_be()?),
        b'f' => Value::from(f32::from_bits(r.u32_be()?)),
        b'd' => Value::from(f64::from_bits(r.u64_be()?)),
        b'D' => {
            let scale = r.u8()?;
            let raw = r.u32_be()?;
            Value::from(f64::from(raw) / 10f64.powi(i32::from(scale)))
        }
        b'S' => Value::from(String::from_utf8_lossy(r.u32_be_prefixed()?).into_owned()),
        b'x' => Value::from(r.u32_be_prefixed()?.len()),
        b'T' => Value::from(r.u64_be()?),
        b'V' => Value::Null,
        b'F' => Value::Object(field_table(r, depth + 1)?),
        b'A' => {
            if depth >= FIELD_TABLE_DEPTH {
                return Err(CodecError::Malformed("field table nested too deeply"));
            }
            let mut inner = Reader::new(r.u32_be_prefixed()?);
            let mut items = Vec::new();
            while !inner.is_empty() {
                items.push(field_value(&mut inner, depth + 1)?);
            }
            Value::Array(items)
        }
        _ => return Err(CodecError::Malformed("unknown field table value type")),
    };
    Ok(value)
}

pub fn field_table(r: &mut Reader<'_>, depth: usize) -> Result<Map<String, Value>, CodecError> {
    if depth > FIELD_TABLE_DEPTH {
        return Err(CodecError::Malformed("field table nested too deeply"));
    }
    let mut table = Reader::new(r.u32_be_prefixed()?);
    let mut out = Map::new();
    while !table.is_empty() {
        let name = table.u8_prefixed_str()?;
        let value = field_value(&mut table, depth)?;
        out.insert(name, value);
    }
    Ok(out)
}

/// Parses the payload of a Connection.Start method frame.
pub fn parse_connection_start(payload: &[u8]) -> Result<ConnectionStart, ProbeError> {
    let mut r = Reader::new(payload);
    let (class, method) = (r.u16_be()?, r.u16_be()?);
    if (class, method) != (10, 10) {
        return Err(ProbeError::mismatch(format!(
            "expected Connection.Start (10,10), got ({},{})",
            class, method
        )));
    }
    let version_major = r.u8()?;
    let version_minor = r.u8()?;
    let server_properties = field_table(&mut r, 0)?;
    let words = |raw: &[u8]| {
        String::from_utf8_lossy(raw)
            .split_whitespace()
            .map(str::to_string)
            .collect::<Vec<_>>()
    };
    let mechanisms = words(r.u32_be_prefixed()?);
    let locales = words(r.u32_be_prefixed()?);
    Ok(ConnectionStart {
        version_major,
        version_minor,
        server_properties,
        mechanisms,
        locales,
    })
}

#[async_trait]
impl ProtocolAdapter for AmqpAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "amqp",
            name: "AMQP 0-9-1",
            default_port: 5672,
            transport: TransportKind::Tcp,
            pattern: Pattern::BinaryHandshake,
            aliases: &["rabbitmq"],
        }
    }

    async fn probe(&self, conn: &mut Connection, _params: &ProbeParams) -> Result<Payload, ProbeError> {
        conn.send(AMQP_HEADER).await?;
        let header = conn.read_exact(7).await?;

        if header.starts_with(b"AMQP") {
            // Server rejected our version and answered with the one it speaks.
            let rest = conn.read_exact(1).await?;
            return Err(ProbeError::ServiceError(format!(
                "server requires AMQP protocol {}-{}-{}",
                header[5], header[6], rest[0]
            )));
        }

        let mut r = Reader::new(&header);
        let frame_type = r.u8()?;
        let channel = r.u16_be()?;
        let size = r.u32_be()? as usize;
        if frame_type != 1 || channel != 0 {
            return Err(ProbeError::mismatch(format!(
                "expected method frame on channel 0, got type {} channel {}",
                frame_type, channel
            )));
        }
        let frame = conn.read_exact(size + 1).await?;
        if frame[size] != AMQP_FRAME_END {
            return Err(ProbeError::malformed("AMQP frame end marker missing"));
        }
        let start = parse_connection_start(&frame[..size])?;
        let prop = |key: &str| start.server_properties.get(key).cloned().unwrap_or(Value::Null);

        Ok(Payload::new()
            .with("protocolVersion", format!("0-{}-{}", start.version_major, start.version_minor))
            .with("product", prop("product"))
            .with("version", prop("version"))
            .with("platform", prop("platform"))
            .with("capabilities", prop("capabilities"))
            .with("mechanisms", start.mechanisms)
            .with("locales", start.locales))
    }
}

// ---------------------------------------------------------------------------
// STOMP

pub struct StompAdapter;

#[derive(Debug, PartialEq)]
pub struct StompFrame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    pub fn header(&self, name: &str) -> Option<&str> {
        // Repeated headers: the first occurrence wins.
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

pub fn build_stomp_connect(host: &str, login: Option<&str>, passcode: Option<&str>) -> Vec<u8> {
    let mut frame = format!("CONNECT\naccept-version:1.0,1.1,1.2\nhost:{}\nheart-beat:0,0\n", host);
    if let Some(login) = login {
        frame.push_str(&format!("login:{}\n", login));
    }
    if let Some(passcode) = passcode {
        frame.push_str(&format!("passcode:{}\n", passcode));
    }
    frame.push('\n');
    let mut bytes = frame.into_bytes();
    bytes.push(0);
    bytes
}

pub fn parse_stomp_frame(raw: &[u8]) -> Result<StompFrame, ProbeError> {
    let raw = raw.strip_suffix(&[0]).unwrap_or(raw);
    let text = String::from_utf8_lossy(raw);
    // Heart-beat EOLs may precede the frame.
    let text = text.trim_start_matches(['\r', '\n']);
    let (head, body) = text
        .split_once("\n\n")
        .or_else(|| text.split_once("\r\n\r\n"))
        .unwrap_or((text, ""));
    let mut lines = head.lines();
    let command = lines.next().unwrap_or("").trim().to_string();
    if command.is_empty() || !command.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(ProbeError::mismatch(format!("invalid STOMP command {:?}", command)));
    }
    let headers = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    Ok(StompFrame {
        command,
        headers,
        body: body.to_string(),
    })
}

#[async_trait]
impl ProtocolAdapter for StompAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "stomp",
            name: "STOMP",
            default_port: 61613,
            transport: TransportKind::Tcp,
            pattern: Pattern::TextCommand,
            aliases: &[],
        }
    }

    async fn probe(&self, conn: &mut Connection, params: &ProbeParams) -> Result<Payload, ProbeError> {
        let vhost = params.get("vhost").unwrap_or_else(|| conn.host()).to_string();
        let login = params.get("login");
        conn.send(&build_stomp_connect(&vhost, login, params.get("passcode")))
            .await?;

        let raw = conn.read_until(&[0], 64 * 1024).await?;
        let frame = parse_stomp_frame(&raw)?;
        match frame.command.as_str() {
            "CONNECTED" => {}
            "ERROR" => {
                let message = frame.header("message").unwrap_or(frame.body.trim()).to_string();
                let lower = message.to_ascii_lowercase();
                if ["auth", "login", "passcode", "credential", "access refused"]
                    .iter()
                    .any(|w| lower.contains(w))
                {
                    return Err(auth_error(login.is_some(), message));
                }
                return Err(ProbeError::ServiceError(message));
            }
            other => return Err(ProbeError::mismatch(format!("expected CONNECTED, got {}", other))),
        }

        conn.send(b"DISCONNECT\n\n\0").await?;
        Ok(Payload::new()
            .with("version", frame.header("version").unwrap_or("1.0"))
            .with("server", frame.header("server"))
            .with("session", frame.header("session"))
            .with("heartBeat", frame.header("heart-beat")))
    }
}

// ---------------------------------------------------------------------------
// NATS

pub struct NatsAdapter;

pub fn parse_nats_info(line: &str) -> Result<Map<String, Value>, ProbeError> {
    let json = line
        .strip_prefix("INFO")
        .ok_or_else(|| ProbeError::mismatch(format!("expected NATS INFO, got {:?}", line)))?;
    match serde_json::from_str::<Value>(json.trim()) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(ProbeError::malformed("NATS INFO payload is not a JSON object")),
    }
}

pub fn build_nats_connect(params: &ProbeParams) -> String {
    let mut connect = json!({
        "verbose": false,
        "pedantic": false,
        "name": CLIENT_NAME,
        "lang": "rust",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": 1,
    });
    for (param, field) in [("user", "user"), ("pass", "pass"), ("token", "auth_token")] {
        if let Some(value) = params.get(param) {
            connect[field] = Value::from(value);
        }
    }
    format!("CONNECT {}\r\nPING\r\n", connect)
}

#[async_trait]
impl ProtocolAdapter for NatsAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "nats",
            name: "NATS",
            default_port: 4222,
            transport: TransportKind::Tcp,
            pattern: Pattern::TextCommand,
            aliases: &[],
        }
    }

    async fn probe(&self, conn: &mut Connection, params: &ProbeParams) -> Result<Payload, ProbeError> {
        let line = conn.read_line(64 * 1024).await?;
        let info = parse_nats_info(&line)?;
        let field = |key: &str| info.get(key).cloned().unwrap_or(Value::Null);
        let tls_required = info.get("tls_required").and_then(Value::as_bool).unwrap_or(false);

        let payload = Payload::new()
            .with("serverId", field("server_id"))
            .with("serverName", field("server_name"))
            .with("version", field("version"))
            .with("go", field("go"))
            .with("maxPayload", field("max_payload"))
            .with("authRequired", field("auth_required"))
            .with("tlsRequired", tls_required);

        if tls_required {
            // A plaintext CONNECT would just be rejected.
            return Ok(payload.with("pong", false));
        }

        conn.enter(ProbeStage::Querying);
        conn.send(build_nats_connect(params).as_bytes()).await?;
        let supplied = ["user", "pass", "token"].iter().any(|k| params.get(k).is_some());
        for _ in 0..16 {
            let reply = conn.read_line(4096).await?;
            match reply.split_whitespace().next().unwrap_or("") {
                "PONG" => return Ok(payload.with("pong", true)),
                "+OK" | "PING" | "INFO" => continue,
                "-ERR" => {
                    let message = reply.trim_start_matches("-ERR").trim().trim_matches('\'').to_string();
                    if message.to_ascii_lowercase().contains("authorization") {
                        return Err(auth_error(supplied, message));
                    }
                    return Err(ProbeError::ServiceError(message));
                }
                _ => return Err(ProbeError::mismatch(format!("unexpected NATS reply {:?}", reply))),
            }
        }
        Err(ProbeError::mismatch("no PONG from NATS server"))
    }
}

// ---------------------------------------------------------------------------
// Kafka

pub struct KafkaAdapter;

const KAFKA_API_VERSIONS: i16 = 18;

#[derive(Debug, PartialEq, Eq)]
pub struct ApiRange {
    pub key: i16,
    pub min: i16,
    pub max: i16,
}

pub fn kafka_api_name(key: i16) -> &'static str {
    match key {
        0 => "Produce",
        1 => "Fetch",
        2 => "ListOffsets",
        3 => "Metadata",
        8 => "OffsetCommit",
        9 => "OffsetFetch",
        10 => "FindCoordinator",
        11 => "JoinGroup",
        12 => "Heartbeat",
        17 => "SaslHandshake",
        18 => "ApiVersions",
        19 => "CreateTopics",
        20 => "DeleteTopics",
        36 => "SaslAuthenticate",
        _ => "Other",
    }
}

pub fn build_api_versions_request(correlation_id: i32) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_i16(KAFKA_API_VERSIONS);
    body.put_i16(0);
    body.put_i32(correlation_id);
    body.put_i16(CLIENT_NAME.len() as i16);
    body.extend_from_slice(CLIENT_NAME.as_bytes());

    let mut request = BytesMut::with_capacity(body.len() + 4);
    request.put_i32(body.len() as i32);
    request.extend_from_slice(&body);
    request.to_vec()
}

/// Parses an ApiVersions v0 response body (after the size prefix).
pub fn parse_api_versions(body: &[u8], correlation_id: i32) -> Result<(i16, Vec<ApiRange>), ProbeError> {
    let mut r = Reader::new(body);
    let echoed = r.i32_be()?;
    if echoed != correlation_id {
        return Err(ProbeError::mismatch(format!(
            "correlation id mismatch: sent {}, got {}",
            correlation_id, echoed
        )));
    }
    let error_code = r.i16_be()?;
    let count = r.i32_be()?;
    if count < 0 || count as usize > r.remaining() / 6 {
        return Err(ProbeError::malformed("ApiVersions array length out of range"));
    }
    let mut apis = Vec::with_capacity(count as usize);
    for _ in 0..count {
        apis.push(ApiRange {
            key: r.i16_be()?,
            min: r.i16_be()?,
            max: r.i16_be()?,
        });
    }
    Ok((error_code, apis))
}

#[async_trait]
impl ProtocolAdapter for KafkaAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "kafka",
            name: "Apache Kafka",
            default_port: 9092,
            transport: TransportKind::Tcp,
            pattern: Pattern::Rpc,
            aliases: &[],
        }
    }

    async fn probe(&self, conn: &mut Connection, _params: &ProbeParams) -> Result<Payload, ProbeError> {
        let correlation_id = rand::random::<i32>() & 0x7fff_ffff;
        conn.send(&build_api_versions_request(correlation_id)).await?;

        let size = Reader::new(&conn.read_exact(4).await?).i32_be()?;
        if !(6..=1024 * 1024).contains(&size) {
            return Err(ProbeError::mismatch(format!("implausible Kafka response size {}", size)));
        }
        let body = conn.read_exact(size as usize).await?;
        let (error_code, apis) = parse_api_versions(&body, correlation_id)?;
        if error_code != 0 {
            return Err(ProbeError::ServiceError(format!("ApiVersions error code {}", error_code)));
        }
        debug!(apis = apis.len(), "kafka api versions");

        let listed: Vec<Value> = apis
            .iter()
            .map(|a| json!({"key": a.key, "name": kafka_api_name(a.key), "min": a.min, "max": a.max}))
            .collect();
        Ok(Payload::new()
            .with("apiCount", apis.len())
            .with("apis", Value::Array(listed)))
    }
}

// ---------------------------------------------------------------------------
// beanstalkd

pub struct BeanstalkdAdapter;

/// Flat `key: value` YAML as emitted by `stats`.
pub fn parse_simple_yaml(body: &str) -> Map<String, Value> {
    let mut out = Map::new();
    for line in body.lines() {
        let Some((key, value)) = line.split_once(':') else { continue };
        let value = value.trim().trim_matches('"');
        let parsed = value
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(value));
        out.insert(key.trim().to_string(), parsed);
    }
    out
}

#[async_trait]
impl ProtocolAdapter for BeanstalkdAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "beanstalkd",
            name: "beanstalkd work queue",
            default_port: 11300,
            transport: TransportKind::Tcp,
            pattern: Pattern::TextCommand,
            aliases: &["beanstalk"],
        }
    }

    async fn probe(&self, conn: &mut Connection, _params: &ProbeParams) -> Result<Payload, ProbeError> {
        conn.send(b"stats\r\n").await?;
        let status = conn.read_line(256).await?;
        let Some(len) = status.strip_prefix("OK ") else {
            return match status.as_str() {
                "OUT_OF_MEMORY" | "INTERNAL_ERROR" | "UNKNOWN_COMMAND" | "BAD_FORMAT" => {
                    Err(ProbeError::ServiceError(status.clone()))
                }
                _ => Err(ProbeError::mismatch(format!("unexpected beanstalkd reply {:?}", status))),
            };
        };
        let len: usize = len.trim().parse().map_err(|_| ProbeError::malformed("invalid stats length"))?;
        let total = len.checked_add(2).ok_or(ProbeError::malformed("stats length overflow"))?;
        let body = conn.read_exact(total).await?;
        let stats = parse_simple_yaml(&String::from_utf8_lossy(&body[..len]));
        let stat = |key: &str| stats.get(key).cloned().unwrap_or(Value::Null);

        Ok(Payload::new()
            .with("version", stat("version"))
            .with("uptime", stat("uptime"))
            .with("currentJobsReady", stat("current-jobs-ready"))
            .with("currentConnections", stat("current-connections"))
            .with("totalJobs", stat("total-jobs"))
            .with("pid", stat("pid")))
    }
}
