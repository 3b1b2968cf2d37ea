// Datastores: Redis, memcached, PostgreSQL, Cassandra, Riak, ZooKeeper and
// MK Livestatus. MySQL lives in its own module.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use serde_json::{Map, Value};

use super::{AdapterInfo, Pattern, ProtocolAdapter};
use crate::probe::codec::{is_text, put_cstr, Reader};
use crate::probe::error::ProbeError;
use crate::probe::request::ProbeParams;
use crate::probe::results::{Payload, ProbeStage, TransportKind};
use crate::probe::transport::Connection;

const LINE_CAP: usize = 64 * 1024;

/// `key:value` (or `key value`) lines into a JSON object, numbers parsed.
fn key_value_lines(body: &str, sep: char) -> Map<String, Value> {
    body.lines()
        .filter(|l| !l.starts_with('#'))
        .filter_map(|l| l.split_once(sep))
        .map(|(k, v)| {
            let v = v.trim();
            let value = v.parse::<i64>().map(Value::from).unwrap_or_else(|_| Value::from(v));
            (k.trim().to_string(), value)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Redis

pub struct RedisAdapter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resp {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
}

pub fn build_resp_command(args: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n{}\r\n", arg.len(), arg).as_bytes());
    }
    out
}

async fn read_resp(conn: &mut Connection) -> Result<Resp, ProbeError> {
    let line = conn.read_line(LINE_CAP).await?;
    let (kind, rest) = line.split_at(line.chars().next().map_or(0, char::len_utf8));
    match kind {
        "+" => Ok(Resp::Simple(rest.to_string())),
        "-" => Ok(Resp::Error(rest.to_string())),
        ":" => rest
            .parse()
            .map(Resp::Integer)
            .map_err(|_| ProbeError::malformed("invalid RESP integer")),
        "$" => {
            let len: i64 = rest.parse().map_err(|_| ProbeError::malformed("invalid RESP bulk length"))?;
            if len < 0 {
                return Ok(Resp::Bulk(None));
            }
            let mut data = conn.read_exact(len as usize + 2).await?;
            data.truncate(len as usize);
            Ok(Resp::Bulk(Some(data)))
        }
        _ => Err(ProbeError::mismatch(format!("not a RESP reply: {:?}", line))),
    }
}

fn redis_error(message: &str, password_supplied: bool) -> ProbeError {
    let code = message.split_whitespace().next().unwrap_or("");
    match code {
        "NOAUTH" => ProbeError::AuthRequired(message.to_string()),
        "WRONGPASS" | "NOPERM" => ProbeError::AuthFailed(message.to_string()),
        "ERR" if password_supplied && message.contains("password") => ProbeError::AuthFailed(message.to_string()),
        _ => ProbeError::ServiceError(message.to_string()),
    }
}

#[async_trait]
impl ProtocolAdapter for RedisAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "redis",
            name: "Redis",
            default_port: 6379,
            transport: TransportKind::Tcp,
            pattern: Pattern::TextCommand,
            aliases: &["valkey"],
        }
    }

    async fn probe(&self, conn: &mut Connection, params: &ProbeParams) -> Result<Payload, ProbeError> {
        let password = params.get("password");
        if let Some(password) = password {
            let auth = match params.get("username") {
                Some(user) => build_resp_command(&["AUTH", user, password]),
                None => build_resp_command(&["AUTH", password]),
            };
            conn.send(&auth).await?;
            match read_resp(conn).await? {
                Resp::Simple(_) => {}
                Resp::Error(e) => return Err(ProbeError::AuthFailed(e)),
                other => return Err(ProbeError::mismatch(format!("unexpected AUTH reply {:?}", other))),
            }
        }

        conn.send(&build_resp_command(&["PING"])).await?;
        match read_resp(conn).await? {
            Resp::Simple(s) if s.eq_ignore_ascii_case("PONG") => {}
            Resp::Error(e) => return Err(redis_error(&e, password.is_some())),
            other => return Err(ProbeError::mismatch(format!("expected PONG, got {:?}", other))),
        }

        conn.enter(ProbeStage::Querying);
        conn.send(&build_resp_command(&["INFO", "server"])).await?;
        let mut payload = Payload::new().with("pong", true);
        // INFO may be renamed or disabled; PONG alone proves the service.
        if let Resp::Bulk(Some(body)) = read_resp(conn).await? {
            let info = key_value_lines(&String::from_utf8_lossy(&body), ':');
            let field = |key: &str| info.get(key).cloned().unwrap_or(Value::Null);
            payload = payload
                .with("version", field("redis_version"))
                .with("mode", field("redis_mode"))
                .with("os", field("os"))
                .with("uptimeSeconds", field("uptime_in_seconds"));
        }
        Ok(payload)
    }
}

// ---------------------------------------------------------------------------
// memcached

pub struct MemcachedAdapter;

#[async_trait]
impl ProtocolAdapter for MemcachedAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "memcached",
            name: "memcached",
            default_port: 11211,
            transport: TransportKind::Tcp,
            pattern: Pattern::TextCommand,
            aliases: &["memcache"],
        }
    }

    async fn probe(&self, conn: &mut Connection, _params: &ProbeParams) -> Result<Payload, ProbeError> {
        conn.send(b"version\r\n").await?;
        let line = conn.read_line(1024).await?;
        let version = match line.strip_prefix("VERSION ") {
            Some(v) => v.trim().to_string(),
            None if line.contains("unauthenticated") => return Err(ProbeError::AuthRequired(line)),
            None => return Err(ProbeError::mismatch(format!("unexpected memcached reply {:?}", line))),
        };

        conn.enter(ProbeStage::Querying);
        conn.send(b"stats\r\n").await?;
        let mut stats = Map::new();
        for _ in 0..512 {
            let line = conn.read_line(1024).await?;
            if line == "END" {
                break;
            }
            if let Some((key, value)) = line.strip_prefix("STAT ").and_then(|s| s.split_once(' ')) {
                stats.insert(key.to_string(), Value::from(value));
            }
        }
        let stat = |key: &str| stats.get(key).cloned().unwrap_or(Value::Null);

        Ok(Payload::new()
            .with("version", version)
            .with("pid", stat("pid"))
            .with("uptime", stat("uptime"))
            .with("currConnections", stat("curr_connections"))
            .with("currItems", stat("curr_items")))
    }
}

// ---------------------------------------------------------------------------
// PostgreSQL

pub struct PostgresAdapter;

const PG_PROTOCOL_3_0: i32 = 196_608;

pub fn build_startup_message(user: &str, database: &str) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_i32(PG_PROTOCOL_3_0);
    for (key, value) in [("user", user), ("database", database), ("application_name", "protoprobe")] {
        put_cstr(&mut body, key);
        put_cstr(&mut body, value);
    }
    body.put_u8(0);

    let mut msg = BytesMut::with_capacity(body.len() + 4);
    msg.put_i32(body.len() as i32 + 4);
    msg.extend_from_slice(&body);
    msg.to_vec()
}

/// ErrorResponse / NoticeResponse fields keyed by their one-byte code.
pub fn parse_error_fields(body: &[u8]) -> Result<Map<String, Value>, ProbeError> {
    let mut r = Reader::new(body);
    let mut fields = Map::new();
    loop {
        let code = r.u8()?;
        if code == 0 {
            return Ok(fields);
        }
        fields.insert((code as char).to_string(), Value::from(r.cstr()?));
    }
}

pub fn pg_auth_method(code: i32) -> &'static str {
    match code {
        0 => "trust",
        2 => "kerberos-v5",
        3 => "password",
        5 => "md5",
        7 => "gss",
        9 => "sspi",
        10 => "sasl",
        _ => "unknown",
    }
}

async fn read_pg_message(conn: &mut Connection) -> Result<(u8, Vec<u8>), ProbeError> {
    let header = conn.read_exact(5).await?;
    let mut r = Reader::new(&header);
    let tag = r.u8()?;
    let len = r.i32_be()?;
    if !(4..=1024 * 1024).contains(&len) {
        return Err(ProbeError::mismatch(format!("implausible PostgreSQL message length {}", len)));
    }
    Ok((tag, conn.read_exact(len as usize - 4).await?))
}

fn pg_error(fields: &Map<String, Value>) -> ProbeError {
    let code = fields.get("C").and_then(Value::as_str).unwrap_or("");
    let message = fields.get("M").and_then(Value::as_str).unwrap_or("error").to_string();
    match code {
        "28P01" => ProbeError::AuthFailed(message),
        c if c.starts_with("28") => ProbeError::AuthRequired(message),
        _ => ProbeError::ServiceError(format!("{} ({})", message, code)),
    }
}

#[async_trait]
impl ProtocolAdapter for PostgresAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "postgres",
            name: "PostgreSQL",
            default_port: 5432,
            transport: TransportKind::Tcp,
            pattern: Pattern::ChallengeResponse,
            aliases: &["postgresql", "pgsql"],
        }
    }

    async fn probe(&self, conn: &mut Connection, params: &ProbeParams) -> Result<Payload, ProbeError> {
        let user = params.get_or("user", "postgres");
        let database = params.get_or("database", user);
        conn.send(&build_startup_message(user, database)).await?;

        let (tag, body) = read_pg_message(conn).await?;
        match tag {
            b'R' => {}
            b'E' => return Err(pg_error(&parse_error_fields(&body)?)),
            _ => return Err(ProbeError::mismatch(format!("unexpected PostgreSQL message type 0x{:02x}", tag))),
        }

        let mut r = Reader::new(&body);
        let auth_code = r.i32_be()?;
        let mut payload = Payload::new()
            .with("authMethod", pg_auth_method(auth_code))
            .with("authRequired", auth_code != 0);

        if auth_code == 10 {
            let mut mechanisms = Vec::new();
            while r.peek_u8().map_or(false, |b| b != 0) {
                mechanisms.push(r.cstr()?);
            }
            payload = payload.with("saslMechanisms", mechanisms);
        }
        if auth_code != 0 {
            // Presence and auth method are the diagnostic answer; no credentials are sent.
            return Ok(payload);
        }

        conn.enter(ProbeStage::Querying);
        let mut parameters = Map::new();
        for _ in 0..128 {
            let (tag, body) = read_pg_message(conn).await?;
            match tag {
                b'S' => {
                    let mut r = Reader::new(&body);
                    let key = r.cstr()?;
                    parameters.insert(key, Value::from(r.cstr()?));
                }
                b'K' | b'N' => {}
                b'Z' => break,
                b'E' => return Err(pg_error(&parse_error_fields(&body)?)),
                _ => return Err(ProbeError::mismatch(format!("unexpected PostgreSQL message type 0x{:02x}", tag))),
            }
        }
        // Terminate
        conn.send(&[b'X', 0, 0, 0, 4]).await?;

        let server_version = parameters.get("server_version").cloned().unwrap_or(Value::Null);
        Ok(payload
            .with("serverVersion", server_version)
            .with("parameters", Value::Object(parameters)))
    }
}

// ---------------------------------------------------------------------------
// Cassandra (CQL native protocol v4)

pub struct CassandraAdapter;

const CQL_VERSION: u8 = 0x04;
const CQL_OPTIONS: u8 = 0x05;
const CQL_SUPPORTED: u8 = 0x06;
const CQL_ERROR: u8 = 0x00;

pub fn build_cql_options(stream: i16) -> [u8; 9] {
    let s = stream.to_be_bytes();
    [CQL_VERSION, 0, s[0], s[1], CQL_OPTIONS, 0, 0, 0, 0]
}

pub fn parse_string_multimap(body: &[u8]) -> Result<Map<String, Value>, ProbeError> {
    let mut r = Reader::new(body);
    let count = r.u16_be()?;
    let mut out = Map::new();
    for _ in 0..count {
        let key = r.u16_be_prefixed_str()?;
        let n = r.u16_be()?;
        let mut values = Vec::with_capacity(n.min(64) as usize);
        for _ in 0..n {
            values.push(Value::from(r.u16_be_prefixed_str()?));
        }
        out.insert(key, Value::Array(values));
    }
    Ok(out)
}

#[async_trait]
impl ProtocolAdapter for CassandraAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "cassandra",
            name: "Apache Cassandra (CQL)",
            default_port: 9042,
            transport: TransportKind::Tcp,
            pattern: Pattern::BinaryHandshake,
            aliases: &["cql", "scylla"],
        }
    }

    async fn probe(&self, conn: &mut Connection, _params: &ProbeParams) -> Result<Payload, ProbeError> {
        let stream = (rand::random::<u16>() & 0x7fff) as i16;
        conn.send(&build_cql_options(stream)).await?;

        let header = conn.read_exact(9).await?;
        let mut r = Reader::new(&header);
        let version = r.u8()?;
        let _flags = r.u8()?;
        let echoed = r.i16_be()?;
        let opcode = r.u8()?;
        let len = r.i32_be()?;
        if version & 0x80 == 0 || !(1..=5).contains(&(version & 0x7f)) {
            return Err(ProbeError::mismatch(format!("not a CQL response frame (version byte 0x{:02x})", version)));
        }
        if !(0..=1024 * 1024).contains(&len) {
            return Err(ProbeError::malformed("CQL frame length out of range"));
        }
        let body = conn.read_exact(len as usize).await?;

        match opcode {
            CQL_SUPPORTED => {}
            CQL_ERROR => {
                let mut r = Reader::new(&body);
                let code = r.i32_be()?;
                let message = r.u16_be_prefixed_str()?;
                return Err(ProbeError::ServiceError(format!("CQL error 0x{:04x}: {}", code, message)));
            }
            _ => return Err(ProbeError::mismatch(format!("unexpected CQL opcode 0x{:02x}", opcode))),
        }
        if echoed != stream {
            return Err(ProbeError::mismatch("CQL stream id not echoed"));
        }

        let options = parse_string_multimap(&body)?;
        let option = |key: &str| options.get(key).cloned().unwrap_or(Value::Null);
        Ok(Payload::new()
            .with("protocolVersion", version & 0x7f)
            .with("cqlVersions", option("CQL_VERSION"))
            .with("compression", option("COMPRESSION"))
            .with("protocolVersions", option("PROTOCOL_VERSIONS"))
            .with("productType", option("PRODUCT_TYPE")))
    }
}

// ---------------------------------------------------------------------------
// Riak protocol buffers

pub struct RiakAdapter;

pub const RIAK_ERROR_RESP: u8 = 0;
pub const RIAK_PING_REQ: u8 = 1;
pub const RIAK_PING_RESP: u8 = 2;
pub const RIAK_SERVER_INFO_REQ: u8 = 7;
pub const RIAK_SERVER_INFO_RESP: u8 = 8;

pub fn riak_frame(code: u8) -> [u8; 5] {
    [0, 0, 0, 1, code]
}

/// Length-delimited protobuf fields by field number. Other wire types are skipped.
pub fn protobuf_strings(body: &[u8]) -> Result<Vec<(u64, String)>, ProbeError> {
    let mut r = Reader::new(body);
    let mut out = Vec::new();
    while !r.is_empty() {
        let key = r.varint_u64()?;
        match key & 0x07 {
            0 => {
                r.varint_u64()?;
            }
            1 => r.skip(8)?,
            2 => {
                let len = r.varint_u64()? as usize;
                out.push((key >> 3, String::from_utf8_lossy(r.take(len)?).into_owned()));
            }
            5 => r.skip(4)?,
            _ => return Err(ProbeError::malformed("unsupported protobuf wire type")),
        }
    }
    Ok(out)
}

async fn read_riak_message(conn: &mut Connection) -> Result<(u8, Vec<u8>), ProbeError> {
    let len = Reader::new(&conn.read_exact(4).await?).u32_be()? as usize;
    if len == 0 || len > 1024 * 1024 {
        return Err(ProbeError::mismatch(format!("implausible Riak message length {}", len)));
    }
    let mut msg = conn.read_exact(len).await?;
    let code = msg.remove(0);
    Ok((code, msg))
}

#[async_trait]
impl ProtocolAdapter for RiakAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "riak",
            name: "Riak KV (protocol buffers)",
            default_port: 8087,
            transport: TransportKind::Tcp,
            pattern: Pattern::BinaryHandshake,
            aliases: &[],
        }
    }

    fn validate(&self, params: &ProbeParams) -> Result<(), ProbeError> {
        params.flag("server_info", false).map(|_| ())
    }

    async fn probe(&self, conn: &mut Connection, params: &ProbeParams) -> Result<Payload, ProbeError> {
        conn.send(&riak_frame(RIAK_PING_REQ)).await?;
        let (code, body) = read_riak_message(conn).await?;
        match code {
            RIAK_PING_RESP => {}
            RIAK_ERROR_RESP => {
                let message = protobuf_strings(&body)?
                    .into_iter()
                    .find(|(field, _)| *field == 1)
                    .map(|(_, m)| m)
                    .unwrap_or_default();
                return Err(ProbeError::ServiceError(message));
            }
            _ => return Err(ProbeError::mismatch(format!("expected ping response code 2, got {}", code))),
        }

        let mut payload = Payload::new().with("pong", true);
        if params.flag("server_info", false)? {
            conn.enter(ProbeStage::Querying);
            conn.send(&riak_frame(RIAK_SERVER_INFO_REQ)).await?;
            let (code, body) = read_riak_message(conn).await?;
            if code != RIAK_SERVER_INFO_RESP {
                return Err(ProbeError::mismatch(format!("expected server info code 8, got {}", code)));
            }
            for (field, value) in protobuf_strings(&body)? {
                match field {
                    1 => payload.insert("node", value),
                    2 => payload.insert("serverVersion", value),
                    _ => {}
                }
            }
        }
        Ok(payload)
    }
}

// ---------------------------------------------------------------------------
// ZooKeeper four-letter words

pub struct ZookeeperAdapter;

pub const FOUR_LETTER_WORDS: &[&str] = &["ruok", "srvr", "stat", "conf", "envi", "mntr", "isro", "cons", "wchs"];

#[async_trait]
impl ProtocolAdapter for ZookeeperAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "zookeeper",
            name: "Apache ZooKeeper",
            default_port: 2181,
            transport: TransportKind::Tcp,
            pattern: Pattern::TextCommand,
            aliases: &["zk"],
        }
    }

    fn validate(&self, params: &ProbeParams) -> Result<(), ProbeError> {
        let command = params.get_or("command", "srvr");
        if !FOUR_LETTER_WORDS.contains(&command) {
            return Err(ProbeError::InvalidRequest(format!(
                "unsupported four-letter word '{}' (expected one of {})",
                command,
                FOUR_LETTER_WORDS.join(", ")
            )));
        }
        Ok(())
    }

    async fn probe(&self, conn: &mut Connection, params: &ProbeParams) -> Result<Payload, ProbeError> {
        let command = params.get_or("command", "srvr");
        conn.send(command.as_bytes()).await?;
        let bytes = conn.read_to_close(LINE_CAP).await?;
        if bytes.is_empty() {
            return Err(ProbeError::mismatch("ZooKeeper closed without answering"));
        }
        let text = String::from_utf8_lossy(&bytes).trim().to_string();
        if text.contains("is not executed because it is not in the whitelist") {
            return Err(ProbeError::ServiceError(text));
        }

        interpret_four_letter(command, &text)
    }
}

/// Checks a four-letter-word reply against what ZooKeeper sends for that word.
pub fn interpret_four_letter(command: &str, text: &str) -> Result<Payload, ProbeError> {
    let payload = Payload::new().with("command", command);
    match command {
        "ruok" if text == "imok" => Ok(payload.with("ok", true)),
        "ruok" => Err(ProbeError::mismatch(format!("expected imok, got {:?}", text))),
        "isro" => match text {
            "ro" => Ok(payload.with("readOnly", true)),
            "rw" => Ok(payload.with("readOnly", false)),
            _ => Err(ProbeError::mismatch(format!("expected ro or rw, got {:?}", text))),
        },
        "mntr" => {
            let stats = key_value_lines(text, '\t');
            let version = stats.get("zk_version").and_then(Value::as_str).unwrap_or_default();
            if version.is_empty() {
                return Err(ProbeError::mismatch("mntr reply has no zk_version"));
            }
            Ok(payload.with("version", version).with("stats", Value::Object(stats.clone())))
        }
        "conf" | "envi" => {
            let stats = key_value_lines(text, '=');
            let marker = if command == "conf" { "clientPort" } else { "zookeeper.version" };
            if !stats.contains_key(marker) {
                return Err(ProbeError::mismatch(format!("{} reply has no {}", command, marker)));
            }
            Ok(payload.with("settings", Value::Object(stats)))
        }
        "cons" | "wchs" => {
            if !is_text(text.as_bytes()) {
                return Err(ProbeError::mismatch(format!("{} reply is not text", command)));
            }
            Ok(payload.with("lines", text.lines().count()).with("response", text))
        }
        _ => {
            let stats = key_value_lines(text, ':');
            let stat = |key: &str| stats.get(key).cloned().unwrap_or(Value::Null);
            if stat("Zookeeper version").is_null() {
                return Err(ProbeError::mismatch(format!("{} reply has no Zookeeper version line", command)));
            }
            Ok(payload
                .with("version", stat("Zookeeper version"))
                .with("mode", stat("Mode"))
                .with("nodeCount", stat("Node count"))
                .with("stats", Value::Object(stats.clone())))
        }
    }
}

// ---------------------------------------------------------------------------
// MK Livestatus

pub struct LivestatusAdapter;

const LIVESTATUS_DEFAULT_QUERY: &str =
    "GET status\nColumns: program_version livestatus_version program_start num_hosts num_services";

/// Decodes the 16-byte `ResponseHeader: fixed16` header: status, space,
/// length right-aligned in 11 characters, newline.
pub fn parse_fixed16(header: &[u8]) -> Result<(u16, usize), ProbeError> {
    if header.len() != 16 || header[3] != b' ' || header[15] != b'\n' {
        return Err(ProbeError::mismatch("not a Livestatus fixed16 header"));
    }
    let text = std::str::from_utf8(header).map_err(|_| ProbeError::mismatch("Livestatus header is not ASCII"))?;
    let status = text[..3]
        .parse()
        .map_err(|_| ProbeError::mismatch("Livestatus status code is not numeric"))?;
    let length = text[4..15]
        .trim()
        .parse()
        .map_err(|_| ProbeError::malformed("Livestatus length field is not numeric"))?;
    Ok((status, length))
}

pub fn build_livestatus_query(query: &str) -> String {
    format!("{}\nOutputFormat: json\nResponseHeader: fixed16\n\n", query.trim_end())
}

/// Zips the requested columns with the first result row when both are known.
fn first_row(query: &str, body: &Value) -> Option<Value> {
    let columns: Vec<&str> = query
        .lines()
        .find_map(|l| l.strip_prefix("Columns:"))?
        .split_whitespace()
        .collect();
    let row = body.as_array()?.first()?.as_array()?;
    if row.len() != columns.len() {
        return None;
    }
    Some(Value::Object(
        columns.iter().map(|c| c.to_string()).zip(row.iter().cloned()).collect(),
    ))
}

#[async_trait]
impl ProtocolAdapter for LivestatusAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "livestatus",
            name: "MK Livestatus",
            default_port: 6557,
            transport: TransportKind::Tcp,
            pattern: Pattern::TextCommand,
            aliases: &["mk-livestatus"],
        }
    }

    fn validate(&self, params: &ProbeParams) -> Result<(), ProbeError> {
        match params.get("query") {
            Some(q) if !q.trim_start().starts_with("GET ") => Err(ProbeError::InvalidRequest(
                "livestatus query must be a GET request".to_string(),
            )),
            Some(q) if q.contains("ResponseHeader:") || q.contains("OutputFormat:") => Err(
                ProbeError::InvalidRequest("livestatus query must not set its own headers".to_string()),
            ),
            _ => Ok(()),
        }
    }

    async fn probe(&self, conn: &mut Connection, params: &ProbeParams) -> Result<Payload, ProbeError> {
        // Parameters arrive on one line from the CLI; `\n` escapes separate headers.
        let query = params
            .get("query")
            .map(|q| q.replace("\\n", "\n"))
            .unwrap_or_else(|| LIVESTATUS_DEFAULT_QUERY.to_string());
        conn.send(build_livestatus_query(&query).as_bytes()).await?;

        let header = conn.read_exact(16).await?;
        let (status, length) = parse_fixed16(&header)?;
        let body = conn.read_exact(length).await?;
        let text = String::from_utf8_lossy(&body);

        if status != 200 {
            return Err(ProbeError::ServiceError(format!("status {}: {}", status, text.trim())));
        }
        let body: Value = serde_json::from_str(&text).map_err(|_| ProbeError::malformed("Livestatus body is not JSON"))?;

        let mut payload = Payload::new().with("statusCode", status).with("bodyBytes", length);
        if let Some(row) = first_row(&query, &body) {
            payload.insert("row", row);
        }
        Ok(payload.with("body", body))
    }
}
