// Legacy Internet services (echo, discard, daytime, chargen, time, qotd,
// finger, whois, gopher). Mostly greeting-only or single-query protocols.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{json, Value};

use super::{AdapterInfo, Pattern, ProtocolAdapter};
use crate::probe::codec::{is_text, Reader};
use crate::probe::error::ProbeError;
use crate::probe::request::ProbeParams;
use crate::probe::results::{Payload, TransportKind};
use crate::probe::transport::Connection;

/// Seconds between 1900-01-01 and the Unix epoch.
pub const RFC868_EPOCH_OFFSET: i64 = 2_208_988_800;

const TEXT_CAP: usize = 16 * 1024;

lazy_static::lazy_static! {
    static ref WHOIS_REFERRAL: Regex =
        Regex::new(r"(?im)^\s*(?:refer|whois server|registrar whois server|referralserver)\s*:\s*(\S+)")
            .expect("valid referral pattern");
}

fn random_token() -> String {
    format!("protoprobe-{:016x}", rand::random::<u64>())
}

fn text_response(bytes: &[u8], what: &str) -> Result<String, ProbeError> {
    if bytes.is_empty() {
        return Err(ProbeError::mismatch(format!("{} server closed without sending data", what)));
    }
    if !is_text(bytes) {
        return Err(ProbeError::mismatch(format!("{} response is not ASCII text", what)));
    }
    Ok(String::from_utf8_lossy(bytes).trim_end().to_string())
}

pub struct EchoAdapter;

#[async_trait]
impl ProtocolAdapter for EchoAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "echo",
            name: "Echo (RFC 862)",
            default_port: 7,
            transport: TransportKind::Tcp,
            pattern: Pattern::TextCommand,
            aliases: &[],
        }
    }

    fn validate(&self, params: &ProbeParams) -> Result<(), ProbeError> {
        match params.get("payload") {
            Some(p) if p.is_empty() || p.contains(['\r', '\n']) => Err(ProbeError::InvalidRequest(
                "payload must be a non-empty single line".to_string(),
            )),
            _ => Ok(()),
        }
    }

    async fn probe(&self, conn: &mut Connection, params: &ProbeParams) -> Result<Payload, ProbeError> {
        let token = params
            .get("payload")
            .map(str::to_string)
            .unwrap_or_else(random_token);
        let line = format!("{}\r\n", token);

        conn.send(line.as_bytes()).await?;
        let echoed = conn.read_exact(line.len()).await?;
        if echoed != line.as_bytes() {
            return Err(ProbeError::mismatch("echoed bytes differ from the payload sent"));
        }

        Ok(Payload::new()
            .with("echoed", true)
            .with("payloadBytes", line.len()))
    }
}

pub struct DiscardAdapter;

impl DiscardAdapter {
    const DEFAULT_LISTEN_MS: u64 = 300;
}

#[async_trait]
impl ProtocolAdapter for DiscardAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "discard",
            name: "Discard (RFC 863)",
            default_port: 9,
            transport: TransportKind::Tcp,
            pattern: Pattern::TextCommand,
            aliases: &[],
        }
    }

    fn validate(&self, params: &ProbeParams) -> Result<(), ProbeError> {
        params.parse::<u64>("listen_ms").map(|_| ())
    }

    async fn probe(&self, conn: &mut Connection, params: &ProbeParams) -> Result<Payload, ProbeError> {
        let listen_ms = params
            .parse::<u64>("listen_ms")?
            .unwrap_or(Self::DEFAULT_LISTEN_MS);
        let data = format!("{}\r\n", random_token());

        conn.send(data.as_bytes()).await?;
        // Leave half the remaining budget so the silence window never races the deadline.
        let window = Duration::from_millis(listen_ms).min(conn.remaining() / 2);
        conn.expect_silence(window).await?;

        Ok(Payload::new()
            .with("discardedBytes", data.len())
            .with("silentForMs", window.as_millis() as u64))
    }
}

pub struct DaytimeAdapter;

#[async_trait]
impl ProtocolAdapter for DaytimeAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "daytime",
            name: "Daytime (RFC 867)",
            default_port: 13,
            transport: TransportKind::Tcp,
            pattern: Pattern::GreetingOnly,
            aliases: &[],
        }
    }

    async fn probe(&self, conn: &mut Connection, _params: &ProbeParams) -> Result<Payload, ProbeError> {
        let bytes = conn.read_line_or_close(512).await?;
        let daytime = text_response(&bytes, "daytime")?;
        Ok(Payload::new().with("daytime", daytime))
    }
}

pub struct QotdAdapter;

#[async_trait]
impl ProtocolAdapter for QotdAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "qotd",
            name: "Quote of the Day (RFC 865)",
            default_port: 17,
            transport: TransportKind::Tcp,
            pattern: Pattern::GreetingOnly,
            aliases: &["quote"],
        }
    }

    async fn probe(&self, conn: &mut Connection, _params: &ProbeParams) -> Result<Payload, ProbeError> {
        // Multi-line quotes usually arrive in one segment; take what came with the first line.
        let mut bytes = conn.read_line_or_close(512).await?;
        let rest = 512usize.saturating_sub(bytes.len());
        bytes.extend(conn.read_at_least(0, rest).await?);
        let quote = text_response(&bytes, "qotd")?;
        Ok(Payload::new().with("quote", quote))
    }
}

pub struct ChargenAdapter;

#[derive(Debug, PartialEq)]
pub struct ChargenSample {
    pub line_length: usize,
    pub first_line: String,
}

/// Validates two consecutive chargen lines. RFC 864 servers shift the
/// printable-ASCII ring by one character per line; anything else is not chargen.
pub fn check_chargen(first: &[u8], second: &[u8]) -> Result<ChargenSample, ProbeError> {
    let first = crate::probe::codec::trim_line(first);
    let second = crate::probe::codec::trim_line(second);
    let printable = |line: &[u8]| !line.is_empty() && line.iter().all(|b| (0x20..0x7f).contains(b));
    if !printable(first) || !printable(second) {
        return Err(ProbeError::mismatch("chargen lines contain non-printable bytes"));
    }
    let rotating = first.len() == second.len() && first.len() > 1 && first[1..] == second[..second.len() - 1];
    if !rotating {
        return Err(ProbeError::mismatch("second line is not the first rotated by one character"));
    }
    Ok(ChargenSample {
        line_length: first.len(),
        first_line: String::from_utf8_lossy(first).into_owned(),
    })
}

#[async_trait]
impl ProtocolAdapter for ChargenAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "chargen",
            name: "Character Generator (RFC 864)",
            default_port: 19,
            transport: TransportKind::Tcp,
            pattern: Pattern::GreetingOnly,
            aliases: &[],
        }
    }

    async fn probe(&self, conn: &mut Connection, _params: &ProbeParams) -> Result<Payload, ProbeError> {
        let first = conn.read_until(b"\n", 1024).await?;
        let second = conn.read_until(b"\n", 1024).await?;
        let sample = check_chargen(&first, &second)?;
        Ok(Payload::new()
            .with("lineLength", sample.line_length)
            .with("sampleLine", sample.first_line)
            .with("rotatingPattern", true))
    }
}

pub struct TimeAdapter;

/// Decodes the 32-bit seconds-since-1900 value, accounting for the 2036 rollover.
pub fn decode_rfc868(bytes: &[u8]) -> Result<DateTime<Utc>, ProbeError> {
    let seconds = i64::from(Reader::new(bytes).u32_be()?);
    let unix = if seconds >= RFC868_EPOCH_OFFSET {
        seconds - RFC868_EPOCH_OFFSET
    } else {
        // Era 1 (after 2036-02-07).
        seconds + (1i64 << 32) - RFC868_EPOCH_OFFSET
    };
    DateTime::<Utc>::from_timestamp(unix, 0).ok_or(ProbeError::malformed("time value out of range"))
}

#[async_trait]
impl ProtocolAdapter for TimeAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "time",
            name: "Time (RFC 868)",
            default_port: 37,
            transport: TransportKind::Tcp,
            pattern: Pattern::GreetingOnly,
            aliases: &["rfc868"],
        }
    }

    async fn probe(&self, conn: &mut Connection, _params: &ProbeParams) -> Result<Payload, ProbeError> {
        let bytes = conn.read_exact(4).await?;
        let server_time = decode_rfc868(&bytes)?;
        let skew = server_time.signed_duration_since(Utc::now()).num_seconds();
        Ok(Payload::new()
            .with("serverTime", server_time.to_rfc3339())
            .with("secondsSince1900", u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            .with("skewSeconds", skew))
    }
}

pub struct FingerAdapter;

#[async_trait]
impl ProtocolAdapter for FingerAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "finger",
            name: "Finger (RFC 1288)",
            default_port: 79,
            transport: TransportKind::Tcp,
            pattern: Pattern::TextCommand,
            aliases: &[],
        }
    }

    fn validate(&self, params: &ProbeParams) -> Result<(), ProbeError> {
        if params.get_or("user", "").contains(['\r', '\n']) {
            return Err(ProbeError::InvalidRequest("user must be a single line".to_string()));
        }
        params.flag("verbose", false).map(|_| ())
    }

    async fn probe(&self, conn: &mut Connection, params: &ProbeParams) -> Result<Payload, ProbeError> {
        let user = params.get_or("user", "").trim();
        let query = if params.flag("verbose", false)? {
            format!("/W {}\r\n", user)
        } else {
            format!("{}\r\n", user)
        };

        conn.send(query.as_bytes()).await?;
        let bytes = conn.read_to_close(TEXT_CAP).await?;
        let response = text_response(&bytes, "finger")?;
        let user_found = !response.to_ascii_lowercase().contains("no such user");

        Ok(Payload::new()
            .with("query", user)
            .with("lines", response.lines().count())
            .with("userFound", user_found)
            .with("response", response))
    }
}

pub struct WhoisAdapter;

pub fn whois_referral(response: &str) -> Option<String> {
    WHOIS_REFERRAL
        .captures(response)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim_end_matches('.').to_string())
}

#[async_trait]
impl ProtocolAdapter for WhoisAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "whois",
            name: "WHOIS (RFC 3912)",
            default_port: 43,
            transport: TransportKind::Tcp,
            pattern: Pattern::TextCommand,
            aliases: &[],
        }
    }

    async fn probe(&self, conn: &mut Connection, params: &ProbeParams) -> Result<Payload, ProbeError> {
        let query = params.get_or("query", "example.com").trim();
        conn.send(format!("{}\r\n", query).as_bytes()).await?;
        let bytes = conn.read_to_close(64 * 1024).await?;
        if bytes.is_empty() {
            return Err(ProbeError::mismatch("whois server closed without sending data"));
        }
        // Registries answer in UTF-8, so only reject obvious binary.
        if bytes.contains(&0) {
            return Err(ProbeError::mismatch("whois response is not text"));
        }
        let response = String::from_utf8_lossy(&bytes).into_owned();

        Ok(Payload::new()
            .with("query", query)
            .with("referral", whois_referral(&response))
            .with("lines", response.lines().count())
            .with("response", response.trim_end()))
    }
}

pub struct GopherAdapter;

/// Parses a gopher menu. Returns `None` when no line looks like a menu entry.
pub fn parse_gopher_menu(body: &str) -> Option<Vec<Value>> {
    let mut entries = Vec::new();
    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line == "." {
            break;
        }
        let mut chars = line.chars();
        let Some(item_type) = chars.next() else { continue };
        let fields: Vec<&str> = chars.as_str().split('\t').collect();
        if fields.len() < 4 {
            continue;
        }
        let Ok(port) = fields[3].trim().parse::<u16>() else { continue };
        entries.push(json!({
            "type": item_type.to_string(),
            "display": fields[0],
            "selector": fields[1],
            "host": fields[2],
            "port": port,
        }));
    }
    (!entries.is_empty()).then_some(entries)
}

#[async_trait]
impl ProtocolAdapter for GopherAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "gopher",
            name: "Gopher (RFC 1436)",
            default_port: 70,
            transport: TransportKind::Tcp,
            pattern: Pattern::TextCommand,
            aliases: &[],
        }
    }

    async fn probe(&self, conn: &mut Connection, params: &ProbeParams) -> Result<Payload, ProbeError> {
        let selector = params.get_or("selector", "");
        conn.send(format!("{}\r\n", selector).as_bytes()).await?;
        let bytes = conn.read_to_close(64 * 1024).await?;
        let body = text_response(&bytes, "gopher")?;

        match parse_gopher_menu(&body) {
            Some(entries) => Ok(Payload::new()
                .with("kind", "menu")
                .with("itemCount", entries.len())
                .with("items", Value::Array(entries.into_iter().take(20).collect()))),
            // The root selector must be a menu; deeper selectors may name documents.
            None if selector.is_empty() => Err(ProbeError::mismatch("root selector did not return a gopher menu")),
            None => Ok(Payload::new().with("kind", "document").with("bytes", bytes.len())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chargen_rotation_detected() {
        let first = b"!\"#$%&'()*+,-./0123456789:;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_`abcdefgh\r\n";
        let second = b"\"#$%&'()*+,-./0123456789:;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_`abcdefghi\r\n";
        let sample = check_chargen(first, second).unwrap();
        assert_eq!(sample.line_length, 72);
        assert_eq!(sample.first_line.as_bytes()[0], b'!');
    }

    #[test]
    fn test_chargen_rejects_unrelated_lines() {
        let err = check_chargen(b"hello world\r\n", b"foo bar baz\r\n").unwrap_err();
        assert!(matches!(err, ProbeError::ProtocolMismatch(_)));
        // Same length but not shifted.
        assert!(check_chargen(b"abcdef\r\n", b"abcdef\r\n").is_err());
    }

    #[test]
    fn test_echo_payload_must_be_one_line() {
        let params: ProbeParams = [("payload", "a\r\nb")].into_iter().collect();
        assert!(matches!(
            EchoAdapter.validate(&params),
            Err(ProbeError::InvalidRequest(_))
        ));
        let params: ProbeParams = [("payload", "hello")].into_iter().collect();
        assert!(EchoAdapter.validate(&params).is_ok());
    }

    #[test]
    fn test_chargen_rejects_binary() {
        assert!(check_chargen(&[0x00, 0x01, b'\n'], b"abc\r\n").is_err());
    }

    #[test]
    fn test_rfc868_decoding() {
        // 2024-02-16T12:00:00Z
        let unix = 1_708_084_800i64;
        let raw = ((unix + RFC868_EPOCH_OFFSET) as u32).to_be_bytes();
        assert_eq!(decode_rfc868(&raw).unwrap().timestamp(), unix);
        assert!(decode_rfc868(&raw[..3]).is_err());
    }

    #[test]
    fn test_rfc868_era_rollover() {
        // Small raw values land after 2036.
        let decoded = decode_rfc868(&[0, 0, 0, 10]).unwrap();
        assert!(decoded.timestamp() > 2_085_978_496);
    }

    #[test]
    fn test_whois_referral() {
        let response = "% IANA WHOIS server\nrefer:        whois.verisign-grs.com\n\ndomain: COM\n";
        assert_eq!(whois_referral(response).as_deref(), Some("whois.verisign-grs.com"));
        assert_eq!(whois_referral("No match"), None);
    }

    #[test]
    fn test_gopher_menu_parsing() {
        let body = "iWelcome\t\terror.host\t1\r\n1Docs\t/docs\tgopher.example\t70\r\n.\r\n";
        let items = parse_gopher_menu(body).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1]["selector"], "/docs");
        assert!(parse_gopher_menu("Monday, February 16, 2024 12:00:00").is_none());
    }
}
