// Line-oriented services that announce themselves on connect.

use async_trait::async_trait;
use serde_json::Value;

use super::{read_numeric_reply, AdapterInfo, Pattern, ProtocolAdapter};
use crate::probe::error::ProbeError;
use crate::probe::request::ProbeParams;
use crate::probe::results::{Payload, ProbeStage, TransportKind};
use crate::probe::transport::Connection;

const LINE_CAP: usize = 4096;
const EHLO_NAME: &str = "protoprobe.local";

#[derive(Debug, PartialEq, Eq)]
pub struct SshIdent {
    pub proto_version: String,
    pub software: String,
    pub comments: Option<String>,
}

/// Parses `SSH-protoversion-softwareversion SP comments`.
pub fn parse_ssh_ident(line: &str) -> Option<SshIdent> {
    let rest = line.strip_prefix("SSH-")?;
    let (ident, comments) = match rest.split_once(' ') {
        Some((ident, comments)) => (ident, Some(comments.trim().to_string())),
        None => (rest, None),
    };
    let (proto_version, software) = ident.split_once('-')?;
    if proto_version.is_empty() || software.is_empty() {
        return None;
    }
    Some(SshIdent {
        proto_version: proto_version.to_string(),
        software: software.to_string(),
        comments: comments.filter(|c| !c.is_empty()),
    })
}

pub struct SshAdapter;

#[async_trait]
impl ProtocolAdapter for SshAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "ssh",
            name: "Secure Shell",
            default_port: 22,
            transport: TransportKind::Tcp,
            pattern: Pattern::GreetingOnly,
            aliases: &[],
        }
    }

    async fn probe(&self, conn: &mut Connection, _params: &ProbeParams) -> Result<Payload, ProbeError> {
        // Servers may send other lines before the identification string.
        for _ in 0..16 {
            let line = conn.read_line(LINE_CAP).await?;
            if !line.starts_with("SSH-") {
                continue;
            }
            let ident = parse_ssh_ident(&line)
                .ok_or_else(|| ProbeError::mismatch(format!("invalid SSH identification {:?}", line)))?;
            return Ok(Payload::new()
                .with("banner", line.as_str())
                .with("protoVersion", ident.proto_version)
                .with("software", ident.software)
                .with("comments", ident.comments));
        }
        Err(ProbeError::mismatch("no SSH identification string"))
    }
}

pub struct FtpAdapter;

/// Strips the `Features:` / `End` framing lines from a FEAT reply.
pub fn parse_feat(lines: &[String]) -> Vec<String> {
    if lines.len() < 2 {
        return Vec::new();
    }
    lines[1..lines.len() - 1]
        .iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

#[async_trait]
impl ProtocolAdapter for FtpAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "ftp",
            name: "File Transfer Protocol",
            default_port: 21,
            transport: TransportKind::Tcp,
            pattern: Pattern::TextCommand,
            aliases: &[],
        }
    }

    async fn probe(&self, conn: &mut Connection, _params: &ProbeParams) -> Result<Payload, ProbeError> {
        let (mut code, mut greeting) = read_numeric_reply(conn).await?;
        if code == 120 {
            // "Service ready in nnn minutes", the real greeting follows.
            (code, greeting) = read_numeric_reply(conn).await?;
        }
        match code {
            220 => {}
            421 => return Err(ProbeError::ServiceError(greeting.join(" "))),
            _ => return Err(ProbeError::mismatch(format!("unexpected FTP greeting code {}", code))),
        }

        conn.enter(ProbeStage::Querying);
        conn.send(b"FEAT\r\n").await?;
        let (feat_code, feat_lines) = read_numeric_reply(conn).await?;
        let features = if feat_code == 211 { parse_feat(&feat_lines) } else { Vec::new() };

        conn.send(b"QUIT\r\n").await?;

        Ok(Payload::new()
            .with("greeting", greeting.join("\n"))
            .with("featSupported", feat_code == 211)
            .with("features", features))
    }
}

pub struct SmtpAdapter;

#[derive(Debug, Default, PartialEq)]
pub struct EhloReply {
    pub domain: String,
    pub extensions: Vec<String>,
    pub auth: Vec<String>,
    pub max_size: Option<u64>,
    pub starttls: bool,
}

pub fn parse_ehlo(lines: &[String]) -> EhloReply {
    let mut reply = EhloReply {
        domain: lines.first().map(|l| l.split_whitespace().next().unwrap_or("").to_string()).unwrap_or_default(),
        ..EhloReply::default()
    };
    for line in lines.iter().skip(1) {
        let mut words = line.split_whitespace();
        let Some(keyword) = words.next() else { continue };
        let keyword = keyword.to_ascii_uppercase();
        match keyword.as_str() {
            "AUTH" => reply.auth.extend(words.map(str::to_string)),
            "SIZE" => reply.max_size = words.next().and_then(|s| s.parse().ok()),
            "STARTTLS" => reply.starttls = true,
            _ => {}
        }
        reply.extensions.push(keyword);
    }
    reply
}

#[async_trait]
impl ProtocolAdapter for SmtpAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "smtp",
            name: "Simple Mail Transfer Protocol",
            default_port: 25,
            transport: TransportKind::Tcp,
            pattern: Pattern::TextCommand,
            aliases: &["esmtp"],
        }
    }

    async fn probe(&self, conn: &mut Connection, params: &ProbeParams) -> Result<Payload, ProbeError> {
        let (code, greeting) = read_numeric_reply(conn).await?;
        match code {
            220 => {}
            421 | 554 => return Err(ProbeError::ServiceError(greeting.join(" "))),
            _ => return Err(ProbeError::mismatch(format!("unexpected SMTP greeting code {}", code))),
        }

        conn.enter(ProbeStage::Querying);
        let helo = params.get_or("helo", EHLO_NAME);
        conn.send(format!("EHLO {}\r\n", helo).as_bytes()).await?;
        let (ehlo_code, ehlo_lines) = read_numeric_reply(conn).await?;

        let mut payload = Payload::new().with("greeting", greeting.join("\n"));
        if ehlo_code == 250 {
            let ehlo = parse_ehlo(&ehlo_lines);
            payload = payload
                .with("esmtp", true)
                .with("domain", ehlo.domain)
                .with("extensions", ehlo.extensions)
                .with("authMechanisms", ehlo.auth)
                .with("maxSize", ehlo.max_size)
                .with("starttls", ehlo.starttls);
        } else {
            conn.send(format!("HELO {}\r\n", helo).as_bytes()).await?;
            let (helo_code, helo_lines) = read_numeric_reply(conn).await?;
            if helo_code != 250 {
                return Err(ProbeError::ServiceError(format!(
                    "HELO rejected with {}: {}",
                    helo_code,
                    helo_lines.join(" ")
                )));
            }
            payload = payload.with("esmtp", false);
        }

        conn.send(b"QUIT\r\n").await?;
        Ok(payload)
    }
}

pub struct Pop3Adapter;

/// APOP timestamp (`<...@...>`) from a POP3 greeting, if any.
pub fn apop_timestamp(greeting: &str) -> Option<&str> {
    let start = greeting.find('<')?;
    let end = greeting[start..].find('>')? + start;
    let stamp = &greeting[start..=end];
    stamp.contains('@').then_some(stamp)
}

#[async_trait]
impl ProtocolAdapter for Pop3Adapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "pop3",
            name: "Post Office Protocol v3",
            default_port: 110,
            transport: TransportKind::Tcp,
            pattern: Pattern::TextCommand,
            aliases: &["pop"],
        }
    }

    async fn probe(&self, conn: &mut Connection, _params: &ProbeParams) -> Result<Payload, ProbeError> {
        let greeting = conn.read_line(LINE_CAP).await?;
        if let Some(reason) = greeting.strip_prefix("-ERR") {
            return Err(ProbeError::ServiceError(reason.trim().to_string()));
        }
        let Some(text) = greeting.strip_prefix("+OK") else {
            return Err(ProbeError::mismatch(format!("unexpected POP3 greeting {:?}", greeting)));
        };

        conn.enter(ProbeStage::Querying);
        conn.send(b"CAPA\r\n").await?;
        let status = conn.read_line(LINE_CAP).await?;
        let mut capabilities = Vec::new();
        if status.starts_with("+OK") {
            for _ in 0..256 {
                let line = conn.read_line(LINE_CAP).await?;
                if line == "." {
                    break;
                }
                capabilities.push(line);
            }
        }

        conn.send(b"QUIT\r\n").await?;
        Ok(Payload::new()
            .with("greeting", text.trim())
            .with("apop", apop_timestamp(text).is_some())
            .with("capabilities", capabilities))
    }
}

pub struct ImapAdapter;

/// Capabilities embedded in a `[CAPABILITY ...]` response code.
pub fn inline_capabilities(line: &str) -> Option<Vec<String>> {
    let start = line.find("[CAPABILITY ")? + "[CAPABILITY ".len();
    let end = line[start..].find(']')? + start;
    Some(line[start..end].split_whitespace().map(str::to_string).collect())
}

#[async_trait]
impl ProtocolAdapter for ImapAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "imap",
            name: "Internet Message Access Protocol",
            default_port: 143,
            transport: TransportKind::Tcp,
            pattern: Pattern::TextCommand,
            aliases: &["imap4"],
        }
    }

    async fn probe(&self, conn: &mut Connection, _params: &ProbeParams) -> Result<Payload, ProbeError> {
        let greeting = conn.read_line(LINE_CAP).await?;
        let status = greeting.split_whitespace().nth(1).unwrap_or("").to_ascii_uppercase();
        if !greeting.starts_with("* ") {
            return Err(ProbeError::mismatch(format!("unexpected IMAP greeting {:?}", greeting)));
        }
        match status.as_str() {
            "OK" | "PREAUTH" => {}
            "BYE" => return Err(ProbeError::ServiceError(greeting)),
            _ => return Err(ProbeError::mismatch(format!("unexpected IMAP greeting {:?}", greeting))),
        }

        let mut capabilities = inline_capabilities(&greeting);
        if capabilities.is_none() {
            conn.enter(ProbeStage::Querying);
            conn.send(b"a001 CAPABILITY\r\n").await?;
            for _ in 0..64 {
                let line = conn.read_line(LINE_CAP).await?;
                if let Some(caps) = line.strip_prefix("* CAPABILITY ") {
                    capabilities = Some(caps.split_whitespace().map(str::to_string).collect());
                } else if line.starts_with("a001 ") {
                    break;
                }
            }
        }

        conn.send(b"a002 LOGOUT\r\n").await?;
        let capabilities = capabilities.unwrap_or_default();
        Ok(Payload::new()
            .with("greeting", greeting.as_str())
            .with("preauth", status == "PREAUTH")
            .with("starttls", capabilities.iter().any(|c| c.eq_ignore_ascii_case("STARTTLS")))
            .with(
                "capabilities",
                Value::Array(capabilities.into_iter().map(Value::from).collect()),
            ))
    }
}
