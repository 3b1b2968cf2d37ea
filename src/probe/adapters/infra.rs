// Datagram infrastructure services: NTP (RFC 5905) and DNS (RFC 1035).

use std::net::{Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use chrono::Utc;
use serde_json::{json, Value};

use super::legacy::RFC868_EPOCH_OFFSET;
use super::{AdapterInfo, Pattern, ProtocolAdapter};
use crate::probe::codec::{to_hex, Reader};
use crate::probe::error::ProbeError;
use crate::probe::request::ProbeParams;
use crate::probe::results::{Payload, TransportKind};
use crate::probe::transport::Connection;

// ---------------------------------------------------------------------------
// NTP

pub const NTP_PACKET_LEN: usize = 48;

/// Unix seconds to the 64-bit NTP timestamp format.
pub fn to_ntp(unix: f64) -> u64 {
    let secs = unix.trunc() as i64 + RFC868_EPOCH_OFFSET;
    let frac = (unix.fract() * 4_294_967_296.0) as u64;
    ((secs as u64) << 32) | (frac & 0xffff_ffff)
}

pub fn from_ntp(ts: u64) -> f64 {
    (ts >> 32) as f64 - RFC868_EPOCH_OFFSET as f64 + (ts & 0xffff_ffff) as f64 / 4_294_967_296.0
}

fn now_unix() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) / 1e9
}

/// Client-mode (3), version 4 request carrying `transmit` as the origin stamp.
pub fn build_ntp_request(transmit: u64) -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0u8; NTP_PACKET_LEN];
    packet[0] = 0x23;
    packet[40..48].copy_from_slice(&transmit.to_be_bytes());
    packet
}

#[derive(Debug, Clone, PartialEq)]
pub struct NtpPacket {
    pub leap: u8,
    pub version: u8,
    pub mode: u8,
    pub stratum: u8,
    pub poll: i8,
    pub precision: i8,
    pub root_delay: f64,
    pub root_dispersion: f64,
    pub reference_id: [u8; 4],
    pub originate: u64,
    pub receive: u64,
    pub transmit: u64,
}

impl NtpPacket {
    pub fn reference(&self) -> String {
        let id = self.reference_id;
        if self.stratum <= 1 {
            // Kiss code or primary reference source, ASCII.
            String::from_utf8_lossy(&id).trim_end_matches('\0').to_string()
        } else {
            Ipv4Addr::from(id).to_string()
        }
    }
}

fn short_format(raw: u32) -> f64 {
    f64::from(raw) / 65536.0
}

pub fn parse_ntp_response(datagram: &[u8]) -> Result<NtpPacket, ProbeError> {
    if datagram.len() < NTP_PACKET_LEN {
        return Err(ProbeError::malformed("NTP packet shorter than 48 bytes"));
    }
    let mut r = Reader::new(datagram);
    let first = r.u8()?;
    let stratum = r.u8()?;
    let poll = r.i8()?;
    let precision = r.i8()?;
    let root_delay = short_format(r.u32_be()?);
    let root_dispersion = short_format(r.u32_be()?);
    let id = r.take(4)?;
    let _reference = r.u64_be()?;
    let originate = r.u64_be()?;
    let receive = r.u64_be()?;
    let transmit = r.u64_be()?;

    Ok(NtpPacket {
        leap: first >> 6,
        version: (first >> 3) & 0x07,
        mode: first & 0x07,
        stratum,
        poll,
        precision,
        root_delay,
        root_dispersion,
        reference_id: [id[0], id[1], id[2], id[3]],
        originate,
        receive,
        transmit,
    })
}

/// Clock offset and round-trip delay in seconds from the four timestamps.
pub fn offset_and_delay(t1: f64, t2: f64, t3: f64, t4: f64) -> (f64, f64) {
    (((t2 - t1) + (t3 - t4)) / 2.0, (t4 - t1) - (t3 - t2))
}

pub struct NtpAdapter;

#[async_trait]
impl ProtocolAdapter for NtpAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "ntp",
            name: "Network Time Protocol",
            default_port: 123,
            transport: TransportKind::Udp,
            pattern: Pattern::Datagram,
            aliases: &["sntp"],
        }
    }

    async fn probe(&self, conn: &mut Connection, _params: &ProbeParams) -> Result<Payload, ProbeError> {
        let t1 = to_ntp(now_unix());
        conn.send(&build_ntp_request(t1)).await?;
        let datagram = conn.recv_datagram().await?;
        let t4 = now_unix();
        let packet = parse_ntp_response(&datagram)?;

        if packet.mode != 4 {
            return Err(ProbeError::mismatch(format!("NTP reply mode {} is not server (4)", packet.mode)));
        }
        if packet.originate != t1 {
            return Err(ProbeError::mismatch("NTP origin timestamp does not match our request"));
        }
        if packet.stratum == 0 {
            return Err(ProbeError::ServiceError(format!("kiss-o'-death {}", packet.reference())));
        }

        let (offset, delay) = offset_and_delay(from_ntp(t1), from_ntp(packet.receive), from_ntp(packet.transmit), t4);
        Ok(Payload::new()
            .with("version", packet.version)
            .with("stratum", packet.stratum)
            .with("reference", packet.reference())
            .with("synchronized", packet.leap != 3)
            .with("precision", packet.precision)
            .with("rootDelayMs", packet.root_delay * 1000.0)
            .with("rootDispersionMs", packet.root_dispersion * 1000.0)
            .with("offsetMs", offset * 1000.0)
            .with("delayMs", delay * 1000.0))
    }
}

// ---------------------------------------------------------------------------
// DNS

const MAX_POINTERS: usize = 16;

pub fn record_type(name: &str) -> Option<u16> {
    Some(match name.to_ascii_uppercase().as_str() {
        "A" => 1,
        "NS" => 2,
        "CNAME" => 5,
        "SOA" => 6,
        "PTR" => 12,
        "MX" => 15,
        "TXT" => 16,
        "AAAA" => 28,
        "ANY" => 255,
        _ => return None,
    })
}

fn record_type_name(code: u16) -> String {
    match code {
        1 => "A".into(),
        2 => "NS".into(),
        5 => "CNAME".into(),
        6 => "SOA".into(),
        12 => "PTR".into(),
        15 => "MX".into(),
        16 => "TXT".into(),
        28 => "AAAA".into(),
        other => format!("TYPE{}", other),
    }
}

pub fn record_class(name: &str) -> Option<u16> {
    match name.to_ascii_uppercase().as_str() {
        "IN" => Some(1),
        "CH" => Some(3),
        "HS" => Some(4),
        _ => None,
    }
}

pub fn build_dns_query(id: u16, name: &str, qtype: u16, qclass: u16) -> Result<Vec<u8>, ProbeError> {
    let mut out = BytesMut::with_capacity(32 + name.len());
    out.put_u16(id);
    out.put_u16(0x0100); // RD
    out.put_u16(1);
    out.put_u16(0);
    out.put_u16(0);
    out.put_u16(0);
    for label in name.trim_end_matches('.').split('.').filter(|l| !l.is_empty()) {
        if label.len() > 63 {
            return Err(ProbeError::InvalidRequest(format!("DNS label '{}' exceeds 63 bytes", label)));
        }
        out.put_u8(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.put_u8(0);
    out.put_u16(qtype);
    out.put_u16(qclass);
    Ok(out.to_vec())
}

/// Reads a possibly compressed name starting at `pos`; returns it and the
/// offset just past it in the original (uncompressed) position.
pub fn read_name(msg: &[u8], mut pos: usize) -> Result<(String, usize), ProbeError> {
    let mut labels = Vec::new();
    let mut end = None;
    let mut jumps = 0;
    loop {
        let len = *msg.get(pos).ok_or(ProbeError::malformed("DNS name runs past end of message"))? as usize;
        match len {
            0 => {
                end.get_or_insert(pos + 1);
                break;
            }
            l if l & 0xc0 == 0xc0 => {
                let low = *msg.get(pos + 1).ok_or(ProbeError::malformed("truncated DNS name pointer"))? as usize;
                end.get_or_insert(pos + 2);
                jumps += 1;
                if jumps > MAX_POINTERS {
                    return Err(ProbeError::malformed("DNS name pointer loop"));
                }
                pos = ((l & 0x3f) << 8) | low;
            }
            l if l & 0xc0 != 0 => return Err(ProbeError::malformed("unsupported DNS label type")),
            l => {
                let label = msg
                    .get(pos + 1..pos + 1 + l)
                    .ok_or(ProbeError::malformed("DNS label runs past end of message"))?;
                labels.push(String::from_utf8_lossy(label).into_owned());
                pos += 1 + l;
            }
        }
    }
    let name = if labels.is_empty() { ".".to_string() } else { labels.join(".") };
    Ok((name, end.unwrap_or(pos + 1)))
}

fn render_rdata(msg: &[u8], rtype: u16, start: usize, rdata: &[u8]) -> Result<Value, ProbeError> {
    Ok(match rtype {
        1 if rdata.len() == 4 => Value::from(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]).to_string()),
        28 if rdata.len() == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(rdata);
            Value::from(Ipv6Addr::from(octets).to_string())
        }
        2 | 5 | 12 => Value::from(read_name(msg, start)?.0),
        15 => {
            let preference = Reader::new(rdata).u16_be()?;
            json!({"preference": preference, "exchange": read_name(msg, start + 2)?.0})
        }
        16 => {
            let mut r = Reader::new(rdata);
            let mut text = String::new();
            while !r.is_empty() {
                text.push_str(&String::from_utf8_lossy(r.u8_prefixed()?));
            }
            Value::from(text)
        }
        6 => {
            let (mname, next) = read_name(msg, start)?;
            let (rname, next) = read_name(msg, next)?;
            let serial = Reader::new(msg.get(next..).unwrap_or(&[])).u32_be()?;
            json!({"mname": mname, "rname": rname, "serial": serial})
        }
        _ => Value::from(to_hex(rdata)),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct DnsResponse {
    pub rcode: u8,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_available: bool,
    pub answers: Vec<Value>,
}

pub fn rcode_name(rcode: u8) -> &'static str {
    match rcode {
        0 => "NOERROR",
        1 => "FORMERR",
        2 => "SERVFAIL",
        3 => "NXDOMAIN",
        4 => "NOTIMP",
        5 => "REFUSED",
        _ => "UNKNOWN",
    }
}

pub fn parse_dns_response(msg: &[u8], id: u16) -> Result<DnsResponse, ProbeError> {
    let mut r = Reader::new(msg);
    if r.u16_be()? != id {
        return Err(ProbeError::mismatch("DNS transaction id mismatch"));
    }
    let flags = r.u16_be()?;
    if flags & 0x8000 == 0 {
        return Err(ProbeError::mismatch("DNS message is not a response"));
    }
    let qdcount = r.u16_be()?;
    let ancount = r.u16_be()?;
    r.skip(4)?;

    let mut pos = r.position();
    for _ in 0..qdcount {
        pos = read_name(msg, pos)?.1 + 4;
    }
    let mut answers = Vec::new();
    for _ in 0..ancount {
        let (name, next) = read_name(msg, pos)?;
        let mut rr = Reader::new(msg.get(next..).ok_or(ProbeError::malformed("DNS record runs past end"))?);
        let rtype = rr.u16_be()?;
        let _class = rr.u16_be()?;
        let ttl = rr.u32_be()?;
        let rdata = rr.u16_be_prefixed()?;
        let rdata_start = next + 10;
        answers.push(json!({
            "name": name,
            "type": record_type_name(rtype),
            "ttl": ttl,
            "data": render_rdata(msg, rtype, rdata_start, rdata)?,
        }));
        pos = rdata_start + rdata.len();
    }

    Ok(DnsResponse {
        rcode: (flags & 0x000f) as u8,
        authoritative: flags & 0x0400 != 0,
        truncated: flags & 0x0200 != 0,
        recursion_available: flags & 0x0080 != 0,
        answers,
    })
}

pub struct DnsAdapter;

impl DnsAdapter {
    fn question(params: &ProbeParams) -> Result<(String, u16, u16), ProbeError> {
        let name = params.get_or("name", "version.bind").to_string();
        let chaos_default = if name.eq_ignore_ascii_case("version.bind") { "CH" } else { "IN" };
        let qtype = params.get_or("type", "TXT");
        let qclass = params.get_or("class", chaos_default);
        let qtype = record_type(qtype)
            .ok_or_else(|| ProbeError::InvalidRequest(format!("unsupported DNS record type '{}'", qtype)))?;
        let qclass = record_class(qclass)
            .ok_or_else(|| ProbeError::InvalidRequest(format!("unsupported DNS class '{}'", qclass)))?;
        Ok((name, qtype, qclass))
    }
}

#[async_trait]
impl ProtocolAdapter for DnsAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "dns",
            name: "Domain Name System",
            default_port: 53,
            transport: TransportKind::Udp,
            pattern: Pattern::Datagram,
            aliases: &["domain"],
        }
    }

    fn validate(&self, params: &ProbeParams) -> Result<(), ProbeError> {
        let (name, qtype, qclass) = Self::question(params)?;
        build_dns_query(0, &name, qtype, qclass).map(|_| ())
    }

    async fn probe(&self, conn: &mut Connection, params: &ProbeParams) -> Result<Payload, ProbeError> {
        let (name, qtype, qclass) = Self::question(params)?;
        let id = rand::random::<u16>();
        conn.send(&build_dns_query(id, &name, qtype, qclass)?).await?;

        let response = parse_dns_response(&conn.recv_datagram().await?, id)?;
        match response.rcode {
            0 | 3 => {}
            code => return Err(ProbeError::ServiceError(format!("DNS server answered {}", rcode_name(code)))),
        }

        Ok(Payload::new()
            .with("query", name)
            .with("rcode", rcode_name(response.rcode))
            .with("authoritative", response.authoritative)
            .with("truncated", response.truncated)
            .with("recursionAvailable", response.recursion_available)
            .with("answers", Value::Array(response.answers)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ntp_timestamp_conversion() {
        let unix = 1_700_000_000.25;
        let ntp = to_ntp(unix);
        assert_eq!(ntp >> 32, (1_700_000_000i64 + RFC868_EPOCH_OFFSET) as u64);
        assert!((from_ntp(ntp) - unix).abs() < 1e-6);
    }

    #[test]
    fn test_ntp_offset_and_delay() {
        // Server clock 1s ahead, 100ms each way, 10ms processing.
        let (offset, delay) = offset_and_delay(10.0, 11.1, 11.11, 10.21);
        assert!((offset - 1.0).abs() < 1e-9);
        assert!((delay - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_parse_ntp_response() {
        let t1 = to_ntp(1_700_000_000.0);
        let mut packet = [0u8; NTP_PACKET_LEN];
        packet[0] = 0x24; // v4 server
        packet[1] = 2;
        packet[12..16].copy_from_slice(&[192, 0, 2, 1]);
        packet[24..32].copy_from_slice(&t1.to_be_bytes());
        let parsed = parse_ntp_response(&packet).unwrap();
        assert_eq!(parsed.mode, 4);
        assert_eq!(parsed.version, 4);
        assert_eq!(parsed.originate, t1);
        assert_eq!(parsed.reference(), "192.0.2.1");
        assert!(parse_ntp_response(&packet[..40]).is_err());
        assert_eq!(build_ntp_request(t1)[0], 0x23);
    }

    fn version_bind_response(id: u16) -> Vec<u8> {
        let mut msg = build_dns_query(id, "version.bind", 16, 3).unwrap();
        msg[2] = 0x85; // QR, AA, RD
        msg[3] = 0x80;
        msg[7] = 1; // ancount
        msg.extend_from_slice(&[0xc0, 0x0c, 0, 16, 0, 3, 0, 0, 0, 0]);
        let txt = b"9.18.24";
        msg.extend_from_slice(&((txt.len() + 1) as u16).to_be_bytes());
        msg.push(txt.len() as u8);
        msg.extend_from_slice(txt);
        msg
    }

    #[test]
    fn test_parse_version_bind() {
        let response = parse_dns_response(&version_bind_response(0xbeef), 0xbeef).unwrap();
        assert_eq!(response.rcode, 0);
        assert!(response.authoritative);
        assert_eq!(response.answers[0]["data"], "9.18.24");
        assert_eq!(response.answers[0]["name"], "version.bind");
        assert!(parse_dns_response(&version_bind_response(1), 2).is_err());
    }

    #[test]
    fn test_pointer_loop_rejected() {
        let msg = [0u8, 0, 0, 0, 0xc0, 4];
        assert!(matches!(read_name(&msg, 4), Err(ProbeError::Malformed(_))));
    }

    #[test]
    fn test_question_defaults() {
        let (name, qtype, qclass) = DnsAdapter::question(&ProbeParams::new()).unwrap();
        assert_eq!((name.as_str(), qtype, qclass), ("version.bind", 16, 3));
        let params: ProbeParams = [("name", "example.com"), ("type", "AAAA")].into_iter().collect();
        assert_eq!(DnsAdapter::question(&params).unwrap().2, 1);
        let bad: ProbeParams = [("type", "HINFO")].into_iter().collect();
        assert!(DnsAdapter::question(&bad).is_err());
    }
}
