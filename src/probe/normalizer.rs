// Turns an adapter outcome plus the probe trace into the one result envelope
// every request gets back.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::probe::codec::to_hex;
use crate::probe::error::{ErrorKind, ProbeError};
use crate::probe::results::{Interception, Payload, ProbeFailure, ProbeResult, ProbeStage, TransportKind};
use crate::probe::trace::TraceSnapshot;

/// Identity and timing of the probe being normalized.
#[derive(Debug, Clone)]
pub struct ProbeContext {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub raw_diagnostics: bool,
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Recognises an HTTP status line or a TLS record header where a different
/// protocol was expected. Deliberately narrow: anything else is `None`.
pub fn detect_interception(received: &[u8]) -> Option<Interception> {
    if received.starts_with(b"HTTP/1.") || received.starts_with(b"HTTP/2") {
        return Some(Interception::Http);
    }
    match received {
        [0x15 | 0x16, 0x03, 0x00..=0x04, _, _, ..] => Some(Interception::Tls),
        _ => None,
    }
}

pub fn normalize(ctx: ProbeContext, outcome: Result<Payload, ProbeError>, trace: TraceSnapshot) -> ProbeResult {
    let mut result = ProbeResult {
        protocol: ctx.protocol,
        host: ctx.host,
        port: ctx.port,
        transport: ctx.transport,
        success: false,
        state: ProbeStage::Failed,
        started_at: ctx.started_at,
        elapsed_ms: millis(ctx.elapsed),
        connect_ms: trace.connect_time.map(millis),
        rtt_ms: trace.rtt.map(millis),
        bytes_sent: trace.bytes_sent,
        bytes_received: trace.bytes_received,
        interception: None,
        fields: Payload::new(),
        error: None,
    };

    match outcome {
        Ok(fields) => {
            result.success = true;
            result.state = ProbeStage::Completed;
            result.fields = fields;
        }
        Err(err) => {
            let kind = err.kind();
            let mut message = err.to_string();

            if matches!(kind, ErrorKind::ProtocolMismatch | ErrorKind::MalformedResponse) {
                result.interception = detect_interception(&trace.transcript);
                match result.interception {
                    Some(Interception::Http) => message.push_str(" (peer answered with HTTP; port may be proxied or intercepted)"),
                    Some(Interception::Tls) => message.push_str(" (peer answered with TLS; service may require TLS or be intercepted)"),
                    None => {}
                }
            }

            let attach_raw = kind == ErrorKind::ProtocolMismatch
                || (ctx.raw_diagnostics && kind != ErrorKind::InvalidRequest);
            let raw_hex = (attach_raw && !trace.transcript.is_empty()).then(|| to_hex(&trace.transcript));

            result.error = Some(ProbeFailure {
                kind,
                message,
                stage: trace.stage,
                raw_hex,
            });
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(raw: bool) -> ProbeContext {
        ProbeContext {
            protocol: "mqtt".to_string(),
            host: "broker".to_string(),
            port: 1883,
            transport: TransportKind::Tcp,
            started_at: Utc::now(),
            elapsed: Duration::from_millis(12),
            raw_diagnostics: raw,
        }
    }

    fn snapshot(stage: ProbeStage, transcript: &[u8]) -> TraceSnapshot {
        TraceSnapshot {
            stage,
            bytes_sent: 14,
            bytes_received: transcript.len() as u64,
            connect_time: Some(Duration::from_micros(300)),
            rtt: None,
            transcript: transcript.to_vec(),
        }
    }

    #[test]
    fn test_detect_interception() {
        assert_eq!(detect_interception(b"HTTP/1.1 400 Bad Request\r\n"), Some(Interception::Http));
        assert_eq!(detect_interception(&[0x16, 0x03, 0x03, 0x00, 0x2a, 0x02]), Some(Interception::Tls));
        assert_eq!(detect_interception(&[0x15, 0x03, 0x01, 0x00, 0x02]), Some(Interception::Tls));
        assert_eq!(detect_interception(&[0x16, 0x03, 0x09, 0x00, 0x02]), None);
        assert_eq!(detect_interception(&[0x16, 0x03]), None);
        assert_eq!(detect_interception(b"SSH-2.0-OpenSSH"), None);
    }

    #[test]
    fn test_success_envelope() {
        let result = normalize(
            ctx(false),
            Ok(Payload::new().with("accepted", true)),
            snapshot(ProbeStage::Handshaking, &[0x20, 0x02, 0x00, 0x00]),
        );
        assert!(result.success);
        assert_eq!(result.state, ProbeStage::Completed);
        assert!((result.connect_ms.unwrap() - 0.3).abs() < 1e-9);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_mismatch_carries_raw_hex_and_interception() {
        let result = normalize(
            ctx(false),
            Err(ProbeError::mismatch("expected CONNACK")),
            snapshot(ProbeStage::Handshaking, b"HTTP/1.1 400"),
        );
        let error = result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ProtocolMismatch);
        assert_eq!(error.stage, ProbeStage::Handshaking);
        assert_eq!(error.raw_hex.as_deref(), Some("485454502f312e3120343030"));
        assert_eq!(result.interception, Some(Interception::Http));
        assert!(error.message.contains("HTTP"));
    }

    #[test]
    fn test_malformed_raw_hex_is_opt_in() {
        let outcome = || Err(ProbeError::malformed("truncated"));
        let plain = normalize(ctx(false), outcome(), snapshot(ProbeStage::Querying, &[1, 2]));
        assert!(plain.error.unwrap().raw_hex.is_none());

        let raw = normalize(ctx(true), outcome(), snapshot(ProbeStage::Querying, &[1, 2]));
        assert_eq!(raw.error.unwrap().raw_hex.as_deref(), Some("0102"));
    }

    #[test]
    fn test_timeout_is_never_flagged_as_interception() {
        let result = normalize(ctx(false), Err(ProbeError::Timeout), snapshot(ProbeStage::Handshaking, b"HTTP/1.1"));
        assert_eq!(result.interception, None);
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    }
}
