use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::probe::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Udp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Udp => write!(f, "udp"),
        }
    }
}

/// Per-probe state machine. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProbeStage {
    Idle = 0,
    Connecting = 1,
    Handshaking = 2,
    Querying = 3,
    Completed = 4,
    Failed = 5,
}

impl ProbeStage {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => ProbeStage::Connecting,
            2 => ProbeStage::Handshaking,
            3 => ProbeStage::Querying,
            4 => ProbeStage::Completed,
            5 => ProbeStage::Failed,
            _ => ProbeStage::Idle,
        }
    }
}

impl std::fmt::Display for ProbeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeStage::Idle => write!(f, "idle"),
            ProbeStage::Connecting => write!(f, "connecting"),
            ProbeStage::Handshaking => write!(f, "handshaking"),
            ProbeStage::Querying => write!(f, "querying"),
            ProbeStage::Completed => write!(f, "completed"),
            ProbeStage::Failed => write!(f, "failed"),
        }
    }
}

/// Protocol-specific fields decoded by an adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, Value>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/// What the interception heuristic saw in place of the expected protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interception {
    Http,
    Tls,
}

impl std::fmt::Display for Interception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Interception::Http => write!(f, "http"),
            Interception::Tls => write!(f, "tls"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Stage that was active when the probe failed.
    pub stage: ProbeStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_hex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    pub success: bool,
    pub state: ProbeStage,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt_ms: Option<f64>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interception: Option<Interception>,
    pub fields: Payload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProbeFailure>,
}

impl ProbeResult {
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_builder_accepts_options() {
        let payload = Payload::new()
            .with("version", "7.2.4")
            .with("uptime", Some(42u64))
            .with("motd", Option::<String>::None);
        assert_eq!(payload.get("version"), Some(&Value::from("7.2.4")));
        assert_eq!(payload.get("uptime"), Some(&Value::from(42u64)));
        assert_eq!(payload.get("motd"), Some(&Value::Null));
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(ProbeStage::Handshaking.to_string(), "handshaking");
        assert_eq!(ProbeStage::from_u8(3), ProbeStage::Querying);
        assert_eq!(ProbeStage::from_u8(200), ProbeStage::Idle);
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let result = ProbeResult {
            protocol: "redis".to_string(),
            host: "127.0.0.1".to_string(),
            port: 6379,
            transport: TransportKind::Tcp,
            success: true,
            state: ProbeStage::Completed,
            started_at: Utc::now(),
            elapsed_ms: 1.5,
            connect_ms: Some(0.2),
            rtt_ms: None,
            bytes_sent: 14,
            bytes_received: 7,
            interception: None,
            fields: Payload::new().with("pong", true),
            error: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["elapsedMs"], 1.5);
        assert_eq!(json["bytesSent"], 14);
        assert_eq!(json["transport"], "tcp");
        assert_eq!(json["fields"]["pong"], true);
        assert!(json.get("error").is_none());
        assert!(json.get("rttMs").is_none());
    }
}
