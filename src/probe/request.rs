use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::probe::adapters::REGISTRY;
use crate::probe::error::ProbeError;

pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("protocol must not be empty")]
    EmptyProtocol,
    #[error("host must not be empty")]
    EmptyHost,
    #[error("port must be between 1 and 65535")]
    InvalidPort,
    #[error("timeout must be greater than zero")]
    InvalidTimeout,
    #[error("no port given and '{0}' has no default port")]
    MissingPort(String),
}

/// Protocol-specific knobs (credentials, query strings, mode selectors).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProbeParams(BTreeMap<String, String>);

impl ProbeParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Parses a parameter, reporting a bad value as an invalid request.
    pub fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ProbeError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
                ProbeError::InvalidRequest(format!("parameter '{}' has invalid value '{}'", key, raw))
            }),
        }
    }

    pub fn flag(&self, key: &str, default: bool) -> Result<bool, ProbeError> {
        match self.get(key).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ProbeError::InvalidRequest(format!(
                    "parameter '{}' must be a boolean",
                    key
                ))),
            },
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ProbeParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// One probe: a protocol, a target and a deadline. Only constructible in a
/// validated state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawProbeRequest", rename_all = "camelCase")]
pub struct ProbeRequest {
    protocol: String,
    host: String,
    port: u16,
    timeout_ms: u64,
    params: ProbeParams,
    raw_diagnostics: bool,
}

impl ProbeRequest {
    pub fn new(protocol: &str, host: &str, port: u16, timeout_ms: u64) -> Result<Self, RequestError> {
        let protocol = protocol.trim().to_ascii_lowercase();
        let host = host.trim().to_string();
        if protocol.is_empty() {
            return Err(RequestError::EmptyProtocol);
        }
        if host.is_empty() {
            return Err(RequestError::EmptyHost);
        }
        if port == 0 {
            return Err(RequestError::InvalidPort);
        }
        if timeout_ms == 0 {
            return Err(RequestError::InvalidTimeout);
        }
        Ok(Self {
            protocol,
            host,
            port,
            timeout_ms,
            params: ProbeParams::new(),
            raw_diagnostics: false,
        })
    }

    /// Uses the registered adapter's default port.
    pub fn with_default_port(protocol: &str, host: &str, timeout_ms: u64) -> Result<Self, RequestError> {
        let port = default_port(protocol).ok_or_else(|| RequestError::MissingPort(protocol.trim().to_string()))?;
        Self::new(protocol, host, port, timeout_ms)
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.set(key, value);
        self
    }

    pub fn with_params(mut self, params: ProbeParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_raw_diagnostics(mut self, enabled: bool) -> Self {
        self.raw_diagnostics = enabled;
        self
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn params(&self) -> &ProbeParams {
        &self.params
    }

    pub fn raw_diagnostics(&self) -> bool {
        self.raw_diagnostics
    }
}

pub fn default_port(protocol: &str) -> Option<u16> {
    REGISTRY.get(protocol).map(|adapter| adapter.info().default_port)
}

/// Wire shape accepted from batch files. A missing port becomes the
/// adapter's default.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProbeRequest {
    protocol: String,
    host: String,
    #[serde(default)]
    port: Option<u32>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    params: ProbeParams,
    #[serde(default)]
    raw_diagnostics: bool,
}

impl TryFrom<RawProbeRequest> for ProbeRequest {
    type Error = RequestError;

    fn try_from(raw: RawProbeRequest) -> Result<Self, Self::Error> {
        let port = match raw.port {
            Some(port) => u16::try_from(port).map_err(|_| RequestError::InvalidPort)?,
            None => default_port(&raw.protocol).ok_or_else(|| RequestError::MissingPort(raw.protocol.clone()))?,
        };
        Ok(ProbeRequest::new(
            &raw.protocol,
            &raw.host,
            port,
            raw.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
        )?
        .with_params(raw.params)
        .with_raw_diagnostics(raw.raw_diagnostics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_fields() {
        assert_eq!(ProbeRequest::new("redis", "", 6379, 100), Err(RequestError::EmptyHost));
        assert_eq!(ProbeRequest::new("redis", "db", 0, 100), Err(RequestError::InvalidPort));
        assert_eq!(ProbeRequest::new("redis", "db", 6379, 0), Err(RequestError::InvalidTimeout));
        assert_eq!(ProbeRequest::new(" ", "db", 6379, 10), Err(RequestError::EmptyProtocol));
    }

    #[test]
    fn test_protocol_is_normalised() {
        let req = ProbeRequest::new(" MQTT ", " broker.local ", 1883, 250).unwrap();
        assert_eq!(req.protocol(), "mqtt");
        assert_eq!(req.host(), "broker.local");
        assert_eq!(req.timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: ProbeRequest = serde_json::from_str(
            r#"{"protocol":"bitcoin","host":"seed.local","port":18444,"params":{"network":"regtest"}}"#,
        )
        .unwrap();
        assert_eq!(ok.timeout_ms(), DEFAULT_TIMEOUT_MS);
        assert_eq!(ok.params().get("network"), Some("regtest"));

        let bad = serde_json::from_str::<ProbeRequest>(r#"{"protocol":"ntp","host":"t","port":70000}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_missing_port_uses_adapter_default() {
        let req: ProbeRequest = serde_json::from_str(r#"{"protocol":"Redis","host":"cache"}"#).unwrap();
        assert_eq!(req.port(), 6379);
        let unknown = serde_json::from_str::<ProbeRequest>(r#"{"protocol":"gopher+","host":"x"}"#);
        assert!(unknown.is_err());
        assert_eq!(
            ProbeRequest::with_default_port("ntp", "pool.ntp.org", 500).unwrap().port(),
            123
        );
    }

    #[test]
    fn test_param_helpers() {
        let params: ProbeParams = [("count", "3"), ("stats", "off"), ("bad", "x")].into_iter().collect();
        assert_eq!(params.parse::<u32>("count").unwrap(), Some(3));
        assert_eq!(params.parse::<u32>("missing").unwrap(), None);
        assert!(params.parse::<u32>("bad").is_err());
        assert!(!params.flag("stats", true).unwrap());
        assert!(params.flag("other", true).unwrap());
        assert!(params.flag("bad", true).is_err());
    }
}
