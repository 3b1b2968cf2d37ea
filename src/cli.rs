use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use serde_json::Value;

use crate::config::ProbeConfig;
use crate::network::parse_targets;
use crate::probe::request::default_port;
use crate::probe::{ProbeParams, ProbeRequest};

#[derive(Parser, Debug)]
#[command(name = "protoprobe")]
#[command(version)]
#[command(about = "Speaks just enough of a service's protocol to prove it is there and report what it is", long_about = None)]
pub struct Cli {
    #[arg(help = "Protocol id or alias (see --list)")]
    pub protocol: Option<String>,

    #[arg(help = "Hostname, IP, IP range (IP1-IP2) or CIDR (192.168.1.0/24). Can be repeated or comma separated.")]
    pub targets: Vec<String>,

    #[arg(short, long, help = "Port to probe (default: the protocol's well-known port)")]
    pub port: Option<u16>,

    #[arg(short, long, value_name = "MS", help = "Deadline for the whole probe in milliseconds")]
    pub timeout: Option<u64>,

    #[arg(short = 'P', long = "param", value_name = "KEY=VALUE", value_parser = parse_key_value, help = "Protocol parameter, e.g. -P user=admin. Repeatable.")]
    pub params: Vec<(String, String)>,

    #[arg(long, help = "Attach hex of received bytes to failed results")]
    pub raw: bool,

    #[arg(long, help = "Maximum probes running at once")]
    pub concurrency: Option<usize>,

    #[arg(long, help = "Maximum probes queued or running")]
    pub queue_depth: Option<usize>,

    #[arg(long, value_name = "FILE", help = "JSON array of probe requests to run")]
    pub batch: Option<PathBuf>,

    #[arg(long, help = "List supported protocols and exit")]
    pub list: bool,

    #[arg(long, value_name = "FILE", help = "Config file (default: <config dir>/protoprobe/config.json)")]
    pub config: Option<PathBuf>,

    #[arg(short = 'o', long, value_enum, default_value = "human", help = "Output format")]
    pub output_format: OutputFormat,

    #[arg(short = 'f', long, help = "Output file path")]
    pub output_file: Option<PathBuf>,

    #[arg(long, help = "Disable colored output")]
    pub no_color: bool,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    #[value(name = "human", help = "Human-readable output")]
    Human,
    #[value(name = "json", help = "JSON output")]
    Json,
    #[value(name = "csv", help = "CSV output")]
    Csv,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

impl Cli {
    /// CLI flags win over file and environment settings.
    pub fn apply_overrides(&self, config: &mut ProbeConfig) {
        if let Some(timeout) = self.timeout {
            config.default_timeout_ms = timeout;
        }
        if let Some(concurrency) = self.concurrency {
            config.max_concurrent_probes = concurrency;
            if self.queue_depth.is_none() && config.max_pending_probes < concurrency {
                config.max_pending_probes = concurrency;
            }
        }
        if let Some(depth) = self.queue_depth {
            config.max_pending_probes = depth;
        }
        if self.raw {
            config.raw_diagnostics = true;
        }
    }

    /// Builds the request list from either `--batch` or PROTOCOL + TARGETs.
    pub fn requests(&self, config: &ProbeConfig) -> Result<Vec<ProbeRequest>> {
        if let Some(path) = &self.batch {
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read batch file {}", path.display()))?;
            return parse_batch(&content, config.default_timeout_ms)
                .with_context(|| format!("invalid batch file {}", path.display()));
        }

        let protocol = self
            .protocol
            .as_deref()
            .ok_or_else(|| anyhow!("no protocol specified (try --list)"))?;
        if self.targets.is_empty() {
            bail!("no target specified");
        }
        let port = match self.port {
            Some(port) => port,
            None => default_port(protocol)
                .ok_or_else(|| anyhow!("unknown protocol '{}' (try --list)", protocol))?,
        };
        let params: ProbeParams = self.params.iter().cloned().collect();

        let mut requests = Vec::new();
        for host in parse_targets(&self.targets.join(","))? {
            let request = ProbeRequest::new(protocol, &host, port, config.default_timeout_ms)?
                .with_params(params.clone())
                .with_raw_diagnostics(config.raw_diagnostics);
            requests.push(request);
        }
        Ok(requests)
    }
}

/// Parses a JSON array of requests; entries without `timeoutMs` get
/// `default_timeout_ms`.
pub fn parse_batch(content: &str, default_timeout_ms: u64) -> Result<Vec<ProbeRequest>> {
    let entries: Vec<Value> = serde_json::from_str(content).context("batch must be a JSON array")?;
    entries
        .into_iter()
        .enumerate()
        .map(|(i, mut entry)| {
            if let Value::Object(map) = &mut entry {
                map.entry("timeoutMs").or_insert_with(|| Value::from(default_timeout_ms));
            }
            serde_json::from_value(entry).with_context(|| format!("request #{}", i + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(parse_key_value("user=admin").unwrap(), ("user".to_string(), "admin".to_string()));
        assert_eq!(parse_key_value("query=a=b").unwrap().1, "a=b");
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn test_requests_from_targets() {
        let cli = Cli::parse_from(["protoprobe", "redis", "10.0.0.1-10.0.0.2", "cache.local", "-P", "password=pw"]);
        let requests = cli.requests(&ProbeConfig::default()).unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.port() == 6379));
        assert_eq!(requests[2].host(), "cache.local");
        assert_eq!(requests[0].params().get("password"), Some("pw"));
    }

    #[test]
    fn test_unknown_protocol_needs_explicit_port() {
        let cli = Cli::parse_from(["protoprobe", "gibberish", "127.0.0.1"]);
        assert!(cli.requests(&ProbeConfig::default()).is_err());
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::parse_from(["protoprobe", "--concurrency", "400", "-t", "900", "--raw", "--list"]);
        let mut config = ProbeConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.max_concurrent_probes, 400);
        assert_eq!(config.max_pending_probes, 400);
        assert_eq!(config.default_timeout_ms, 900);
        assert!(config.raw_diagnostics);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_batch_fills_timeout() {
        let batch = r#"[
            {"protocol": "ntp", "host": "pool.ntp.org"},
            {"protocol": "redis", "host": "cache", "port": 6380, "timeoutMs": 250, "params": {"password": "pw"}}
        ]"#;
        let requests = parse_batch(batch, 1200).unwrap();
        assert_eq!(requests[0].port(), 123);
        assert_eq!(requests[0].timeout_ms(), 1200);
        assert_eq!(requests[1].timeout_ms(), 250);
        assert_eq!(requests[1].params().get("password"), Some("pw"));

        assert!(parse_batch(r#"[{"protocol": "redis", "host": "x", "port": 0}]"#, 1000).is_err());
        assert!(parse_batch(r#"{"protocol": "redis"}"#, 1000).is_err());
    }
}
