// Protocol adapters and the registry that resolves them by identifier.
// Each family module holds a handful of small, stateless adapters.

pub mod banner;
pub mod bitcoin;
pub mod database;
pub mod game;
pub mod infra;
pub mod legacy;
pub mod messaging;
pub mod mysql;
pub mod rpc;
pub mod streaming;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::probe::error::ProbeError;
use crate::probe::request::ProbeParams;
use crate::probe::results::{Payload, TransportKind};
use crate::probe::transport::Connection;

/// The interaction shape an adapter follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Pattern {
    GreetingOnly,
    BinaryHandshake,
    TextCommand,
    Rpc,
    ChallengeResponse,
    Datagram,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub default_port: u16,
    pub transport: TransportKind,
    pub pattern: Pattern,
    pub aliases: &'static [&'static str],
}

#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    fn info(&self) -> AdapterInfo;

    /// Checks protocol-specific parameters before any socket is opened.
    fn validate(&self, _params: &ProbeParams) -> Result<(), ProbeError> {
        Ok(())
    }

    /// Runs the send/parse sequence over an open connection.
    async fn probe(&self, conn: &mut Connection, params: &ProbeParams) -> Result<Payload, ProbeError>;
}

/// Read-only lookup table from protocol id (or alias) to adapter.
pub struct Registry {
    adapters: Vec<Arc<dyn ProtocolAdapter>>,
    index: HashMap<&'static str, usize>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder { adapters: Vec::new() }
    }

    pub fn with_builtin_adapters() -> Self {
        Self::builder()
            .register(legacy::EchoAdapter)
            .register(legacy::DiscardAdapter)
            .register(legacy::DaytimeAdapter)
            .register(legacy::QotdAdapter)
            .register(legacy::ChargenAdapter)
            .register(legacy::TimeAdapter)
            .register(legacy::FingerAdapter)
            .register(legacy::WhoisAdapter)
            .register(legacy::GopherAdapter)
            .register(banner::SshAdapter)
            .register(banner::FtpAdapter)
            .register(banner::SmtpAdapter)
            .register(banner::Pop3Adapter)
            .register(banner::ImapAdapter)
            .register(messaging::MqttAdapter)
            .register(messaging::AmqpAdapter)
            .register(messaging::StompAdapter)
            .register(messaging::NatsAdapter)
            .register(messaging::KafkaAdapter)
            .register(messaging::BeanstalkdAdapter)
            .register(database::RedisAdapter)
            .register(database::MemcachedAdapter)
            .register(database::PostgresAdapter)
            .register(mysql::MysqlAdapter)
            .register(database::CassandraAdapter)
            .register(database::RiakAdapter)
            .register(database::ZookeeperAdapter)
            .register(database::LivestatusAdapter)
            .register(rpc::PortmapperAdapter)
            .register(rpc::NfsAdapter)
            .register(game::SourceAdapter)
            .register(game::MinecraftAdapter)
            .register(streaming::RtmpAdapter)
            .register(streaming::RtspAdapter)
            .register(bitcoin::BitcoinAdapter)
            .register(infra::NtpAdapter)
            .register(infra::DnsAdapter)
            .build()
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ProtocolAdapter>> {
        let key = id.trim().to_ascii_lowercase();
        self.index
            .get(key.as_str())
            .map(|&i| Arc::clone(&self.adapters[i]))
    }

    pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn ProtocolAdapter>> {
        self.adapters.iter()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

pub struct RegistryBuilder {
    adapters: Vec<Arc<dyn ProtocolAdapter>>,
}

impl RegistryBuilder {
    pub fn register<A: ProtocolAdapter + 'static>(mut self, adapter: A) -> Self {
        self.adapters.push(Arc::new(adapter));
        self
    }

    /// Later registrations win on id/alias collisions.
    pub fn build(self) -> Registry {
        let mut index = HashMap::new();
        for (i, adapter) in self.adapters.iter().enumerate() {
            let info = adapter.info();
            index.insert(info.id, i);
            for alias in info.aliases {
                index.insert(*alias, i);
            }
        }
        Registry {
            adapters: self.adapters,
            index,
        }
    }
}

lazy_static::lazy_static! {
    /// Process-wide adapter table, built on first use and never mutated.
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::with_builtin_adapters());
}

/// Parses a numeric reply line such as `220 ready` or `250-SIZE 1000`.
/// Returns the code, whether more lines follow, and the text.
pub(crate) fn split_reply_line(line: &str) -> Option<(u16, bool, &str)> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let code = line[..3].parse().ok()?;
    match bytes.get(3) {
        None => Some((code, false, "")),
        Some(b'-') => Some((code, true, &line[4..])),
        Some(b' ') => Some((code, false, &line[4..])),
        _ => None,
    }
}

/// Reads an FTP/SMTP style reply, following `ddd-` continuation lines.
pub(crate) async fn read_numeric_reply(conn: &mut Connection) -> Result<(u16, Vec<String>), ProbeError> {
    let mut lines = Vec::new();
    for _ in 0..256 {
        let line = conn.read_line(4096).await?;
        let (code, more, text) = match split_reply_line(&line) {
            Some(parts) => parts,
            // Continuation lines of some FTP servers carry no code at all.
            None if !lines.is_empty() => {
                lines.push(line.trim().to_string());
                continue;
            }
            None => return Err(ProbeError::mismatch(format!("expected numeric reply, got {:?}", line))),
        };
        lines.push(text.to_string());
        if !more {
            return Ok((code, lines));
        }
    }
    Err(ProbeError::mismatch("reply has too many continuation lines"))
}
