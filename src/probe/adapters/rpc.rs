// ONC-RPC (RFC 5531) over TCP record marking: portmapper DUMP and NFS NULL.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use serde::Serialize;
use serde_json::Value;

use super::{AdapterInfo, Pattern, ProtocolAdapter};
use crate::probe::codec::Reader;
use crate::probe::error::ProbeError;
use crate::probe::request::ProbeParams;
use crate::probe::results::{Payload, TransportKind};
use crate::probe::transport::Connection;

pub const PORTMAPPER_PROGRAM: u32 = 100_000;
pub const NFS_PROGRAM: u32 = 100_003;
const PMAPPROC_DUMP: u32 = 4;
const LAST_FRAGMENT: u32 = 0x8000_0000;
const MAX_RECORD: usize = 1024 * 1024;

pub fn program_name(program: u32) -> &'static str {
    match program {
        100_000 => "portmapper",
        100_001 => "rstatd",
        100_002 => "rusersd",
        100_003 => "nfs",
        100_004 => "ypserv",
        100_005 => "mountd",
        100_007 => "ypbind",
        100_008 => "walld",
        100_009 => "yppasswdd",
        100_011 => "rquotad",
        100_021 => "nlockmgr",
        100_024 => "status",
        100_083 => "ttdbserverd",
        100_227 => "nfs_acl",
        150_001 => "pcnfsd",
        391_002 => "sgi_fam",
        _ => "unknown",
    }
}

/// A CALL with AUTH_NONE credentials, wrapped in a single last-fragment record.
pub fn build_rpc_call(xid: u32, program: u32, version: u32, procedure: u32, args: &[u8]) -> Vec<u8> {
    let mut msg = BytesMut::with_capacity(44 + args.len());
    msg.put_u32(xid);
    msg.put_u32(0); // CALL
    msg.put_u32(2); // RPC version
    msg.put_u32(program);
    msg.put_u32(version);
    msg.put_u32(procedure);
    msg.put_u64(0); // cred: AUTH_NONE, empty body
    msg.put_u64(0); // verf
    msg.extend_from_slice(args);

    let mut record = BytesMut::with_capacity(msg.len() + 4);
    record.put_u32(LAST_FRAGMENT | msg.len() as u32);
    record.extend_from_slice(&msg);
    record.to_vec()
}

async fn read_record(conn: &mut Connection) -> Result<Vec<u8>, ProbeError> {
    let mut record = Vec::new();
    loop {
        let marker = Reader::new(&conn.read_exact(4).await?).u32_be()?;
        let len = (marker & !LAST_FRAGMENT) as usize;
        if record.len() + len > MAX_RECORD {
            return Err(ProbeError::mismatch(format!("implausible RPC fragment length {}", len)));
        }
        record.extend_from_slice(&conn.read_exact(len).await?);
        if marker & LAST_FRAGMENT != 0 {
            return Ok(record);
        }
    }
}

/// Validates a REPLY and returns the procedure results that follow it.
pub fn parse_rpc_reply(xid: u32, msg: &[u8]) -> Result<&[u8], ProbeError> {
    let mut r = Reader::new(msg);
    let got = r.xdr_u32()?;
    if got != xid {
        return Err(ProbeError::mismatch(format!("RPC xid mismatch: sent {:#x}, got {:#x}", xid, got)));
    }
    if r.xdr_u32()? != 1 {
        return Err(ProbeError::mismatch("RPC message is not a REPLY"));
    }
    match r.xdr_u32()? {
        0 => {}
        1 => {
            return Err(match r.xdr_u32()? {
                0 => {
                    let (low, high) = (r.xdr_u32()?, r.xdr_u32()?);
                    ProbeError::ServiceError(format!("RPC version mismatch (server supports {}-{})", low, high))
                }
                _ => ProbeError::AuthRequired(format!("RPC call denied with auth_stat {}", r.xdr_u32()?)),
            })
        }
        _ => return Err(ProbeError::mismatch("invalid RPC reply_stat")),
    }

    let _verf_flavor = r.xdr_u32()?;
    r.xdr_opaque()?;
    match r.xdr_u32()? {
        0 => Ok(r.rest()),
        1 => Err(ProbeError::ServiceError("program unavailable".to_string())),
        2 => {
            let (low, high) = (r.xdr_u32()?, r.xdr_u32()?);
            Err(ProbeError::ServiceError(format!(
                "program version mismatch (server supports {}-{})",
                low, high
            )))
        }
        3 => Err(ProbeError::ServiceError("procedure unavailable".to_string())),
        4 => Err(ProbeError::ServiceError("server could not decode arguments".to_string())),
        5 => Err(ProbeError::ServiceError("system error".to_string())),
        _ => Err(ProbeError::mismatch("invalid RPC accept_stat")),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mapping {
    pub program: u32,
    pub name: &'static str,
    pub version: u32,
    pub protocol: String,
    pub port: u32,
}

/// Decodes the `pmaplist` linked list returned by PMAPPROC_DUMP.
pub fn parse_dump(results: &[u8]) -> Result<Vec<Mapping>, ProbeError> {
    let mut r = Reader::new(results);
    let mut mappings = Vec::new();
    while r.xdr_bool()? {
        let program = r.xdr_u32()?;
        let version = r.xdr_u32()?;
        let protocol = match r.xdr_u32()? {
            6 => "tcp".to_string(),
            17 => "udp".to_string(),
            other => other.to_string(),
        };
        let port = r.xdr_u32()?;
        mappings.push(Mapping {
            program,
            name: program_name(program),
            version,
            protocol,
            port,
        });
        if mappings.len() > 4096 {
            return Err(ProbeError::malformed("portmapper list too long"));
        }
    }
    Ok(mappings)
}

async fn call(conn: &mut Connection, program: u32, version: u32, procedure: u32) -> Result<Vec<u8>, ProbeError> {
    let xid = rand::random::<u32>();
    conn.send(&build_rpc_call(xid, program, version, procedure, &[])).await?;
    let record = read_record(conn).await?;
    Ok(parse_rpc_reply(xid, &record)?.to_vec())
}

pub struct PortmapperAdapter;

#[async_trait]
impl ProtocolAdapter for PortmapperAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "portmapper",
            name: "ONC-RPC portmapper",
            default_port: 111,
            transport: TransportKind::Tcp,
            pattern: Pattern::Rpc,
            aliases: &["rpcbind", "portmap", "sunrpc"],
        }
    }

    async fn probe(&self, conn: &mut Connection, _params: &ProbeParams) -> Result<Payload, ProbeError> {
        let results = call(conn, PORTMAPPER_PROGRAM, 2, PMAPPROC_DUMP).await?;
        let mappings = parse_dump(&results)?;

        let mut services: Vec<&str> = mappings.iter().map(|m| m.name).collect();
        services.sort_unstable();
        services.dedup();

        Ok(Payload::new()
            .with("count", mappings.len())
            .with("services", services)
            .with("mappings", serde_json::to_value(&mappings).unwrap_or(Value::Null)))
    }
}

pub struct NfsAdapter;

#[async_trait]
impl ProtocolAdapter for NfsAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "nfs",
            name: "Network File System",
            default_port: 2049,
            transport: TransportKind::Tcp,
            pattern: Pattern::Rpc,
            aliases: &[],
        }
    }

    fn validate(&self, params: &ProbeParams) -> Result<(), ProbeError> {
        match params.parse::<u32>("version")? {
            None | Some(2..=4) => Ok(()),
            Some(v) => Err(ProbeError::InvalidRequest(format!("NFS version {} is not 2, 3 or 4", v))),
        }
    }

    async fn probe(&self, conn: &mut Connection, params: &ProbeParams) -> Result<Payload, ProbeError> {
        let version = params.parse::<u32>("version")?.unwrap_or(3);
        call(conn, NFS_PROGRAM, version, 0).await?;
        Ok(Payload::new()
            .with("program", NFS_PROGRAM)
            .with("version", version)
            .with("nullCall", true))
    }
}
