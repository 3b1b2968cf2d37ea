//! Deadline-bound TCP/UDP connections.
//!
//! A [`Connection`] is created per probe and dropped when the probe ends; the
//! socket closes with it. Every blocking call is wrapped in
//! `tokio::time::timeout_at` against the probe's single deadline.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::probe::error::ProbeError;
use crate::probe::results::{ProbeStage, TransportKind};
use crate::probe::trace::ProbeTrace;

const READ_CHUNK: usize = 8192;
const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug, Clone, Copy)]
pub struct IoLimits {
    /// Total bytes a single probe may buffer from the peer.
    pub max_response_bytes: usize,
}

impl Default for IoLimits {
    fn default() -> Self {
        Self {
            max_response_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug)]
enum Socket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

#[derive(Debug)]
pub struct Connection {
    socket: Socket,
    host: String,
    peer: SocketAddr,
    deadline: Instant,
    buffer: BytesMut,
    received_total: usize,
    eof: bool,
    limits: IoLimits,
    trace: Arc<ProbeTrace>,
    exchange_started: Instant,
}

/// Resolves `host` and opens a socket of the requested kind, all within `deadline`.
pub async fn open(
    host: &str,
    port: u16,
    kind: TransportKind,
    deadline: Instant,
    limits: IoLimits,
    trace: Arc<ProbeTrace>,
) -> Result<Connection, ProbeError> {
    let started = Instant::now();
    let addrs: Vec<SocketAddr> = with_deadline(deadline, lookup_host((host, port)))
        .await?
        .map_err(|e| ProbeError::Dns {
            host: host.to_string(),
            reason: e.to_string(),
        })?
        .collect();

    if addrs.is_empty() {
        return Err(ProbeError::Dns {
            host: host.to_string(),
            reason: "no addresses returned".to_string(),
        });
    }

    let (socket, peer) = match kind {
        TransportKind::Tcp => connect_tcp(&addrs, deadline).await?,
        TransportKind::Udp => connect_udp(addrs[0], deadline).await?,
    };

    let elapsed = started.elapsed();
    trace.record_connect(elapsed);
    debug!(%peer, %kind, elapsed_ms = elapsed.as_millis() as u64, "connected");

    Ok(Connection {
        socket,
        host: host.to_string(),
        peer,
        deadline,
        buffer: BytesMut::with_capacity(READ_CHUNK),
        received_total: 0,
        eof: false,
        limits,
        trace,
        exchange_started: Instant::now(),
    })
}

async fn connect_tcp(addrs: &[SocketAddr], deadline: Instant) -> Result<(Socket, SocketAddr), ProbeError> {
    let mut last_err: Option<(SocketAddr, io::Error)> = None;

    // One socket at a time: a failed attempt is dropped before the next.
    for &addr in addrs {
        match with_deadline(deadline, TcpStream::connect(addr)).await? {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok((Socket::Tcp(stream), addr));
            }
            Err(e) => {
                debug!(%addr, error = %e, "connect attempt failed");
                last_err = Some((addr, e));
            }
        }
    }

    match last_err {
        Some((addr, e)) => Err(classify_connect_error(addr, e)),
        None => Err(ProbeError::Transport("no address to connect to".to_string())),
    }
}

async fn connect_udp(addr: SocketAddr, deadline: Instant) -> Result<(Socket, SocketAddr), ProbeError> {
    let local: SocketAddr = match addr.ip() {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = with_deadline(deadline, UdpSocket::bind(local))
        .await?
        .map_err(|e| ProbeError::Transport(format!("bind failed: {}", e)))?;
    // A connected UDP socket surfaces ICMP port-unreachable as ECONNREFUSED.
    with_deadline(deadline, socket.connect(addr))
        .await?
        .map_err(|e| classify_connect_error(addr, e))?;
    Ok((Socket::Udp(socket), addr))
}

fn classify_connect_error(addr: SocketAddr, err: io::Error) -> ProbeError {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => ProbeError::ConnectionRefused {
            addr: addr.to_string(),
        },
        io::ErrorKind::TimedOut => ProbeError::Timeout,
        _ => ProbeError::Transport(format!("{}: {}", addr, err)),
    }
}

/// Post-connect I/O errors. A peer that resets or vanishes mid-exchange is
/// reachable but not speaking the expected protocol.
fn classify_io_error(err: io::Error) -> ProbeError {
    match err.kind() {
        io::ErrorKind::TimedOut => ProbeError::Timeout,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => ProbeError::mismatch(format!("connection closed by peer ({})", err)),
        io::ErrorKind::ConnectionRefused => ProbeError::ConnectionRefused {
            addr: "peer".to_string(),
        },
        _ => ProbeError::Transport(err.to_string()),
    }
}

async fn with_deadline<F: Future>(deadline: Instant, fut: F) -> Result<F::Output, ProbeError> {
    if Instant::now() >= deadline {
        return Err(ProbeError::Timeout);
    }
    timeout_at(deadline, fut).await.map_err(|_| ProbeError::Timeout)
}

impl Connection {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn kind(&self) -> TransportKind {
        match self.socket {
            Socket::Tcp(_) => TransportKind::Tcp,
            Socket::Udp(_) => TransportKind::Udp,
        }
    }

    /// Marks progress into a later stage of the state machine.
    pub fn enter(&self, stage: ProbeStage) {
        self.trace.enter(stage);
    }

    /// Bytes already buffered but not yet consumed by a read call.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<(), ProbeError> {
        let deadline = self.deadline;
        match &mut self.socket {
            Socket::Tcp(stream) => {
                with_deadline(deadline, stream.write_all(data))
                    .await?
                    .map_err(classify_io_error)?;
                with_deadline(deadline, stream.flush())
                    .await?
                    .map_err(classify_io_error)?;
            }
            Socket::Udp(socket) => {
                let sent = with_deadline(deadline, socket.send(data))
                    .await?
                    .map_err(classify_io_error)?;
                if sent != data.len() {
                    return Err(ProbeError::Transport(format!(
                        "datagram truncated on send ({} of {} bytes)",
                        sent,
                        data.len()
                    )));
                }
            }
        }
        self.trace.record_sent(data.len());
        if !self.trace.has_rtt() {
            self.exchange_started = Instant::now();
        }
        debug!(bytes = data.len(), "sent");
        Ok(())
    }

    /// Pulls more bytes into the buffer. Returns 0 at end of stream.
    async fn fill(&mut self) -> Result<usize, ProbeError> {
        if self.eof {
            return Ok(0);
        }
        let deadline = self.deadline;
        let n = match &mut self.socket {
            Socket::Tcp(stream) => {
                self.buffer.reserve(READ_CHUNK);
                with_deadline(deadline, stream.read_buf(&mut self.buffer))
                    .await?
                    .map_err(classify_io_error)?
            }
            Socket::Udp(socket) => {
                let mut datagram = vec![0u8; MAX_DATAGRAM];
                let n = with_deadline(deadline, socket.recv(&mut datagram))
                    .await?
                    .map_err(classify_io_error)?;
                self.buffer.extend_from_slice(&datagram[..n]);
                n
            }
        };

        if n == 0 {
            self.eof = true;
            return Ok(0);
        }

        let start = self.buffer.len() - n;
        self.trace.record_received(&self.buffer[start..]);
        self.trace.record_rtt(self.exchange_started.elapsed());
        self.received_total += n;
        if self.received_total > self.limits.max_response_bytes {
            return Err(ProbeError::mismatch(format!(
                "response exceeded {} bytes",
                self.limits.max_response_bytes
            )));
        }
        Ok(n)
    }

    fn closed_early(&self, expecting: &str) -> ProbeError {
        ProbeError::mismatch(format!(
            "connection closed by peer while waiting for {} ({} bytes buffered)",
            expecting,
            self.buffer.len()
        ))
    }

    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, ProbeError> {
        if n > self.limits.max_response_bytes {
            return Err(ProbeError::malformed("declared length exceeds response limit"));
        }
        while self.buffer.len() < n {
            if self.fill().await? == 0 {
                return Err(self.closed_early(&format!("{} bytes", n)));
            }
        }
        Ok(self.buffer.split_to(n).to_vec())
    }

    /// Reads through `delim` (inclusive). Fails when `cap` bytes pass without it.
    pub async fn read_until(&mut self, delim: &[u8], cap: usize) -> Result<Vec<u8>, ProbeError> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = find(&self.buffer[scanned..], delim) {
                let end = scanned + pos + delim.len();
                if end > cap {
                    return Err(no_terminator(delim, cap));
                }
                return Ok(self.buffer.split_to(end).to_vec());
            }
            if self.buffer.len() >= cap {
                return Err(no_terminator(delim, cap));
            }
            scanned = self.buffer.len().saturating_sub(delim.len() - 1);
            if self.fill().await? == 0 {
                return Err(self.closed_early("a terminator"));
            }
        }
    }

    /// One line without its CRLF/LF, decoded lossily.
    pub async fn read_line(&mut self, cap: usize) -> Result<String, ProbeError> {
        let line = self.read_until(b"\n", cap).await?;
        Ok(String::from_utf8_lossy(crate::probe::codec::trim_line(&line)).into_owned())
    }

    /// Reads until the peer closes or `cap` bytes are buffered.
    pub async fn read_to_close(&mut self, cap: usize) -> Result<Vec<u8>, ProbeError> {
        while self.buffer.len() < cap {
            if self.fill().await? == 0 {
                break;
            }
        }
        let n = self.buffer.len().min(cap);
        Ok(self.buffer.split_to(n).to_vec())
    }

    /// Reads through the first LF, or whatever arrived before the peer
    /// closed. At most `cap` bytes are returned.
    pub async fn read_line_or_close(&mut self, cap: usize) -> Result<Vec<u8>, ProbeError> {
        loop {
            let window = self.buffer.len().min(cap);
            if let Some(pos) = find(&self.buffer[..window], b"\n") {
                return Ok(self.buffer.split_to(pos + 1).to_vec());
            }
            if self.buffer.len() >= cap || self.fill().await? == 0 {
                let n = self.buffer.len().min(cap);
                return Ok(self.buffer.split_to(n).to_vec());
            }
        }
    }

    /// Waits for at least `min` bytes and returns up to `cap` of what is buffered.
    pub async fn read_at_least(&mut self, min: usize, cap: usize) -> Result<Vec<u8>, ProbeError> {
        while self.buffer.len() < min {
            if self.fill().await? == 0 {
                return Err(self.closed_early(&format!("at least {} bytes", min)));
            }
        }
        let n = self.buffer.len().min(cap.max(min));
        Ok(self.buffer.split_to(n).to_vec())
    }

    /// Receives one datagram (UDP) or one read's worth of bytes (TCP).
    pub async fn recv_datagram(&mut self) -> Result<Vec<u8>, ProbeError> {
        if self.buffer.is_empty() && self.fill().await? == 0 {
            return Err(self.closed_early("a datagram"));
        }
        Ok(self.buffer.split().to_vec())
    }

    /// Succeeds when the peer stays silent for `window` (capped by the deadline).
    pub async fn expect_silence(&mut self, window: Duration) -> Result<(), ProbeError> {
        if !self.buffer.is_empty() {
            return Err(ProbeError::mismatch("peer sent unexpected data"));
        }
        let until = std::cmp::min(Instant::now() + window, self.deadline);
        let saved = self.deadline;
        self.deadline = until;
        let outcome = self.fill().await;
        self.deadline = saved;
        match outcome {
            Err(ProbeError::Timeout) => Ok(()),
            Ok(0) => Err(self.closed_early("more input")),
            Ok(n) => Err(ProbeError::mismatch(format!("peer sent {} unexpected bytes", n))),
            Err(e) => Err(e),
        }
    }

    /// Best-effort graceful close; errors are irrelevant once the probe has its answer.
    pub async fn shutdown(mut self) {
        if let Socket::Tcp(stream) = &mut self.socket {
            let grace = std::cmp::min(self.deadline, Instant::now() + Duration::from_millis(50));
            let _ = timeout_at(grace, stream.shutdown()).await;
        }
    }
}

fn no_terminator(delim: &[u8], cap: usize) -> ProbeError {
    ProbeError::mismatch(format!(
        "no {:?} terminator within {} bytes",
        String::from_utf8_lossy(delim),
        cap
    ))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn trace() -> Arc<ProbeTrace> {
        Arc::new(ProbeTrace::new(256))
    }

    async fn server(reply: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(reply).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_mixed_reads_share_buffer() {
        let addr = server(b"+OK ready\r\n\x00\x01\x02\x03tail").await;
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut conn = open("127.0.0.1", addr.port(), TransportKind::Tcp, deadline, IoLimits::default(), trace())
            .await
            .unwrap();
        assert_eq!(conn.read_line(64).await.unwrap(), "+OK ready");
        assert_eq!(conn.read_exact(4).await.unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(conn.read_to_close(64).await.unwrap(), b"tail");
    }

    #[tokio::test]
    async fn test_early_close_is_mismatch() {
        let addr = server(b"ab").await;
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut conn = open("127.0.0.1", addr.port(), TransportKind::Tcp, deadline, IoLimits::default(), trace())
            .await
            .unwrap();
        let err = conn.read_exact(8).await.unwrap_err();
        assert!(matches!(err, ProbeError::ProtocolMismatch(_)));
    }

    #[tokio::test]
    async fn test_read_until_respects_cap() {
        let addr = server(b"no newline in here at all").await;
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut conn = open("127.0.0.1", addr.port(), TransportKind::Tcp, deadline, IoLimits::default(), trace())
            .await
            .unwrap();
        assert!(conn.read_until(b"\n", 8).await.is_err());
    }

    #[tokio::test]
    async fn test_read_until_rejects_line_longer_than_cap() {
        let addr = server(b"abcdefghijklmnop\r\nnext\r\n").await;
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut conn = open("127.0.0.1", addr.port(), TransportKind::Tcp, deadline, IoLimits::default(), trace())
            .await
            .unwrap();
        let err = conn.read_until(b"\n", 8).await.unwrap_err();
        assert!(matches!(err, ProbeError::ProtocolMismatch(_)));
    }

    #[tokio::test]
    async fn test_read_line_or_close() {
        let addr = server(b"Monday\r\nrest").await;
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut conn = open("127.0.0.1", addr.port(), TransportKind::Tcp, deadline, IoLimits::default(), trace())
            .await
            .unwrap();
        assert_eq!(conn.read_line_or_close(64).await.unwrap(), b"Monday\r\n");
        // No terminator before close: whatever arrived is returned.
        assert_eq!(conn.read_line_or_close(64).await.unwrap(), b"rest");
        assert!(conn.read_line_or_close(64).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let deadline = Instant::now() + Duration::from_secs(2);
        let err = open("127.0.0.1", port, TransportKind::Tcp, deadline, IoLimits::default(), trace())
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::ConnectionRefused { .. }));
    }

    #[test]
    fn test_find() {
        assert_eq!(find(b"abc\r\n\r\n", b"\r\n\r\n"), Some(3));
        assert_eq!(find(b"ab", b"abc"), None);
    }
}
