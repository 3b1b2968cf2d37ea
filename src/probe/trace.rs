// Shared per-probe bookkeeping. The orchestrator keeps one handle and the
// connection keeps another, so stage, byte counts and the received-bytes
// transcript survive an aborted probe task.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::probe::results::ProbeStage;

const UNSET: u64 = u64::MAX;

#[derive(Debug)]
pub struct ProbeTrace {
    stage: AtomicU8,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    connect_us: AtomicU64,
    rtt_us: AtomicU64,
    transcript: Mutex<Vec<u8>>,
    capture_limit: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceSnapshot {
    pub stage: ProbeStage,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connect_time: Option<Duration>,
    pub rtt: Option<Duration>,
    pub transcript: Vec<u8>,
}

impl ProbeTrace {
    pub fn new(capture_limit: usize) -> Self {
        Self {
            stage: AtomicU8::new(ProbeStage::Idle as u8),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            connect_us: AtomicU64::new(UNSET),
            rtt_us: AtomicU64::new(UNSET),
            transcript: Mutex::new(Vec::new()),
            capture_limit,
        }
    }

    pub fn enter(&self, stage: ProbeStage) {
        self.stage.store(stage as u8, Ordering::Release);
    }

    pub fn stage(&self) -> ProbeStage {
        ProbeStage::from_u8(self.stage.load(Ordering::Acquire))
    }

    pub fn record_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, data: &[u8]) {
        self.bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        if let Ok(mut transcript) = self.transcript.lock() {
            let room = self.capture_limit.saturating_sub(transcript.len());
            let n = room.min(data.len());
            transcript.extend_from_slice(&data[..n]);
        }
    }

    pub fn record_connect(&self, elapsed: Duration) {
        self.connect_us
            .store(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Only the first exchange counts as the round-trip sample.
    pub fn record_rtt(&self, elapsed: Duration) {
        let _ = self.rtt_us.compare_exchange(
            UNSET,
            elapsed.as_micros() as u64,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    pub fn has_rtt(&self) -> bool {
        self.rtt_us.load(Ordering::Relaxed) != UNSET
    }

    pub fn snapshot(&self) -> TraceSnapshot {
        let micros = |v: u64| (v != UNSET).then(|| Duration::from_micros(v));
        TraceSnapshot {
            stage: self.stage(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            connect_time: micros(self.connect_us.load(Ordering::Relaxed)),
            rtt: micros(self.rtt_us.load(Ordering::Relaxed)),
            transcript: self
                .transcript
                .lock()
                .map(|t| t.clone())
                .unwrap_or_default(),
        }
    }
}
