pub mod adapters;
pub mod codec;
pub mod error;
pub mod normalizer;
pub mod request;
pub mod results;
pub mod trace;
pub mod transport;

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use indicatif::ProgressBar;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::ProbeConfig;
use adapters::{AdapterInfo, ProtocolAdapter, Registry, REGISTRY};
use normalizer::{normalize, ProbeContext};
use trace::ProbeTrace;
use transport::IoLimits;

pub use error::{CodecError, ErrorKind, ProbeError};
pub use request::{ProbeParams, ProbeRequest, RequestError};
pub use results::{Interception, Payload, ProbeFailure, ProbeResult, ProbeStage, TransportKind};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("probe queue is full ({pending} pending, limit {limit})")]
    Saturated { pending: usize, limit: usize },
}

struct Inner {
    registry: Arc<Registry>,
    config: ProbeConfig,
    permits: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
}

/// Runs probes against the adapter registry with bounded concurrency.
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct Prober {
    inner: Arc<Inner>,
}

/// Releases a pending slot when the task that holds it ends, however it ends.
struct PendingSlot(Arc<AtomicUsize>);

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A submitted probe. Awaiting it always yields a result.
pub struct ProbeHandle {
    context: ProbeContext,
    handle: JoinHandle<ProbeResult>,
}

impl ProbeHandle {
    pub async fn join(self) -> ProbeResult {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => {
                let mut context = self.context;
                context.elapsed = (Utc::now() - context.started_at).to_std().unwrap_or_default();
                normalize(
                    context,
                    Err(ProbeError::AdapterFault(format!("probe task ended abnormally: {}", e))),
                    ProbeTrace::new(0).snapshot(),
                )
            }
        }
    }
}

impl Prober {
    pub fn new(config: ProbeConfig) -> Self {
        Self::with_registry(Arc::clone(&REGISTRY), config)
    }

    pub fn with_registry(registry: Arc<Registry>, config: ProbeConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_probes.max(1)));
        Self {
            inner: Arc::new(Inner {
                registry,
                config,
                permits,
                pending: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Probes submitted but not yet finished.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Runs one probe to completion. Waits for a concurrency permit but does
    /// not count against the pending bound.
    pub async fn probe(&self, request: ProbeRequest) -> ProbeResult {
        let _permit = Arc::clone(&self.inner.permits).acquire_owned().await.ok();
        self.execute(request).await
    }

    /// Queues a probe on the pool. Fails fast once `max_pending_probes`
    /// probes are queued or running.
    pub fn submit(&self, request: ProbeRequest) -> Result<ProbeHandle, SubmitError> {
        self.try_submit(request).map_err(|(e, _)| e)
    }

    fn try_submit(&self, request: ProbeRequest) -> Result<ProbeHandle, (SubmitError, ProbeRequest)> {
        let limit = self.inner.config.max_pending_probes;
        if let Err(pending) = self
            .inner
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then(|| n + 1))
        {
            return Err((SubmitError::Saturated { pending, limit }, request));
        }
        let slot = PendingSlot(Arc::clone(&self.inner.pending));

        let context = self.context_for(&request, Utc::now());
        let prober = self.clone();
        let handle = tokio::spawn(async move {
            let _slot = slot;
            prober.probe(request).await
        });
        Ok(ProbeHandle { context, handle })
    }

    /// Runs every request through the pool and returns results in request
    /// order. When the queue is full the oldest in-flight probe is awaited
    /// before more work is submitted.
    pub async fn probe_all(&self, requests: Vec<ProbeRequest>, progress: Option<&ProgressBar>) -> Vec<ProbeResult> {
        let mut results = Vec::with_capacity(requests.len());
        let mut in_flight: VecDeque<ProbeHandle> = VecDeque::new();

        for request in requests {
            let mut request = request;
            loop {
                match self.try_submit(request) {
                    Ok(handle) => {
                        in_flight.push_back(handle);
                        break;
                    }
                    Err((SubmitError::Saturated { pending, .. }, rejected)) => {
                        debug!(pending, "queue saturated, waiting for oldest probe");
                        request = rejected;
                        match in_flight.pop_front() {
                            Some(oldest) => {
                                results.push(oldest.join().await);
                                if let Some(pb) = progress {
                                    pb.inc(1);
                                }
                            }
                            // Slots are held by another caller sharing this pool.
                            None => tokio::time::sleep(Duration::from_millis(5)).await,
                        }
                    }
                }
            }
        }

        let rest = join_all(in_flight.into_iter().map(|handle| async move {
            let result = handle.join().await;
            if let Some(pb) = progress {
                pb.inc(1);
            }
            result
        }))
        .await;
        results.extend(rest);
        results
    }

    fn context_for(&self, request: &ProbeRequest, started_at: chrono::DateTime<Utc>) -> ProbeContext {
        let adapter = self.inner.registry.get(request.protocol());
        ProbeContext {
            protocol: adapter
                .as_ref()
                .map(|a| a.info().id.to_string())
                .unwrap_or_else(|| request.protocol().to_string()),
            host: request.host().to_string(),
            port: request.port(),
            transport: adapter.map(|a| a.info().transport).unwrap_or(TransportKind::Tcp),
            started_at,
            elapsed: Duration::ZERO,
            raw_diagnostics: request.raw_diagnostics() || self.inner.config.raw_diagnostics,
        }
    }

    async fn execute(&self, request: ProbeRequest) -> ProbeResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let deadline = clock + request.timeout();
        let trace = Arc::new(ProbeTrace::new(self.inner.config.raw_capture_bytes));
        let mut context = self.context_for(&request, started_at);

        let outcome = match self.inner.registry.get(request.protocol()) {
            None => Err(ProbeError::InvalidRequest(format!("unknown protocol '{}'", request.protocol()))),
            Some(adapter) => match adapter.validate(request.params()) {
                Ok(()) => self.drive(adapter, &request, deadline, Arc::clone(&trace)).await,
                Err(e) => Err(e),
            },
        };

        context.elapsed = clock.elapsed();
        let result = normalize(context, outcome, trace.snapshot());
        match &result.error {
            None => info!(
                protocol = %result.protocol,
                host = %result.host,
                port = result.port,
                elapsed_ms = result.elapsed_ms,
                "probe completed"
            ),
            Some(failure) => info!(
                protocol = %result.protocol,
                host = %result.host,
                port = result.port,
                kind = %failure.kind,
                stage = %failure.stage,
                "probe failed: {}",
                failure.message
            ),
        }
        result
    }

    /// Runs the adapter in its own task so a panic or an overrun deadline
    /// cannot take the caller down with it.
    async fn drive(
        &self,
        adapter: Arc<dyn ProtocolAdapter>,
        request: &ProbeRequest,
        deadline: Instant,
        trace: Arc<ProbeTrace>,
    ) -> Result<Payload, ProbeError> {
        let AdapterInfo { id, transport: kind, .. } = adapter.info();
        let limits = IoLimits {
            max_response_bytes: self.inner.config.max_response_bytes,
        };
        let host = request.host().to_string();
        let port = request.port();
        let params = request.params().clone();
        let task_trace = Arc::clone(&trace);

        let mut task = tokio::spawn(async move {
            task_trace.enter(ProbeStage::Connecting);
            let mut conn = transport::open(&host, port, kind, deadline, limits, task_trace).await?;
            conn.enter(ProbeStage::Handshaking);
            let payload = adapter.probe(&mut conn, &params).await?;
            conn.shutdown().await;
            Ok::<Payload, ProbeError>(payload)
        });

        match timeout_at(deadline, &mut task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                warn!(protocol = id, stage = %trace.stage(), "adapter panicked: {}", message);
                Err(ProbeError::AdapterFault(message))
            }
            Ok(Err(e)) => Err(ProbeError::AdapterFault(e.to_string())),
            Err(_) => {
                task.abort();
                debug!(protocol = id, stage = %trace.stage(), "deadline elapsed, probe task aborted");
                Err(ProbeError::Timeout)
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "adapter panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn small_pool(concurrent: usize, pending: usize) -> Prober {
        Prober::new(ProbeConfig {
            max_concurrent_probes: concurrent,
            max_pending_probes: pending,
            ..ProbeConfig::default()
        })
    }

    /// Accepts connections and never writes.
    async fn silent_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        });
        port
    }

    #[tokio::test]
    async fn test_unknown_protocol_is_invalid_request() {
        let result = Prober::new(ProbeConfig::default())
            .probe(ProbeRequest::new("carrier-pigeon", "127.0.0.1", 1, 100).unwrap())
            .await;
        assert!(!result.success);
        assert_eq!(result.protocol, "carrier-pigeon");
        let error = result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::InvalidRequest);
        assert_eq!(error.stage, ProbeStage::Idle);
    }

    #[tokio::test]
    async fn test_parameter_rejection_happens_before_connect() {
        let request = ProbeRequest::new("zookeeper", "127.0.0.1", 1, 100)
            .unwrap()
            .with_param("command", "kill");
        let result = Prober::new(ProbeConfig::default()).probe(request).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::InvalidRequest));
        assert_eq!(result.bytes_sent, 0);
        assert!(result.connect_ms.is_none());
    }

    #[tokio::test]
    async fn test_alias_resolves_to_canonical_id() {
        let port = silent_server().await;
        let result = Prober::new(ProbeConfig::default())
            .probe(ProbeRequest::new("PostgreSQL", "127.0.0.1", port, 50).unwrap())
            .await;
        assert_eq!(result.protocol, "postgres");
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_submit_rejects_when_saturated() {
        let port = silent_server().await;
        let prober = small_pool(1, 1);
        let request = || ProbeRequest::new("redis", "127.0.0.1", port, 300).unwrap();

        let first = prober.submit(request()).unwrap();
        assert_eq!(prober.pending(), 1);
        assert_eq!(
            prober.submit(request()).err(),
            Some(SubmitError::Saturated { pending: 1, limit: 1 })
        );

        assert_eq!(first.join().await.error_kind(), Some(ErrorKind::Timeout));
        assert_eq!(prober.pending(), 0);
        assert!(prober.submit(request()).is_ok());
    }

    #[tokio::test]
    async fn test_probe_all_keeps_request_order() {
        let port = silent_server().await;
        let prober = small_pool(2, 2);
        let requests: Vec<ProbeRequest> = ["redis", "nope", "memcached", "beanstalkd", "mqtt"]
            .iter()
            .map(|p| ProbeRequest::new(p, "127.0.0.1", port, 40).unwrap())
            .collect();

        let results = prober.probe_all(requests, None).await;
        let protocols: Vec<&str> = results.iter().map(|r| r.protocol.as_str()).collect();
        assert_eq!(protocols, ["redis", "nope", "memcached", "beanstalkd", "mqtt"]);
        assert_eq!(results[1].error_kind(), Some(ErrorKind::InvalidRequest));
        assert!(results.iter().all(|r| !r.success));
        assert_eq!(prober.pending(), 0);
    }

    #[test]
    fn test_panic_message_downcasts() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7u8)), "adapter panicked");
    }
}
