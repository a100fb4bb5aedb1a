use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};

use crate::error::{DispatchError, StorageError};
use crate::ingest::IncomingWebhook;
use crate::registry::HandlerRegistry;
use crate::retry::RetryPolicy;
use crate::storage::{update_tracking, HitStore};
use crate::types::{CorrelationId, HitId, Job, JobResult, JobStatus, NormalizedPayload};
use crate::worker::{worker_loop, RetryRequest, WorkerContext};

pub(crate) const INTERRUPTED: &str = "Interrupted before completion";

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub worker_count: usize,
    pub queue_size: usize,
    pub retry: RetryPolicy,
    pub job_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_size: 1_024,
            retry: RetryPolicy::default(),
            job_timeout: Duration::from_secs(60),
        }
    }
}

/// What the ingestion endpoint reports back to the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReceipt {
    pub id: HitId,
    /// `None` when the hit was recorded but could not be enqueued; it stays
    /// `queued` until the next recovery sweep.
    pub correlation_id: Option<CorrelationId>,
}

/// Summary of a startup sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub interrupted: usize,
}

/// Records hits, assigns correlation ids and feeds the worker pool.
pub struct Dispatcher {
    ready_tx: Mutex<Option<mpsc::Sender<Job>>>,
    is_running: Arc<AtomicBool>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    scheduler_handle: Mutex<Option<JoinHandle<()>>>,
    notify: Arc<Notify>,
    ctx: Arc<WorkerContext>,
    next_driver_id: AtomicU64,
}

impl Dispatcher {
    /// Spawn workers and the retry scheduler. Must be called inside a Tokio
    /// runtime.
    pub fn new(config: DispatcherConfig, store: Arc<dyn HitStore>, registry: HandlerRegistry) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(config.queue_size.max(1));
        let shared_ready_rx = Arc::new(Mutex::new(ready_rx));
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();

        let ctx = Arc::new(WorkerContext {
            store,
            registry,
            retry: config.retry.clone(),
            job_timeout: config.job_timeout,
            retry_tx,
        });

        let worker_handles = (0..config.worker_count.max(1))
            .map(|_| tokio::spawn(worker_loop(shared_ready_rx.clone(), ctx.clone())))
            .collect();

        let notify = Arc::new(Notify::new());
        let is_running = Arc::new(AtomicBool::new(true));

        let scheduler_handle = tokio::spawn(retry_scheduler(
            retry_rx,
            ready_tx.clone(),
            is_running.clone(),
            notify.clone(),
        ));

        info!(
            workers = config.worker_count.max(1),
            queue_size = config.queue_size.max(1),
            handlers = ctx.registry.len(),
            "webhook dispatcher started"
        );

        Self {
            ready_tx: Mutex::new(Some(ready_tx)),
            is_running,
            worker_handles: Mutex::new(worker_handles),
            scheduler_handle: Mutex::new(Some(scheduler_handle)),
            notify,
            ctx,
            next_driver_id: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn HitStore> {
        &self.ctx.store
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.ctx.registry
    }

    /// Record an inbound delivery and dispatch it.
    ///
    /// Only a failure to record the hit is returned; a dispatch failure is
    /// logged and leaves the hit `queued`.
    pub async fn ingest(&self, incoming: IncomingWebhook) -> Result<IngestReceipt, StorageError> {
        let (new_hit, payload) = incoming.into_parts();
        let provider = new_hit.provider.clone();
        let event = new_hit.event.clone();

        let id = self.ctx.store.record(new_hit).await?;
        metric_inc("webhook.ingest.recorded");
        info!(hit_id = %id, provider = ?provider, event = ?event, "webhook ingested");

        let correlation_id = match self.dispatch(id, payload).await {
            Ok(correlation_id) => Some(correlation_id),
            Err(err) => {
                error!(hit_id = %id, error = %err, "webhook recorded but not dispatched");
                None
            }
        };

        Ok(IngestReceipt { id, correlation_id })
    }

    /// Assign a fresh correlation id to the hit, reset its job tracking and
    /// enqueue it.
    pub async fn dispatch(
        &self,
        hit_id: HitId,
        payload: NormalizedPayload,
    ) -> Result<CorrelationId, DispatchError> {
        if !self.is_running() {
            return Err(DispatchError::Shutdown);
        }

        let handler = self.ctx.registry.handler_name(&payload.event);
        let correlation_id = CorrelationId::generate();

        let updated = update_tracking(self.ctx.store.as_ref(), hit_id, |t| {
            t.dispatched(handler.clone(), &correlation_id)
        })
        .await?;
        if updated.is_none() {
            return Err(DispatchError::HitNotFound(hit_id));
        }

        let driver_seq = self.next_driver_id.fetch_add(1, Ordering::Relaxed);
        let job = Job {
            hit_id,
            correlation_id: correlation_id.clone(),
            payload,
            attempt: 1,
            driver_id: Some(format!("mem-{driver_seq}")),
        };

        self.enqueue(job).await?;
        info!(
            hit_id = %hit_id,
            correlation_id = %correlation_id,
            handler = ?handler,
            "webhook job queued"
        );
        Ok(correlation_id)
    }

    /// Dispatch a stored hit again, e.g. after an operator fixed whatever
    /// made it fail.
    pub async fn redispatch(&self, hit_id: HitId) -> Result<CorrelationId, DispatchError> {
        let hit = self
            .ctx
            .store
            .get(hit_id)
            .await?
            .ok_or(DispatchError::HitNotFound(hit_id))?;
        self.dispatch(hit_id, hit.normalized_payload()).await
    }

    /// Startup sweep over hits left behind by a previous process.
    ///
    /// Hits still `queued` are dispatched again. Hits stuck in `processing`
    /// lost their worker mid-attempt and are finished as failed. Run this
    /// before accepting traffic: in-flight jobs of this process would also
    /// look stuck.
    pub async fn recover_pending(&self) -> Result<RecoveryReport, DispatchError> {
        let mut report = RecoveryReport::default();
        let now = Utc::now();
        let response = json!({ "message": INTERRUPTED });

        for hit in self.ctx.store.with_status(JobStatus::Processing).await? {
            let finished = update_tracking(self.ctx.store.as_ref(), hit.id, |t| {
                if t.job_status == JobStatus::Processing {
                    t.finish(JobResult::Failed, Some(response.clone()), None, now)
                } else {
                    t.clone()
                }
            })
            .await?;
            if finished.is_some_and(|t| t.job_status == JobStatus::Done && t.processed_at == Some(now)) {
                warn!(hit_id = %hit.id, "webhook job interrupted by restart");
                report.interrupted += 1;
            }
        }

        for hit in self.ctx.store.with_status(JobStatus::Queued).await? {
            self.dispatch(hit.id, hit.normalized_payload()).await?;
            report.requeued += 1;
        }

        info!(
            requeued = report.requeued,
            interrupted = report.interrupted,
            "webhook recovery sweep finished"
        );
        Ok(report)
    }

    async fn enqueue(&self, job: Job) -> Result<(), DispatchError> {
        let tx = self
            .ready_tx
            .lock()
            .await
            .clone()
            .ok_or(DispatchError::Shutdown)?;
        tx.send(job).await.map_err(|_| DispatchError::Shutdown)?;
        metric_inc("webhook.dispatch.enqueued");
        Ok(())
    }

    /// Stop accepting work and wait for in-flight jobs. Pending retries are
    /// dropped; their last failure stays recorded.
    pub async fn shutdown(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.ready_tx.lock().await.take();

        self.notify.notify_one();
        if let Some(handle) = self.scheduler_handle.lock().await.take() {
            let _ = handle.await;
        }

        let handles: Vec<JoinHandle<()>> = self.worker_handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("webhook dispatcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct TimedJob {
    ready_at: Instant,
    job: Job,
}

impl Eq for TimedJob {}

impl PartialEq for TimedJob {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at.eq(&other.ready_at)
    }
}

impl Ord for TimedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse for min-heap behavior
        other.ready_at.cmp(&self.ready_at)
    }
}

impl PartialOrd for TimedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Holds failed jobs until their backoff elapses, then puts them back on the
/// ready queue.
async fn retry_scheduler(
    mut retry_rx: mpsc::UnboundedReceiver<RetryRequest>,
    ready_tx: mpsc::Sender<Job>,
    is_running: Arc<AtomicBool>,
    notify: Arc<Notify>,
) {
    let mut delay_heap: BinaryHeap<TimedJob> = BinaryHeap::new();

    loop {
        if !is_running.load(Ordering::SeqCst) {
            if !delay_heap.is_empty() {
                warn!(dropped = delay_heap.len(), "pending webhook retries dropped at shutdown");
            }
            return;
        }

        let now = Instant::now();
        while delay_heap.peek().is_some_and(|t| t.ready_at <= now) {
            let Some(timed) = delay_heap.pop() else { break };
            if ready_tx.send(timed.job).await.is_err() {
                return;
            }
            metric_inc("webhook.dispatch.retried");
        }

        let next_ready = delay_heap.peek().map(|t| t.ready_at);
        let wait_next = async {
            match next_ready {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            request = retry_rx.recv() => match request {
                Some(RetryRequest { job, delay }) => {
                    delay_heap.push(TimedJob { ready_at: Instant::now() + delay, job });
                }
                None => match next_ready {
                    Some(at) => sleep_until(at).await,
                    None => return,
                },
            },
            _ = notify.notified() => {}
            _ = wait_next => {}
        }
    }
}
