use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinError;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use crate::classify::is_duplicate_violation;
use crate::error::HandlerError;
use crate::registry::HandlerRegistry;
use crate::retry::RetryPolicy;
use crate::storage::{update_tracking, HitStore};
use crate::types::{Job, JobResult};

pub(crate) const INVALID_PAYLOAD: &str = "Invalid webhook payload";
pub(crate) const NO_HANDLER: &str = "No handler (noop)";
pub(crate) const DUPLICATE: &str = "Duplicate; no-op";

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Request to deliver a failed job again after `delay`.
#[derive(Debug)]
pub(crate) struct RetryRequest {
    pub job: Job,
    pub delay: Duration,
}

/// Shared, read-only context for all workers.
pub(crate) struct WorkerContext {
    pub store: Arc<dyn HitStore>,
    pub registry: HandlerRegistry,
    pub retry: RetryPolicy,
    /// Upper bound on a single handler invocation.
    pub job_timeout: Duration,
    /// Retries handed to the dispatcher's delay scheduler.
    pub retry_tx: mpsc::UnboundedSender<RetryRequest>,
}

/// How one attempt ended.
#[derive(Debug)]
pub(crate) enum Outcome {
    Invalid,
    Noop,
    Succeeded,
    Duplicate,
    HandlerFailed(HandlerError),
    /// Panic, cancellation or timeout outside the handler's own error path.
    Crashed { class: &'static str, message: String },
}

impl Outcome {
    fn result(&self) -> JobResult {
        match self {
            Outcome::Noop | Outcome::Succeeded | Outcome::Duplicate => JobResult::Success,
            Outcome::Invalid | Outcome::HandlerFailed(_) | Outcome::Crashed { .. } => {
                JobResult::Failed
            }
        }
    }

    fn response(&self) -> Option<Value> {
        match self {
            Outcome::Invalid => Some(json!({ "message": INVALID_PAYLOAD })),
            Outcome::Noop => Some(json!({ "message": NO_HANDLER })),
            Outcome::Succeeded => None,
            Outcome::Duplicate => Some(json!({ "message": DUPLICATE })),
            Outcome::HandlerFailed(err) => Some(err.to_response()),
            Outcome::Crashed { class, message } => Some(crash_response(class, message)),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Outcome::Invalid => "invalid",
            Outcome::Noop => "noop",
            Outcome::Succeeded => "success",
            Outcome::Duplicate => "duplicate",
            Outcome::HandlerFailed(_) => "failed",
            Outcome::Crashed { .. } => "crashed",
        }
    }

    fn from_join_error(err: JoinError) -> Self {
        if err.is_panic() {
            Outcome::Crashed {
                class: "panic",
                message: panic_message(err.into_panic()),
            }
        } else {
            Outcome::Crashed {
                class: "cancelled",
                message: "job task was cancelled".to_string(),
            }
        }
    }
}

fn crash_response(class: &str, message: &str) -> Value {
    json!({ "error": message, "class": class, "code": Value::Null })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".to_string()
    }
}

/// Main worker loop.
///
/// Each worker:
/// - Pulls jobs from the shared queue
/// - Runs one attempt per job
/// - Finishes the hit as failed if the attempt itself crashes
pub(crate) async fn worker_loop(rx: Arc<Mutex<mpsc::Receiver<Job>>>, ctx: Arc<WorkerContext>) {
    loop {
        let job = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };

        let Some(job) = job else { break };

        let attempt = tokio::spawn(process_job(job.clone(), ctx.clone()));
        if let Err(err) = attempt.await {
            let outcome = Outcome::from_join_error(err);
            error!(
                hit_id = %job.hit_id,
                correlation_id = %job.correlation_id,
                outcome = ?outcome,
                "webhook job crashed"
            );
            finish(&job, &ctx, &outcome).await;
        }
    }
}

/// Run a single attempt of `job` and persist its outcome.
pub(crate) async fn process_job(job: Job, ctx: Arc<WorkerContext>) {
    let span = tracing::info_span!(
        "webhook_job",
        hit_id = %job.hit_id,
        correlation_id = %job.correlation_id,
        event = %job.payload.event,
        attempt = job.attempt,
    );

    async move {
        if !begin_attempt(&job, &ctx).await {
            return;
        }

        let outcome = execute(&job, &ctx).await;
        if !finish(&job, &ctx, &outcome).await {
            return;
        }

        if let Outcome::HandlerFailed(ref err) = outcome {
            schedule_retry(job, &ctx, err);
        }
    }
    .instrument(span)
    .await
}

/// `queued → processing`. Returns false when the job was superseded by a
/// later dispatch of the same hit and must not run.
async fn begin_attempt(job: &Job, ctx: &WorkerContext) -> bool {
    let driver_id = job.driver_id.as_deref();
    let written = update_tracking(ctx.store.as_ref(), job.hit_id, |t| {
        if t.belongs_to(&job.correlation_id) {
            t.begin_attempt(&job.correlation_id, driver_id)
        } else {
            t.clone()
        }
    })
    .await;

    match written {
        Ok(Some(tracking)) if tracking.belongs_to(&job.correlation_id) => {
            debug!(attempts = tracking.job_attempts, "webhook job processing");
            true
        }
        Ok(Some(tracking)) => {
            warn!(current_job_id = ?tracking.job_id, "job superseded by a later dispatch; skipping");
            metric_inc("webhook.job.superseded");
            false
        }
        Ok(None) => {
            warn!("webhook hit missing; running job without tracking");
            true
        }
        Err(err) => {
            error!(error = %err, "could not mark webhook hit as processing; running job anyway");
            true
        }
    }
}

async fn execute(job: &Job, ctx: &WorkerContext) -> Outcome {
    let event = job.payload.event.as_str();
    let data = match &job.payload.data {
        Value::Object(map) if !event.is_empty() => map.clone(),
        _ => return Outcome::Invalid,
    };

    let Some(handler) = ctx.registry.resolve(event) else {
        return Outcome::Noop;
    };

    let handler_name = handler.name().to_string();
    info!(handler = %handler_name, "dispatching handler");

    let mut task = tokio::spawn(async move { handler.handle(&data).await });
    let outcome = match timeout(ctx.job_timeout, &mut task).await {
        Ok(Ok(Ok(()))) => Outcome::Succeeded,
        Ok(Ok(Err(err))) if is_duplicate_violation(&err) => Outcome::Duplicate,
        Ok(Ok(Err(err))) => Outcome::HandlerFailed(err),
        Ok(Err(join_err)) => Outcome::from_join_error(join_err),
        Err(_) => {
            task.abort();
            Outcome::Crashed {
                class: "timeout",
                message: format!("handler exceeded {}s", ctx.job_timeout.as_secs_f64()),
            }
        }
    };

    info!(handler = %handler_name, outcome = outcome.label(), "handler completed");
    outcome
}

/// Terminal write of the attempt. Returns false when the hit was
/// re-dispatched meanwhile; the newer job owns the row and nothing is written.
async fn finish(job: &Job, ctx: &WorkerContext, outcome: &Outcome) -> bool {
    let result = outcome.result();
    let response = outcome.response();
    let driver_id = job.driver_id.as_deref();
    let now = Utc::now();

    let written = update_tracking(ctx.store.as_ref(), job.hit_id, |t| {
        if t.belongs_to(&job.correlation_id) {
            t.finish(result, response.clone(), driver_id, now)
        } else {
            t.clone()
        }
    })
    .await;
    match written {
        Ok(Some(tracking)) if !tracking.belongs_to(&job.correlation_id) => {
            warn!(
                current_job_id = ?tracking.job_id,
                outcome = outcome.label(),
                "job superseded by a later dispatch; outcome discarded"
            );
            metric_inc("webhook.job.superseded");
            return false;
        }
        Ok(_) => {}
        Err(err) => error!(error = %err, "could not record webhook job result"),
    }

    match outcome {
        Outcome::Noop => metric_inc("webhook.job.noop"),
        Outcome::Duplicate => metric_inc("webhook.job.duplicate"),
        Outcome::Succeeded => metric_inc("webhook.job.success"),
        _ => metric_inc("webhook.job.failed"),
    }

    if result == JobResult::Failed {
        warn!(outcome = outcome.label(), response = ?response, "webhook job failed");
    } else {
        info!(outcome = outcome.label(), "webhook job done");
    }
    true
}

fn schedule_retry(job: Job, ctx: &WorkerContext, err: &HandlerError) {
    let Some(delay) = ctx.retry.next_delay(job.attempt) else {
        return;
    };

    let next = Job {
        attempt: job.attempt + 1,
        ..job
    };
    info!(
        error = %err,
        next_attempt = next.attempt,
        delay_secs = delay.as_secs_f64(),
        "scheduling webhook retry"
    );
    if ctx.retry_tx.send(RetryRequest { job: next, delay }).is_err() {
        debug!("retry scheduler stopped; failure stands");
        return;
    }
    metric_inc("webhook.job.retry_scheduled");
}
