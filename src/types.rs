use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Surrogate identifier of a recorded hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HitId(pub i64);

impl fmt::Display for HitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier generated before enqueue so a hit can be tracked across logs
/// and the UI before the queue has assigned anything of its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job lifecycle of a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Done,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "done" => Ok(JobStatus::Done),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Terminal outcome of an attempt.
///
/// The executor writes `Success` for noop and duplicate outcomes (the
/// response message says which); `Duplicate` and `Noop` remain valid values
/// of the persisted column for rows written by other tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobResult {
    Success,
    Failed,
    Duplicate,
    Noop,
}

impl JobResult {
    pub fn as_str(self) -> &'static str {
        match self {
            JobResult::Success => "success",
            JobResult::Failed => "failed",
            JobResult::Duplicate => "duplicate",
            JobResult::Noop => "noop",
        }
    }
}

impl FromStr for JobResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(JobResult::Success),
            "failed" => Ok(JobResult::Failed),
            "duplicate" => Ok(JobResult::Duplicate),
            "noop" => Ok(JobResult::Noop),
            other => Err(format!("unknown job result: {other}")),
        }
    }
}

/// Mutable job-tracking columns of a hit.
///
/// Every change goes through one of the transition methods below, which take
/// the current record and return the next one. Stores persist the result
/// with a conditional update guarded on `job_id`, `job_status` and
/// `job_attempts` (see [`crate::storage::update_tracking`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTracking {
    pub job_id: Option<String>,
    pub job_driver_id: Option<String>,
    pub job_status: JobStatus,
    pub job_attempts: u32,
    pub handler: Option<String>,
    pub job_result: Option<JobResult>,
    pub job_response: Option<Value>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Default for JobTracking {
    fn default() -> Self {
        Self {
            job_id: None,
            job_driver_id: None,
            job_status: JobStatus::Queued,
            job_attempts: 0,
            handler: None,
            job_result: None,
            job_response: None,
            processed_at: None,
        }
    }
}

impl JobTracking {
    /// Bookkeeping written right before a job is enqueued: counters reset,
    /// previous outcome cleared.
    pub fn dispatched(&self, handler: Option<String>, correlation_id: &CorrelationId) -> Self {
        Self {
            job_id: Some(correlation_id.0.clone()),
            job_driver_id: None,
            job_status: JobStatus::Queued,
            job_attempts: 0,
            handler,
            job_result: None,
            job_response: None,
            processed_at: None,
        }
    }

    /// Pickup by a worker. A retry re-enters `processing` from `done` with a
    /// higher attempt count, so the previous attempt's outcome is cleared.
    pub fn begin_attempt(&self, correlation_id: &CorrelationId, driver_id: Option<&str>) -> Self {
        let mut next = self.clone();
        next.job_status = JobStatus::Processing;
        next.job_attempts = self.job_attempts.saturating_add(1);
        if let Some(id) = driver_id {
            next.job_driver_id = Some(id.to_string());
        }
        if next.job_id.is_none() {
            next.job_id = Some(correlation_id.0.clone());
        }
        next.job_result = None;
        next.job_response = None;
        next.processed_at = None;
        next
    }

    /// Terminal write of an attempt. Calling it again with the same result
    /// only refreshes `processed_at`.
    pub fn finish(
        &self,
        result: JobResult,
        response: Option<Value>,
        driver_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut next = self.clone();
        next.job_status = JobStatus::Done;
        next.job_result = Some(result);
        next.job_response = response.filter(|v| !is_empty_response(v));
        next.processed_at = Some(now);
        if next.job_driver_id.is_none() {
            next.job_driver_id = driver_id.map(str::to_string);
        }
        next
    }

    /// True unless the hit was re-dispatched under a different correlation id.
    /// An unset `job_id` belongs to whichever job backfills it first.
    pub fn belongs_to(&self, correlation_id: &CorrelationId) -> bool {
        self.job_id
            .as_deref()
            .map_or(true, |id| id == correlation_id.as_str())
    }

    /// True when `other` is the same row state for conditional-update purposes.
    pub fn same_guard(&self, other: &JobTracking) -> bool {
        self.job_id == other.job_id
            && self.job_status == other.job_status
            && self.job_attempts == other.job_attempts
    }
}

fn is_empty_response(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// One durably recorded inbound delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookHit {
    pub id: HitId,
    pub provider: Option<String>,
    pub event: Option<String>,
    pub payload: Map<String, Value>,
    pub headers: BTreeMap<String, Vec<String>>,
    pub ip: Option<String>,
    pub received_at: DateTime<Utc>,
    #[serde(flatten)]
    pub tracking: JobTracking,
}

impl WebhookHit {
    /// Rebuild the envelope that ingestion would have dispatched for this hit.
    pub fn normalized_payload(&self) -> NormalizedPayload {
        NormalizedPayload::from_body(self.event.clone(), &self.payload)
    }
}

/// Insert form of a hit; the store assigns id and initial tracking.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHit {
    pub provider: Option<String>,
    pub event: Option<String>,
    pub payload: Map<String, Value>,
    pub headers: BTreeMap<String, Vec<String>>,
    pub ip: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl NewHit {
    /// Build a hit from raw request parts. Never fails: a body that is not a
    /// non-empty JSON object is kept as `{"raw": "<text>"}`.
    pub fn from_raw(
        provider: Option<String>,
        event: Option<String>,
        raw_body: &[u8],
        headers: BTreeMap<String, Vec<String>>,
        ip: Option<String>,
    ) -> Self {
        let payload = match serde_json::from_slice::<Value>(raw_body) {
            Ok(Value::Object(map)) if !map.is_empty() => map,
            _ => {
                let mut map = Map::new();
                map.insert(
                    "raw".to_string(),
                    Value::String(String::from_utf8_lossy(raw_body).into_owned()),
                );
                map
            }
        };

        Self {
            provider,
            event,
            payload,
            headers,
            ip,
            received_at: Utc::now(),
        }
    }

    pub fn into_hit(self, id: HitId) -> WebhookHit {
        WebhookHit {
            id,
            provider: self.provider,
            event: self.event,
            payload: self.payload,
            headers: self.headers,
            ip: self.ip,
            received_at: self.received_at,
            tracking: JobTracking::default(),
        }
    }
}

/// Best-effort `{event, data}` envelope handed to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPayload {
    pub event: String,
    pub data: Value,
}

impl NormalizedPayload {
    /// `event` falls back to the empty string and `data` to an empty object;
    /// the executor decides whether the result is usable.
    pub fn from_body(event: Option<String>, body: &Map<String, Value>) -> Self {
        Self {
            event: event.unwrap_or_default(),
            data: body
                .get("data")
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new())),
        }
    }
}

/// A unit of work consumed by workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub hit_id: HitId,
    pub correlation_id: CorrelationId,
    pub payload: NormalizedPayload,
    /// Deliveries of this job so far, including the current one.
    pub attempt: u32,
    /// Queue-native id, when the substrate exposes one.
    pub driver_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn raw_body_fallback_for_non_object() {
        let hit = NewHit::from_raw(None, None, b"not json", BTreeMap::new(), None);
        assert_eq!(hit.payload.get("raw"), Some(&json!("not json")));

        let hit = NewHit::from_raw(None, None, b"", BTreeMap::new(), None);
        assert_eq!(hit.payload.get("raw"), Some(&json!("")));

        let hit = NewHit::from_raw(None, None, b"{}", BTreeMap::new(), None);
        assert_eq!(hit.payload.get("raw"), Some(&json!("{}")));
    }

    #[test]
    fn object_body_is_kept() {
        let hit = NewHit::from_raw(None, None, br#"{"event":"x","data":{"a":1}}"#, BTreeMap::new(), None);
        assert_eq!(hit.payload.get("event"), Some(&json!("x")));
        assert!(hit.payload.get("raw").is_none());
    }

    #[test]
    fn finish_is_idempotent() {
        let correlation = CorrelationId::generate();
        let now = Utc::now();
        let processing = JobTracking::default()
            .dispatched(Some("ContactCreated".into()), &correlation)
            .begin_attempt(&correlation, Some("mem-1"));

        let once = processing.finish(JobResult::Success, None, Some("mem-1"), now);
        let twice = once.finish(JobResult::Success, None, Some("mem-1"), now);

        assert_eq!(once, twice);
        assert_eq!(twice.job_status, JobStatus::Done);
        assert_eq!(twice.job_attempts, 1);
    }

    #[test]
    fn retry_clears_previous_outcome() {
        let correlation = CorrelationId::generate();
        let first = JobTracking::default()
            .dispatched(None, &correlation)
            .begin_attempt(&correlation, None)
            .finish(JobResult::Failed, Some(json!({"error": "boom"})), None, Utc::now());

        let second = first.begin_attempt(&correlation, None);
        assert_eq!(second.job_status, JobStatus::Processing);
        assert_eq!(second.job_attempts, 2);
        assert!(second.job_result.is_none());
        assert!(second.job_response.is_none());
    }

    #[test]
    fn begin_attempt_backfills_job_id() {
        let correlation = CorrelationId::generate();
        let next = JobTracking::default().begin_attempt(&correlation, None);
        assert_eq!(next.job_id.as_deref(), Some(correlation.as_str()));
    }

    #[test]
    fn redispatch_changes_ownership() {
        let first = CorrelationId::generate();
        let second = CorrelationId::generate();
        assert!(JobTracking::default().belongs_to(&first));

        let tracking = JobTracking::default()
            .dispatched(None, &first)
            .dispatched(None, &second);
        assert!(tracking.belongs_to(&second));
        assert!(!tracking.belongs_to(&first));
    }

    #[test]
    fn hit_serializes_flat() {
        let hit = NewHit::from_raw(Some("stripe".into()), None, b"{\"a\":1}", BTreeMap::new(), None)
            .into_hit(HitId(7));
        let value = serde_json::to_value(&hit).unwrap();
        assert_eq!(value["id"], json!(7));
        assert_eq!(value["job_status"], json!("queued"));
        assert_eq!(value["job_attempts"], json!(0));
        assert_eq!(value["job_result"], Value::Null);
    }
}
