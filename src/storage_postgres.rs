#[cfg(feature = "postgres")]
use async_trait::async_trait;
#[cfg(feature = "postgres")]
use tokio_postgres::{Client, Row};

#[cfg(feature = "postgres")]
use crate::error::StorageError;
#[cfg(feature = "postgres")]
use crate::storage::HitStore;
#[cfg(feature = "postgres")]
use crate::types::{HitId, JobResult, JobStatus, JobTracking, NewHit, WebhookHit};

#[cfg(feature = "postgres")]
const HIT_COLUMNS: &str = "id, provider, event, payload, headers, ip, received_at, \
    job_id, job_driver_id, job_status, job_attempts, handler, processed_at, \
    job_result, job_response";

/// Hit store backed by the `webhook_hits` table.
#[cfg(feature = "postgres")]
pub struct PostgresHitStore {
    client: Client,
}

#[cfg(feature = "postgres")]
impl PostgresHitStore {
    /// Wrap a connected client, creating the table if it does not exist.
    pub async fn new(client: Client) -> Result<Self, tokio_postgres::Error> {
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS webhook_hits (
                    id BIGSERIAL PRIMARY KEY,
                    provider TEXT NULL,
                    event TEXT NULL,
                    payload JSONB NOT NULL,
                    headers JSONB NULL,
                    ip TEXT NULL,
                    received_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    job_id TEXT NULL,
                    job_driver_id TEXT NULL,
                    job_status TEXT NOT NULL DEFAULT 'queued',
                    job_attempts INTEGER NOT NULL DEFAULT 0,
                    handler TEXT NULL,
                    processed_at TIMESTAMPTZ NULL,
                    job_result TEXT NULL,
                    job_response JSONB NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
                );
                CREATE INDEX IF NOT EXISTS webhook_hits_provider_event_idx
                    ON webhook_hits (provider, event);
                CREATE INDEX IF NOT EXISTS webhook_hits_received_at_idx
                    ON webhook_hits (received_at);",
            )
            .await?;

        Ok(Self { client })
    }

    fn hit_from_row(row: &Row) -> Result<WebhookHit, StorageError> {
        let payload: serde_json::Value = row.try_get("payload")?;
        let headers: Option<serde_json::Value> = row.try_get("headers")?;
        let status: String = row.try_get("job_status")?;
        let result: Option<String> = row.try_get("job_result")?;
        let attempts: i32 = row.try_get("job_attempts")?;

        let payload = match payload {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("raw".to_string(), other);
                map
            }
        };
        let headers = match headers {
            Some(value) => serde_json::from_value(value)?,
            None => Default::default(),
        };

        Ok(WebhookHit {
            id: HitId(row.try_get("id")?),
            provider: row.try_get("provider")?,
            event: row.try_get("event")?,
            payload,
            headers,
            ip: row.try_get("ip")?,
            received_at: row.try_get("received_at")?,
            tracking: JobTracking {
                job_id: row.try_get("job_id")?,
                job_driver_id: row.try_get("job_driver_id")?,
                job_status: status.parse().map_err(StorageError::Serialization)?,
                job_attempts: u32::try_from(attempts).unwrap_or(0),
                handler: row.try_get("handler")?,
                job_result: result
                    .map(|r| r.parse::<JobResult>())
                    .transpose()
                    .map_err(StorageError::Serialization)?,
                job_response: row.try_get("job_response")?,
                processed_at: row.try_get("processed_at")?,
            },
        })
    }

    fn hits_from_rows(rows: Vec<Row>) -> Result<Vec<WebhookHit>, StorageError> {
        rows.iter().map(Self::hit_from_row).collect()
    }
}

#[cfg(feature = "postgres")]
#[async_trait]
impl HitStore for PostgresHitStore {
    async fn record(&self, hit: NewHit) -> Result<HitId, StorageError> {
        let payload = serde_json::Value::Object(hit.payload);
        let headers = serde_json::to_value(&hit.headers)?;
        let row = self
            .client
            .query_one(
                "INSERT INTO webhook_hits (provider, event, payload, headers, ip, received_at, job_status)
                 VALUES ($1, $2, $3, $4, $5, $6, 'queued')
                 RETURNING id",
                &[
                    &hit.provider,
                    &hit.event,
                    &payload,
                    &headers,
                    &hit.ip,
                    &hit.received_at,
                ],
            )
            .await?;
        Ok(HitId(row.try_get(0)?))
    }

    async fn get(&self, id: HitId) -> Result<Option<WebhookHit>, StorageError> {
        let query = format!("SELECT {HIT_COLUMNS} FROM webhook_hits WHERE id = $1");
        let row = self.client.query_opt(query.as_str(), &[&id.0]).await?;
        row.as_ref().map(Self::hit_from_row).transpose()
    }

    async fn recent(&self, limit: usize) -> Result<Vec<WebhookHit>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let query = format!(
            "SELECT {HIT_COLUMNS} FROM webhook_hits ORDER BY received_at DESC, id DESC LIMIT $1"
        );
        let rows = self.client.query(query.as_str(), &[&limit]).await?;
        Self::hits_from_rows(rows)
    }

    async fn with_status(&self, status: JobStatus) -> Result<Vec<WebhookHit>, StorageError> {
        let query = format!(
            "SELECT {HIT_COLUMNS} FROM webhook_hits WHERE job_status = $1 ORDER BY id"
        );
        let rows = self.client.query(query.as_str(), &[&status.as_str()]).await?;
        Self::hits_from_rows(rows)
    }

    async fn compare_and_swap(
        &self,
        id: HitId,
        expected: &JobTracking,
        next: &JobTracking,
    ) -> Result<bool, StorageError> {
        let expected_attempts = i32::try_from(expected.job_attempts).unwrap_or(i32::MAX);
        let next_attempts = i32::try_from(next.job_attempts).unwrap_or(i32::MAX);
        let next_result = next.job_result.map(|r| r.as_str());

        let updated = self
            .client
            .execute(
                "UPDATE webhook_hits SET
                    job_id = $5,
                    job_driver_id = $6,
                    job_status = $7,
                    job_attempts = $8,
                    handler = $9,
                    processed_at = $10,
                    job_result = $11,
                    job_response = $12,
                    updated_at = now()
                 WHERE id = $1
                   AND job_id IS NOT DISTINCT FROM $2
                   AND job_status = $3
                   AND job_attempts = $4",
                &[
                    &id.0,
                    &expected.job_id,
                    &expected.job_status.as_str(),
                    &expected_attempts,
                    &next.job_id,
                    &next.job_driver_id,
                    &next.job_status.as_str(),
                    &next_attempts,
                    &next.handler,
                    &next.processed_at,
                    &next_result,
                    &next.job_response,
                ],
            )
            .await?;

        Ok(updated == 1)
    }
}
