//! A single-process webhook ingestion and processing pipeline.
//!
//! Every inbound request is recorded as a **hit** before anything else
//! happens, then dispatched to an in-process worker pool that runs the
//! handler bound to its event type and writes the outcome back onto the hit.
//!
//! ## Guarantees
//! - Ingestion never rejects a payload once it has been recorded
//! - Every hit carries a correlation id from the moment it is dispatched
//! - Job state only moves `queued → processing → done` within an attempt
//! - Duplicate side effects on redelivery are recorded as success
//!
//! ## Non-Guarantees
//! - Exactly-once handler execution
//! - Ordering between hits
//! - Survival of in-flight jobs across restarts (see
//!   [`Dispatcher::recover_pending`])

mod classify;
mod config;
mod dispatcher;
mod error;
mod handlers;
mod http_server;
mod ingest;
mod registry;
mod retry;
mod storage;
mod types;
mod worker;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use classify::is_duplicate_violation;
pub use config::{parse_bindings, AppConfig, LogFormat};
pub use dispatcher::{Dispatcher, DispatcherConfig, IngestReceipt, RecoveryReport};
pub use error::{ConfigError, DispatchError, HandlerError, StorageError};
pub use handlers::{catalog, Contact, ContactCreated};
pub use http_server::{router, serve, start};
pub use ingest::IncomingWebhook;
pub use registry::{handler_fn, FnHandler, HandlerRegistry, WebhookHandler};
pub use retry::RetryPolicy;
pub use storage::{update_tracking, HitStore, InMemoryHitStore};
pub use types::{
    CorrelationId, HitId, Job, JobResult, JobStatus, JobTracking, NewHit, NormalizedPayload,
    WebhookHit,
};

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresHitStore;
