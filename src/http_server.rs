use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;
use crate::ingest::IncomingWebhook;
use crate::types::HitId;

pub const DEFAULT_HITS_LIMIT: usize = 50;
pub const MAX_HITS_LIMIT: usize = 500;

type ApiResponse = (StatusCode, Json<Value>);

#[derive(Debug, Default, Deserialize)]
struct IngestQuery {
    event: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct HitsQuery {
    limit: Option<usize>,
}

/// Ingestion endpoints plus the read side over recorded hits.
///
/// The source IP is taken from `ConnectInfo<SocketAddr>` when the router is
/// served through `into_make_service_with_connect_info` (as [`serve`] does)
/// and left unset otherwise.
///
/// `hits` is reserved: `POST /webhooks/hits` hits the read route and answers
/// 405, so a provider by that name must use `POST /webhooks` with the
/// `X-Webhook-Provider` header.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/ingest", post(ingest))
        .route("/webhooks", post(ingest))
        .route("/webhooks/{provider}", post(ingest_for_provider))
        .route("/webhooks/hits", get(list_hits))
        .route("/webhooks/hits/{id}", get(show_hit))
        .route("/webhooks/hits/{id}/redispatch", post(redispatch_hit))
        .with_state(dispatcher)
}

/// Serve the router on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, dispatcher: Arc<Dispatcher>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(dispatcher).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await
}

/// Bind `addr` and serve in a background task. Returns the bound address,
/// which differs from `addr` when port 0 was requested.
pub async fn start(addr: SocketAddr, dispatcher: Arc<Dispatcher>) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "webhook HTTP server bound");

    let handle = tokio::spawn(async move {
        if let Err(err) = serve(listener, dispatcher, std::future::pending()).await {
            error!(error = %err, "webhook HTTP server error");
        }
    });

    Ok((local_addr, handle))
}

async fn ingest(
    State(dispatcher): State<Arc<Dispatcher>>,
    peer: Option<Extension<ConnectInfo<SocketAddr>>>,
    Query(query): Query<IngestQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResponse {
    let incoming = incoming_webhook(None, peer, query, &headers, body);
    accept(&dispatcher, incoming).await
}

async fn ingest_for_provider(
    Path(provider): Path<String>,
    State(dispatcher): State<Arc<Dispatcher>>,
    peer: Option<Extension<ConnectInfo<SocketAddr>>>,
    Query(query): Query<IngestQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResponse {
    let incoming = incoming_webhook(Some(provider), peer, query, &headers, body);
    accept(&dispatcher, incoming).await
}

fn incoming_webhook(
    provider: Option<String>,
    peer: Option<Extension<ConnectInfo<SocketAddr>>>,
    query: IngestQuery,
    headers: &HeaderMap,
    body: Bytes,
) -> IncomingWebhook {
    let mut incoming = IncomingWebhook::new(body.to_vec());
    incoming.ip = peer.map(|Extension(ConnectInfo(addr))| addr.ip().to_string());
    incoming.provider = provider;
    incoming.query_event = query.event;

    // HeaderMap names are already lowercase
    for (name, value) in headers {
        incoming
            .headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    incoming
}

async fn accept(dispatcher: &Dispatcher, incoming: IncomingWebhook) -> ApiResponse {
    match dispatcher.ingest(incoming).await {
        Ok(receipt) => (
            StatusCode::OK,
            Json(json!({ "ok": true, "id": receipt.id, "queued": true })),
        ),
        Err(err) => {
            error!(error = %err, "webhook could not be recorded");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": err.to_string() })),
            )
        }
    }
}

async fn list_hits(State(dispatcher): State<Arc<Dispatcher>>, Query(query): Query<HitsQuery>) -> ApiResponse {
    let limit = query.limit.unwrap_or(DEFAULT_HITS_LIMIT).clamp(1, MAX_HITS_LIMIT);
    match dispatcher.store().recent(limit).await {
        Ok(hits) => (StatusCode::OK, Json(json!({ "data": hits }))),
        Err(err) => {
            error!(error = %err, "could not list webhook hits");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

async fn show_hit(State(dispatcher): State<Arc<Dispatcher>>, Path(id): Path<i64>) -> ApiResponse {
    match dispatcher.store().get(HitId(id)).await {
        Ok(Some(hit)) => (StatusCode::OK, Json(json!({ "data": hit }))),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "webhook hit not found"),
        Err(err) => {
            error!(hit_id = id, error = %err, "could not load webhook hit");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

async fn redispatch_hit(State(dispatcher): State<Arc<Dispatcher>>, Path(id): Path<i64>) -> ApiResponse {
    match dispatcher.redispatch(HitId(id)).await {
        Ok(correlation_id) => {
            info!(hit_id = id, correlation_id = %correlation_id, "webhook hit re-dispatched");
            (
                StatusCode::OK,
                Json(json!({ "ok": true, "id": id, "job_id": correlation_id.as_str() })),
            )
        }
        Err(DispatchError::HitNotFound(_)) => error_response(StatusCode::NOT_FOUND, "webhook hit not found"),
        Err(DispatchError::Shutdown) => {
            warn!(hit_id = id, "re-dispatch refused during shutdown");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "dispatcher is shut down")
        }
        Err(err) => {
            error!(hit_id = id, error = %err, "could not re-dispatch webhook hit");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> ApiResponse {
    (status, Json(json!({ "ok": false, "error": message })))
}
