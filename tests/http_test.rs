use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpListener;
use webhook_pipeline::{
    catalog, router, start, Dispatcher, DispatcherConfig, HandlerRegistry, HitId, HitStore,
    InMemoryHitStore, JobStatus,
};

struct TestServer {
    addr: SocketAddr,
    store: Arc<InMemoryHitStore>,
    dispatcher: Arc<Dispatcher>,
    client: reqwest::Client,
}

impl TestServer {
    async fn spawn() -> Self {
        let store = Arc::new(InMemoryHitStore::new());
        let registry =
            HandlerRegistry::from_bindings([("contact.created", "ContactCreated")], &catalog()).unwrap();
        let dispatcher = Arc::new(Dispatcher::new(
            DispatcherConfig {
                worker_count: 2,
                ..Default::default()
            },
            store.clone(),
            registry,
        ));
        let (addr, _server) = start("127.0.0.1:0".parse().unwrap(), dispatcher.clone())
            .await
            .unwrap();

        Self {
            addr,
            store,
            dispatcher,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn wait_for_done(&self, id: i64) -> Value {
        for _ in 0..500 {
            let hit = self.store.get(HitId(id)).await.unwrap().unwrap();
            if hit.tracking.job_status == JobStatus::Done {
                return serde_json::to_value(hit).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("hit {id} never finished");
    }
}

#[tokio::test]
async fn provider_route_records_and_processes() {
    let server = TestServer::spawn().await;

    let res = server
        .client
        .post(server.url("/webhooks/hubspot"))
        .header("X-HubSpot-Event", "contact.created")
        .header("X-Webhook-Event", "ignored.event")
        .body(r#"{"data":{"name":"Ada Lovelace","email":"ada@example.com"}}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["queued"], json!(true));

    let id = body["id"].as_i64().unwrap();
    let hit = server.wait_for_done(id).await;
    assert_eq!(hit["provider"], json!("hubspot"));
    assert_eq!(hit["event"], json!("contact.created"));
    assert_eq!(hit["ip"], json!("127.0.0.1"));
    assert_eq!(hit["headers"]["x-hubspot-event"], json!(["contact.created"]));
    assert_eq!(hit["job_status"], json!("done"));
    assert_eq!(hit["job_result"], json!("success"));
    assert_eq!(hit["handler"], json!("ContactCreated"));
    assert_eq!(hit["job_attempts"], json!(1));

    server.dispatcher.shutdown().await;
}

#[tokio::test]
async fn generic_routes_take_provider_and_event_from_request() {
    let server = TestServer::spawn().await;

    let res = server
        .client
        .post(server.url("/webhooks?event=deal.won"))
        .header("X-Webhook-Provider", "pipedrive")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let id = res.json::<Value>().await.unwrap()["id"].as_i64().unwrap();

    let hit = server.wait_for_done(id).await;
    assert_eq!(hit["provider"], json!("pipedrive"));
    assert_eq!(hit["event"], json!("deal.won"));
    assert_eq!(hit["payload"], json!({ "raw": "{}" }));
    assert_eq!(hit["job_result"], json!("success"));
    assert_eq!(hit["job_response"], json!({ "message": "No handler (noop)" }));

    let res = server
        .client
        .post(server.url("/ingest"))
        .body("definitely not json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let id = res.json::<Value>().await.unwrap()["id"].as_i64().unwrap();

    let hit = server.wait_for_done(id).await;
    assert_eq!(hit["provider"], Value::Null);
    assert_eq!(hit["payload"], json!({ "raw": "definitely not json" }));
    assert_eq!(hit["job_result"], json!("failed"));

    server.dispatcher.shutdown().await;
}

#[tokio::test]
async fn hits_can_be_read_and_redispatched() {
    let server = TestServer::spawn().await;

    let mut ids = Vec::new();
    for email in ["a@example.com", "b@example.com", "c@example.com"] {
        let res = server
            .client
            .post(server.url("/webhooks/hubspot"))
            .json(&json!({ "event": "contact.created", "data": { "email": email } }))
            .send()
            .await
            .unwrap();
        ids.push(res.json::<Value>().await.unwrap()["id"].as_i64().unwrap());
    }
    for id in &ids {
        server.wait_for_done(*id).await;
    }

    let listed: Value = server
        .client
        .get(server.url("/webhooks/hits?limit=2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let data = listed["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["id"], json!(ids[2]));
    assert_eq!(data[1]["id"], json!(ids[1]));

    let shown: Value = server
        .client
        .get(server.url(&format!("/webhooks/hits/{}", ids[0])))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(shown["data"]["id"], json!(ids[0]));
    let first_job = shown["data"]["job_id"].clone();

    let res = server
        .client
        .get(server.url("/webhooks/hits/424242"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);

    // The contact already exists, so the second run is a duplicate.
    let res = server
        .client
        .post(server.url(&format!("/webhooks/hits/{}/redispatch", ids[0])))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let redispatched: Value = res.json().await.unwrap();
    assert_ne!(redispatched["job_id"], first_job);

    let hit = server.wait_for_done(ids[0]).await;
    assert_eq!(hit["job_id"], redispatched["job_id"]);
    assert_eq!(hit["job_result"], json!("success"));
    assert_eq!(hit["job_response"], json!({ "message": "Duplicate; no-op" }));

    let res = server
        .client
        .post(server.url("/webhooks/hits/424242/redispatch"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);

    server.dispatcher.shutdown().await;
}

#[tokio::test]
async fn plain_router_records_without_peer_address() {
    let store = Arc::new(InMemoryHitStore::new());
    let dispatcher = Arc::new(Dispatcher::new(
        DispatcherConfig::default(),
        store.clone(),
        HandlerRegistry::new(),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(dispatcher.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let res = reqwest::Client::new()
        .post(format!("http://{addr}/webhooks/stripe"))
        .body(r#"{"event":"invoice.paid","data":{}}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let id = res.json::<Value>().await.unwrap()["id"].as_i64().unwrap();

    let hit = store.get(HitId(id)).await.unwrap().unwrap();
    assert_eq!(hit.provider.as_deref(), Some("stripe"));
    assert_eq!(hit.ip, None);
    assert_eq!(store.len().await, 1);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn hits_is_not_a_provider_name() {
    let server = TestServer::spawn().await;

    let res = server
        .client
        .post(server.url("/webhooks/hits"))
        .body(r#"{"event":"contact.created","data":{}}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 405);
    assert!(server.store.is_empty().await);

    server.dispatcher.shutdown().await;
}
