use std::sync::Arc;
use std::time::Duration;

use webhook_pipeline::{
    catalog, Dispatcher, DispatcherConfig, HandlerRegistry, HitStore, InMemoryHitStore,
    IncomingWebhook, JobStatus,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryHitStore::new());
    let registry = HandlerRegistry::from_bindings([("contact.created", "ContactCreated")], &catalog())?;
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), store.clone(), registry);

    let incoming = IncomingWebhook::new(
        r#"{"event":"contact.created","data":{"name":"Ada Lovelace","email":"ada@example.com"}}"#,
    )
    .with_provider("hubspot");

    let receipt = dispatcher.ingest(incoming).await?;
    println!("recorded hit {} as job {:?}", receipt.id, receipt.correlation_id);

    loop {
        let hit = store.get(receipt.id).await?.ok_or_else(|| anyhow::anyhow!("hit vanished"))?;
        if hit.tracking.job_status == JobStatus::Done {
            println!("{}", serde_json::to_string_pretty(&hit)?);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    dispatcher.shutdown().await;
    Ok(())
}
