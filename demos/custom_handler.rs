//! Bind a handler of your own and serve the ingestion endpoints.
//!
//! ```text
//! curl -X POST localhost:8080/webhooks/stripe \
//!      -H 'Stripe-Event-Type: invoice.paid' \
//!      -d '{"data":{"invoice":"in_123"}}'
//! curl localhost:8080/webhooks/hits
//! ```

use std::sync::Arc;

use webhook_pipeline::{
    handler_fn, start, Dispatcher, DispatcherConfig, HandlerError, HandlerRegistry, InMemoryHitStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let invoice_paid = handler_fn("InvoicePaid", |data| {
        let invoice = data
            .get("invoice")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerError::new("InvalidArgument", "invoice id missing"))?;
        println!("marking {invoice} as paid");
        Ok(())
    });

    let registry = HandlerRegistry::new().register("invoice.paid", invoice_paid);
    let dispatcher = Arc::new(Dispatcher::new(
        DispatcherConfig::default(),
        Arc::new(InMemoryHitStore::new()),
        registry,
    ));

    let (addr, server) = start("127.0.0.1:8080".parse()?, dispatcher.clone()).await?;
    println!("listening on http://{addr}");

    tokio::signal::ctrl_c().await?;
    server.abort();
    dispatcher.shutdown().await;
    Ok(())
}
