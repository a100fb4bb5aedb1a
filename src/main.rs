//! Composition root: configuration, logging, store, registry, dispatcher and
//! the HTTP server, wired together and run until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use webhook_pipeline::{
    catalog, serve, AppConfig, Dispatcher, HandlerRegistry, HitStore, InMemoryHitStore, LogFormat,
};

const DEFAULT_LOG_FILTER: &str = "info,webhook_pipeline=debug";

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[cfg(feature = "postgres")]
async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn HitStore>> {
    let Some(url) = config.database_url.as_deref() else {
        info!("DATABASE_URL not set; using in-memory hit store");
        return Ok(Arc::new(InMemoryHitStore::new()));
    };

    let (client, connection) = tokio_postgres::connect(url, tokio_postgres::NoTls)
        .await
        .context("connecting to DATABASE_URL")?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::error!(error = %err, "postgres connection closed");
        }
    });

    let store = webhook_pipeline::PostgresHitStore::new(client)
        .await
        .context("preparing webhook_hits table")?;
    info!("using postgres hit store");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn HitStore>> {
    if config.database_url.is_some() {
        tracing::warn!("DATABASE_URL ignored: built without the postgres feature");
    }
    Ok(Arc::new(InMemoryHitStore::new()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("loading configuration")?;
    init_tracing(config.log_format);

    let store = open_store(&config).await?;
    let registry = HandlerRegistry::from_bindings(config.handler_bindings(), &catalog())
        .context("binding webhook handlers")?;

    let dispatcher = Arc::new(Dispatcher::new(config.dispatcher.clone(), store, registry));
    dispatcher
        .recover_pending()
        .await
        .context("recovering pending webhook hits")?;

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %listener.local_addr()?, "listening for webhooks");

    serve(listener, dispatcher.clone(), async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    })
    .await
    .context("serving HTTP")?;

    dispatcher.shutdown().await;
    Ok(())
}
