use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use terralog::api::ApiClient;
use terralog::config::Config;
use terralog::db::{self, PgStore};
use terralog::health::{self, HealthState};
use terralog::scraper::{ActivityScraper, SnapshotScraper};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "terralog=info".into()),
        )
        .init();

    info!("terralog starting");

    let config = Config::from_env()?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let pool = db::connect(&config).await?;
    db::migrate(&pool).await?;

    let store = Arc::new(PgStore::new(pool));
    let client = Arc::new(ApiClient::from_config(&config)?);
    let state = Arc::new(HealthState::new());

    let activity = ActivityScraper::new(
        client.clone(),
        store.clone(),
        state.clone(),
        Duration::from_secs(config.activity_interval_secs),
    );
    let snapshot = SnapshotScraper::new(
        client,
        store.clone(),
        state.clone(),
        Duration::from_secs(config.snapshot_interval_secs),
    );

    let health_task = tokio::spawn(health::serve(
        config.http_port,
        store,
        state,
        cancel.clone(),
    ));
    let activity_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { activity.run(cancel).await }
    });
    let snapshot_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { snapshot.run(cancel).await }
    });

    // The health server exits on shutdown or on a bind failure; either way
    // the scrape loops must stop with it.
    match health_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "health server failed"),
        Err(e) => error!(error = %e, "health server task panicked"),
    }
    cancel.cancel();

    let _ = tokio::join!(activity_task, snapshot_task);

    info!("terralog shutdown complete");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                cancel.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received ctrl-c, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c, shutting down");
    }
    cancel.cancel();
}
