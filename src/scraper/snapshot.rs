use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{extract_identity, ApiClient, EntityKind, Identity};
use crate::db::{SnapshotRecord, Store};
use crate::health::HealthState;
use crate::scraper::gate::AdmissionGate;

/// Low-frequency loop capturing full entity records for all four kinds.
pub struct SnapshotScraper<S> {
    client: Arc<ApiClient>,
    store: Arc<S>,
    health: Arc<HealthState>,
    interval: Duration,
    gate: AdmissionGate,
}

impl<S: Store> SnapshotScraper<S> {
    pub fn new(
        client: Arc<ApiClient>,
        store: Arc<S>,
        health: Arc<HealthState>,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            store,
            health,
            interval,
            gate: AdmissionGate::new(),
        }
    }

    /// Run the scrape loop until the token is cancelled. Fires once
    /// immediately, then on the fixed interval. Cancellation drops an
    /// in-flight tick rather than draining it.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "snapshot scraper started");
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.tick(&cancel) => {}
                    }
                }
            }
        }
        info!("snapshot scraper stopped");
    }

    pub(crate) async fn tick(&self, cancel: &CancellationToken) {
        let Some(_permit) = self.gate.try_enter() else {
            warn!("snapshot tick skipped: previous still running");
            return;
        };

        let start = Instant::now();
        let tick_ts = Utc::now();

        // One tick-scoped context shared by all sub-scrapes. A sub-scrape
        // failure is isolated and never cancels its siblings.
        let tick_cancel = cancel.child_token();

        let (server, towns, nations, players) = tokio::join!(
            self.scrape_server(&tick_cancel, tick_ts),
            self.scrape_entities(&tick_cancel, EntityKind::Town, tick_ts),
            self.scrape_entities(&tick_cancel, EntityKind::Nation, tick_ts),
            self.scrape_entities(&tick_cancel, EntityKind::Player, tick_ts),
        );

        let mut failed = 0;
        for (kind, result) in [
            ("server", server),
            ("town", towns),
            ("nation", nations),
            ("player", players),
        ] {
            if let Err(e) = result {
                failed += 1;
                error!(
                    kind,
                    error = %e,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "snapshot sub-scrape failed"
                );
            }
        }

        if failed < 4 {
            self.health.record_snapshot_tick(tick_ts).await;
        }

        info!(
            failed,
            duration_ms = start.elapsed().as_millis() as u64,
            "snapshot tick complete"
        );
    }

    /// Single fetch, one fixed-shape typed row, no dimension table.
    async fn scrape_server(&self, cancel: &CancellationToken, tick_ts: DateTime<Utc>) -> Result<()> {
        let server = self
            .client
            .get_server(cancel)
            .await
            .context("get server status")?;

        self.store
            .insert_server_snapshot(tick_ts, &server)
            .await
            .context("insert server snapshot")?;

        info!(
            online = server.stats.num_online_players,
            towns = server.stats.num_towns,
            nations = server.stats.num_nations,
            "server snapshot saved"
        );
        Ok(())
    }

    /// Id list, batched detail fetch, opaque snapshot insert, dimension upsert.
    async fn scrape_entities(
        &self,
        cancel: &CancellationToken,
        kind: EntityKind,
        tick_ts: DateTime<Utc>,
    ) -> Result<()> {
        let list = self
            .client
            .get_entity_list(cancel, kind)
            .await
            .with_context(|| format!("get {} list", kind.label()))?;
        debug!(kind = kind.label(), count = list.len(), "fetched id list");

        let ids: Vec<String> = list.into_iter().map(|entry| entry.uuid).collect();
        let details = self
            .client
            .get_entity_details(cancel, kind, &ids)
            .await
            .with_context(|| format!("fetch {} details", kind.label()))?;

        // A record whose identity cannot be parsed is skipped; the rest of
        // the batch continues.
        let mut records = Vec::with_capacity(details.len());
        for raw in details {
            match extract_identity(&raw) {
                Ok(identity) => records.push(SnapshotRecord {
                    identity,
                    payload: raw,
                }),
                Err(e) => {
                    warn!(kind = kind.label(), error = %e, "skipping record with unparseable identity");
                }
            }
        }

        if records.is_empty() {
            debug!(kind = kind.label(), "no valid records this tick");
            return Ok(());
        }

        self.store
            .insert_snapshots(kind, tick_ts, &records)
            .await
            .with_context(|| format!("insert {} snapshots", kind.label()))?;

        let identities: Vec<Identity> = records.iter().map(|r| r.identity.clone()).collect();
        self.store
            .upsert_dimensions(kind, tick_ts, &identities)
            .await
            .with_context(|| format!("upsert {} dimensions", kind.label()))?;

        info!(
            kind = kind.label(),
            records = records.len(),
            "snapshot sub-scrape complete"
        );
        Ok(())
    }
}
