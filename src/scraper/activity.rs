use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{ApiClient, EntityKind, Identity, ListEntry, MapPlayer, MapPlayersResponse};
use crate::db::{ActivityRow, PartitionProvisioner, Store};
use crate::health::HealthState;
use crate::scraper::gate::AdmissionGate;

/// High-frequency loop capturing per-tick online/position state.
pub struct ActivityScraper<S> {
    client: Arc<ApiClient>,
    store: Arc<S>,
    provisioner: PartitionProvisioner<S>,
    health: Arc<HealthState>,
    interval: Duration,
    gate: AdmissionGate,
}

impl<S: Store> ActivityScraper<S> {
    pub fn new(
        client: Arc<ApiClient>,
        store: Arc<S>,
        health: Arc<HealthState>,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            provisioner: PartitionProvisioner::new(store.clone()),
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
        info!(interval_secs = self.interval.as_secs(), "activity scraper started");
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
        info!("activity scraper stopped");
    }

    pub(crate) async fn tick(&self, cancel: &CancellationToken) {
        let Some(_permit) = self.gate.try_enter() else {
            warn!("activity tick skipped: previous still running");
            return;
        };

        let start = Instant::now();
        let tick_ts = Utc::now();

        // Partitions must cover the tick timestamp before any row is written.
        self.provisioner.ensure(tick_ts).await;

        let (online, positions) = tokio::join!(
            self.client.get_online(cancel),
            self.client.get_positions(cancel),
        );

        let online = match online {
            Ok(resp) => resp,
            Err(e) => {
                error!(
                    error = %e,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "activity: failed to fetch online players"
                );
                return;
            }
        };

        // The position feed is best-effort; the tick proceeds without it.
        let positions = match positions {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "activity: failed to fetch map positions, proceeding without coordinates");
                MapPlayersResponse::default()
            }
        };

        let visible = positions.players.len();
        let rows = build_activity_rows(&online.players, &positions.players);
        if rows.is_empty() {
            debug!("activity: no online players");
            return;
        }

        if let Err(e) = self.store.insert_activity(tick_ts, &rows).await {
            error!(
                error = %e,
                rows = rows.len(),
                duration_ms = start.elapsed().as_millis() as u64,
                "activity: insert failed"
            );
            return;
        }

        let identities: Vec<Identity> = rows
            .iter()
            .map(|r| Identity {
                name: r.name.clone(),
                uuid: r.uuid.clone(),
            })
            .collect();
        if let Err(e) = self
            .store
            .upsert_dimensions(EntityKind::Player, tick_ts, &identities)
            .await
        {
            error!(error = %e, "activity: player dimension upsert failed");
        }

        self.health.record_activity_tick(tick_ts).await;

        info!(
            online = online.count,
            visible,
            inserted = rows.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "activity tick complete"
        );
    }
}

/// Strip formatting separators so ids from differently-formatted sources
/// join by identity. The map feed omits the dashes the main API includes.
pub(crate) fn normalize_id(raw: &str) -> String {
    raw.chars().filter(|c| *c != '-').collect()
}

/// Join the online list against the position feed by normalized id.
///
/// An online player absent from the feed is recorded as online but not
/// visible, with all position fields null.
pub(crate) fn build_activity_rows(
    online: &[ListEntry],
    positions: &[MapPlayer],
) -> Vec<ActivityRow> {
    let by_id: HashMap<String, &MapPlayer> = positions
        .iter()
        .map(|p| (normalize_id(&p.uuid), p))
        .collect();

    online
        .iter()
        .map(|player| {
            let mut row = ActivityRow {
                uuid: player.uuid.clone(),
                name: player.name.clone(),
                is_online: true,
                is_visible: false,
                x: None,
                y: None,
                z: None,
                yaw: None,
                world: None,
            };
            if let Some(pos) = by_id.get(normalize_id(&player.uuid).as_str()) {
                row.is_visible = true;
                row.x = Some(pos.x);
                row.y = Some(pos.y);
                row.z = Some(pos.z);
                row.yaw = Some(pos.yaw);
                row.world = Some(pos.world.clone());
            }
            row
        })
        .collect()
}
