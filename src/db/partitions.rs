use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::db::Store;

/// How far ahead of the tick timestamp partitions are provisioned.
pub const PARTITION_AHEAD_HOURS: i32 = 48;

/// Minimum time between actual provisioning runs.
pub const PARTITION_COOLDOWN: Duration = Duration::from_secs(30 * 60);

/// Keeps activity partitions provisioned ahead of writes.
///
/// Calls within the cool-down are no-ops. A failed run does not update the
/// cool-down clock, so the next call retries.
pub struct PartitionProvisioner<S> {
    store: Arc<S>,
    cooldown: Duration,
    ahead_hours: i32,
    last_run: Mutex<Option<Instant>>,
}

impl<S: Store> PartitionProvisioner<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_cooldown(store, PARTITION_COOLDOWN, PARTITION_AHEAD_HOURS)
    }

    pub fn with_cooldown(store: Arc<S>, cooldown: Duration, ahead_hours: i32) -> Self {
        Self {
            store,
            cooldown,
            ahead_hours,
            last_run: Mutex::new(None),
        }
    }

    /// Ensure partitions exist covering [target, target + ahead window].
    /// Failure is logged and non-fatal.
    pub async fn ensure(&self, target: DateTime<Utc>) {
        let mut last_run = self.last_run.lock().await;
        if let Some(t) = *last_run {
            if t.elapsed() < self.cooldown {
                return;
            }
        }

        match self
            .store
            .ensure_activity_partitions(target, self.ahead_hours)
            .await
        {
            Ok(()) => {
                *last_run = Some(Instant::now());
                info!(
                    hours_ahead = self.ahead_hours,
                    "ensured activity partitions exist"
                );
            }
            Err(e) => {
                error!(error = %e, "failed to provision activity partitions");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::mock::MockStore;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_cooldown_suppresses_second_call() {
        let store = Arc::new(MockStore::new());
        let provisioner =
            PartitionProvisioner::with_cooldown(store.clone(), Duration::from_secs(60), 48);

        provisioner.ensure(Utc::now()).await;
        provisioner.ensure(Utc::now()).await;

        assert_eq!(store.partition_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_cooldown_runs_every_call() {
        let store = Arc::new(MockStore::new());
        let provisioner = PartitionProvisioner::with_cooldown(store.clone(), Duration::ZERO, 48);

        provisioner.ensure(Utc::now()).await;
        provisioner.ensure(Utc::now()).await;

        assert_eq!(store.partition_calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_run_retries_on_next_call() {
        let store = Arc::new(MockStore::new());
        let provisioner =
            PartitionProvisioner::with_cooldown(store.clone(), Duration::from_secs(3600), 48);

        store.fail_partitions.store(true, Ordering::SeqCst);
        provisioner.ensure(Utc::now()).await;
        assert!(store.partition_calls.lock().unwrap().is_empty());

        // Failure must not start the cool-down clock.
        store.fail_partitions.store(false, Ordering::SeqCst);
        provisioner.ensure(Utc::now()).await;
        assert_eq!(store.partition_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_passes_ahead_window() {
        let store = Arc::new(MockStore::new());
        let provisioner = PartitionProvisioner::with_cooldown(store.clone(), Duration::ZERO, 48);

        let target = Utc::now();
        provisioner.ensure(target).await;

        let calls = store.partition_calls.lock().unwrap();
        assert_eq!(calls[0], (target, 48));
    }
}
