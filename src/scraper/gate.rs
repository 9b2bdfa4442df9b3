use tokio::sync::{Semaphore, SemaphorePermit};

/// Single-slot, non-blocking admission gate.
///
/// `try_enter` succeeds for at most one holder at a time and never queues:
/// a concurrent second caller gets `None` immediately. The scrape loops use
/// this to drop a tick while the previous one is still running.
pub struct AdmissionGate {
    slot: Semaphore,
}

/// Held for the duration of one tick; releasing it re-opens the gate.
pub struct AdmissionPermit<'a> {
    _permit: SemaphorePermit<'a>,
}

impl AdmissionGate {
    pub fn new() -> Self {
        Self {
            slot: Semaphore::new(1),
        }
    }

    pub fn try_enter(&self) -> Option<AdmissionPermit<'_>> {
        self.slot
            .try_acquire()
            .ok()
            .map(|permit| AdmissionPermit { _permit: permit })
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_entry_denied_while_held() {
        let gate = AdmissionGate::new();
        let permit = gate.try_enter();
        assert!(permit.is_some());
        assert!(gate.try_enter().is_none());
        drop(permit);
        assert!(gate.try_enter().is_some());
    }

    #[tokio::test]
    async fn test_never_blocks() {
        let gate = std::sync::Arc::new(AdmissionGate::new());
        let _held = gate.try_enter().unwrap();

        // A denied caller returns immediately rather than queueing.
        let gate2 = gate.clone();
        let denied = tokio::time::timeout(std::time::Duration::from_millis(50), async move {
            gate2.try_enter().is_none()
        })
        .await
        .unwrap();
        assert!(denied);
    }
}
