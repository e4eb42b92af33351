use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::api::Reachability;

/// Shared online/offline signal.
///
/// Starts offline; subscribers are only woken when the value actually changes.
#[derive(Debug, Clone)]
pub struct NetworkStatus {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkStatus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_offline(&self) -> bool {
        *self.tx.borrow()
    }

    /// Publishes the new state. Returns whether it differed from the old one.
    pub fn set_offline(&self, offline: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == offline {
                false
            } else {
                *current = offline;
                true
            }
        });
        if changed {
            if offline {
                log::warn!("Network went offline");
            } else {
                log::info!("Network is back online");
            }
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Asks `probe` every `interval` and publishes the answer.
pub async fn run_probe<R: Reachability>(probe: &R, status: &NetworkStatus, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let reachable = probe.is_reachable().await;
        status.set_offline(!reachable);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    struct Toggle(AtomicBool);

    impl Reachability for Toggle {
        async fn is_reachable(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_starts_offline_and_reports_changes_once() {
        let status = NetworkStatus::new();
        assert!(status.is_offline());

        assert!(!status.set_offline(true));
        assert!(status.set_offline(false));
        assert!(!status.is_offline());
        assert!(!status.set_offline(false));
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let status = NetworkStatus::new();
        let mut rx = status.subscribe();

        status.set_offline(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());

        // Same value again must not wake the subscriber.
        status.set_offline(false);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_probe_publishes_reachability() {
        let status = NetworkStatus::new();
        let mut rx = status.subscribe();
        let probe = Toggle(AtomicBool::new(true));

        let handle = {
            let status = status.clone();
            tokio::spawn(async move {
                run_probe(&probe, &status, Duration::from_millis(5)).await;
            })
        };

        rx.changed().await.unwrap();
        assert!(!status.is_offline());
        handle.abort();
    }
}
