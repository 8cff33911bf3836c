//! Per-entity notification debouncing.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::gauge;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info};

/// Default minimum gap between two delivered notifications for one key.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(5000);

/// Default period of the stale-entry sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(60_000);

/// Suppresses repeat notifications for the same entity key within a window.
///
/// Entries are refreshed only when a notification passes. The sweep drops
/// entries older than twice the window.
pub struct Debouncer {
    window: Duration,
    last_delivered: DashMap<String, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_delivered: DashMap::new(),
        }
    }

    /// Whether a notification for `key` observed at `now` should be delivered.
    pub fn should_deliver(&self, key: &str, now: Instant) -> bool {
        match self.last_delivered.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if now.saturating_duration_since(*entry.get()) < self.window {
                    return false;
                }
                entry.insert(now);
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    /// Remove entries last delivered more than twice the window before `now`.
    /// Returns the number removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let ttl = self.window * 2;
        let before = self.last_delivered.len();
        self.last_delivered
            .retain(|_, last| now.saturating_duration_since(*last) <= ttl);
        before.saturating_sub(self.last_delivered.len())
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.last_delivered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_delivered.is_empty()
    }

    /// Run the sweep every `period` until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, period: Duration, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut ticker = interval(period);
        ticker.reset();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Debounce sweeper stopped");
                    break;
                }

                _ = ticker.tick() => {
                    let removed = self.sweep(Instant::now());
                    gauge!("gateway_debounce_entries").set(self.len() as f64);
                    if removed > 0 {
                        debug!("Debounce sweep removed {} entries ({} left)", removed, self.len());
                    }
                }
            }
        }
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_window_suppresses_repeat() {
        let debouncer = Debouncer::new(ms(5000));
        let t0 = Instant::now();

        assert!(debouncer.should_deliver("token/A", t0));
        assert!(!debouncer.should_deliver("token/A", t0 + ms(3000)));
        assert!(debouncer.should_deliver("token/A", t0 + ms(6000)));
        // Refreshed at 6000.
        assert!(!debouncer.should_deliver("token/A", t0 + ms(10_999)));
        assert!(debouncer.should_deliver("token/A", t0 + ms(11_000)));
    }

    #[test]
    fn test_keys_are_independent() {
        let debouncer = Debouncer::new(ms(5000));
        let t0 = Instant::now();

        assert!(debouncer.should_deliver("token/A", t0));
        assert!(debouncer.should_deliver("token/B", t0 + ms(1)));
        assert!(!debouncer.should_deliver("token/A", t0 + ms(2)));
        assert_eq!(debouncer.len(), 2);
    }

    #[test]
    fn test_sweep_drops_stale_entries() {
        let debouncer = Debouncer::new(ms(5000));
        let t0 = Instant::now();

        debouncer.should_deliver("old", t0);
        debouncer.should_deliver("fresh", t0 + ms(8000));

        assert_eq!(debouncer.sweep(t0 + ms(10_000)), 0);
        assert_eq!(debouncer.sweep(t0 + ms(10_001)), 1);
        assert_eq!(debouncer.len(), 1);

        // A swept key is delivered again as a first observation.
        assert!(debouncer.should_deliver("old", t0 + ms(10_002)));
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let debouncer = Arc::new(Debouncer::new(ms(1)));
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(debouncer.clone().run_sweeper(ms(5), rx));

        debouncer.should_deliver("k", Instant::now());
        tokio::time::sleep(ms(30)).await;
        assert!(debouncer.is_empty());

        tx.send(()).await.unwrap();
        handle.await.unwrap();
    }
}
