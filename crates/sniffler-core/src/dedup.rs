//! Rolling-window deduplication, shared by C7's outgoing-proxy request
//! coalescing (§4.7) and C8's intra-connection query coalescing (§4.8).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Coalesces identical `(a, b)` firings within a rolling window: the first
/// occurrence proceeds, subsequent ones inside the window are reported as
/// duplicates until the window lapses.
pub struct DedupWindow {
    window: Duration,
    last_seen: Mutex<HashMap<(String, String), Instant>>,
}

impl DedupWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// `true` if `(a, b)` was already seen within the window; always records
    /// the current occurrence regardless of the outcome.
    pub async fn is_duplicate(&self, a: &str, b: &str) -> bool {
        let key = (a.to_string(), b.to_string());
        let now = Instant::now();
        let mut guard = self.last_seen.lock().await;

        let duplicate = guard.get(&key).map(|seen| now.duration_since(*seen) < self.window).unwrap_or(false);
        guard.insert(key, now);
        duplicate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_firing_within_window_is_duplicate() {
        let dedup = DedupWindow::new(Duration::from_millis(200));
        assert!(!dedup.is_duplicate("GET", "/a").await);
        assert!(dedup.is_duplicate("GET", "/a").await);
    }

    #[tokio::test]
    async fn firing_after_window_is_not_duplicate() {
        let dedup = DedupWindow::new(Duration::from_millis(20));
        assert!(!dedup.is_duplicate("GET", "/a").await);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!dedup.is_duplicate("GET", "/a").await);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_collide() {
        let dedup = DedupWindow::new(Duration::from_millis(200));
        assert!(!dedup.is_duplicate("GET", "/a").await);
        assert!(!dedup.is_duplicate("POST", "/a").await);
        assert!(!dedup.is_duplicate("GET", "/b").await);
    }
}
