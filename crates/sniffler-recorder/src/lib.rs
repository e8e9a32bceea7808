//! # Sniffler Recorder
//!
//! Request Recorder (C5): a bounded, ordered in-memory history per proxy,
//! with a background sweeper that resolves stale `pending` records (§4.5).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sniffler_core::events::{Event, SharedEventBus};
use sniffler_core::model::{RequestRecord, RequestStatus, Response};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// How often the stale-pending sweeper runs (§4.5).
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
/// A `pending` record older than this becomes `failed` (§4.5).
pub const STALE_PENDING_HORIZON: Duration = Duration::from_secs(30);

struct ProxyHistory {
    records: Mutex<VecDeque<RequestRecord>>,
}

impl ProxyHistory {
    fn new() -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
        }
    }
}

/// Per-proxy bounded deque of [`RequestRecord`]s, newest at the head, with
/// `request`/`response` event emission and a stale-pending sweeper.
pub struct RequestRecorder {
    per_proxy: RwLock<HashMap<u16, Arc<ProxyHistory>>>,
    max_request_history: usize,
    event_bus: SharedEventBus,
}

impl RequestRecorder {
    pub fn new(max_request_history: usize, event_bus: SharedEventBus) -> Arc<Self> {
        Arc::new(Self {
            per_proxy: RwLock::new(HashMap::new()),
            max_request_history,
            event_bus,
        })
    }

    async fn history_for(&self, proxy_port: u16) -> Arc<ProxyHistory> {
        if let Some(history) = self.per_proxy.read().await.get(&proxy_port) {
            return history.clone();
        }
        let mut guard = self.per_proxy.write().await;
        guard
            .entry(proxy_port)
            .or_insert_with(|| Arc::new(ProxyHistory::new()))
            .clone()
    }

    /// Append a new `pending` record and emit it as a `request` event
    /// (§4.5: "Every append emits the record as `request` event
    /// (pre-response)").
    pub async fn append(&self, record: RequestRecord) -> RequestRecord {
        let history = self.history_for(record.proxy_port).await;
        let mut guard = history.records.lock().await;

        guard.push_front(record.clone());
        while guard.len() > self.max_request_history {
            guard.pop_back();
        }
        drop(guard);

        self.event_bus
            .emit(
                Event::new("request", serializable(&record))
                    .with_key(format!("request:{}", record.id)),
            )
            .await;

        record
    }

    /// Finalize a record by id: set its terminal status, response, and
    /// error, then emit it as a `response` event. Returns the updated
    /// record, or `None` if the id is unknown.
    pub async fn finish(
        &self,
        proxy_port: u16,
        id: &str,
        status: RequestStatus,
        response: Option<Response>,
        error: Option<String>,
    ) -> Option<RequestRecord> {
        let history = self.history_for(proxy_port).await;
        let mut guard = history.records.lock().await;
        let record = guard.iter_mut().find(|r| r.id == id)?;
        record.finish(status, response, error);
        let finished = record.clone();
        drop(guard);

        self.event_bus
            .emit(
                Event::new("response", serializable(&finished))
                    .with_key(format!("response:{}", finished.id)),
            )
            .await;

        Some(finished)
    }

    pub async fn list(&self, proxy_port: u16) -> Vec<RequestRecord> {
        let history = self.history_for(proxy_port).await;
        let records = history.records.lock().await.iter().cloned().collect();
        records
    }

    /// Seed a proxy's history from persisted records without re-emitting
    /// `request`/`response` events for each one (§4.11 boot restore).
    /// `records` is expected newest-first, matching [`Self::list`]'s order.
    pub async fn import(&self, proxy_port: u16, records: Vec<RequestRecord>) {
        let history = self.history_for(proxy_port).await;
        let mut guard = history.records.lock().await;
        guard.extend(records);
        while guard.len() > self.max_request_history {
            guard.pop_back();
        }
    }

    pub async fn clear(&self, proxy_port: u16) {
        let history = self.history_for(proxy_port).await;
        history.records.lock().await.clear();
    }

    /// Drop a proxy's entire history (proxy deletion, §3 lifecycle).
    pub async fn remove_proxy(&self, proxy_port: u16) {
        self.per_proxy.write().await.remove(&proxy_port);
    }

    /// One sweep pass: finalize every `pending` record older than
    /// [`STALE_PENDING_HORIZON`] as `failed` with
    /// `error = "Request timed out"` (§4.5). Returns the number resolved.
    pub async fn sweep_once(&self) -> usize {
        let snapshot: Vec<u16> = self.per_proxy.read().await.keys().copied().collect();
        let mut resolved = 0;

        for proxy_port in snapshot {
            let history = self.history_for(proxy_port).await;
            let stale_ids: Vec<String> = {
                let guard = history.records.lock().await;
                guard
                    .iter()
                    .filter(|r| {
                        r.status == RequestStatus::Pending
                            && r.start_time
                                .map(|start| start.elapsed() >= STALE_PENDING_HORIZON)
                                .unwrap_or(false)
                    })
                    .map(|r| r.id.clone())
                    .collect()
            };

            for id in stale_ids {
                if self
                    .finish(
                        proxy_port,
                        &id,
                        RequestStatus::Failed,
                        None,
                        Some("Request timed out".to_string()),
                    )
                    .await
                    .is_some()
                {
                    resolved += 1;
                }
            }
        }

        resolved
    }

    /// Spawn the background sweeper task (§4.5: "runs every 10 s").
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let recorder = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let resolved = recorder.sweep_once().await;
                if resolved > 0 {
                    tracing::debug!(resolved, "stale-pending sweeper resolved timed-out requests");
                }
            }
        })
    }
}

fn serializable(record: &RequestRecord) -> serde_json::Value {
    serde_json::to_value(record).unwrap_or_else(|_| json!({"id": record.id}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sniffler_core::events::EventBus;

    fn bus() -> SharedEventBus {
        Arc::new(EventBus::new())
    }

    #[tokio::test]
    async fn append_then_finish_updates_status_and_duration() {
        let recorder = RequestRecorder::new(100, bus());
        let record = RequestRecord::new_pending(8080, "GET", "/a");
        let id = record.id.clone();
        recorder.append(record).await;

        let finished = recorder
            .finish(8080, &id, RequestStatus::Success, None, None)
            .await
            .unwrap();
        assert_eq!(finished.status, RequestStatus::Success);
        assert!(finished.duration_ms.is_some());
    }

    #[tokio::test]
    async fn newest_is_at_head_and_eviction_is_fifo() {
        let recorder = RequestRecorder::new(2, bus());
        recorder.append(RequestRecord::new_pending(8080, "GET", "/a")).await;
        recorder.append(RequestRecord::new_pending(8080, "GET", "/b")).await;
        recorder.append(RequestRecord::new_pending(8080, "GET", "/c")).await;

        let list = recorder.list(8080).await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].url, "/c");
        assert_eq!(list[1].url, "/b");
    }

    #[tokio::test]
    async fn sweep_resolves_stale_pending_records() {
        let recorder = RequestRecorder::new(100, bus());
        let mut record = RequestRecord::new_pending(8080, "GET", "/slow");
        record.start_time = Some(std::time::Instant::now() - Duration::from_secs(31));
        recorder.append(record).await;

        let resolved = recorder.sweep_once().await;
        assert_eq!(resolved, 1);

        let list = recorder.list(8080).await;
        assert_eq!(list[0].status, RequestStatus::Failed);
        assert_eq!(list[0].error.as_deref(), Some("Request timed out"));
    }

    #[tokio::test]
    async fn sweep_leaves_fresh_pending_alone() {
        let recorder = RequestRecorder::new(100, bus());
        recorder.append(RequestRecord::new_pending(8080, "GET", "/fast")).await;

        let resolved = recorder.sweep_once().await;
        assert_eq!(resolved, 0);
    }

    #[tokio::test]
    async fn clear_empties_history() {
        let recorder = RequestRecorder::new(100, bus());
        recorder.append(RequestRecord::new_pending(8080, "GET", "/a")).await;
        recorder.clear(8080).await;
        assert!(recorder.list(8080).await.is_empty());
    }

    #[tokio::test]
    async fn import_seeds_history_without_emitting_events() {
        let recorder = RequestRecorder::new(100, bus());
        let mut rx = recorder.event_bus.subscribe();

        let mut record = RequestRecord::new_pending(8080, "GET", "/restored");
        record.finish(RequestStatus::Success, None, None);
        recorder.import(8080, vec![record]).await;

        assert_eq!(recorder.list(8080).await.len(), 1);
        assert!(rx.try_recv().is_err());
    }
}
