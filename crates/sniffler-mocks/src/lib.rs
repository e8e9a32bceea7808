//! # Sniffler Mocks
//!
//! Mock Store (C4): a keyed collection of [`Mock`]s per proxy, with
//! exact-then-pattern matching, idempotent inserts, and FIFO eviction past
//! capacity (§4.4).

use std::collections::HashMap;

use chrono::Utc;
use sniffler_core::model::{Mock, MockKey};
use sniffler_core::pattern::pattern_of;
use tokio::sync::RwLock;

/// In-memory store of [`Mock`]s, keyed by `(proxy_port, method, url)` for
/// HTTP or `(proxy_port, "QUERY", query_norm)` for db mocks — both fit the
/// same [`MockKey`] shape.
pub struct MockStore {
    inner: RwLock<HashMap<MockKey, Mock>>,
    max_mock_history: usize,
}

/// Outcome of [`MockStore::add`]: whether a new mock was created or an
/// existing one with the same identity was returned untouched (§4.4
/// "idempotent on identity").
#[derive(Debug, Clone)]
pub struct AddOutcome {
    pub mock: Mock,
    pub created: bool,
}

impl MockStore {
    pub fn new(max_mock_history: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_mock_history,
        }
    }

    /// Insert `mock`, or return the existing mock at the same identity key
    /// unchanged (§4.4, §8: `add(m) ∘ add(m) = add(m)`).
    pub async fn add(&self, mut mock: Mock) -> AddOutcome {
        let key = mock.key();
        let mut guard = self.inner.write().await;

        if let Some(existing) = guard.get(&key) {
            return AddOutcome {
                mock: existing.clone(),
                created: false,
            };
        }

        let now = Utc::now();
        mock.created_at = now;
        mock.updated_at = now;
        guard.insert(key, mock.clone());

        evict_oldest_if_over_capacity(&mut guard, self.max_mock_history);

        AddOutcome { mock, created: true }
    }

    /// Exact-then-pattern match for an incoming request (§4.4
    /// `find_for_request`). Wildcard templates containing a literal `*`
    /// path segment are honored as a single-segment wildcard.
    pub async fn find_for_request(&self, proxy_port: u16, method: &str, url: &str, pattern_matching_enabled: bool) -> Option<Mock> {
        let guard = self.inner.read().await;

        let exact_key = MockKey {
            proxy_port,
            method: method.to_string(),
            url: url.to_string(),
        };
        if let Some(mock) = guard.get(&exact_key) {
            return Some(mock.clone());
        }

        if !pattern_matching_enabled {
            return None;
        }

        let requested_pattern = pattern_of(url);
        guard
            .values()
            .filter(|m| m.proxy_port == proxy_port && m.method.eq_ignore_ascii_case(method))
            .find(|m| pattern_of(&m.url) == requested_pattern || segments_match_wildcard(&m.url, url))
            .cloned()
    }

    pub async fn find_exact(&self, proxy_port: u16, method: &str, url: &str) -> Option<Mock> {
        let guard = self.inner.read().await;
        guard
            .get(&MockKey {
                proxy_port,
                method: method.to_string(),
                url: url.to_string(),
            })
            .cloned()
    }

    pub async fn list(&self, proxy_port: u16) -> Vec<Mock> {
        let guard = self.inner.read().await;
        let mut mocks: Vec<Mock> = guard.values().filter(|m| m.proxy_port == proxy_port).cloned().collect();
        mocks.sort_by_key(|m| m.created_at);
        mocks
    }

    /// All mocks matching `proxy_port` and `method`, used by drift
    /// detection (§4.6 step 4: "any mock, enabled or not").
    pub async fn all_for_method(&self, proxy_port: u16, method: &str) -> Vec<Mock> {
        let guard = self.inner.read().await;
        guard
            .values()
            .filter(|m| m.proxy_port == proxy_port && m.method.eq_ignore_ascii_case(method))
            .cloned()
            .collect()
    }

    pub async fn toggle(&self, key: &MockKey, enabled: bool) -> Option<Mock> {
        let mut guard = self.inner.write().await;
        if let Some(mock) = guard.get_mut(key) {
            mock.enabled = enabled;
            mock.updated_at = Utc::now();
            return Some(mock.clone());
        }
        None
    }

    pub async fn update(&self, key: &MockKey, mutate: impl FnOnce(&mut Mock)) -> Option<Mock> {
        let mut guard = self.inner.write().await;
        if let Some(mock) = guard.get_mut(key) {
            mutate(mock);
            mock.updated_at = Utc::now();
            return Some(mock.clone());
        }
        None
    }

    pub async fn remove(&self, key: &MockKey) -> Option<Mock> {
        self.inner.write().await.remove(key)
    }

    /// Remove every mock belonging to `proxy_port` (proxy deletion, §3
    /// lifecycle: "A Mock is owned by its proxy and deleted when the proxy
    /// is").
    pub async fn remove_all_for_proxy(&self, proxy_port: u16) {
        self.inner.write().await.retain(|k, _| k.proxy_port != proxy_port);
    }

    /// Export every mock for `proxy_port` as a JSON-serializable list
    /// ([SUPPLEMENT] 5: single JSON array).
    pub async fn export(&self, proxy_port: u16) -> Vec<Mock> {
        self.list(proxy_port).await
    }

    /// Import mocks, preserving `enabled` and timestamps (§4.4 `import`).
    /// Mocks whose identity already exists are left untouched, matching
    /// `add`'s idempotency.
    pub async fn import(&self, mocks: Vec<Mock>) -> Vec<AddOutcome> {
        let mut outcomes = Vec::with_capacity(mocks.len());
        for mock in mocks {
            let key = mock.key();
            let mut guard = self.inner.write().await;
            if let Some(existing) = guard.get(&key) {
                outcomes.push(AddOutcome {
                    mock: existing.clone(),
                    created: false,
                });
            } else {
                guard.insert(key, mock.clone());
                evict_oldest_if_over_capacity(&mut guard, self.max_mock_history);
                outcomes.push(AddOutcome { mock, created: true });
            }
        }
        outcomes
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

fn evict_oldest_if_over_capacity(map: &mut HashMap<MockKey, Mock>, capacity: usize) {
    while map.len() > capacity {
        if let Some(oldest_key) = map
            .iter()
            .min_by_key(|(_, mock)| mock.created_at)
            .map(|(key, _)| key.clone())
        {
            map.remove(&oldest_key);
        } else {
            break;
        }
    }
}

/// `true` if `template` contains a literal `*` path segment that matches
/// the corresponding segment of `url` position-for-position.
fn segments_match_wildcard(template: &str, url: &str) -> bool {
    let template_path = template.split(['?', '#']).next().unwrap_or(template);
    let url_path = url.split(['?', '#']).next().unwrap_or(url);

    let template_segments: Vec<&str> = template_path.split('/').collect();
    let url_segments: Vec<&str> = url_path.split('/').collect();

    if template_segments.len() != url_segments.len() {
        return false;
    }
    if !template_segments.contains(&"*") {
        return false;
    }

    template_segments
        .iter()
        .zip(url_segments.iter())
        .all(|(t, u)| *t == "*" || t == u)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_mock(proxy_port: u16, method: &str, url: &str, status_code: u16, body: &str) -> Mock {
        let now = Utc::now();
        Mock {
            id: uuid::Uuid::new_v4().to_string(),
            proxy_port,
            method: method.to_string(),
            url: url.to_string(),
            status_code,
            headers: HashMap::new(),
            body: body.to_string(),
            delay_ms: 0,
            enabled: true,
            name: None,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            auto_generated: false,
        }
    }

    #[tokio::test]
    async fn add_is_idempotent_by_identity() {
        let store = MockStore::new(100);
        let first = store.add(new_mock(8080, "GET", "/users", 200, "a")).await;
        assert!(first.created);

        let second = store.add(new_mock(8080, "GET", "/users", 200, "different body")).await;
        assert!(!second.created);
        assert_eq!(second.mock.body, "a");
    }

    #[tokio::test]
    async fn find_for_request_prefers_exact_match() {
        let store = MockStore::new(100);
        store.add(new_mock(8080, "GET", "/items/{id}", 200, "pattern")).await;
        store.add(new_mock(8080, "GET", "/items/42", 200, "exact")).await;

        let found = store.find_for_request(8080, "GET", "/items/42", true).await.unwrap();
        assert_eq!(found.body, "exact");
    }

    #[tokio::test]
    async fn find_for_request_falls_back_to_pattern() {
        let store = MockStore::new(100);
        store.add(new_mock(8080, "GET", "/items/{id}", 200, "pattern")).await;

        let found = store.find_for_request(8080, "GET", "/items/99", true).await.unwrap();
        assert_eq!(found.body, "pattern");
    }

    #[tokio::test]
    async fn find_for_request_respects_pattern_matching_flag() {
        let store = MockStore::new(100);
        store.add(new_mock(8080, "GET", "/items/{id}", 200, "pattern")).await;

        let found = store.find_for_request(8080, "GET", "/items/99", false).await;
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn wildcard_segment_matches() {
        let store = MockStore::new(100);
        store.add(new_mock(8080, "GET", "/users/*/profile", 200, "wild")).await;

        let found = store.find_for_request(8080, "GET", "/users/42/profile", true).await.unwrap();
        assert_eq!(found.body, "wild");
    }

    #[tokio::test]
    async fn disabled_mocks_are_still_findable_for_drift() {
        let store = MockStore::new(100);
        let mut mock = new_mock(8080, "GET", "/users", 200, "a");
        mock.enabled = false;
        store.add(mock).await;

        let all = store.all_for_method(8080, "GET").await;
        assert_eq!(all.len(), 1);
        assert!(!all[0].enabled);
    }

    #[tokio::test]
    async fn capacity_evicts_oldest_first() {
        let store = MockStore::new(2);
        store.add(new_mock(8080, "GET", "/a", 200, "a")).await;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store.add(new_mock(8080, "GET", "/b", 200, "b")).await;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store.add(new_mock(8080, "GET", "/c", 200, "c")).await;

        assert_eq!(store.len().await, 2);
        assert!(store.find_exact(8080, "GET", "/a").await.is_none());
        assert!(store.find_exact(8080, "GET", "/c").await.is_some());
    }

    #[tokio::test]
    async fn remove_all_for_proxy_clears_only_that_proxy() {
        let store = MockStore::new(100);
        store.add(new_mock(8080, "GET", "/a", 200, "a")).await;
        store.add(new_mock(9090, "GET", "/b", 200, "b")).await;

        store.remove_all_for_proxy(8080).await;
        assert_eq!(store.list(8080).await.len(), 0);
        assert_eq!(store.list(9090).await.len(), 1);
    }

    #[tokio::test]
    async fn export_import_round_trip_preserves_identity_and_enabled() {
        let store = MockStore::new(100);
        let mut mock = new_mock(8080, "GET", "/a", 200, "a");
        mock.enabled = false;
        store.add(mock).await;

        let exported = store.export(8080).await;

        let fresh = MockStore::new(100);
        let outcomes = fresh.import(exported).await;
        assert!(outcomes[0].created);
        assert!(!outcomes[0].mock.enabled);

        let reimport = fresh.import(fresh.export(8080).await).await;
        assert!(!reimport[0].created);
    }
}
