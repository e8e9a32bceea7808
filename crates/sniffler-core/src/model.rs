//! The entities of §3: `ProxyConfig`, `RuntimeProxy` stats, `Mock`,
//! `RequestRecord`, and `DriftReport`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One of the three transports a proxy can run as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    Normal,
    Outgoing,
    Db,
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Outgoing => write!(f, "outgoing"),
            Self::Db => write!(f, "db"),
        }
    }
}

/// Wire protocol spoken by a `db`-kind proxy's upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbProtocol {
    #[default]
    Postgres,
    Mysql,
    Mongodb,
    Redis,
    Other,
}

impl std::fmt::Display for DbProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
            Self::Mysql => write!(f, "mysql"),
            Self::Mongodb => write!(f, "mongodb"),
            Self::Redis => write!(f, "redis"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Persisted description of one proxy (§3 `ProxyConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub port: u16,
    pub name: String,
    /// `normal`/`db`: upstream host. Unused for `outgoing`.
    #[serde(default)]
    pub target_host: Option<String>,
    /// `normal`/`db`: upstream port. Unused for `outgoing`.
    #[serde(default)]
    pub target_port: Option<u16>,
    /// `outgoing`: scheme+authority+optional path prefix.
    #[serde(default)]
    pub target_url: Option<String>,
    #[serde(default)]
    pub protocol: Option<DbProtocol>,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub running_at_last_shutdown: bool,
    pub created_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl ProxyConfig {
    /// Validate the invariants of §3(a)/(b) that are local to a single
    /// config (port range, self-loop). Uniqueness-per-kind is enforced by
    /// the registry, which sees every config at once.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::config_invalid("port must be in [1, 65535]"));
        }
        if self.name.trim().is_empty() {
            return Err(Error::config_invalid("name must not be empty"));
        }
        if self.kind == ProxyKind::Normal {
            let is_loopback = self
                .target_host
                .as_deref()
                .map(is_loopback_host)
                .unwrap_or(false);
            if is_loopback && self.target_port == Some(self.port) {
                return Err(Error::config_invalid(
                    "self-loop: target_host:target_port must not equal the proxy's own port on loopback",
                ));
            }
        }
        Ok(())
    }
}

fn is_loopback_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// Point-in-time counters for a running proxy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProxyStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub mocks_served: u64,
}

impl ProxyStats {
    /// §8 invariant 5: `total = success + failed + mocks_served`.
    pub fn is_consistent(&self) -> bool {
        self.total == self.success + self.failed + self.mocks_served
    }
}

/// A captured or canned HTTP response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// A matcher plus canned response (§3 `Mock`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mock {
    pub id: String,
    pub proxy_port: u16,
    /// HTTP method, or the literal `"QUERY"` for db mocks.
    pub method: String,
    /// Request URL (HTTP) or normalized query text (db).
    pub url: String,
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub delay_ms: u64,
    pub enabled: bool,
    pub name: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub auto_generated: bool,
}

/// The identity key a `Mock` is addressed by (§3: exactly one mock per key).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MockKey {
    pub proxy_port: u16,
    pub method: String,
    pub url: String,
}

impl Mock {
    pub fn key(&self) -> MockKey {
        MockKey {
            proxy_port: self.proxy_port,
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }
}

/// Final disposition of a `RequestRecord` (never remains `Pending`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Success,
    Failed,
    Timeout,
    Mocked,
}

/// One captured exchange (§3 `RequestRecord`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Monotonic start instant, serialized as milliseconds since an
    /// arbitrary epoch for persistence; only deltas are meaningful.
    #[serde(skip)]
    pub start_time: Option<std::time::Instant>,
    pub duration_ms: Option<u64>,
    pub proxy_port: u16,
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub response: Option<Response>,
    pub status: RequestStatus,
    pub error: Option<String>,
    pub served_from_mock: bool,
    pub mock_comparison: Option<DriftReport>,
}

impl RequestRecord {
    pub fn new_pending(proxy_port: u16, method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            start_time: Some(std::time::Instant::now()),
            duration_ms: None,
            proxy_port,
            method: method.into(),
            url: url.into(),
            headers: HashMap::new(),
            body: String::new(),
            response: None,
            status: RequestStatus::Pending,
            error: None,
            served_from_mock: false,
            mock_comparison: None,
        }
    }

    /// Finalize the record. §3 invariant (c): `duration_ms` is set exactly
    /// once, here, at the single place a record transitions out of
    /// `Pending`.
    pub fn finish(&mut self, status: RequestStatus, response: Option<Response>, error: Option<String>) {
        debug_assert_ne!(status, RequestStatus::Pending, "finish() must not set Pending");
        if let Some(start) = self.start_time.take() {
            self.duration_ms = Some(start.elapsed().as_millis() as u64);
        }
        self.status = status;
        self.response = response;
        self.error = error;
    }
}

/// Kind of a single field-level divergence in a [`DriftReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifferenceKind {
    Status,
    Header,
    Value,
    Missing,
    Extra,
}

/// One field-level divergence between a mock and a live response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Difference {
    pub path: String,
    pub expected: String,
    pub actual: String,
    pub kind: DifferenceKind,
}

/// Emitted when a live response is observed for a route that also has a
/// mock (§3 `DriftReport`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftReport {
    pub has_differences: bool,
    pub differences: Vec<Difference>,
    pub summary: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kind: ProxyKind, port: u16, target_port: Option<u16>) -> ProxyConfig {
        ProxyConfig {
            kind,
            port,
            name: "test".to_string(),
            target_host: Some("localhost".to_string()),
            target_port,
            target_url: None,
            protocol: None,
            auto_start: true,
            disabled: false,
            running_at_last_shutdown: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn rejects_port_zero() {
        let cfg = config(ProxyKind::Normal, 0, Some(3000));
        assert!(matches!(cfg.validate(), Err(Error::ConfigInvalid { .. })));
    }

    #[test]
    fn rejects_self_loop() {
        let cfg = config(ProxyKind::Normal, 8080, Some(8080));
        assert!(matches!(cfg.validate(), Err(Error::ConfigInvalid { .. })));
    }

    #[test]
    fn accepts_distinct_target_port() {
        let cfg = config(ProxyKind::Normal, 8080, Some(3000));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn stats_consistency() {
        let stats = ProxyStats {
            total: 3,
            success: 1,
            failed: 1,
            mocks_served: 1,
        };
        assert!(stats.is_consistent());
    }

    #[test]
    fn request_record_finish_sets_duration_once() {
        let mut record = RequestRecord::new_pending(8080, "GET", "/a");
        assert!(record.start_time.is_some());
        record.finish(RequestStatus::Success, None, None);
        assert!(record.duration_ms.is_some());
        assert!(record.start_time.is_none());
    }
}
