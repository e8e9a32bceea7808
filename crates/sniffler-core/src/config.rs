//! Process-wide settings (§4.11 `settings` key, [AMBIENT] 3).

use serde::{Deserialize, Serialize};

/// Settings shared by every proxy in the process. Persisted under the
/// `settings` key and loaded once at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Gates mock serving across all three transports (GLOSSARY: "Testing
    /// mode").
    #[serde(default)]
    pub testing_mode: bool,
    #[serde(default = "default_true")]
    pub pattern_matching_enabled: bool,
    #[serde(default)]
    pub auto_save_as_mocks: bool,
    #[serde(default = "default_max_mock_history")]
    pub max_mock_history: usize,
    #[serde(default = "default_max_request_history")]
    pub max_request_history: usize,
    #[serde(default = "default_outgoing_dedup_window_ms")]
    pub outgoing_dedup_window_ms: u64,
    #[serde(default = "default_db_dedup_window_ms")]
    pub db_dedup_window_ms: u64,
    #[serde(default = "default_request_body_cap_bytes")]
    pub request_body_cap_bytes: usize,
    #[serde(default = "default_upstream_idle_timeout_ms")]
    pub upstream_idle_timeout_ms: u64,
    #[serde(default = "default_stop_grace_period_ms")]
    pub stop_grace_period_ms: u64,
    #[serde(default)]
    pub mocking_enabled_for_outgoing: bool,
    #[serde(default)]
    pub mocking_enabled_for_db: bool,
    #[serde(default)]
    pub filter_health_checks: bool,
    #[serde(default = "default_true")]
    pub global_auto_start: bool,
    #[serde(default = "default_tls_cert_cache_capacity")]
    pub tls_cert_cache_capacity: usize,
}

fn default_true() -> bool {
    true
}
fn default_max_mock_history() -> usize {
    10_000
}
fn default_max_request_history() -> usize {
    1_000
}
fn default_outgoing_dedup_window_ms() -> u64 {
    1_000
}
fn default_db_dedup_window_ms() -> u64 {
    1_000
}
fn default_request_body_cap_bytes() -> usize {
    1024 * 1024
}
fn default_upstream_idle_timeout_ms() -> u64 {
    30_000
}
fn default_stop_grace_period_ms() -> u64 {
    3_000
}
fn default_tls_cert_cache_capacity() -> usize {
    256
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            testing_mode: false,
            pattern_matching_enabled: true,
            auto_save_as_mocks: false,
            max_mock_history: default_max_mock_history(),
            max_request_history: default_max_request_history(),
            outgoing_dedup_window_ms: default_outgoing_dedup_window_ms(),
            db_dedup_window_ms: default_db_dedup_window_ms(),
            request_body_cap_bytes: default_request_body_cap_bytes(),
            upstream_idle_timeout_ms: default_upstream_idle_timeout_ms(),
            stop_grace_period_ms: default_stop_grace_period_ms(),
            mocking_enabled_for_outgoing: false,
            mocking_enabled_for_db: false,
            filter_health_checks: true,
            global_auto_start: true,
            tls_cert_cache_capacity: default_tls_cert_cache_capacity(),
        }
    }
}

/// Read the `LICENSING_API_URL` override (§6). The core never parses or
/// acts on the value beyond passing it through.
pub fn licensing_api_url_override() -> Option<String> {
    std::env::var("LICENSING_API_URL").ok()
}
