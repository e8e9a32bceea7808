//! Proxy Registry & Lifecycle (C9): owns every `ProxyConfig` and
//! `RuntimeProxy`, runs boot orchestration, and exposes the admin operation
//! surface as typed `AdminResult`s that never throw across the boundary
//! (§7).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use sniffler_core::config::Settings;
use sniffler_core::events::{Event, SharedEventBus};
use sniffler_core::model::{Mock, MockKey, ProxyConfig, ProxyKind, ProxyStats, RequestRecord, RequestStatus, Response};
use sniffler_core::pattern::should_mock;
use sniffler_core::persistence::PersistenceStore;
use sniffler_core::{AdminResult, Error, Result};
use sniffler_mocks::MockStore;
use sniffler_proxy::ca::RootCa;
use sniffler_proxy::http::forward_live;
use sniffler_proxy::pipeline::{Pipeline, PipelineConfig};
use sniffler_proxy::port_probe;
use sniffler_recorder::RequestRecorder;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::runtime::{RuntimeProxy, SpawnContext};

/// Request-history and mock writes for the same proxy within this window
/// are coalesced into a single persisted snapshot (§4.11).
const FLUSH_COALESCE_WINDOW: Duration = Duration::from_millis(500);

/// Upper bound on starting a single proxy (§4.9 step g).
const START_TIMEOUT: Duration = Duration::from_secs(30);
/// Cross-port lifecycle operations run concurrently up to this many at a
/// time (§4.9 "bounded concurrency").
const MAX_CONCURRENT_LIFECYCLE_OPS: usize = 8;

fn namespace(kind: ProxyKind) -> &'static str {
    match kind {
        ProxyKind::Normal => "normal",
        ProxyKind::Outgoing => "outgoing",
        ProxyKind::Db => "db",
    }
}

fn configs_key(kind: ProxyKind) -> String {
    format!("proxies/{}/configs", namespace(kind))
}

fn mocks_key(kind: ProxyKind, port: u16) -> String {
    format!("proxies/{}/{port}/mocks", namespace(kind))
}

fn requests_key(kind: ProxyKind, port: u16) -> String {
    format!("proxies/{}/{port}/requests", namespace(kind))
}

/// The process-wide registry: the only place a `ProxyConfig` or
/// `RuntimeProxy` is stored (§3 "Ownership").
pub struct ProxyRegistry {
    configs: Mutex<HashMap<u16, ProxyConfig>>,
    runtimes: Mutex<HashMap<u16, RuntimeProxy>>,
    /// One lock per port, lazily created, serializing lifecycle operations
    /// on that port (§4.9 "Concurrency").
    port_locks: Mutex<HashMap<u16, Arc<Mutex<()>>>>,
    cross_port: Semaphore,
    persistence: Arc<PersistenceStore>,
    mocks: Arc<MockStore>,
    recorder: Arc<RequestRecorder>,
    events: SharedEventBus,
    settings: RwLock<Settings>,
    ca: Arc<RootCa>,
    http_client: reqwest::Client,
    /// Ports with a mock-store flush already scheduled (§4.11 coalescing).
    mocks_flush_pending: Mutex<HashSet<u16>>,
    /// Ports with a request-history flush already scheduled.
    requests_flush_pending: Mutex<HashSet<u16>>,
}

impl ProxyRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        persistence: Arc<PersistenceStore>,
        mocks: Arc<MockStore>,
        recorder: Arc<RequestRecorder>,
        events: SharedEventBus,
        ca: Arc<RootCa>,
        settings: Settings,
    ) -> Arc<Self> {
        Arc::new(Self {
            configs: Mutex::new(HashMap::new()),
            runtimes: Mutex::new(HashMap::new()),
            port_locks: Mutex::new(HashMap::new()),
            cross_port: Semaphore::new(MAX_CONCURRENT_LIFECYCLE_OPS),
            persistence,
            mocks,
            recorder,
            events,
            settings: RwLock::new(settings),
            ca,
            http_client: reqwest::Client::new(),
            mocks_flush_pending: Mutex::new(HashSet::new()),
            requests_flush_pending: Mutex::new(HashSet::new()),
        })
    }

    async fn port_lock(&self, port: u16) -> Arc<Mutex<()>> {
        self.port_locks.lock().await.entry(port).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    async fn persist_configs(&self) -> Result<()> {
        let configs = self.configs.lock().await;
        for kind in [ProxyKind::Normal, ProxyKind::Outgoing, ProxyKind::Db] {
            let list: Vec<ProxyConfig> = configs.values().filter(|c| c.kind == kind).cloned().collect();
            self.persistence.save(&configs_key(kind), &list).await?;
        }
        Ok(())
    }

    async fn load_mocks(&self, config: &ProxyConfig) {
        match self.persistence.load::<Vec<Mock>>(&mocks_key(config.kind, config.port)).await {
            Ok(Some(mocks)) => {
                self.mocks.import(mocks).await;
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(%err, port = config.port, "failed to load persisted mocks"),
        }
    }

    async fn load_requests(&self, config: &ProxyConfig) {
        match self.persistence.load::<Vec<RequestRecord>>(&requests_key(config.kind, config.port)).await {
            Ok(Some(records)) => {
                self.recorder.import(config.port, records).await;
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(%err, port = config.port, "failed to load persisted request history"),
        }
    }

    /// Persist the current in-memory mock set for `port` under its
    /// namespaced key. Called only from the debounced flush task, never
    /// inline on the hot path.
    async fn persist_mocks(&self, port: u16) {
        let Some(kind) = self.configs.lock().await.get(&port).map(|c| c.kind) else {
            return;
        };
        let mocks = self.mocks.export(port).await;
        if let Err(err) = self.persistence.save(&mocks_key(kind, port), &mocks).await {
            tracing::warn!(%err, port, "failed to persist mocks");
        }
    }

    async fn persist_requests(&self, port: u16) {
        let Some(kind) = self.configs.lock().await.get(&port).map(|c| c.kind) else {
            return;
        };
        let records = self.recorder.list(port).await;
        if let Err(err) = self.persistence.save(&requests_key(kind, port), &records).await {
            tracing::warn!(%err, port, "failed to persist request history");
        }
    }

    /// Schedule a debounced mock-store flush for `port` (§4.11 "writes...
    /// within 500ms are batched"). A no-op if a flush is already pending.
    async fn schedule_mocks_flush(self: &Arc<Self>, port: u16) {
        {
            let mut pending = self.mocks_flush_pending.lock().await;
            if !pending.insert(port) {
                return;
            }
        }
        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(FLUSH_COALESCE_WINDOW).await;
            registry.mocks_flush_pending.lock().await.remove(&port);
            registry.persist_mocks(port).await;
        });
    }

    async fn schedule_requests_flush(self: &Arc<Self>, port: u16) {
        {
            let mut pending = self.requests_flush_pending.lock().await;
            if !pending.insert(port) {
                return;
            }
        }
        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(FLUSH_COALESCE_WINDOW).await;
            registry.requests_flush_pending.lock().await.remove(&port);
            registry.persist_requests(port).await;
        });
    }

    /// Attach to the event bus and translate mutation events into debounced
    /// persistence flushes — the only subscriber that ever calls
    /// `EventBus::attach` (no separate UI transport exists in this
    /// workspace, so the registry is the bus's sole consumer).
    pub fn spawn_persistence_bridge(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let (drained, mut rx) = registry.events.attach().await;
            for event in drained {
                registry.route_persistence_event(&event).await;
            }
            while let Ok(event) = rx.recv().await {
                registry.route_persistence_event(&event).await;
            }
        })
    }

    async fn route_persistence_event(self: &Arc<Self>, event: &Event) {
        let port = event.payload.get("proxy_port").and_then(Value::as_u64).map(|p| p as u16);
        let Some(port) = port else {
            return;
        };
        match event.channel.as_str() {
            "request" | "response" => self.schedule_requests_flush(port).await,
            "mock-auto-created" | "mock-added" | "mock-removed" | "mock-updated" | "mock-imported" => {
                self.schedule_mocks_flush(port).await
            }
            _ => {}
        }
    }

    async fn spawn_context(&self) -> SpawnContext {
        let settings = self.settings.read().await;
        SpawnContext {
            mocks: self.mocks.clone(),
            recorder: self.recorder.clone(),
            events: self.events.clone(),
            ca: self.ca.clone(),
            http_client: self.http_client.clone(),
            testing_mode: settings.testing_mode,
            pattern_matching_enabled: settings.pattern_matching_enabled,
            auto_save_as_mocks: settings.auto_save_as_mocks,
            mocking_enabled_for_outgoing: settings.mocking_enabled_for_outgoing,
            mocking_enabled_for_db: settings.mocking_enabled_for_db,
            filter_health_checks: settings.filter_health_checks,
            request_body_cap_bytes: settings.request_body_cap_bytes,
            outgoing_dedup_window: Duration::from_millis(settings.outgoing_dedup_window_ms),
            db_dedup_window: Duration::from_millis(settings.db_dedup_window_ms),
        }
    }

    async fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.settings.read().await.stop_grace_period_ms)
    }

    /// Fold a proxy's recorded history into point-in-time counters (§3
    /// `RuntimeProxy.stats`). Computed on demand from C5 rather than
    /// tracked incrementally, so there is exactly one source of truth.
    async fn stats_for(&self, port: u16) -> ProxyStats {
        let records = self.recorder.list(port).await;
        let mut stats = ProxyStats::default();
        for record in &records {
            match record.status {
                RequestStatus::Success => {
                    stats.success += 1;
                    stats.total += 1;
                }
                RequestStatus::Failed | RequestStatus::Timeout => {
                    stats.failed += 1;
                    stats.total += 1;
                }
                RequestStatus::Mocked => {
                    stats.mocks_served += 1;
                    stats.total += 1;
                }
                RequestStatus::Pending => {}
            }
        }
        stats
    }

    /// Load persisted configs and start every one that should auto-start
    /// (§4.9 "Boot orchestration"), sequentially as specified.
    pub async fn boot(self: &Arc<Self>) -> Vec<AdminResult> {
        let mut loaded = Vec::new();
        for kind in [ProxyKind::Normal, ProxyKind::Outgoing, ProxyKind::Db] {
            match self.persistence.load::<Vec<ProxyConfig>>(&configs_key(kind)).await {
                Ok(Some(list)) => loaded.extend(list),
                Ok(None) => {}
                Err(err) => tracing::warn!(%err, kind = %kind, "failed to load persisted configs"),
            }
        }

        {
            let mut configs = self.configs.lock().await;
            for config in &loaded {
                configs.insert(config.port, config.clone());
            }
        }

        let global_auto_start = self.settings.read().await.global_auto_start;
        let mut results = Vec::new();
        for config in loaded {
            let should_start = config.auto_start && !config.disabled && global_auto_start;
            if should_start {
                results.push(self.start(config.port).await);
            }
        }
        results
    }

    async fn start_impl(self: &Arc<Self>, port: u16, bypass_disabled: bool) -> AdminResult {
        let _permit = match self.cross_port.acquire().await {
            Ok(permit) => permit,
            Err(_) => return AdminResult::denied("registry is shutting down"),
        };
        let lock = self.port_lock(port).await;
        let _guard = lock.lock().await;

        if self.runtimes.lock().await.contains_key(&port) {
            return AdminResult::ok(format!("proxy on port {port} is already running"));
        }

        let Some(config) = self.configs.lock().await.get(&port).cloned() else {
            return AdminResult::from(Error::config_invalid(format!("no proxy configured on port {port}")));
        };

        if config.disabled && !bypass_disabled {
            return AdminResult::denied(format!("proxy on port {port} is disabled"));
        }

        // (b) port-in-use pre-check — RuntimeProxy::spawn would catch this
        // too, but probing first gives a typed error without ever binding.
        if port_probe::is_bound(port).await {
            return AdminResult::from(Error::port_in_use(port));
        }

        // (c) informational target probe — never blocks start.
        if let (Some(host), Some(target_port)) = (&config.target_host, config.target_port) {
            if !port_probe::is_reachable(host, target_port).await {
                tracing::warn!(port, target_host = %host, target_port, "target unreachable at start, continuing anyway");
            }
        }

        self.load_mocks(&config).await;
        self.load_requests(&config).await;

        let ctx = self.spawn_context().await;
        let runtime = match tokio::time::timeout(START_TIMEOUT, RuntimeProxy::spawn(&config, &ctx)).await {
            Ok(Ok(runtime)) => runtime,
            Ok(Err(err)) => return AdminResult::from(err),
            Err(_elapsed) => return AdminResult::from(Error::timeout(format!("starting proxy on port {port} exceeded {START_TIMEOUT:?}"))),
        };

        // (h) verify by self-connect.
        if !port_probe::is_reachable("127.0.0.1", port).await {
            runtime.stop(Duration::from_millis(0)).await;
            return AdminResult::from(Error::internal(format!("proxy on port {port} failed self-connect verification")));
        }

        runtime.mark_ready();
        self.runtimes.lock().await.insert(port, runtime);
        self.events
            .emit(Event::new("proxy-started", json!({"port": port, "kind": config.kind, "name": config.name})))
            .await;

        AdminResult::ok(format!("proxy on port {port} started"))
    }

    pub async fn start(self: &Arc<Self>, port: u16) -> AdminResult {
        self.start_impl(port, false).await
    }

    /// Starts the proxy even if `disabled` (§4.9 operations: `force_start`).
    pub async fn force_start(self: &Arc<Self>, port: u16) -> AdminResult {
        self.start_impl(port, true).await
    }

    pub async fn stop(self: &Arc<Self>, port: u16) -> AdminResult {
        let _permit = match self.cross_port.acquire().await {
            Ok(permit) => permit,
            Err(_) => return AdminResult::denied("registry is shutting down"),
        };
        let lock = self.port_lock(port).await;
        let _guard = lock.lock().await;

        let Some(runtime) = self.runtimes.lock().await.remove(&port) else {
            return AdminResult::ok(format!("proxy on port {port} is not running"));
        };

        runtime.stop(self.stop_grace().await).await;
        self.events.emit(Event::new("proxy-stopped", json!({"port": port}))).await;
        AdminResult::ok(format!("proxy on port {port} stopped"))
    }

    pub async fn create(self: &Arc<Self>, config: ProxyConfig) -> AdminResult {
        if let Err(err) = config.validate() {
            return AdminResult::from(err);
        }

        let should_start = {
            let _permit = match self.cross_port.acquire().await {
                Ok(permit) => permit,
                Err(_) => return AdminResult::denied("registry is shutting down"),
            };
            let lock = self.port_lock(config.port).await;
            let _guard = lock.lock().await;

            {
                let mut configs = self.configs.lock().await;
                if configs.contains_key(&config.port) {
                    return AdminResult::from(Error::config_invalid(format!("port {} is already configured", config.port)));
                }
                configs.insert(config.port, config.clone());
            }

            if let Err(err) = self.persist_configs().await {
                self.configs.lock().await.remove(&config.port);
                return AdminResult::from(err);
            }

            self.events
                .emit(Event::new("proxy-created", json!({"port": config.port, "kind": config.kind, "name": config.name})))
                .await;

            config.auto_start && !config.disabled && self.settings.read().await.global_auto_start
        };

        if should_start {
            self.start(config.port).await
        } else {
            AdminResult::ok(format!("proxy on port {} created", config.port))
        }
    }

    /// Apply `mutate` to the persisted config on `port`. Refused while the
    /// proxy is running (§4.9 "update (only when stopped)"). If `mutate`
    /// changes the port, the config moves to the new key; a concurrent
    /// lifecycle op racing on the *new* port number during this call is an
    /// accepted simplification, since only the *old* port's lock is held.
    pub async fn update(self: &Arc<Self>, port: u16, mutate: impl FnOnce(&mut ProxyConfig)) -> AdminResult {
        let _permit = match self.cross_port.acquire().await {
            Ok(permit) => permit,
            Err(_) => return AdminResult::denied("registry is shutting down"),
        };
        let lock = self.port_lock(port).await;
        let _guard = lock.lock().await;

        if self.runtimes.lock().await.contains_key(&port) {
            return AdminResult::denied(format!("proxy on port {port} must be stopped before updating"));
        }

        let mut configs = self.configs.lock().await;
        let Some(mut config) = configs.get(&port).cloned() else {
            return AdminResult::from(Error::config_invalid(format!("no proxy configured on port {port}")));
        };

        let old_port = config.port;
        mutate(&mut config);

        if let Err(err) = config.validate() {
            return AdminResult::from(err);
        }

        if config.port != old_port && configs.contains_key(&config.port) {
            return AdminResult::from(Error::config_invalid(format!("port {} is already configured", config.port)));
        }

        configs.remove(&old_port);
        configs.insert(config.port, config.clone());
        drop(configs);

        if let Err(err) = self.persist_configs().await {
            return AdminResult::from(err);
        }

        self.events.emit(Event::new("proxy-updated", json!({"port": config.port, "name": config.name}))).await;
        AdminResult::ok(format!("proxy on port {} updated", config.port))
    }

    async fn set_disabled(self: &Arc<Self>, port: u16, disabled: bool) -> AdminResult {
        let _permit = match self.cross_port.acquire().await {
            Ok(permit) => permit,
            Err(_) => return AdminResult::denied("registry is shutting down"),
        };
        let lock = self.port_lock(port).await;
        let _guard = lock.lock().await;

        {
            let mut configs = self.configs.lock().await;
            let Some(config) = configs.get_mut(&port) else {
                return AdminResult::from(Error::config_invalid(format!("no proxy configured on port {port}")));
            };
            config.disabled = disabled;
        }

        if let Err(err) = self.persist_configs().await {
            return AdminResult::from(err);
        }

        // §3 invariant (c): disabled ⇒ not running.
        if disabled {
            if let Some(runtime) = self.runtimes.lock().await.remove(&port) {
                runtime.stop(self.stop_grace().await).await;
            }
        }

        self.events.emit(Event::new("proxy-disabled-changed", json!({"port": port, "disabled": disabled}))).await;
        AdminResult::ok(format!("proxy on port {port} {}", if disabled { "disabled" } else { "enabled" }))
    }

    pub async fn enable(self: &Arc<Self>, port: u16) -> AdminResult {
        self.set_disabled(port, false).await
    }

    pub async fn disable(self: &Arc<Self>, port: u16) -> AdminResult {
        self.set_disabled(port, true).await
    }

    pub async fn delete(self: &Arc<Self>, port: u16) -> AdminResult {
        let _permit = match self.cross_port.acquire().await {
            Ok(permit) => permit,
            Err(_) => return AdminResult::denied("registry is shutting down"),
        };
        let lock = self.port_lock(port).await;
        let _guard = lock.lock().await;

        if let Some(runtime) = self.runtimes.lock().await.remove(&port) {
            runtime.stop(self.stop_grace().await).await;
        }

        let Some(config) = self.configs.lock().await.remove(&port) else {
            return AdminResult::ok(format!("no proxy configured on port {port}"));
        };

        if let Err(err) = self.persist_configs().await {
            tracing::warn!(%err, port, "failed to persist configs after delete");
        }

        self.mocks.remove_all_for_proxy(port).await;
        self.recorder.remove_proxy(port).await;
        let _ = self.persistence.delete(&mocks_key(config.kind, port)).await;
        let _ = self.persistence.delete(&requests_key(config.kind, port)).await;

        self.events.emit(Event::new("proxy-deleted", json!({"port": port}))).await;
        AdminResult::ok(format!("proxy on port {port} deleted"))
    }

    pub async fn verify_status(&self, port: u16) -> AdminResult {
        let is_running = self.runtimes.lock().await.contains_key(&port);
        let self_connect_ok = is_running && port_probe::is_reachable("127.0.0.1", port).await;
        let stats = self.stats_for(port).await;
        AdminResult::ok_with_details(
            format!("port {port} status"),
            json!({"is_running": is_running, "self_connect_ok": self_connect_ok, "stats": stats}),
        )
    }

    /// Summary of every proxy plus a persistence-root health flag ([SUPPLEMENT]
    /// 5: `diagnose()`'s return shape isn't fixed by §6).
    pub async fn diagnose(&self) -> AdminResult {
        let configs: Vec<ProxyConfig> = self.configs.lock().await.values().cloned().collect();
        let mut report = Vec::with_capacity(configs.len());
        for config in &configs {
            let is_running = self.runtimes.lock().await.contains_key(&config.port);
            let stats = self.stats_for(config.port).await;
            let last_error = self
                .recorder
                .list(config.port)
                .await
                .into_iter()
                .find_map(|record| record.error);
            report.push(json!({
                "port": config.port,
                "kind": config.kind,
                "name": config.name,
                "disabled": config.disabled,
                "is_running": is_running,
                "stats": stats,
                "last_error": last_error,
            }));
        }

        let persistence_root_ok = tokio::fs::metadata(self.persistence.root()).await.is_ok();
        AdminResult::ok_with_details(
            format!("{} proxies configured", configs.len()),
            json!({"proxies": report, "persistence_root_ok": persistence_root_ok}),
        )
    }

    /// Stop everything, clear the runtime map, and re-run boot
    /// orchestration; per-proxy failures are collected, never raised
    /// (§4.9 "Restart-all").
    pub async fn restart_all(self: &Arc<Self>) -> AdminResult {
        let ports: Vec<u16> = self.configs.lock().await.keys().copied().collect();
        let grace = self.stop_grace().await;

        let stopped: Vec<RuntimeProxy> = {
            let mut runtimes = self.runtimes.lock().await;
            ports.iter().filter_map(|port| runtimes.remove(port)).collect()
        };
        for runtime in stopped {
            runtime.stop(grace).await;
        }

        let results = self.boot().await;
        let failed = results.iter().filter(|r| !r.ok).count();
        if failed == 0 {
            AdminResult::ok(format!("restarted {} proxies", results.len()))
        } else {
            AdminResult::ok_with_details(format!("restarted with {failed} failure(s)"), json!(results))
        }
    }

    pub async fn list(&self) -> Vec<ProxyConfig> {
        self.configs.lock().await.values().cloned().collect()
    }

    pub async fn is_running(&self, port: u16) -> bool {
        self.runtimes.lock().await.contains_key(&port)
    }

    pub async fn settings(&self) -> Settings {
        self.settings.read().await.clone()
    }

    pub async fn update_settings(&self, mutate: impl FnOnce(&mut Settings)) -> Result<Settings> {
        let mut settings = self.settings.write().await;
        mutate(&mut settings);
        let snapshot = settings.clone();
        drop(settings);
        self.persistence.save("settings", &snapshot).await?;
        Ok(snapshot)
    }

    // --- Mocks admin surface (§6) ---

    pub async fn mocks_list(&self, port: u16) -> AdminResult {
        let mocks = self.mocks.list(port).await;
        AdminResult::ok_with_details(format!("{} mock(s) on port {port}", mocks.len()), json!(mocks))
    }

    /// Create a mock, denying the request if one already covers the same
    /// exact or pattern-equivalent route (§4.3 priority order, §8 scenario
    /// 3).
    pub async fn mocks_add(self: &Arc<Self>, port: u16, method: String, url: String, response: Response) -> AdminResult {
        let pattern_matching_enabled = self.settings.read().await.pattern_matching_enabled;
        let existing = self.mocks.list(port).await;
        let decision = should_mock(&method, &url, port, &existing, pattern_matching_enabled);
        if !decision.should_mock {
            return AdminResult::denied(decision.reason);
        }

        let now = Utc::now();
        let mock = Mock {
            id: Uuid::new_v4().to_string(),
            proxy_port: port,
            method,
            url,
            status_code: response.status_code,
            headers: response.headers,
            body: response.body,
            delay_ms: 0,
            enabled: true,
            name: None,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            auto_generated: false,
        };

        let outcome = self.mocks.add(mock).await;
        self.events
            .emit(Event::new("mock-added", json!({"proxy_port": port, "mock_id": outcome.mock.id})))
            .await;
        AdminResult::ok_with_details(format!("mock {} added", outcome.mock.id), json!(outcome.mock))
    }

    pub async fn mocks_remove(self: &Arc<Self>, port: u16, method: String, url: String) -> AdminResult {
        let key = MockKey { proxy_port: port, method, url };
        match self.mocks.remove(&key).await {
            Some(mock) => {
                self.events
                    .emit(Event::new("mock-removed", json!({"proxy_port": port, "mock_id": mock.id})))
                    .await;
                AdminResult::ok(format!("mock {} removed", mock.id))
            }
            None => AdminResult::denied(format!("no mock for {} {} on port {port}", key.method, key.url)),
        }
    }

    pub async fn mocks_toggle(self: &Arc<Self>, port: u16, method: String, url: String, enabled: bool) -> AdminResult {
        let key = MockKey { proxy_port: port, method, url };
        match self.mocks.toggle(&key, enabled).await {
            Some(mock) => {
                self.events
                    .emit(Event::new("mock-updated", json!({"proxy_port": port, "mock_id": mock.id})))
                    .await;
                AdminResult::ok_with_details(format!("mock {} {}", mock.id, if enabled { "enabled" } else { "disabled" }), json!(mock))
            }
            None => AdminResult::denied(format!("no mock for {} {} on port {port}", key.method, key.url)),
        }
    }

    pub async fn mocks_update(self: &Arc<Self>, port: u16, method: String, url: String, response: Response) -> AdminResult {
        let key = MockKey { proxy_port: port, method, url };
        let outcome = self
            .mocks
            .update(&key, |m| {
                m.status_code = response.status_code;
                m.headers = response.headers;
                m.body = response.body;
            })
            .await;
        match outcome {
            Some(mock) => {
                self.events
                    .emit(Event::new("mock-updated", json!({"proxy_port": port, "mock_id": mock.id})))
                    .await;
                AdminResult::ok_with_details(format!("mock {} updated", mock.id), json!(mock))
            }
            None => AdminResult::denied(format!("no mock for {} {} on port {port}", key.method, key.url)),
        }
    }

    pub async fn mocks_import(self: &Arc<Self>, port: u16, mocks: Vec<Mock>) -> AdminResult {
        let outcomes = self.mocks.import(mocks).await;
        let created = outcomes.iter().filter(|o| o.created).count();
        self.events
            .emit(Event::new("mock-imported", json!({"proxy_port": port, "created": created})))
            .await;
        let imported: Vec<Mock> = outcomes.into_iter().map(|o| o.mock).collect();
        AdminResult::ok_with_details(format!("{created} mock(s) imported on port {port}"), json!(imported))
    }

    pub async fn mocks_export(&self, port: u16) -> AdminResult {
        let mocks = self.mocks.export(port).await;
        AdminResult::ok_with_details(format!("{} mock(s) exported from port {port}", mocks.len()), json!(mocks))
    }

    // --- Requests admin surface (§6) ---

    pub async fn requests_list(&self, port: u16) -> AdminResult {
        let records = self.recorder.list(port).await;
        AdminResult::ok_with_details(format!("{} request(s) on port {port}", records.len()), json!(records))
    }

    pub async fn requests_clear(self: &Arc<Self>, port: u16) -> AdminResult {
        self.recorder.clear(port).await;
        self.events.emit(Event::new("requests-cleared", json!({"proxy_port": port}))).await;
        AdminResult::ok(format!("request history cleared for port {port}"))
    }

    /// Inject a synthetic client call into a `normal`-kind proxy's pipeline
    /// (§6 `send_via`), exercising mock matching, drift detection, and
    /// history capture exactly as a real client request would.
    pub async fn send_via(self: &Arc<Self>, port: u16, method: String, url: String, headers: HashMap<String, String>, body: Vec<u8>) -> AdminResult {
        let Some(config) = self.configs.lock().await.get(&port).cloned() else {
            return AdminResult::from(Error::config_invalid(format!("no proxy configured on port {port}")));
        };
        if config.kind != ProxyKind::Normal {
            return AdminResult::denied(format!("send_via only supports normal-kind proxies, port {port} is {}", config.kind));
        }
        let Some(target_host) = config.target_host.clone() else {
            return AdminResult::from(Error::config_invalid(format!("proxy on port {port} has no target_host")));
        };
        let Some(target_port) = config.target_port else {
            return AdminResult::from(Error::config_invalid(format!("proxy on port {port} has no target_port")));
        };

        let settings = self.settings.read().await.clone();
        let pipeline = Pipeline {
            proxy_port: port,
            proxy_name: config.name.clone(),
            mocks: self.mocks.clone(),
            recorder: self.recorder.clone(),
            events: self.events.clone(),
        };
        let pipeline_config = PipelineConfig {
            pattern_matching_enabled: settings.pattern_matching_enabled,
            auto_save_as_mocks: settings.auto_save_as_mocks,
            mocking_allowed: settings.testing_mode,
            request_body_cap_bytes: None,
        };

        let client = self.http_client.clone();
        let forward_method = method.clone();
        let forward_headers = headers.clone();
        let forward_body = body.clone();
        let forward_path = url.clone();

        let outcome = pipeline
            .run(&pipeline_config, &method, &url, headers, body, || async move {
                forward_live(&client, &target_host, target_port, &forward_method, &forward_path, forward_headers, forward_body).await
            })
            .await;

        match outcome {
            Ok(outcome) => AdminResult::ok_with_details(
                format!("sent {method} {url} via proxy on port {port}"),
                json!({"response": outcome.response, "served_from_mock": outcome.served_from_mock, "record_id": outcome.record_id}),
            ),
            Err(err) => AdminResult::from(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sniffler_core::events::EventBus;
    use tempfile::TempDir;

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn registry() -> (Arc<ProxyRegistry>, TempDir) {
        let dir = TempDir::new().unwrap();
        let persistence = Arc::new(PersistenceStore::open(dir.path()).await.unwrap());
        let ca = Arc::new(RootCa::load_or_generate(dir.path(), 256).unwrap());
        let registry = ProxyRegistry::new(
            persistence,
            Arc::new(MockStore::new(100)),
            RequestRecorder::new(100, Arc::new(EventBus::new())),
            Arc::new(EventBus::new()),
            ca,
            Settings::default(),
        );
        (registry, dir)
    }

    fn normal_config(port: u16, target_port: u16) -> ProxyConfig {
        ProxyConfig {
            kind: ProxyKind::Normal,
            port,
            name: "test-normal".to_string(),
            target_host: Some("127.0.0.1".to_string()),
            target_port: Some(target_port),
            target_url: None,
            protocol: None,
            auto_start: true,
            disabled: false,
            running_at_last_shutdown: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_auto_starts_then_stop_and_start_round_trip() {
        let (registry, _dir) = registry().await;
        let upstream = free_port();
        let port = free_port();

        let created = registry.create(normal_config(port, upstream)).await;
        assert!(created.ok, "{created:?}");
        assert!(registry.is_running(port).await);

        let stopped = registry.stop(port).await;
        assert!(stopped.ok);
        assert!(!registry.is_running(port).await);

        let started = registry.start(port).await;
        assert!(started.ok, "{started:?}");
        assert!(registry.is_running(port).await);

        registry.stop(port).await;
    }

    #[tokio::test]
    async fn create_rejects_duplicate_port() {
        let (registry, _dir) = registry().await;
        let upstream = free_port();
        let port = free_port();

        registry.create(normal_config(port, upstream)).await;
        let second = registry.create(normal_config(port, upstream)).await;
        assert!(!second.ok);
        assert_eq!(second.kind.as_deref(), Some("ConfigInvalid"));

        registry.stop(port).await;
    }

    #[tokio::test]
    async fn disable_stops_a_running_proxy_and_blocks_start() {
        let (registry, _dir) = registry().await;
        let upstream = free_port();
        let port = free_port();
        registry.create(normal_config(port, upstream)).await;
        assert!(registry.is_running(port).await);

        let disabled = registry.disable(port).await;
        assert!(disabled.ok);
        assert!(!registry.is_running(port).await);

        let start_attempt = registry.start(port).await;
        assert!(!start_attempt.ok);
    }

    #[tokio::test]
    async fn update_refuses_while_running_but_succeeds_once_stopped() {
        let (registry, _dir) = registry().await;
        let upstream = free_port();
        let port = free_port();
        registry.create(normal_config(port, upstream)).await;

        let blocked = registry.update(port, |c| c.name = "renamed".to_string()).await;
        assert!(!blocked.ok);

        registry.stop(port).await;
        let applied = registry.update(port, |c| c.name = "renamed".to_string()).await;
        assert!(applied.ok, "{applied:?}");

        let configs = registry.list().await;
        assert_eq!(configs.iter().find(|c| c.port == port).unwrap().name, "renamed");
    }

    #[tokio::test]
    async fn delete_cascades_mocks_and_history() {
        let (registry, _dir) = registry().await;
        let upstream = free_port();
        let port = free_port();
        registry.create(normal_config(port, upstream)).await;

        let deleted = registry.delete(port).await;
        assert!(deleted.ok);
        assert!(!registry.is_running(port).await);
        assert!(registry.list().await.iter().all(|c| c.port != port));
    }

    #[tokio::test]
    async fn verify_status_reports_running_and_consistent_stats() {
        let (registry, _dir) = registry().await;
        let upstream = free_port();
        let port = free_port();
        registry.create(normal_config(port, upstream)).await;

        let status = registry.verify_status(port).await;
        assert!(status.ok);
        let details = status.details.unwrap();
        assert_eq!(details["is_running"], json!(true));

        registry.stop(port).await;
    }

    #[tokio::test]
    async fn restart_all_collects_results_without_failing() {
        let (registry, _dir) = registry().await;
        let upstream = free_port();
        let port = free_port();
        registry.create(normal_config(port, upstream)).await;

        let result = registry.restart_all().await;
        assert!(result.ok);
        assert!(registry.is_running(port).await);

        registry.stop(port).await;
    }

    #[tokio::test]
    async fn diagnose_reports_persistence_health_and_per_proxy_summary() {
        let (registry, _dir) = registry().await;
        let upstream = free_port();
        let port = free_port();
        registry.create(normal_config(port, upstream)).await;

        let report = registry.diagnose().await;
        assert!(report.ok);
        let details = report.details.unwrap();
        assert_eq!(details["persistence_root_ok"], json!(true));
        assert_eq!(details["proxies"][0]["port"], json!(port));

        registry.stop(port).await;
    }

    fn response(body: &str) -> Response {
        Response {
            status_code: 200,
            headers: HashMap::new(),
            body: body.to_string(),
        }
    }

    #[tokio::test]
    async fn mocks_add_denies_pattern_conflict_with_exact_reason() {
        let (registry, _dir) = registry().await;
        let upstream = free_port();
        let port = free_port();
        registry.create(normal_config(port, upstream)).await;

        let first = registry.mocks_add(port, "GET".to_string(), "/items/{id}".to_string(), response("a")).await;
        assert!(first.ok, "{first:?}");

        let second = registry.mocks_add(port, "GET".to_string(), "/items/42".to_string(), response("b")).await;
        assert!(!second.ok);
        assert_eq!(second.message, "Mock already exists for pattern /items/{id}");

        registry.stop(port).await;
    }

    #[tokio::test]
    async fn mocks_round_trip_add_toggle_update_remove() {
        let (registry, _dir) = registry().await;
        let upstream = free_port();
        let port = free_port();
        registry.create(normal_config(port, upstream)).await;

        let added = registry.mocks_add(port, "GET".to_string(), "/users".to_string(), response("a")).await;
        assert!(added.ok);

        let listed = registry.mocks_list(port).await;
        assert_eq!(listed.details.unwrap().as_array().unwrap().len(), 1);

        let toggled = registry.mocks_toggle(port, "GET".to_string(), "/users".to_string(), false).await;
        assert!(toggled.ok, "{toggled:?}");
        assert_eq!(toggled.details.unwrap()["enabled"], json!(false));

        let updated = registry.mocks_update(port, "GET".to_string(), "/users".to_string(), response("updated")).await;
        assert!(updated.ok, "{updated:?}");
        assert_eq!(updated.details.unwrap()["body"], json!("updated"));

        let removed = registry.mocks_remove(port, "GET".to_string(), "/users".to_string()).await;
        assert!(removed.ok);

        let missing = registry.mocks_remove(port, "GET".to_string(), "/users".to_string()).await;
        assert!(!missing.ok);

        registry.stop(port).await;
    }

    #[tokio::test]
    async fn requests_clear_empties_history() {
        let (registry, _dir) = registry().await;
        let upstream = free_port();
        let port = free_port();
        registry.create(normal_config(port, upstream)).await;

        registry.recorder.append(RequestRecord::new_pending(port, "GET", "/a")).await;
        let before = registry.requests_list(port).await;
        assert_eq!(before.details.unwrap().as_array().unwrap().len(), 1);

        let cleared = registry.requests_clear(port).await;
        assert!(cleared.ok);
        let after = registry.requests_list(port).await;
        assert!(after.details.unwrap().as_array().unwrap().is_empty());

        registry.stop(port).await;
    }

    #[tokio::test]
    async fn send_via_forwards_through_pipeline_and_records_history() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream_listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = upstream_listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let body = "ok";
                let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}", body.len(), body);
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        let (registry, _dir) = registry().await;
        let port = free_port();
        let create = registry.create(normal_config(port, upstream_port)).await;
        assert!(create.ok, "{create:?}");

        let result = registry
            .send_via(port, "GET".to_string(), "/ping".to_string(), HashMap::new(), Vec::new())
            .await;
        assert!(result.ok, "{result:?}");

        let history = registry.requests_list(port).await;
        let requests = history.details.unwrap().as_array().cloned().unwrap_or_default();
        assert!(requests.iter().any(|r| r["url"] == json!("/ping")));

        registry.stop(port).await;
    }

    #[tokio::test]
    async fn mutations_persist_after_debounce_window() {
        let (registry, dir) = registry().await;
        let upstream = free_port();
        let port = free_port();
        registry.create(normal_config(port, upstream)).await;
        let _bridge = registry.spawn_persistence_bridge();

        let added = registry.mocks_add(port, "GET".to_string(), "/cached".to_string(), response("a")).await;
        assert!(added.ok, "{added:?}");

        tokio::time::sleep(FLUSH_COALESCE_WINDOW + Duration::from_millis(200)).await;

        let persisted: Vec<Mock> = PersistenceStore::open(dir.path())
            .await
            .unwrap()
            .load(&mocks_key(ProxyKind::Normal, port))
            .await
            .unwrap()
            .unwrap_or_default();
        assert!(persisted.iter().any(|m| m.url == "/cached"));

        registry.stop(port).await;
    }
}
