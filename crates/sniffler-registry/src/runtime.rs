//! `RuntimeProxy` (§3): the live counterpart to a persisted `ProxyConfig`.
//! Holds only what's needed to stop the proxy and, for `outgoing`, lift its
//! initialization gate — stats and mocks are looked up by port through
//! `RequestRecorder`/`MockStore` rather than held here (§9 "no
//! back-pointers").

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sniffler_core::dedup::DedupWindow;
use sniffler_core::events::SharedEventBus;
use sniffler_core::model::{DbProtocol, ProxyConfig, ProxyKind};
use sniffler_core::{Error, Result};
use sniffler_mocks::MockStore;
use sniffler_proxy::ca::RootCa;
use sniffler_proxy::pipeline::Pipeline;
use sniffler_recorder::RequestRecorder;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Collaborators common to every `ProxyKind`, threaded through so each
/// spawn helper only has to pick what it needs.
pub struct SpawnContext {
    pub mocks: Arc<MockStore>,
    pub recorder: Arc<RequestRecorder>,
    pub events: SharedEventBus,
    pub ca: Arc<RootCa>,
    pub http_client: reqwest::Client,
    pub testing_mode: bool,
    pub pattern_matching_enabled: bool,
    pub auto_save_as_mocks: bool,
    pub mocking_enabled_for_outgoing: bool,
    pub mocking_enabled_for_db: bool,
    pub filter_health_checks: bool,
    pub request_body_cap_bytes: usize,
    pub outgoing_dedup_window: Duration,
    pub db_dedup_window: Duration,
}

pub struct RuntimeProxy {
    pub started_at: DateTime<Utc>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    /// `outgoing` only: lifted once boot orchestration verifies this proxy
    /// by self-connect (§4.7 "initialization gate").
    ready_gate: Option<Arc<AtomicBool>>,
}

impl RuntimeProxy {
    /// Bind `config.port` and spawn its accept loop. Binding happens here,
    /// synchronously, so a `PortInUse` error surfaces before any task runs.
    pub async fn spawn(config: &ProxyConfig, ctx: &SpawnContext) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.port))
            .await
            .map_err(|_err| Error::port_in_use(config.port))?;

        let cancel = CancellationToken::new();
        let (handle, ready_gate) = match config.kind {
            ProxyKind::Normal => (spawn_normal(listener, config, ctx, cancel.clone())?, None),
            ProxyKind::Outgoing => spawn_outgoing(listener, config, ctx, cancel.clone())?,
            ProxyKind::Db => (spawn_db(listener, config, ctx, cancel.clone())?, None),
        };

        Ok(Self {
            started_at: Utc::now(),
            cancel,
            handle,
            ready_gate,
        })
    }

    /// Lift the `outgoing` initialization gate; a no-op for other kinds.
    pub fn mark_ready(&self) {
        if let Some(gate) = &self.ready_gate {
            gate.store(false, std::sync::atomic::Ordering::SeqCst);
        }
    }

    /// Cancel the accept loop and wait up to `grace` for it to return,
    /// force-aborting the task if it doesn't (§5 "force-closed after a
    /// grace period"). In-flight connections the accept loop already handed
    /// off run to completion independently of this.
    pub async fn stop(self, grace: Duration) {
        self.cancel.cancel();
        let mut handle = self.handle;
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            handle.abort();
        }
    }
}

fn require_target_host(config: &ProxyConfig) -> Result<String> {
    config
        .target_host
        .clone()
        .ok_or_else(|| Error::config_invalid(format!("{} proxy on port {} requires target_host", config.kind, config.port)))
}

fn require_target_port(config: &ProxyConfig) -> Result<u16> {
    config
        .target_port
        .ok_or_else(|| Error::config_invalid(format!("{} proxy on port {} requires target_port", config.kind, config.port)))
}

fn spawn_normal(listener: TcpListener, config: &ProxyConfig, ctx: &SpawnContext, cancel: CancellationToken) -> Result<JoinHandle<()>> {
    let target_host = require_target_host(config)?;
    let target_port = require_target_port(config)?;

    let state = Arc::new(sniffler_proxy::http::NormalProxyState {
        pipeline: Pipeline {
            proxy_port: config.port,
            proxy_name: config.name.clone(),
            mocks: ctx.mocks.clone(),
            recorder: ctx.recorder.clone(),
            events: ctx.events.clone(),
        },
        target_host,
        target_port,
        pattern_matching_enabled: ctx.pattern_matching_enabled,
        auto_save_as_mocks: ctx.auto_save_as_mocks,
        testing_mode: ctx.testing_mode,
        http_client: ctx.http_client.clone(),
    });

    Ok(tokio::spawn(async move { sniffler_proxy::http::serve(listener, state, cancel).await }))
}

fn spawn_outgoing(listener: TcpListener, config: &ProxyConfig, ctx: &SpawnContext, cancel: CancellationToken) -> Result<(JoinHandle<()>, Option<Arc<AtomicBool>>)> {
    let ready_gate = Arc::new(AtomicBool::new(true));

    let state = Arc::new(sniffler_proxy::mitm::OutgoingProxyState::new(
        Pipeline {
            proxy_port: config.port,
            proxy_name: config.name.clone(),
            mocks: ctx.mocks.clone(),
            recorder: ctx.recorder.clone(),
            events: ctx.events.clone(),
        },
        ctx.ca.clone(),
        ctx.pattern_matching_enabled,
        ctx.auto_save_as_mocks,
        ctx.testing_mode,
        ctx.mocking_enabled_for_outgoing,
        ctx.request_body_cap_bytes,
        DedupWindow::new(ctx.outgoing_dedup_window),
        ready_gate.clone(),
        ctx.http_client.clone(),
        ctx.events.clone(),
    ));

    let handle = tokio::spawn(async move { sniffler_proxy::mitm::serve(listener, state, cancel).await });
    Ok((handle, Some(ready_gate)))
}

fn spawn_db(listener: TcpListener, config: &ProxyConfig, ctx: &SpawnContext, cancel: CancellationToken) -> Result<JoinHandle<()>> {
    let target_host = require_target_host(config)?;
    let target_port = require_target_port(config)?;
    let protocol = config.protocol.unwrap_or(DbProtocol::Postgres);

    let state = Arc::new(sniffler_db::DbProxyState::new(
        config.port,
        config.name.clone(),
        target_host,
        target_port,
        protocol,
        ctx.mocks.clone(),
        ctx.recorder.clone(),
        ctx.events.clone(),
        ctx.testing_mode,
        ctx.mocking_enabled_for_db,
        ctx.filter_health_checks,
        ctx.db_dedup_window,
    ));

    Ok(tokio::spawn(async move { sniffler_db::proxy::serve(listener, state, cancel).await }))
}
