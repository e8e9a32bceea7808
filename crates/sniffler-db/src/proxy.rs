//! DB Wire Proxy (C8): an opaque TCP forwarder augmented with
//! protocol-aware observers (§4.8). Traffic is always relayed byte-for-byte;
//! only whether a `RequestRecord` gets created (and whether a mock
//! short-circuits the round-trip) depends on what the observers see.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sniffler_core::dedup::DedupWindow;
use sniffler_core::events::{Event, SharedEventBus};
use sniffler_core::model::{DbProtocol, RequestRecord, RequestStatus, Response};
use sniffler_core::Error;
use sniffler_mocks::MockStore;
use sniffler_recorder::RequestRecorder;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::health_check;
use crate::mock;
use crate::protocol::{self, Completion};

const READ_BUF_SIZE: usize = 64 * 1024;
/// §4.8 "default 1 s" intra-connection dedup window.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(1);

pub struct DbProxyState {
    pub proxy_port: u16,
    pub proxy_name: String,
    pub target_host: String,
    pub target_port: u16,
    pub protocol: DbProtocol,
    pub mocks: Arc<MockStore>,
    pub recorder: Arc<RequestRecorder>,
    pub events: SharedEventBus,
    pub testing_mode: bool,
    pub db_mocking_enabled: bool,
    pub health_check_filter_enabled: bool,
    pub dedup_window: Duration,
    health_checks_filtered: AtomicU64,
    dedup_coalesced: AtomicU64,
}

impl DbProxyState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        proxy_port: u16,
        proxy_name: String,
        target_host: String,
        target_port: u16,
        protocol: DbProtocol,
        mocks: Arc<MockStore>,
        recorder: Arc<RequestRecorder>,
        events: SharedEventBus,
        testing_mode: bool,
        db_mocking_enabled: bool,
        health_check_filter_enabled: bool,
        dedup_window: Duration,
    ) -> Self {
        Self {
            proxy_port,
            proxy_name,
            target_host,
            target_port,
            protocol,
            mocks,
            recorder,
            events,
            testing_mode,
            db_mocking_enabled,
            health_check_filter_enabled,
            dedup_window,
            health_checks_filtered: AtomicU64::new(0),
            dedup_coalesced: AtomicU64::new(0),
        }
    }

    pub fn health_checks_filtered(&self) -> u64 {
        self.health_checks_filtered.load(Ordering::Relaxed)
    }

    pub fn dedup_coalesced(&self) -> u64 {
        self.dedup_coalesced.load(Ordering::Relaxed)
    }
}

/// Accept loop for one db-proxy listener, grounded on the same
/// accept-then-spawn shape used by the HTTP-family transports. Stops
/// accepting as soon as `cancel` fires; open connections run to completion
/// independently.
pub async fn serve(listener: TcpListener, state: Arc<DbProxyState>, cancel: CancellationToken) {
    loop {
        let (client, _peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(%err, "db proxy accept failed");
                    continue;
                }
            },
            () = cancel.cancelled() => return,
        };
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(client, state).await {
                debug!(%err, "db proxy connection ended with error");
            }
        });
    }
}

async fn handle_connection(client: TcpStream, state: Arc<DbProxyState>) -> Result<(), Error> {
    let upstream = TcpStream::connect((state.target_host.as_str(), state.target_port))
        .await
        .map_err(|_err| Error::target_unreachable(state.target_host.clone(), state.target_port))?;

    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let client_write = Arc::new(Mutex::new(client_write));
    // FIFO record ids awaiting a completion frame; `None` marks a frame that
    // was forwarded but deliberately left un-recorded (health check filtered
    // or deduped), so a later completion doesn't misattribute to the wrong
    // record.
    let pending: Arc<Mutex<VecDeque<Option<String>>>> = Arc::new(Mutex::new(VecDeque::new()));
    let dedup = DedupWindow::new(state.dedup_window);

    let to_upstream = client_to_upstream(client_read, upstream_write, client_write.clone(), state.clone(), pending.clone(), dedup);
    let to_client = upstream_to_client(upstream_read, client_write, state.clone(), pending);

    tokio::select! {
        res = to_upstream => res,
        res = to_client => res,
    }
}

async fn client_to_upstream(
    mut reader: OwnedReadHalf,
    mut upstream_write: OwnedWriteHalf,
    client_write: Arc<Mutex<OwnedWriteHalf>>,
    state: Arc<DbProxyState>,
    pending: Arc<Mutex<VecDeque<Option<String>>>>,
    dedup: DedupWindow,
) -> Result<(), Error> {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await.map_err(|err| Error::upstream_io(err.to_string()))?;
        if n == 0 {
            return Ok(());
        }
        let frame = &buf[..n];

        if let Some(query) = protocol::extract_query(state.protocol, frame) {
            if handle_observed_query(&state, &query, &client_write, &pending, &dedup).await? {
                // Served from a mock: the client already has its response,
                // and there is nothing for upstream to see.
                continue;
            }
        }

        upstream_write.write_all(frame).await.map_err(|err| Error::upstream_io(err.to_string()))?;
    }
}

/// Returns `true` if a mock fully answered the query (short-circuiting the
/// upstream round-trip for this frame).
async fn handle_observed_query(
    state: &Arc<DbProxyState>,
    query: &str,
    client_write: &Arc<Mutex<OwnedWriteHalf>>,
    pending: &Arc<Mutex<VecDeque<Option<String>>>>,
    dedup: &DedupWindow,
) -> Result<bool, Error> {
    let normalized = health_check::normalize(query);

    if state.health_check_filter_enabled && health_check::is_health_check(query) {
        state.health_checks_filtered.fetch_add(1, Ordering::Relaxed);
        pending.lock().await.push_back(None);
        return Ok(false);
    }

    if dedup.is_duplicate(&normalized, &normalized).await {
        let count = state.dedup_coalesced.fetch_add(1, Ordering::Relaxed) + 1;
        state
            .events
            .emit(Event::new(
                "database-dedup-coalesced",
                json!({"proxy_port": state.proxy_port, "proxy_name": state.proxy_name, "query": query, "count": count}),
            ))
            .await;
        pending.lock().await.push_back(None);
        return Ok(false);
    }

    if state.testing_mode && state.db_mocking_enabled {
        if let Some(found) = state.mocks.find_exact(state.proxy_port, "QUERY", &normalized).await {
            if found.enabled {
                match mock::fabricate(state.protocol, &found.body) {
                    Ok(response_frame) => {
                        client_write
                            .lock()
                            .await
                            .write_all(&response_frame)
                            .await
                            .map_err(|err| Error::upstream_io(err.to_string()))?;

                        let mut record = RequestRecord::new_pending(state.proxy_port, "QUERY", &normalized);
                        record.served_from_mock = true;
                        record.finish(RequestStatus::Mocked, None, None);
                        state.recorder.append(record).await;

                        state
                            .events
                            .emit(Event::new(
                                "mock-served",
                                json!({"proxy_port": state.proxy_port, "proxy_name": state.proxy_name, "mock_id": found.id, "query": query}),
                            ))
                            .await;
                        return Ok(true);
                    }
                    Err(err) => {
                        state
                            .events
                            .emit(Event::new(
                                "mock-incompatible",
                                json!({"proxy_port": state.proxy_port, "mock_id": found.id, "query": query, "error": err.to_string()}),
                            ))
                            .await;
                    }
                }
            }
        }
    }

    let record = RequestRecord::new_pending(state.proxy_port, "QUERY", &normalized);
    let record = state.recorder.append(record).await;
    pending.lock().await.push_back(Some(record.id));
    Ok(false)
}

async fn upstream_to_client(
    mut reader: OwnedReadHalf,
    client_write: Arc<Mutex<OwnedWriteHalf>>,
    state: Arc<DbProxyState>,
    pending: Arc<Mutex<VecDeque<Option<String>>>>,
) -> Result<(), Error> {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await.map_err(|err| Error::upstream_io(err.to_string()))?;
        if n == 0 {
            return Ok(());
        }
        let frame = &buf[..n];

        if let Some(completion) = protocol::extract_completion(state.protocol, frame) {
            if let Some(Some(record_id)) = pending.lock().await.pop_front() {
                let (status, response, error) = match completion {
                    Completion::Ok(tag) => (
                        RequestStatus::Success,
                        Some(Response {
                            status_code: 200,
                            headers: Default::default(),
                            body: tag,
                        }),
                        None,
                    ),
                    Completion::Error(message) => (RequestStatus::Failed, None, Some(message)),
                };
                state.recorder.finish(state.proxy_port, &record_id, status, response, error).await;
            }
        }

        client_write.lock().await.write_all(frame).await.map_err(|err| Error::upstream_io(err.to_string()))?;
    }
}
