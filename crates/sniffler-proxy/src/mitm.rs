//! MITM HTTP(S) Proxy — outgoing (C7): CONNECT-capable forward proxy that
//! terminates TLS with a certificate issued by the local root CA, then runs
//! the same pipeline as C6 against the decrypted traffic (§4.7).

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use sniffler_core::dedup::DedupWindow;
use sniffler_core::events::{Event, SharedEventBus};
use sniffler_core::model::Response as SniffResponse;
use sniffler_core::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ca::RootCa;
use crate::pipeline::{Pipeline, PipelineConfig};

type ProxyBody = BoxBody<Bytes, Infallible>;

pub struct OutgoingProxyState {
    pub pipeline: Pipeline,
    pub ca: Arc<RootCa>,
    pub pattern_matching_enabled: bool,
    pub auto_save_as_mocks: bool,
    pub testing_mode: bool,
    pub mocking_enabled_for_outgoing: bool,
    pub request_body_cap_bytes: usize,
    pub dedup: DedupWindow,
    /// §4.7 "initialization gate": `true` until the registry signals ready.
    pub initializing: Arc<AtomicBool>,
    pub http_client: reqwest::Client,
    pub events: SharedEventBus,
    dedup_coalesced: AtomicU64,
}

impl OutgoingProxyState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline: Pipeline,
        ca: Arc<RootCa>,
        pattern_matching_enabled: bool,
        auto_save_as_mocks: bool,
        testing_mode: bool,
        mocking_enabled_for_outgoing: bool,
        request_body_cap_bytes: usize,
        dedup: DedupWindow,
        initializing: Arc<AtomicBool>,
        http_client: reqwest::Client,
        events: SharedEventBus,
    ) -> Self {
        Self {
            pipeline,
            ca,
            pattern_matching_enabled,
            auto_save_as_mocks,
            testing_mode,
            mocking_enabled_for_outgoing,
            request_body_cap_bytes,
            dedup,
            initializing,
            http_client,
            events,
            dedup_coalesced: AtomicU64::new(0),
        }
    }

    pub fn mark_ready(&self) {
        self.initializing.store(false, Ordering::SeqCst);
    }

    pub fn dedup_coalesced(&self) -> u64 {
        self.dedup_coalesced.load(Ordering::Relaxed)
    }
}

/// Accept loop for one outgoing-proxy listener. Stops accepting as soon as
/// `cancel` fires; already-accepted connections run to completion
/// independently (the registry force-aborts the accept task itself if it
/// doesn't return promptly).
pub async fn serve(listener: TcpListener, state: Arc<OutgoingProxyState>, cancel: CancellationToken) {
    loop {
        let (stream, _peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(%err, "outgoing proxy accept failed");
                    continue;
                }
            },
            () = cancel.cancelled() => return,
        };
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, state).await {
                debug!(%err, "outgoing proxy connection ended with error");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<OutgoingProxyState>) -> Result<(), Error> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(accept_or_tunnel(req, state).await) }
    });

    http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(|err| Error::upstream_io(err.to_string()))
}

/// Handle the initial plaintext request on an accepted connection: only
/// `CONNECT` is meaningful here (§4.7 "CONNECT is honored").
async fn accept_or_tunnel(req: Request<Incoming>, state: Arc<OutgoingProxyState>) -> Response<ProxyBody> {
    if req.method() != Method::CONNECT {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "CONNECT required");
    }

    let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
        return text_response(StatusCode::BAD_REQUEST, "missing CONNECT authority");
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(err) = terminate_tls(upgraded, authority, state).await {
                    debug!(%err, "MITM TLS session ended with error");
                }
            }
            Err(err) => warn!(%err, "CONNECT upgrade failed"),
        }
    });

    Response::builder().status(StatusCode::OK).body(empty_body()).unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, ""))
}

async fn terminate_tls(upgraded: hyper::upgrade::Upgraded, authority: String, state: Arc<OutgoingProxyState>) -> Result<(), Error> {
    let host = authority.split(':').next().unwrap_or(&authority).to_string();
    let server_config = state.ca.server_config_for_host(&host)?;
    let acceptor = TlsAcceptor::from(server_config);

    let tls_stream = acceptor.accept(TokioIo::new(upgraded)).await.map_err(|err| Error::upstream_io(format!("TLS handshake with client for {host}: {err}")))?;
    let io = TokioIo::new(tls_stream);

    let authority_for_service = authority.clone();
    let service = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        let authority = authority_for_service.clone();
        async move { Ok::<_, Infallible>(handle_mitm_request(req, authority, state).await) }
    });

    http1::Builder::new()
        .serve_connection(io, service)
        .await
        .map_err(|err| Error::upstream_io(err.to_string()))
}

async fn handle_mitm_request(req: Request<Incoming>, authority: String, state: Arc<OutgoingProxyState>) -> Response<ProxyBody> {
    if state.initializing.load(Ordering::SeqCst) {
        return text_response(StatusCode::SERVICE_UNAVAILABLE, "Sniffler Initializing");
    }

    let method = req.method().as_str().to_string();
    let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/").to_string();
    let url = format!("https://{authority}{path_and_query}");

    let mut headers = HashMap::new();
    for (name, value) in req.headers() {
        if let Ok(value_str) = value.to_str() {
            headers.insert(name.as_str().to_lowercase(), value_str.to_string());
        }
    }

    let body_bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes().to_vec(),
        Err(err) => {
            warn!(%err, "failed to read MITM request body");
            Vec::new()
        }
    };

    if state.dedup.is_duplicate(&method, &url).await {
        let count = state.dedup_coalesced.fetch_add(1, Ordering::Relaxed) + 1;
        state
            .events
            .emit(Event::new(
                "outgoing-dedup-coalesced",
                json!({"proxy_port": state.pipeline.proxy_port, "proxy_name": state.pipeline.proxy_name, "method": method, "url": url, "count": count}),
            ))
            .await;
        return match forward_https(&state.http_client, &method, &url, headers, body_bytes).await {
            Ok(response) => to_hyper_response(response),
            Err(_err) => text_response(StatusCode::BAD_GATEWAY, "upstream unreachable"),
        };
    }

    let config = PipelineConfig {
        pattern_matching_enabled: state.pattern_matching_enabled,
        auto_save_as_mocks: state.auto_save_as_mocks,
        mocking_allowed: state.testing_mode && state.mocking_enabled_for_outgoing,
        request_body_cap_bytes: Some(state.request_body_cap_bytes),
    };

    let client = state.http_client.clone();
    let forward_method = method.clone();
    let forward_headers = headers.clone();
    let forward_body = body_bytes.clone();
    let forward_url = url.clone();

    let outcome = state
        .pipeline
        .run(&config, &method, &url, headers, body_bytes, || async move {
            forward_https(&client, &forward_method, &forward_url, forward_headers, forward_body).await
        })
        .await;

    match outcome {
        Ok(outcome) => to_hyper_response(outcome.response),
        Err(_err) => text_response(StatusCode::BAD_GATEWAY, "upstream unreachable"),
    }
}

async fn forward_https(client: &reqwest::Client, method: &str, url: &str, headers: HashMap<String, String>, body: Vec<u8>) -> Result<SniffResponse, Error> {
    let reqwest_method = reqwest::Method::from_bytes(method.as_bytes()).map_err(|_| Error::upstream_io(format!("unsupported method {method}")))?;

    let mut builder = client.request(reqwest_method, url);
    for (name, value) in &headers {
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        builder = builder.header(name, value);
    }

    let response = builder.body(body).send().await.map_err(|err| Error::upstream_io(err.to_string()))?;
    let status_code = response.status().as_u16();

    let mut response_headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(value_str) = value.to_str() {
            response_headers.insert(name.to_string(), value_str.to_string());
        }
    }
    let content_type = response_headers.get("content-type").cloned().unwrap_or_default();
    let content_encoding = response_headers.get("content-encoding").cloned().unwrap_or_default();
    let body_bytes = response.bytes().await.map_err(|err| Error::upstream_io(err.to_string()))?;
    let body_string = sniffler_core::codec::decode_body(&body_bytes, Some(&content_encoding), Some(&content_type));

    Ok(SniffResponse {
        status_code,
        headers: response_headers,
        body: body_string,
    })
}

fn to_hyper_response(response: SniffResponse) -> Response<ProxyBody> {
    let mut builder = Response::builder().status(response.status_code);
    for (name, value) in &response.headers {
        if let (Ok(header_name), Ok(header_value)) = (
            hyper::header::HeaderName::try_from(name.as_str()),
            hyper::header::HeaderValue::try_from(value.as_str()),
        ) {
            builder = builder.header(header_name, header_value);
        }
    }
    builder
        .body(full_body(response.body))
        .unwrap_or_else(|_| text_response(StatusCode::BAD_GATEWAY, "failed to build response"))
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never: Infallible| match never {}).boxed()
}

fn full_body(text: String) -> ProxyBody {
    Full::new(Bytes::from(text)).map_err(|never: Infallible| match never {}).boxed()
}

fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    Response::builder().status(status).body(full_body(message.to_string())).unwrap_or_else(|_| {
        let mut response = Response::new(empty_body());
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sniffler_core::events::EventBus;
    use sniffler_mocks::MockStore;
    use sniffler_recorder::RequestRecorder;
    use tempfile::tempdir;

    fn state() -> Arc<OutgoingProxyState> {
        let dir = tempdir().unwrap();
        Arc::new(OutgoingProxyState::new(
            Pipeline {
                proxy_port: 9443,
                proxy_name: "outgoing-test".to_string(),
                mocks: Arc::new(MockStore::new(100)),
                recorder: RequestRecorder::new(100, Arc::new(EventBus::new())),
                events: Arc::new(EventBus::new()),
            },
            Arc::new(RootCa::load_or_generate(dir.path(), 256).unwrap()),
            true,
            false,
            true,
            true,
            1024,
            DedupWindow::new(Duration::from_millis(1000)),
            Arc::new(AtomicBool::new(true)),
            reqwest::Client::new(),
            Arc::new(EventBus::new()),
        ))
    }

    #[test]
    fn initialization_gate_starts_closed_and_lifts_on_mark_ready() {
        let state = state();
        assert!(state.initializing.load(Ordering::SeqCst));
        state.mark_ready();
        assert!(!state.initializing.load(Ordering::SeqCst));
    }

    #[test]
    fn dedup_coalesced_counter_starts_at_zero() {
        let state = state();
        assert_eq!(state.dedup_coalesced(), 0);
    }
}
