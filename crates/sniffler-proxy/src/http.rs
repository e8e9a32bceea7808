//! Normal HTTP Proxy (C6): plain forward proxy, no TLS termination (§4.6).

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Router;
use sniffler_core::model::Response as SniffResponse;
use sniffler_core::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::pipeline::{Pipeline, PipelineConfig};

/// Shared state for one running normal-proxy listener.
pub struct NormalProxyState {
    pub pipeline: Pipeline,
    pub target_host: String,
    pub target_port: u16,
    pub pattern_matching_enabled: bool,
    pub auto_save_as_mocks: bool,
    /// §9 open question resolution: the normal proxy also requires
    /// `testing_mode=true` before it will serve mocks.
    pub testing_mode: bool,
    pub http_client: reqwest::Client,
}

/// Build the axum router for a normal-proxy listener (one per `ProxyConfig`
/// of kind `normal`, grounded on the teacher's single-router-per-proxy
/// shape).
pub fn router(state: Arc<NormalProxyState>) -> Router {
    Router::new().fallback(handle).with_state(state)
}

/// Accept loop for one normal-proxy listener. Hyper's graceful shutdown
/// drains in-flight requests once `cancel` fires; the registry backstops
/// this with its own grace-period abort (§5 "force-closed after a grace
/// period").
pub async fn serve(listener: TcpListener, state: Arc<NormalProxyState>, cancel: CancellationToken) {
    let app = router(state);
    let shutdown = async move { cancel.cancelled().await };
    if let Err(err) = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(shutdown).await {
        warn!(%err, "normal proxy server error");
    }
}

async fn handle(State(state): State<Arc<NormalProxyState>>, method: Method, uri: Uri, headers: HeaderMap, body: Body) -> axum::response::Response {
    let request_headers = header_map_to_strings(&headers);
    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes.to_vec(),
        Err(err) => {
            error!(%err, "failed to read request body");
            Vec::new()
        }
    };

    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/").to_string();

    let config = PipelineConfig {
        pattern_matching_enabled: state.pattern_matching_enabled,
        auto_save_as_mocks: state.auto_save_as_mocks,
        mocking_allowed: state.testing_mode,
        request_body_cap_bytes: None,
    };

    let target_host = state.target_host.clone();
    let target_port = state.target_port;
    let client = state.http_client.clone();
    let method_str = method.as_str().to_string();
    let forward_headers = request_headers.clone();
    let forward_body = body_bytes.clone();
    let forward_path = path_and_query.clone();

    let outcome = state
        .pipeline
        .run(&config, &method_str, &path_and_query, request_headers, body_bytes, || {
            let method_str = method_str.clone();
            async move {
                forward_live(&client, &target_host, target_port, &method_str, &forward_path, forward_headers, forward_body).await
            }
        })
        .await;

    match outcome {
        Ok(outcome) => to_axum_response(outcome.response),
        Err(_err) => (StatusCode::BAD_GATEWAY, "upstream unreachable").into_response(),
    }
}

/// Perform the live upstream call for a `normal`-kind proxy. Exposed so
/// `sniffler-registry` can inject a synthetic request through the same
/// forwarding path as real traffic (§6 `send_via`).
pub async fn forward_live(
    client: &reqwest::Client,
    target_host: &str,
    target_port: u16,
    method: &str,
    path_and_query: &str,
    mut headers: HashMap<String, String>,
    body: Vec<u8>,
) -> Result<SniffResponse, Error> {
    let authority = format!("{target_host}:{target_port}");
    headers.insert("Host".to_string(), authority.clone());
    headers.insert("Via".to_string(), "1.1 sniffler".to_string());
    headers
        .entry("X-Forwarded-For".to_string())
        .or_insert_with(|| "127.0.0.1".to_string());

    let url = format!("http://{authority}{path_and_query}");
    let reqwest_method = reqwest::Method::from_bytes(method.as_bytes()).map_err(|_| Error::upstream_io(format!("unsupported method {method}")))?;

    let mut builder = client.request(reqwest_method, &url);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    let response = builder
        .body(body)
        .send()
        .await
        .map_err(|err| Error::upstream_io(err.to_string()))?;

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

fn header_map_to_strings(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (name, value) in headers {
        if let Ok(value_str) = value.to_str() {
            out.insert(name.as_str().to_lowercase(), value_str.to_string());
        }
    }
    out
}

fn to_axum_response(response: SniffResponse) -> axum::response::Response {
    let mut builder = axum::http::Response::builder().status(response.status_code);
    for (name, value) in &response.headers {
        if let (Ok(header_name), Ok(header_value)) = (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
            builder = builder.header(header_name, header_value);
        }
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|err| {
            warn!(%err, "failed to build proxied response, falling back to 502");
            (StatusCode::BAD_GATEWAY, "failed to build response").into_response()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sniffler_core::events::EventBus;
    use sniffler_mocks::MockStore;
    use sniffler_recorder::RequestRecorder;
    use tower::ServiceExt;

    fn state(target_port: u16, testing_mode: bool) -> Arc<NormalProxyState> {
        Arc::new(NormalProxyState {
            pipeline: Pipeline {
                proxy_port: 9000,
                proxy_name: "normal-test".to_string(),
                mocks: Arc::new(MockStore::new(100)),
                recorder: RequestRecorder::new(100, Arc::new(EventBus::new())),
                events: Arc::new(EventBus::new()),
            },
            target_host: "127.0.0.1".to_string(),
            target_port,
            pattern_matching_enabled: true,
            auto_save_as_mocks: false,
            testing_mode,
            http_client: reqwest::Client::new(),
        })
    }

    #[tokio::test]
    async fn mock_served_without_contacting_upstream() {
        let st = state(1, true);
        let now = chrono::Utc::now();
        st.pipeline
            .mocks
            .add(sniffler_core::model::Mock {
                id: "m1".to_string(),
                proxy_port: 9000,
                method: "GET".to_string(),
                url: "/users".to_string(),
                status_code: 200,
                headers: HashMap::new(),
                body: r#"{"u":1}"#.to_string(),
                delay_ms: 0,
                enabled: true,
                name: None,
                tags: Vec::new(),
                created_at: now,
                updated_at: now,
                auto_generated: false,
            })
            .await;

        let app = router(st);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("GET")
                    .uri("/users")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("X-Sniffler-Mock").unwrap(), "true");
    }
}
