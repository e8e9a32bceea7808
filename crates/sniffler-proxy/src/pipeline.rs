//! Shared request/response pipeline (§4.6 steps 1-6, reused by C7 with the
//! MITM-specific gates layered on top in `mitm.rs`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sniffler_core::codec::decode_body;
use sniffler_core::drift;
use sniffler_core::events::{Event, SharedEventBus};
use sniffler_core::model::{Mock, RequestRecord, RequestStatus, Response};
use sniffler_core::pattern::pattern_of;
use sniffler_core::Error;
use sniffler_mocks::MockStore;
use sniffler_recorder::RequestRecorder;

/// Per-exchange knobs that vary between C6 and C7 but not the pipeline
/// shape itself.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub pattern_matching_enabled: bool,
    pub auto_save_as_mocks: bool,
    /// Whether mock serving is allowed at all for this exchange (§4.6 step
    /// 2 for normal; §4.7 "testing mode and mocking enabled" for outgoing).
    pub mocking_allowed: bool,
    /// Request bodies larger than this are captured as a
    /// `"[Body omitted: <n> bytes]"` sentinel instead of decoded text
    /// (§4.7 "Body policy"). `None` disables capping (C6 doesn't cap).
    pub request_body_cap_bytes: Option<usize>,
}

pub struct PipelineOutcome {
    pub response: Response,
    pub served_from_mock: bool,
    pub record_id: String,
}

/// Shared collaborators the pipeline needs, one instance per running proxy.
pub struct Pipeline {
    pub proxy_port: u16,
    pub proxy_name: String,
    pub mocks: Arc<MockStore>,
    pub recorder: Arc<RequestRecorder>,
    pub events: SharedEventBus,
}

impl Pipeline {
    /// Run one exchange end to end. `forward` performs the live upstream
    /// call and is only invoked when no mock serves the request.
    pub async fn run<F, Fut>(
        &self,
        config: &PipelineConfig,
        method: &str,
        url: &str,
        request_headers: HashMap<String, String>,
        request_body: Vec<u8>,
        forward: F,
    ) -> Result<PipelineOutcome, Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Response, Error>>,
    {
        let content_type = request_headers.get("content-type").map(String::as_str).unwrap_or("");
        let content_encoding = request_headers.get("content-encoding").map(String::as_str).unwrap_or("");

        let mut record = RequestRecord::new_pending(self.proxy_port, method, url);
        record.headers = request_headers.clone();
        record.body = match config.request_body_cap_bytes {
            Some(cap) if request_body.len() > cap => format!("[Body omitted: {} bytes]", request_body.len()),
            _ => decode_body(&request_body, Some(content_encoding), Some(content_type)),
        };
        let record_id = record.id.clone();
        self.recorder.append(record).await;

        if config.mocking_allowed {
            if let Some(mock) = self
                .mocks
                .find_for_request(self.proxy_port, method, url, config.pattern_matching_enabled)
                .await
            {
                if mock.enabled {
                    return Ok(self.serve_mock(&record_id, mock).await);
                }
            }
        }

        match forward().await {
            Ok(mut response) => {
                response
                    .headers
                    .insert("X-Sniffler-Proxy".to_string(), self.proxy_name.clone());

                self.after_live_response(config, method, url, &response).await;

                self.recorder
                    .finish(self.proxy_port, &record_id, RequestStatus::Success, Some(response.clone()), None)
                    .await;

                Ok(PipelineOutcome {
                    response,
                    served_from_mock: false,
                    record_id,
                })
            }
            Err(err) => {
                self.recorder
                    .finish(self.proxy_port, &record_id, RequestStatus::Failed, None, Some(err.to_string()))
                    .await;
                Err(err)
            }
        }
    }

    async fn serve_mock(&self, record_id: &str, mock: Mock) -> PipelineOutcome {
        if mock.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(mock.delay_ms)).await;
        }

        let mut headers = mock.headers.clone();
        headers.insert("X-Sniffler-Mock".to_string(), "true".to_string());
        headers.insert("X-Sniffler-Proxy".to_string(), self.proxy_name.clone());

        let response = Response {
            status_code: mock.status_code,
            headers,
            body: mock.body.clone(),
        };

        self.recorder
            .finish(self.proxy_port, record_id, RequestStatus::Mocked, Some(response.clone()), None)
            .await;

        self.events
            .emit(Event::new(
                "mock-served",
                json!({"proxy_port": self.proxy_port, "mock_id": mock.id, "record_id": record_id}),
            ))
            .await;

        PipelineOutcome {
            response,
            served_from_mock: true,
            record_id: record_id.to_string(),
        }
    }

    /// §4.6 step 4-5: drift against any existing mock, auto-mock synthesis.
    async fn after_live_response(&self, config: &PipelineConfig, method: &str, url: &str, response: &Response) {
        let existing = self.find_identity_mock(method, url).await;

        if let Some(mock) = &existing {
            let ignored = drift::default_ignored_headers();
            let report = drift::compare(mock, response, &ignored);
            if report.has_differences {
                self.events
                    .emit(Event::new(
                        "mock-difference-detected",
                        json!({
                            "proxy_port": self.proxy_port,
                            "mock_id": mock.id,
                            "differences": report.differences,
                            "summary": report.summary,
                        }),
                    ))
                    .await;
            }
        } else if config.auto_save_as_mocks && self.auto_save_as_mocks_applies(response) {
            self.auto_save(method, url, response).await;
        }
    }

    async fn find_identity_mock(&self, method: &str, url: &str) -> Option<Mock> {
        let pattern = pattern_of(url);
        self.mocks
            .all_for_method(self.proxy_port, method)
            .await
            .into_iter()
            .find(|m| m.url == url || pattern_of(&m.url) == pattern)
    }

    fn auto_save_as_mocks_applies(&self, response: &Response) -> bool {
        (200..400).contains(&response.status_code)
    }

    async fn auto_save(&self, method: &str, url: &str, response: &Response) {
        let now = chrono::Utc::now();
        let mock = Mock {
            id: uuid::Uuid::new_v4().to_string(),
            proxy_port: self.proxy_port,
            method: method.to_string(),
            url: url.to_string(),
            status_code: response.status_code,
            headers: response.headers.clone(),
            body: response.body.clone(),
            delay_ms: 0,
            enabled: false,
            name: None,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            auto_generated: true,
        };
        let outcome = self.mocks.add(mock).await;
        if outcome.created {
            self.events
                .emit(Event::new(
                    "mock-auto-created",
                    json!({"proxy_port": self.proxy_port, "mock_id": outcome.mock.id, "url": url}),
                ))
                .await;
        }
    }
}
