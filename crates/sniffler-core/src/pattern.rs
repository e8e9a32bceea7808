//! Pattern Engine (C3): URL templating and the "should a new mock be
//! created?" decision of §4.3.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::Mock;

static NUMERIC_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]+$").unwrap());
static UUID_V4_SEGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$",
    )
    .unwrap()
});

/// Normalize a URL into a template by replacing numeric path segments with
/// `{id}` and UUID-v4 segments with `{uuid}`, dropping query and fragment.
pub fn pattern_of(url: &str) -> String {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url);

    let segments: Vec<String> = path
        .split('/')
        .map(|segment| {
            if segment.is_empty() {
                segment.to_string()
            } else if UUID_V4_SEGMENT.is_match(segment) {
                "{uuid}".to_string()
            } else if NUMERIC_SEGMENT.is_match(segment) {
                "{id}".to_string()
            } else {
                segment.to_string()
            }
        })
        .collect();

    segments.join("/")
}

/// Result of the §4.3 `should_mock` decision.
#[derive(Debug, Clone)]
pub struct MockDecision {
    pub should_mock: bool,
    pub reason: String,
    pub existing: Option<Mock>,
}

/// Decide whether a new mock may be created for `(method, url)` given the
/// proxy's existing mocks, following the priority order of §4.3.
pub fn should_mock(
    method: &str,
    url: &str,
    proxy_port: u16,
    existing_mocks: &[Mock],
    pattern_matching_enabled: bool,
) -> MockDecision {
    if !pattern_matching_enabled {
        return MockDecision {
            should_mock: true,
            reason: "pattern matching disabled".to_string(),
            existing: None,
        };
    }

    if let Some(exact) = existing_mocks
        .iter()
        .find(|m| m.proxy_port == proxy_port && m.method.eq_ignore_ascii_case(method) && m.url == url)
    {
        return MockDecision {
            should_mock: false,
            reason: format!("Mock already exists for {} {}", method, url),
            existing: Some(exact.clone()),
        };
    }

    let requested_pattern = pattern_of(url);
    if let Some(pattern_match) = existing_mocks.iter().find(|m| {
        m.proxy_port == proxy_port
            && m.method.eq_ignore_ascii_case(method)
            && pattern_of(&m.url) == requested_pattern
    }) {
        return MockDecision {
            should_mock: false,
            reason: format!("Mock already exists for pattern {}", pattern_of(&pattern_match.url)),
            existing: Some(pattern_match.clone()),
        };
    }

    MockDecision {
        should_mock: true,
        reason: "no conflicting mock".to_string(),
        existing: None,
    }
}
