//! Structural comparison between a live response and a stored mock (§4.6
//! step 4, §3 `DriftReport`).

use std::collections::HashSet;

use serde_json::Value;

use crate::model::{Difference, DifferenceKind, DriftReport, Mock, Response};

/// Headers ignored by default when comparing responses — values that are
/// expected to vary across calls regardless of content.
pub fn default_ignored_headers() -> HashSet<String> {
    ["date", "x-sniffler-mock", "x-sniffler-proxy", "content-length"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Compare a live `response` against `mock`, producing the `DriftReport` of
/// §3. Headers in `ignored_headers` are skipped.
pub fn compare(mock: &Mock, response: &Response, ignored_headers: &HashSet<String>) -> DriftReport {
    let mut differences = Vec::new();

    if mock.status_code != response.status_code {
        differences.push(Difference {
            path: "$.status".to_string(),
            expected: mock.status_code.to_string(),
            actual: response.status_code.to_string(),
            kind: DifferenceKind::Status,
        });
    }

    for (key, expected_value) in &mock.headers {
        let lower = key.to_ascii_lowercase();
        if ignored_headers.contains(&lower) {
            continue;
        }
        match response.headers.get(key) {
            Some(actual_value) if actual_value == expected_value => {}
            Some(actual_value) => differences.push(Difference {
                path: format!("$.headers.{}", key),
                expected: expected_value.clone(),
                actual: actual_value.clone(),
                kind: DifferenceKind::Header,
            }),
            None => differences.push(Difference {
                path: format!("$.headers.{}", key),
                expected: expected_value.clone(),
                actual: String::new(),
                kind: DifferenceKind::Missing,
            }),
        }
    }

    differences.extend(compare_bodies(&mock.body, &response.body));

    let has_differences = !differences.is_empty();
    let summary = if has_differences {
        format!("{} difference(s) from stored mock", differences.len())
    } else {
        "identical to stored mock".to_string()
    };

    DriftReport {
        has_differences,
        differences,
        summary,
    }
}

fn compare_bodies(expected: &str, actual: &str) -> Vec<Difference> {
    match (
        serde_json::from_str::<Value>(expected),
        serde_json::from_str::<Value>(actual),
    ) {
        (Ok(expected_json), Ok(actual_json)) => {
            let mut out = Vec::new();
            compare_json("$", &expected_json, &actual_json, &mut out);
            out
        }
        _ if expected == actual => Vec::new(),
        _ => vec![Difference {
            path: "$".to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
            kind: DifferenceKind::Value,
        }],
    }
}

fn compare_json(path: &str, expected: &Value, actual: &Value, out: &mut Vec<Difference>) {
    match (expected, actual) {
        (Value::Object(expected_map), Value::Object(actual_map)) => {
            for (key, expected_value) in expected_map {
                let child_path = format!("{}.{}", path, key);
                match actual_map.get(key) {
                    Some(actual_value) => compare_json(&child_path, expected_value, actual_value, out),
                    None => out.push(Difference {
                        path: child_path,
                        expected: expected_value.to_string(),
                        actual: String::new(),
                        kind: DifferenceKind::Missing,
                    }),
                }
            }
            for key in actual_map.keys() {
                if !expected_map.contains_key(key) {
                    out.push(Difference {
                        path: format!("{}.{}", path, key),
                        expected: String::new(),
                        actual: actual_map[key].to_string(),
                        kind: DifferenceKind::Extra,
                    });
                }
            }
        }
        (Value::Array(expected_items), Value::Array(actual_items)) => {
            for (index, expected_item) in expected_items.iter().enumerate() {
                let child_path = format!("{}[{}]", path, index);
                match actual_items.get(index) {
                    Some(actual_item) => compare_json(&child_path, expected_item, actual_item, out),
                    None => out.push(Difference {
                        path: child_path,
                        expected: expected_item.to_string(),
                        actual: String::new(),
                        kind: DifferenceKind::Missing,
                    }),
                }
            }
            for index in expected_items.len()..actual_items.len() {
                out.push(Difference {
                    path: format!("{}[{}]", path, index),
                    expected: String::new(),
                    actual: actual_items[index].to_string(),
                    kind: DifferenceKind::Extra,
                });
            }
        }
        (expected_scalar, actual_scalar) if expected_scalar != actual_scalar => {
            out.push(Difference {
                path: path.to_string(),
                expected: scalar_display(expected_scalar),
                actual: scalar_display(actual_scalar),
                kind: DifferenceKind::Value,
            });
        }
        _ => {}
    }
}

fn scalar_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn mock_with_body(body: &str) -> Mock {
        Mock {
            id: "m1".to_string(),
            proxy_port: 8080,
            method: "GET".to_string(),
            url: "/users".to_string(),
            status_code: 200,
            headers: HashMap::new(),
            body: body.to_string(),
            delay_ms: 0,
            enabled: false,
            name: None,
            tags: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            auto_generated: false,
        }
    }

    #[test]
    fn identical_bodies_have_no_drift() {
        let mock = mock_with_body(r#"{"u":1}"#);
        let response = Response {
            status_code: 200,
            headers: HashMap::new(),
            body: r#"{"u":1}"#.to_string(),
        };
        let report = compare(&mock, &response, &default_ignored_headers());
        assert!(!report.has_differences);
    }

    #[test]
    fn changed_json_field_is_reported() {
        let mock = mock_with_body(r#"{"u":1}"#);
        let response = Response {
            status_code: 200,
            headers: HashMap::new(),
            body: r#"{"u":2}"#.to_string(),
        };
        let report = compare(&mock, &response, &default_ignored_headers());
        assert!(report.has_differences);
        assert_eq!(report.differences.len(), 1);
        assert_eq!(report.differences[0].path, "$.u");
        assert_eq!(report.differences[0].expected, "1");
        assert_eq!(report.differences[0].actual, "2");
        assert_eq!(report.differences[0].kind, DifferenceKind::Value);
    }

    #[test]
    fn status_mismatch_is_reported() {
        let mock = mock_with_body("{}");
        let response = Response {
            status_code: 404,
            headers: HashMap::new(),
            body: "{}".to_string(),
        };
        let report = compare(&mock, &response, &default_ignored_headers());
        assert!(report.differences.iter().any(|d| d.kind == DifferenceKind::Status));
    }

    #[test]
    fn ignored_headers_are_skipped() {
        let mut mock = mock_with_body("{}");
        mock.headers.insert("Date".to_string(), "yesterday".to_string());
        let response = Response {
            status_code: 200,
            headers: HashMap::from([("Date".to_string(), "today".to_string())]),
            body: "{}".to_string(),
        };
        let report = compare(&mock, &response, &default_ignored_headers());
        assert!(!report.has_differences);
    }

    #[test]
    fn array_items_compared_by_index() {
        let mock = mock_with_body(r#"[1,2,3]"#);
        let response = Response {
            status_code: 200,
            headers: HashMap::new(),
            body: r#"[1,9,3]"#.to_string(),
        };
        let report = compare(&mock, &response, &default_ignored_headers());
        assert_eq!(report.differences.len(), 1);
        assert_eq!(report.differences[0].path, "$[1]");
    }
}
