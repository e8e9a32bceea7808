//! Typed admin-operation result (§7): admin operations never throw across
//! the in-process RPC boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// `{ok, kind?, message, details?}` as specified in §7.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl AdminResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            kind: None,
            message: message.into(),
            details: None,
        }
    }

    pub fn ok_with_details(message: impl Into<String>, details: Value) -> Self {
        Self {
            ok: true,
            kind: None,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            kind: None,
            message: message.into(),
            details: None,
        }
    }
}

impl From<&Error> for AdminResult {
    fn from(error: &Error) -> Self {
        Self {
            ok: false,
            kind: Some(error.kind().to_string()),
            message: error.to_string(),
            details: None,
        }
    }
}

impl From<Error> for AdminResult {
    fn from(error: Error) -> Self {
        Self::from(&error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_conversion_carries_kind_and_message() {
        let result: AdminResult = Error::port_in_use(8080).into();
        assert!(!result.ok);
        assert_eq!(result.kind.as_deref(), Some("PortInUse"));
        assert!(result.message.contains("8080"));
    }
}
