//! Error types shared across the Sniffler workspace.

/// Result type alias for Sniffler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error taxonomy. Every admin-facing failure collapses to one of
/// these kinds before it crosses the admin API boundary (see
/// [`crate::admin::AdminResult`]).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("target {host}:{port} is unreachable")]
    TargetUnreachable { host: String, port: u16 },

    #[error("invalid config: {message}")]
    ConfigInvalid { message: String },

    #[error("upstream I/O error: {message}")]
    UpstreamIo { message: String },

    #[error("decode error: {message}")]
    DecodeError { message: String },

    #[error("mock incompatible with protocol: {message}")]
    MockIncompatible { message: String },

    #[error("persistence error: {message}")]
    PersistenceError { message: String },

    #[error("operation timed out: {message}")]
    Timeout { message: String },

    #[error("operation cancelled: {message}")]
    Cancelled { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl Error {
    pub fn port_in_use(port: u16) -> Self {
        Self::PortInUse { port }
    }

    pub fn target_unreachable(host: impl Into<String>, port: u16) -> Self {
        Self::TargetUnreachable {
            host: host.into(),
            port,
        }
    }

    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    pub fn upstream_io(message: impl Into<String>) -> Self {
        Self::UpstreamIo {
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::DecodeError {
            message: message.into(),
        }
    }

    pub fn mock_incompatible(message: impl Into<String>) -> Self {
        Self::MockIncompatible {
            message: message.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::PersistenceError {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The taxonomy kind as a stable, UI-facing string (§7: "all UI alerts
    /// derive from typed `kind`").
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PortInUse { .. } => "PortInUse",
            Self::TargetUnreachable { .. } => "TargetUnreachable",
            Self::ConfigInvalid { .. } => "ConfigInvalid",
            Self::UpstreamIo { .. } => "UpstreamIO",
            Self::DecodeError { .. } => "DecodeError",
            Self::MockIncompatible { .. } => "MockIncompatible",
            Self::PersistenceError { .. } => "PersistenceError",
            Self::Timeout { .. } => "Timeout",
            Self::Cancelled { .. } => "Cancelled",
            Self::Internal { .. } => "Internal",
            Self::Io(_) => "Internal",
            Self::Json(_) => "PersistenceError",
            Self::UrlParse(_) => "ConfigInvalid",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_per_variant() {
        assert_eq!(Error::port_in_use(8080).kind(), "PortInUse");
        assert_eq!(Error::config_invalid("bad").kind(), "ConfigInvalid");
        assert_eq!(Error::timeout("slow").kind(), "Timeout");
    }
}
