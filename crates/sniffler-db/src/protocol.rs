//! Protocol-dispatch layer: routes raw frames to the Postgres or MySQL
//! observers (§4.8 "parse just enough of startup/handshake frames").

use sniffler_core::model::DbProtocol;

use crate::{mysql, postgres};

/// Outcome of observing a server→client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Successful completion; carries whatever tag/status text the wire
    /// protocol exposes (a command tag for Postgres, empty for MySQL OK).
    Ok(String),
    Error(String),
}

/// Best-effort query-text extraction from one client→server frame. Returns
/// `Some(String::new())` for a bare health-check ping with no query text
/// (MySQL `COM_PING`), so the health-check filter can treat it uniformly.
pub fn extract_query(protocol: DbProtocol, frame: &[u8]) -> Option<String> {
    match protocol {
        DbProtocol::Postgres => postgres::extract_query(frame),
        DbProtocol::Mysql => mysql::extract_query(frame),
        _ => None,
    }
}

/// Best-effort completion extraction from one server→client frame.
pub fn extract_completion(protocol: DbProtocol, frame: &[u8]) -> Option<Completion> {
    match protocol {
        DbProtocol::Postgres => postgres::extract_completion(frame),
        DbProtocol::Mysql => mysql::extract_completion(frame),
        _ => None,
    }
}
