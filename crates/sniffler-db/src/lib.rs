//! # Sniffler DB
//!
//! The DB Wire Proxy (C8): an opaque TCP forwarder for Postgres and MySQL
//! upstreams, augmented with protocol-aware observers that extract query
//! text and completion status without needing to understand the full wire
//! protocol.

pub mod health_check;
pub mod mock;
pub mod mysql;
pub mod postgres;
pub mod protocol;
pub mod proxy;

pub use proxy::{DbProxyState, DEFAULT_DEDUP_WINDOW};
