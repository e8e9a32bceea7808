//! # Sniffler Registry
//!
//! Proxy Registry & Lifecycle (C9): the only component that owns a
//! `ProxyConfig` or a `RuntimeProxy`. Boot orchestration, per-port
//! lifecycle operations, and the admin operation surface all live here;
//! every other crate is reached by port, never by back-pointer.

pub mod registry;
pub mod runtime;

pub use registry::ProxyRegistry;
pub use runtime::{RuntimeProxy, SpawnContext};
