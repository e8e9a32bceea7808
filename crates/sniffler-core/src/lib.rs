//! # Sniffler Core
//!
//! Shared foundation for the Sniffler intercepting-proxy suite: the entity
//! model (`ProxyConfig`, `Mock`, `RequestRecord`, `DriftReport`), the Body
//! Codec (C2), the Pattern Engine (C3), drift comparison, the Event Bus
//! (C10), the Persistence Store (C11), and process-wide settings and
//! logging bootstrap.
//!
//! Protocol-specific crates (`sniffler-mocks`, `sniffler-recorder`,
//! `sniffler-proxy`, `sniffler-db`, `sniffler-registry`) build on top of
//! these types; none of them reach back into each other directly — they
//! look proxies up by port through the registry instead (§9 "no
//! back-pointers").

pub mod admin;
pub mod codec;
pub mod config;
pub mod dedup;
pub mod drift;
pub mod error;
pub mod events;
pub mod logging;
pub mod model;
pub mod pattern;
pub mod persistence;

pub use admin::AdminResult;
pub use error::{Error, Result};
