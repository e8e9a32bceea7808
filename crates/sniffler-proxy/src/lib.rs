//! # Sniffler Proxy
//!
//! The two HTTP-family transports: the plain forward proxy (C6, `http`)
//! and the CONNECT+TLS-MITM forward proxy (C7, `mitm`), sharing a single
//! request/response pipeline (`pipeline`) for mock serving, drift
//! detection, and auto-mock synthesis.

pub mod ca;
pub mod http;
pub mod mitm;
pub mod pipeline;
pub mod port_probe;
