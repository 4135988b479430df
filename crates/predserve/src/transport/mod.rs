//! Transport layer for predserve.
//!
//! Currently provides HTTP and websocket transport via axum.

pub mod http;

pub use http::{ServerConfig, serve};
