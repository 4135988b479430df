//! HTTP transport: REST routes, the task event websocket, and the server loop.

mod routes;
mod server;
mod ws;

pub use routes::{ApiError, BatchAccepted, routes};
pub use server::{ServerConfig, serve, serve_on};
