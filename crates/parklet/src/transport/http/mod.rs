//! HTTP transport: axum router and server loop.

mod routes;
mod server;

pub use routes::routes;
pub use server::{ServerConfig, ShutdownReason, bind, serve, serve_on, wait_for_shutdown};
