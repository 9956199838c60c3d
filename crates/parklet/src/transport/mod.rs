//! Transport layer for parklet.
//!
//! Provides HTTP transport via axum for lane controllers and the attendant
//! console.

pub mod http;

pub use http::{ServerConfig, serve};
