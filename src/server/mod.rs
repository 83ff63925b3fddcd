//! HTTP server module
//!
//! Exposes the streaming endpoint and control requests over HTTP.

mod http;
mod streaming;

pub use http::router;
pub use streaming::*;
