//! HTTP API Module
//!
//! Provides the admin REST API of the monitor.

mod http;

pub use http::{AppState, HttpServer};
