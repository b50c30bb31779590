//! HTTP API Module
//!
//! Provides a REST API for record writes and cluster state.

mod http;

pub use http::{AppState, HttpServer};
