//! HTTP API: intake server, routing, and request/response mapping.

pub mod app;
pub mod settings;
