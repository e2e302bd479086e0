//! Observability surfaces: status and health endpoints.
//!
//! The `/metrics` endpoint is served separately via
//! `metrics-exporter-prometheus` and is mounted in `main`.

pub mod health;

pub use health::status_router;
