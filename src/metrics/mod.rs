//! Metrics collection and export module.
//!
//! This module holds the gauge store the scheduler writes into and the HTTP
//! endpoint a Prometheus server scrapes.
//!
//! # Submodules
//!
//! - `store` - expiry gauges, probe status and build info in a dedicated registry
//! - `server` - HTTP exposition of that registry

pub mod server;
pub mod store;

pub use server::{bind, router, serve};
pub use store::{ExpiryGaugeStore, EXPIRY_METRIC};
