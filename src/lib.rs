//! Offline-first request gateway, durable write queue and replay engine.

pub mod app;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod session;
pub mod store;
pub mod sync;
pub mod transport;
