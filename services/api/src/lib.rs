//! Cadence API Library Crate
//!
//! HTTP and WebSocket surface of the session engine: configuration, the
//! Postgres-backed store, REST handlers, the WebSocket channel and routing.
//! The binaries in `bin/` are thin wrappers around this library.

pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;
