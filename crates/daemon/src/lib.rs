//! Vigil Daemon
//!
//! Runtime around the sans-I/O coordinator: a tokio task owning the
//! [`vigil_server::Coordinator`], a one-second global tick, and an axum
//! WebSocket endpoint carrying prost envelopes as binary frames.

#![deny(unsafe_code)]

pub mod actor;
pub mod config;
pub mod transport;
