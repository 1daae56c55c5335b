//! netcore
//!
//! Networking core for real-time multiplayer games: channel-addressed
//! transport with a token handshake, bit-packed player input, per-frame
//! input history and rollback replay.
//!
//! # Features
//!
//! - `quic` - QUIC/WebTransport engine and the dedicated server binary (enabled by default)
//! - `metrics_http` - HTTP endpoint for Prometheus/JSON metrics (enabled by default)
//!
//! The in-process loopback engine is always available.

pub mod config;
pub mod input;
pub mod metrics;
pub mod net;
pub mod util;
