//! scanbridge - browser-to-scanner bridge daemon
//!
//! A long-lived local daemon that lets browser pages drive a physically
//! attached document scanner over two loopback WebSocket endpoints (one
//! plaintext, one TLS).
//!
//! ## Architecture (9 Components)
//!
//! 1. CertManager - TLS certificate lifecycle
//! 2. SessionStore - token auth and socket binding
//! 3. Protocol - JSON request/response codec
//! 4. Backends - device-family adapters (`a`, `b`, `e`)
//! 5. ScannerRouter - namespaced façade and event fan-in
//! 6. Recompressor - size-adaptive page re-encoding
//! 7. Gateway - dual-port WebSocket front end
//! 8. Control plane - wiring and lifecycle (main.rs)
//! 9. PreferencesStore - default device record
//!
//! ## Design Principles
//!
//! - One seat: a single scanner device serves many sessions, one job at a time
//! - Pairwise delivery: pages reach the requesting session only, never broadcast
//! - Exactly one terminal message per scan job, however noisy the driver

pub mod backend;
pub mod cert_manager;
pub mod driver;
pub mod gateway;
pub mod models;
pub mod prefs;
pub mod protocol;
pub mod recompress;
pub mod router;
pub mod session_store;
pub mod error;
pub mod state;

pub use error::{Error, Result};
pub use state::AppState;
