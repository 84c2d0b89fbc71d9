//! Matching and signaling relay for anonymous one-to-one sessions.
//!
//! Clients announce readiness over a WebSocket, get paired with whoever is
//! waiting, and exchange offer/answer/candidate messages through the relay
//! until one of them asks for the next partner or leaves.

pub mod config;
pub mod matchmaker;
pub mod registry;
pub mod relay;
pub mod server;
pub mod switchboard;

pub use config::{Args, Keepalive};
pub use server::{router, serve};
pub use switchboard::Switchboard;
