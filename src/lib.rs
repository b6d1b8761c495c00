//! DOTS server library.
//!
//! Mitigation request orchestration for a DDoS Open Threat Signaling server:
//! lifecycle management, conflict resolution and blocker management.

pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod utils;
