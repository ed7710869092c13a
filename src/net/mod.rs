//! Networking module
//!
//! This module handles the client-facing side of the icon server:
//! - Client directory and session events
//! - Icon packet transport to per-client outbound queues

pub mod directory;
pub mod transport;
