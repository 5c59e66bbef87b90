//! Peer-side client for the Switchboard orchestrator.
//!
//! Agents, services, and plain clients connect to their channel endpoint
//! with a [`PeerClient`], which handles the WebSocket transport, request
//! correlation, and optional registration. Reconnection re-establishes the
//! channel only; in-flight tasks are never resumed.

mod client;

pub use client::{PeerClient, PeerClientBuilder, Registration};
