//! # Relay Server
//!
//! Rendezvous point for peers running the GVT synchronization core. The
//! server never simulates anything itself; it only
//!
//! - answers handshakes with the offset between its own clock and the peer's,
//!   so every peer can translate times into one shared timeline,
//! - acknowledges each peer's batch and republishes it verbatim to every
//!   subscriber of the `GVT` topic,
//! - announces departures, both explicit ones and peers whose lease ran out,
//!   with a disconnect notice carrying the peer's last claim.
//!
//! ## Module Organization
//!
//! - `client_manager`: peer roster, leases and the subscriber list
//! - `network`: UDP endpoints, receiver/sender tasks and the main loop

pub mod client_manager;
pub mod network;
