//! Approval workflow engine for certificate-of-occupancy cases and land
//! ownership transfers.
//!
//! A case moves through an ordered reviewer pipeline under sequential
//! custody: at any moment exactly one reviewer (or nobody) owes a decision,
//! anchored by a single pending inbox entry per case. Every transition is
//! attributable, timestamped and recorded in an append-only stage log.
//! Ownership transfers additionally clear a multi-channel one-time-code
//! gate before entering a single-authority approval.

pub mod audit;
pub mod case;
pub mod collab;
pub mod config;
pub mod directory;
pub mod error;
pub mod ids;
pub mod inbox;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod transfer;
