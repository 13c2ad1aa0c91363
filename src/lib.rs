//! Connectivity core of the bioreactor cluster console.
//!
//! `mqtt` provides the process-wide broker client: connection establishment
//! with multi-host fallback and bounded retries, a wildcard-aware topic
//! registry and reference-counted broker subscriptions. `config` loads the
//! TOML file that decides whether and where to connect.

pub mod config;
pub mod mqtt;
