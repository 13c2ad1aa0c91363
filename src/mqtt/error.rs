//! Error definitions for the MQTT connectivity module

use thiserror::Error;

/// Error types for broker connectivity and topic routing
#[derive(Debug, Error)]
pub enum MqttError {
    /// A single host failed or timed out during one connection attempt.
    /// Recovered locally by moving on to the next host in the list.
    #[error("host {host} unreachable: {reason}")]
    HostUnreachable { host: String, reason: String },

    /// Every host failed in every retry round. Terminal for the connect
    /// call; surfaced to the UI as a banner, never as a panic.
    #[error("broker unreachable at {address}")]
    BrokerUnreachable { address: String },

    /// Transport-level error after a connection was established,
    /// e.g. a broker restart.
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// A subscription filter that violates wildcard placement rules.
    #[error("invalid topic pattern '{0}': '#' must be the final segment")]
    InvalidPattern(String),

    /// A broker request was enqueued on a client whose request channel
    /// is already closed.
    #[error("broker link closed")]
    LinkClosed,
}
