use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// WebSocket flavor used to reach the broker.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WsProtocol {
    #[default]
    Ws,
    Wss,
}

impl fmt::Display for WsProtocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WsProtocol::Ws => write!(f, "ws"),
            WsProtocol::Wss => write!(f, "wss"),
        }
    }
}

/// Everything needed for one connection attempt round: candidate hosts in
/// fallback order plus shared protocol, port and credentials.
///
/// Immutable once handed to the connection manager; a changed configuration
/// means a fresh `connect` call.
#[derive(Clone, Debug, PartialEq)]
pub struct BrokerConfig {
    pub hosts: Vec<String>,
    pub protocol: WsProtocol,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl BrokerConfig {
    /// Connection URI for one candidate host, e.g. `ws://unit1.lab:8083/mqtt`.
    pub fn uri_for(&self, host: &str) -> String {
        format!("{}://{}:{}/mqtt", self.protocol, host, self.port)
    }

    /// The full candidate list in its original semicolon-delimited form,
    /// used in user-facing error messages.
    pub fn address_list(&self) -> String {
        self.hosts.join(";")
    }
}

/// Retry envelope for `connect`. The defaults mirror the values the
/// dashboard has always shipped with; no exponential backoff.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Full rounds over the host list before giving up.
    pub attempts: u32,
    /// Upper bound for a single host attempt.
    pub connect_timeout: Duration,
    /// Pause between rounds (not applied after the final round).
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            connect_timeout: Duration::from_millis(1000),
            retry_delay: Duration::from_millis(100),
        }
    }
}
