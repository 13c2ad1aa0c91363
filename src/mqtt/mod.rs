//! # MQTT Connectivity Module
//!
//! The live-update channel of the bioreactor console. The REST API remains
//! the system of record; MQTT exists so charts, log views and alert panels
//! can follow the cluster in real time without polling.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs     - broker endpoint description and retry policy
//! ├── error.rs      - error taxonomy
//! ├── connection.rs - multi-host fallback dialing and the broker link
//! ├── registry.rs   - topic trie, per-component handlers, ref counting
//! └── handler.rs    - MqttService: the API surface components talk to
//! ```
//!
//! ## Design Notes
//!
//! - Any number of components may subscribe to overlapping wildcard
//!   patterns; the registry fans each inbound message out to exactly the
//!   matching handlers.
//! - The broker only ever sees one subscription per pattern, opened when the
//!   first consumer arrives and closed when the last one leaves.
//! - Connection loss is state, not an exception: the service keeps accepting
//!   registrations while disconnected and replays them on the next connect.

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod registry;

pub use config::{BrokerConfig, RetryPolicy, WsProtocol};
pub use error::MqttError;
pub use handler::{ConnectionState, MqttService, MqttStatus};
pub use registry::{Handler, MessageMeta, TopicRegistry};
