//! Broker connection establishment with multi-host fallback.
//!
//! The connection manager walks the configured host list in order, racing
//! each dial against a fixed timeout, and repeats the whole round a bounded
//! number of times with a fixed delay in between. The first host to answer
//! wins; everything after that is abandoned. The actual dialing sits behind
//! the [`Dialer`] trait so the retry envelope can be exercised without a
//! broker.

use std::future::Future;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter, Transport};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::config::{BrokerConfig, RetryPolicy, WsProtocol};
use super::error::MqttError;

const KEEP_ALIVE: Duration = Duration::from_secs(5);
const REQUEST_CHANNEL_CAP: usize = 100;

/// Command half of a live broker session. All calls are non-blocking
/// enqueues; delivery failures degrade to log lines, they never panic the
/// caller.
pub trait BrokerLink: Send + Sync {
    fn subscribe_many(&self, patterns: &[String]) -> Result<(), MqttError>;
    fn unsubscribe_many(&self, patterns: &[String]) -> Result<(), MqttError>;
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), MqttError>;
    fn disconnect(&self);
}

/// One attempt against one host. Dropping the returned future, or the link
/// it resolves to, must close whatever socket the attempt opened.
pub trait Dialer: Send + Sync {
    type Link: Send;

    fn dial(&self, uri: &str) -> impl Future<Output = Result<Self::Link, MqttError>> + Send;
}

/// Drives the retry/fallback loop over a [`Dialer`].
pub struct ConnectionManager<D> {
    config: BrokerConfig,
    policy: RetryPolicy,
    dialer: D,
    cancel: CancellationToken,
}

impl<D: Dialer> ConnectionManager<D> {
    pub fn new(
        config: BrokerConfig,
        policy: RetryPolicy,
        dialer: D,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            policy,
            dialer,
            cancel,
        }
    }

    /// Attempts every host for every retry round until one dial succeeds.
    ///
    /// Timeouts and per-host refusals stay inside the retry envelope and are
    /// only logged; the caller sees either a live link or the terminal
    /// [`MqttError::BrokerUnreachable`]. A cancellation racing the connect is
    /// checked before a freshly dialed link is promoted, so a teardown during
    /// the dial can never leave a stray live connection behind (the
    /// unpromoted link is dropped, which closes it).
    pub async fn connect(&self) -> Result<D::Link, MqttError> {
        for round in 1..=self.policy.attempts {
            for host in &self.config.hosts {
                if self.cancel.is_cancelled() {
                    return Err(MqttError::ConnectionError(
                        "connect cancelled during teardown".into(),
                    ));
                }
                let uri = self.config.uri_for(host);
                debug!(round, %uri, "attempting broker connection");
                match timeout(self.policy.connect_timeout, self.dialer.dial(&uri)).await {
                    Ok(Ok(link)) => {
                        if self.cancel.is_cancelled() {
                            debug!(%uri, "discarding link dialed during teardown");
                            return Err(MqttError::ConnectionError(
                                "connect cancelled during teardown".into(),
                            ));
                        }
                        debug!(round, %uri, "broker connection established");
                        return Ok(link);
                    }
                    Ok(Err(e)) => {
                        warn!(%uri, error = %e, "broker host attempt failed");
                    }
                    Err(_) => {
                        // dropping the dial future closes the half-open attempt
                        warn!(
                            %uri,
                            timeout_ms = self.policy.connect_timeout.as_millis() as u64,
                            "broker host attempt timed out"
                        );
                    }
                }
            }
            if round < self.policy.attempts {
                sleep(self.policy.retry_delay).await;
            }
        }
        Err(MqttError::BrokerUnreachable {
            address: self.config.address_list(),
        })
    }
}

/// A dialed rumqttc session, not yet wired up: the client half becomes the
/// [`BrokerLink`], the event loop half goes to the listener task.
pub struct MqttLink {
    pub client: AsyncClient,
    pub eventloop: EventLoop,
}

/// Production dialer: MQTT 3.1.1 over WebSocket via rumqttc.
pub struct WsDialer {
    config: BrokerConfig,
}

impl WsDialer {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

impl Dialer for WsDialer {
    type Link = MqttLink;

    async fn dial(&self, uri: &str) -> Result<MqttLink, MqttError> {
        // for websocket transports rumqttc wants the full URL as the broker
        // address and ignores the port argument
        let client_id = format!("bioconsole-{}", std::process::id());
        let mut options = MqttOptions::new(client_id, uri, self.config.port);
        options.set_transport(match self.config.protocol {
            WsProtocol::Ws => Transport::Ws,
            WsProtocol::Wss => Transport::wss_with_default_config(),
        });
        options.set_keep_alive(KEEP_ALIVE);
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAP);
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    return Ok(MqttLink { client, eventloop });
                }
                Ok(_) => continue,
                Err(e) => {
                    return Err(MqttError::HostUnreachable {
                        host: uri.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}

/// [`BrokerLink`] over a connected rumqttc client. Uses the `try_` request
/// variants so subscribe/unsubscribe/publish stay synchronous for callers.
pub struct RumqttcLink {
    client: AsyncClient,
}

impl RumqttcLink {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

impl BrokerLink for RumqttcLink {
    fn subscribe_many(&self, patterns: &[String]) -> Result<(), MqttError> {
        if patterns.is_empty() {
            return Ok(());
        }
        let filters = patterns
            .iter()
            .map(|p| SubscribeFilter::new(p.clone(), QoS::AtMostOnce))
            .collect::<Vec<_>>();
        self.client
            .try_subscribe_many(filters)
            .map_err(|_| MqttError::LinkClosed)
    }

    fn unsubscribe_many(&self, patterns: &[String]) -> Result<(), MqttError> {
        for pattern in patterns {
            self.client
                .try_unsubscribe(pattern.clone())
                .map_err(|_| MqttError::LinkClosed)?;
        }
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), MqttError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|_| MqttError::LinkClosed)
    }

    fn disconnect(&self) {
        if self.client.try_disconnect().is_err() {
            debug!("broker link already closed");
        }
    }
}
