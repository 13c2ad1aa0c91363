//! The process-wide MQTT service consumed by UI components.
//!
//! One `MqttService` is constructed when configuration becomes available and
//! injected into consumers; it owns the topic registry, the current broker
//! link and the status surface. Components only ever call
//! `subscribe_to_topic`/`unsubscribe_from_topic` and receive their messages
//! through the handlers they registered.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{BrokerConfig, RetryPolicy};
use super::connection::{BrokerLink, ConnectionManager, MqttLink, RumqttcLink, WsDialer};
use super::error::MqttError;
use super::registry::{invoke_all, Handler, MessageMeta, TopicRegistry};
use rumqttc::{Event, EventLoop, Packet};

/// Lifecycle of the underlying broker connection.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

/// Status surface for the UI: connection lifecycle, the persistent (but
/// dismissible) error banner, and activity counters.
#[derive(Clone, Debug, Default)]
pub struct MqttStatus {
    pub connection_state: ConnectionState,
    /// User-visible, non-fatal connection failures. Cleared on the next
    /// successful connect.
    pub error_messages: Vec<String>,
    pub messages_received: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

struct Inner {
    registry: Mutex<TopicRegistry>,
    link: Mutex<Option<Box<dyn BrokerLink>>>,
    status_tx: watch::Sender<MqttStatus>,
    cancel: Mutex<CancellationToken>,
}

impl Inner {
    fn lock_registry(&self) -> std::sync::MutexGuard<'_, TopicRegistry> {
        self.registry.lock().expect("topic registry lock")
    }

    fn lock_link(&self) -> std::sync::MutexGuard<'_, Option<Box<dyn BrokerLink>>> {
        self.link.lock().expect("broker link lock")
    }

    /// Routes one inbound broker message. Matching handlers are cloned out
    /// under the registry lock and invoked after it is released, so a
    /// handler may re-enter subscribe/unsubscribe without deadlocking.
    fn handle_publish(&self, topic: &str, payload: &[u8], retain: bool) {
        self.status_tx.send_modify(|status| {
            status.messages_received += 1;
            status.last_activity = Some(chrono::Local::now());
        });
        let handlers = self.lock_registry().matches(topic);
        if handlers.is_empty() {
            // most cluster traffic is not locally subscribed
            return;
        }
        invoke_all(&handlers, topic, payload, &MessageMeta { retain });
    }
}

/// Handle to the shared broker-client service. Cheap to clone; all clones
/// observe the same registry and connection.
#[derive(Clone)]
pub struct MqttService {
    inner: Arc<Inner>,
}

impl Default for MqttService {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttService {
    /// Creates the service in its inert state: registrations are accepted
    /// and recorded, nothing is sent until a connect succeeds.
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(MqttStatus::default());
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(TopicRegistry::new()),
                link: Mutex::new(None),
                status_tx,
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Watch channel carrying connection state and the error banner.
    pub fn status(&self) -> watch::Receiver<MqttStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Registers `handler` under `key` for one or more patterns. Patterns
    /// that became active are pushed to the broker in a single batched
    /// subscribe; without a live link they are merely recorded and picked up
    /// by the resubscription pass of the next successful connect.
    pub fn subscribe_to_topic<S: AsRef<str>>(&self, patterns: &[S], handler: Handler, key: &str) {
        let newly_active = self.inner.lock_registry().subscribe(patterns, handler, key);
        if newly_active.is_empty() {
            return;
        }
        match &*self.inner.lock_link() {
            Some(link) => {
                if let Err(e) = link.subscribe_many(&newly_active) {
                    warn!(error = %e, "broker subscribe failed; patterns stay registered locally");
                }
            }
            None => debug!(
                count = newly_active.len(),
                "no live broker link; subscription recorded for later"
            ),
        }
    }

    /// Removes `key`'s handlers for the given patterns. Patterns whose last
    /// consumer just left are unsubscribed at the broker.
    pub fn unsubscribe_from_topic<S: AsRef<str>>(&self, patterns: &[S], key: &str) {
        let newly_inactive = self.inner.lock_registry().unsubscribe(patterns, key);
        if newly_inactive.is_empty() {
            return;
        }
        if let Some(link) = &*self.inner.lock_link() {
            if let Err(e) = link.unsubscribe_many(&newly_inactive) {
                warn!(error = %e, "broker unsubscribe failed");
            }
        }
    }

    /// Sends a command payload to the cluster at QoS 0. Dropped with a log
    /// line when no connection is live; device state is recoverable over the
    /// REST API, MQTT is the convenience channel.
    pub fn publish(&self, topic: &str, payload: &[u8]) {
        match &*self.inner.lock_link() {
            Some(link) => {
                if let Err(e) = link.publish(topic, payload) {
                    warn!(%topic, error = %e, "publish failed");
                }
            }
            None => debug!(%topic, "publish dropped; no live broker link"),
        }
    }

    /// Establishes the broker connection, replacing any previous one.
    ///
    /// On success the full set of active patterns is re-subscribed, the
    /// listener task is spawned and the error banner is cleared. On terminal
    /// failure the banner is set and the error returned; the service stays
    /// usable in its inert state.
    pub async fn connect(
        &self,
        config: &BrokerConfig,
        policy: &RetryPolicy,
    ) -> Result<(), MqttError> {
        // never two live connections under one logical client
        self.teardown();

        let cancel = CancellationToken::new();
        *self.inner.cancel.lock().expect("cancel token lock") = cancel.clone();

        self.inner.status_tx.send_modify(|status| {
            status.connection_state = ConnectionState::Connecting;
        });

        let manager = ConnectionManager::new(
            config.clone(),
            policy.clone(),
            WsDialer::new(config.clone()),
            cancel.clone(),
        );
        match manager.connect().await {
            Ok(MqttLink { client, eventloop }) => {
                let link: Box<dyn BrokerLink> = Box::new(RumqttcLink::new(client));
                let active = self.inner.lock_registry().active_patterns();
                if !active.is_empty() {
                    if let Err(e) = link.subscribe_many(&active) {
                        warn!(error = %e, "resubscription after connect failed");
                    } else {
                        info!(count = active.len(), "resubscribed active patterns");
                    }
                }
                *self.inner.lock_link() = Some(link);
                self.inner.status_tx.send_modify(|status| {
                    status.connection_state = ConnectionState::Connected;
                    status.error_messages.clear();
                });
                info!(address = %config.address_list(), "mqtt broker connected");

                let inner = self.inner.clone();
                tokio::spawn(listen(inner, eventloop, cancel));
                Ok(())
            }
            Err(e) => {
                let banner = format!("MQTT connection failed ({})", config.address_list());
                self.inner.status_tx.send_modify(|status| {
                    status.connection_state = ConnectionState::Failed;
                    status.error_messages.push(banner);
                });
                warn!(error = %e, "mqtt broker connection failed");
                Err(e)
            }
        }
    }

    /// Closes the current connection if present. Idempotent; safe to call
    /// on shutdown, on configuration change and while a connect is still in
    /// flight (the in-flight attempt will refuse to promote its link).
    pub fn teardown(&self) {
        self.inner.cancel.lock().expect("cancel token lock").cancel();
        if let Some(link) = self.inner.lock_link().take() {
            link.disconnect();
            info!("mqtt link closed");
        }
        self.inner.status_tx.send_modify(|status| {
            status.connection_state = ConnectionState::Disconnected;
        });
    }

    #[cfg(test)]
    fn set_link_for_test(&self, link: Box<dyn BrokerLink>) {
        *self.inner.lock_link() = Some(link);
    }
}

/// Single transport listener per connection: forwards every inbound publish
/// into the registry, sequentially, so per-connection delivery order is
/// preserved. Errors after an intentional teardown are suppressed.
async fn listen(inner: Arc<Inner>, mut eventloop: EventLoop, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("mqtt listener stopped");
                break;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    inner.handle_publish(&publish.topic, &publish.payload, publish.retain);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    info!("broker closed the connection");
                }
                Ok(_) => {}
                Err(e) => {
                    if cancel.is_cancelled() {
                        // benign error from our own disconnect
                        break;
                    }
                    error!(error = %e, "mqtt transport error");
                    inner.status_tx.send_modify(|status| {
                        status.connection_state = ConnectionState::Failed;
                        status.error_messages.push(format!("MQTT connection lost: {e}"));
                    });
                    break;
                }
            }
        }
    }
}
