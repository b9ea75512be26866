//! Bus client facade
//!
//! The rest of the application talks to the broker through this thin
//! client-like API. The facade is polymorphic over the capability set
//! (publish, subscribe, lifecycle) so tests and future deployments can
//! substitute an external broker proxy for the in-process one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use crate::broker::{Broker, DeadLetterFn};
use crate::config::{Config, ConfigError};
use crate::error::BusError;
use crate::message::{MessageHandler, QoS};

/// The capability set the application consumes
#[async_trait]
pub trait Bus: Send + Sync {
    /// Start the broker
    async fn connect(&self) -> Result<(), BusError>;
    /// Graceful stop
    async fn disconnect(&self);
    /// Publish with the configured default QoS, not retained
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError>;
    /// Publish with explicit QoS and retain flag
    async fn publish_with_qos(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retained: bool,
    ) -> Result<(), BusError>;
    /// Register a handler for a topic filter
    async fn subscribe(
        &self,
        filter: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BusError>;
    /// Remove the handler for a topic filter
    async fn unsubscribe(&self, filter: &str) -> Result<(), BusError>;
    fn is_connected(&self) -> bool;
    /// Poll until the broker is running or the timeout elapses
    async fn wait_for_connection(&self, timeout: Duration) -> Result<(), BusError>;
}

static CLIENT_COUNTER: AtomicU64 = AtomicU64::new(1);

/// In-process bus client backed by an embedded [`Broker`]
pub struct BusClient {
    broker: Arc<Broker>,
    subscriber_id: Arc<str>,
    default_qos: QoS,
}

impl BusClient {
    /// Create a client with its own embedded broker
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        let broker = Broker::new(config)?;
        Ok(Self::from_broker(Arc::new(broker)))
    }

    /// Create a client whose abandoned deliveries go to the callback
    pub fn with_dead_letter(
        config: Config,
        dead_letter: Arc<DeadLetterFn>,
    ) -> Result<Self, ConfigError> {
        let broker = Broker::with_dead_letter(config, dead_letter)?;
        Ok(Self::from_broker(Arc::new(broker)))
    }

    /// Wrap an existing broker; the client derives its own subscriber
    /// identity, so all of its handlers share one FIFO dispatch queue.
    pub fn from_broker(broker: Arc<Broker>) -> Self {
        let n = CLIENT_COUNTER.fetch_add(1, Ordering::Relaxed);
        let default_qos = broker.config().default_qos_level();
        Self {
            broker,
            subscriber_id: format!("bus-client-{}", n).into(),
            default_qos,
        }
    }

    /// The embedded broker, for events, stats and metrics access
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Serialise a value to JSON and publish it with the default QoS
    pub async fn publish_json<T: Serialize>(&self, topic: &str, value: &T) -> Result<(), BusError> {
        let payload = serde_json::to_vec(value)?;
        self.broker
            .publish(topic, Bytes::from(payload), self.default_qos, false)
            .await
    }
}

#[async_trait]
impl Bus for BusClient {
    async fn connect(&self) -> Result<(), BusError> {
        self.broker.start()
    }

    async fn disconnect(&self) {
        self.broker.remove_subscriber(&self.subscriber_id);
        self.broker.stop().await;
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        self.broker
            .publish(topic, Bytes::copy_from_slice(payload), self.default_qos, false)
            .await
    }

    async fn publish_with_qos(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retained: bool,
    ) -> Result<(), BusError> {
        self.broker
            .publish(topic, Bytes::copy_from_slice(payload), qos, retained)
            .await
    }

    async fn subscribe(
        &self,
        filter: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BusError> {
        // Request the strongest guarantee; the broker caps it at its
        // configured maximum and the effective QoS is min-ed per message.
        self.broker
            .subscribe(&self.subscriber_id, filter, QoS::ExactlyOnce, handler)
            .map(|_| ())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), BusError> {
        self.broker
            .unsubscribe(&self.subscriber_id, filter)
            .map(|_| ())
    }

    fn is_connected(&self) -> bool {
        self.broker.is_connected()
    }

    async fn wait_for_connection(&self, timeout: Duration) -> Result<(), BusError> {
        self.broker.wait_for_connection(timeout).await
    }
}
