//! Bus broker core
//!
//! Owns the subscription index, retained store, in-flight table and the
//! router worker pool, and coordinates the broker lifecycle from start
//! through graceful drain to stop.

mod dispatch;
mod inflight;
mod router;

pub use inflight::{DeliveryState, InflightMessage};

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::{Config, ConfigError};
use crate::error::BusError;
use crate::message::{AbandonedDelivery, Delivery, Message, MessageHandler, QoS};
use crate::metrics::Metrics;
use crate::retained::RetainedStore;
use crate::topic::{validate_topic_filter, validate_topic_name, Subscription, SubscriptionStore};

use dispatch::{spawn_dispatcher, DispatchCtx, SubscriberHandle};
use inflight::InflightTable;
use router::{deliver_to_subscriber, route_worker, RouteJob, RouteQueue, RouterCtx};

/// Sink for deliveries abandoned after exhausting retries
pub type DeadLetterFn = dyn Fn(AbandonedDelivery) + Send + Sync;

/// Broker lifecycle states. Transitions are monotonic: a stopped broker
/// is not restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BrokerState {
    Initialized = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl BrokerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => BrokerState::Initialized,
            1 => BrokerState::Running,
            2 => BrokerState::Stopping,
            _ => BrokerState::Stopped,
        }
    }
}

/// Broker events, for the console's activity feed
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// Subscription registered
    SubscriberAdded {
        subscriber_id: Arc<str>,
        filter: Arc<str>,
    },
    /// Subscription removed
    SubscriberRemoved {
        subscriber_id: Arc<str>,
        filter: Arc<str>,
    },
    /// Message accepted for routing
    MessagePublished { topic: Arc<str>, qos: QoS },
    /// Delivery abandoned after exhausting retries
    DeliveryAbandoned {
        topic: Arc<str>,
        subscriber_id: Arc<str>,
    },
}

/// The in-process bus broker
pub struct Broker {
    config: Config,
    state: AtomicU8,
    subscriptions: Arc<SubscriptionStore>,
    retained: Arc<RetainedStore>,
    dispatchers: Arc<DashMap<Arc<str>, SubscriberHandle>>,
    router_ctx: Arc<RouterCtx>,
    route_queue: RouteQueue,
    route_receivers: Mutex<Option<Vec<mpsc::Receiver<RouteJob>>>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: broadcast::Sender<()>,
    events: broadcast::Sender<BusEvent>,
    metrics: Arc<Metrics>,
}

impl Broker {
    /// Create a broker with no dead-letter sink
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        Self::build(config, None)
    }

    /// Create a broker whose abandoned deliveries are passed to the
    /// given callback
    pub fn with_dead_letter(
        config: Config,
        dead_letter: Arc<DeadLetterFn>,
    ) -> Result<Self, ConfigError> {
        Self::build(config, Some(dead_letter))
    }

    fn build(config: Config, dead_letter: Option<Arc<DeadLetterFn>>) -> Result<Self, ConfigError> {
        config.validate()?;

        let worker_count = config.effective_worker_count();
        let (route_queue, route_receivers) =
            RouteQueue::new(worker_count, config.route_shard_capacity());
        let (shutdown, _) = broadcast::channel(1);
        let (events, _) = broadcast::channel(1024);

        let metrics = Arc::new(Metrics::new());
        let subscriptions = Arc::new(SubscriptionStore::new());
        let retained = Arc::new(RetainedStore::new());
        let dispatchers: Arc<DashMap<Arc<str>, SubscriberHandle>> = Arc::new(DashMap::new());

        let dispatch = Arc::new(DispatchCtx {
            qos1_deadline: config.qos1_deadline,
            qos2_phase_deadline: config.qos2_phase_deadline,
            max_attempts: config.max_attempts,
            retry_initial: config.retry_initial,
            retry_cap: config.retry_cap,
            inflight: Arc::new(InflightTable::new(worker_count)),
            metrics: metrics.clone(),
            dead_letter,
            shutdown: shutdown.clone(),
            events: events.clone(),
        });

        let router_ctx = Arc::new(RouterCtx {
            subscriptions: subscriptions.clone(),
            dispatchers: dispatchers.clone(),
            dispatch,
        });

        Ok(Self {
            config,
            state: AtomicU8::new(BrokerState::Initialized as u8),
            subscriptions,
            retained,
            dispatchers,
            router_ctx,
            route_queue,
            route_receivers: Mutex::new(Some(route_receivers)),
            worker_handles: Mutex::new(Vec::new()),
            shutdown,
            events,
            metrics,
        })
    }

    /// Start the router workers and accept publishes.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), BusError> {
        self.state
            .compare_exchange(
                BrokerState::Initialized as u8,
                BrokerState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| BusError::AlreadyStarted)?;

        let receivers = self.route_receivers.lock().take().unwrap_or_default();
        let mut handles = Vec::with_capacity(receivers.len());
        for rx in receivers {
            handles.push(tokio::spawn(route_worker(
                self.router_ctx.clone(),
                rx,
                self.shutdown.subscribe(),
            )));
        }
        let worker_count = handles.len();
        *self.worker_handles.lock() = handles;

        info!(
            "bus broker running ({} router workers, queue capacity {})",
            worker_count, self.config.queue_capacity
        );
        Ok(())
    }

    /// Graceful stop: reject new publishes, drain in-flight QoS >= 1
    /// messages up to the configured deadline, then cancel pending
    /// retries and stop the workers.
    pub async fn stop(&self) {
        if self
            .state
            .compare_exchange(
                BrokerState::Running as u8,
                BrokerState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Never ran: settle straight into the terminal state
            let _ = self.state.compare_exchange(
                BrokerState::Initialized as u8,
                BrokerState::Stopped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            return;
        }

        let inflight = &self.router_ctx.dispatch.inflight;
        let deadline = Instant::now() + self.config.shutdown_drain;
        while inflight.outstanding() > 0 && Instant::now() < deadline {
            tokio::time::sleep(self.config.wait_poll_interval).await;
        }
        let undrained = inflight.outstanding();
        if undrained > 0 {
            warn!("drain deadline reached with {} messages in flight", undrained);
        }

        let _ = self.shutdown.send(());

        let handles = std::mem::take(&mut *self.worker_handles.lock());
        let _ = tokio::time::timeout(
            Duration::from_secs(1),
            futures_util::future::join_all(handles),
        )
        .await;

        self.dispatchers.clear();
        self.state
            .store(BrokerState::Stopped as u8, Ordering::Release);
        info!("bus broker stopped");
    }

    /// Publish a message.
    ///
    /// Returns once the message is routed (enqueued), not once it is
    /// delivered; delivery failures surface through metrics and the
    /// dead-letter callback.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), BusError> {
        if self.state() != BrokerState::Running {
            return Err(BusError::NotConnected);
        }
        validate_topic_name(topic).map_err(BusError::InvalidTopic)?;

        let topic: Arc<str> = Arc::from(topic);

        if retain {
            if payload.len() > self.config.retained_payload_max_bytes {
                warn!(
                    "not retaining oversized payload on {} ({} bytes)",
                    topic,
                    payload.len()
                );
                self.metrics.retained_dropped_total.inc();
            } else {
                self.retained.store(topic.clone(), payload.clone(), qos);
                self.metrics
                    .retained_current
                    .set(self.retained.len() as i64);
                self.metrics
                    .retained_bytes_current
                    .set(self.retained.payload_bytes() as i64);

                if payload.is_empty() {
                    // Deletion is silent to subscribers
                    trace!("retained entry for {} cleared", topic);
                    return Ok(());
                }
            }
        }

        self.metrics.messages_published_total.inc();
        let _ = self.events.send(BusEvent::MessagePublished {
            topic: topic.clone(),
            qos,
        });

        let result = self
            .route_queue
            .enqueue(
                Message {
                    topic,
                    payload,
                    qos,
                    retain,
                },
                self.config.back_pressure,
                self.config.enqueue_timeout,
            )
            .await;

        if matches!(result, Err(BusError::QueueFull) | Err(BusError::Timeout)) {
            self.metrics
                .queue_dropped_total
                .with_label_values(&["route"])
                .inc();
        }
        result
    }

    /// Register a subscription; returns the granted QoS.
    ///
    /// Retained messages matching the filter are delivered to the handler
    /// before any subsequently published message.
    pub fn subscribe(
        &self,
        subscriber_id: &str,
        filter: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<QoS, BusError> {
        if self.state() != BrokerState::Running {
            return Err(BusError::NotConnected);
        }
        validate_topic_filter(filter).map_err(BusError::InvalidFilter)?;

        let granted = qos.min(self.config.max_qos_level());
        let subscriber_id: Arc<str> = Arc::from(subscriber_id);
        let filter: Arc<str> = Arc::from(filter);

        self.dispatchers
            .entry(subscriber_id.clone())
            .or_insert_with(|| {
                spawn_dispatcher(
                    self.router_ctx.dispatch.clone(),
                    subscriber_id.clone(),
                    self.config.subscriber_queue_capacity,
                )
            });

        self.subscriptions.subscribe(Subscription {
            subscriber_id: subscriber_id.clone(),
            filter: filter.clone(),
            qos: granted,
            handler: handler.clone(),
        });
        self.metrics
            .subscriptions_current
            .set(self.subscriptions.len() as i64);
        debug!("{} subscribed to {} (qos {:?})", subscriber_id, filter, granted);
        let _ = self.events.send(BusEvent::SubscriberAdded {
            subscriber_id: subscriber_id.clone(),
            filter: filter.clone(),
        });

        // Materialise retained messages through the normal dispatch path
        for entry in self.retained.matching(&filter) {
            let effective_qos = entry.qos.min(granted);
            deliver_to_subscriber(
                &self.router_ctx,
                Delivery {
                    topic: entry.topic,
                    payload: entry.payload,
                    qos: effective_qos,
                    retained: true,
                    duplicate: false,
                },
                subscriber_id.clone(),
                handler.clone(),
            );
        }

        Ok(granted)
    }

    /// Remove a subscription; returns whether an entry existed
    pub fn unsubscribe(&self, subscriber_id: &str, filter: &str) -> Result<bool, BusError> {
        validate_topic_filter(filter).map_err(BusError::InvalidFilter)?;

        let removed = self.subscriptions.unsubscribe(subscriber_id, filter);
        if removed {
            self.metrics
                .subscriptions_current
                .set(self.subscriptions.len() as i64);
            debug!("{} unsubscribed from {}", subscriber_id, filter);
            let _ = self.events.send(BusEvent::SubscriberRemoved {
                subscriber_id: Arc::from(subscriber_id),
                filter: Arc::from(filter),
            });
            if self.subscriptions.count_for(subscriber_id) == 0 {
                self.dispatchers.remove(subscriber_id);
            }
        }
        Ok(removed)
    }

    /// Drop every subscription owned by a subscriber and its dispatch
    /// queue; returns how many subscriptions were removed
    pub fn remove_subscriber(&self, subscriber_id: &str) -> usize {
        let removed = self.subscriptions.unsubscribe_all(subscriber_id);
        self.dispatchers.remove(subscriber_id);
        if removed > 0 {
            self.metrics
                .subscriptions_current
                .set(self.subscriptions.len() as i64);
            debug!("removed subscriber {} ({} subscriptions)", subscriber_id, removed);
        }
        removed
    }

    /// Current lifecycle state
    pub fn state(&self) -> BrokerState {
        BrokerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True iff the broker is running
    pub fn is_connected(&self) -> bool {
        self.state() == BrokerState::Running
    }

    /// Poll until the broker is running or the timeout elapses
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<(), BusError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_connected() {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BusError::Timeout);
            }
            tokio::time::sleep(self.config.wait_poll_interval.min(remaining)).await;
        }
    }

    /// Subscribe to broker events
    pub fn subscribe_events(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    /// Shutdown signal; fires when pending retries are cancelled.
    /// Handlers may watch it to cut long-running work short.
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Bus metrics, for the host application's registry endpoint
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Broker configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Live subscription count
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Retained message count
    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    /// QoS >= 1 messages with an incomplete handshake
    pub fn inflight_count(&self) -> usize {
        self.router_ctx.dispatch.inflight.outstanding()
    }

    /// Number of subscribers with a live dispatch queue
    pub fn subscriber_count(&self) -> usize {
        self.dispatchers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::handler_fn;
    use tokio_test::assert_ok;

    fn test_config() -> Config {
        Config {
            worker_count: 2,
            retry_initial: Duration::from_millis(10),
            retry_cap: Duration::from_millis(40),
            qos1_deadline: Duration::from_millis(500),
            qos2_phase_deadline: Duration::from_millis(500),
            shutdown_drain: Duration::from_secs(2),
            wait_poll_interval: Duration::from_millis(10),
            ..Config::default()
        }
    }

    fn noop_handler() -> Arc<dyn MessageHandler> {
        handler_fn(|_| async { Ok(()) })
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let broker = Broker::new(test_config()).unwrap();
        assert_eq!(broker.state(), BrokerState::Initialized);
        assert!(!broker.is_connected());

        assert_ok!(broker.start());
        assert_eq!(broker.state(), BrokerState::Running);
        assert!(broker.is_connected());

        assert!(matches!(broker.start(), Err(BusError::AlreadyStarted)));

        broker.stop().await;
        assert_eq!(broker.state(), BrokerState::Stopped);
        assert!(!broker.is_connected());
    }

    #[tokio::test]
    async fn test_stop_without_start_settles_stopped() {
        let broker = Broker::new(test_config()).unwrap();
        broker.stop().await;
        assert_eq!(broker.state(), BrokerState::Stopped);
        assert!(matches!(broker.start(), Err(BusError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_publish_requires_running() {
        let broker = Broker::new(test_config()).unwrap();
        let err = broker
            .publish("alerts", Bytes::from_static(b"x"), QoS::AtMostOnce, false)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NotConnected));

        broker.start().unwrap();
        broker.stop().await;
        let err = broker
            .publish("alerts", Bytes::from_static(b"x"), QoS::AtMostOnce, false)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NotConnected));
    }

    #[tokio::test]
    async fn test_publish_rejects_wildcard_topics() {
        let broker = Broker::new(test_config()).unwrap();
        broker.start().unwrap();

        let err = broker
            .publish("a/+", Bytes::from_static(b"x"), QoS::AtMostOnce, false)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidTopic(_)));

        let err = broker
            .publish("a/#", Bytes::from_static(b"x"), QoS::AtMostOnce, false)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidTopic(_)));

        broker.stop().await;
    }

    #[tokio::test]
    async fn test_subscribe_grants_capped_qos() {
        let config = Config {
            max_qos: 1,
            ..test_config()
        };
        let broker = Broker::new(config).unwrap();
        broker.start().unwrap();

        let granted = broker
            .subscribe("sub-1", "alerts/#", QoS::ExactlyOnce, noop_handler())
            .unwrap();
        assert_eq!(granted, QoS::AtLeastOnce);

        broker.stop().await;
    }

    #[tokio::test]
    async fn test_subscribe_rejects_invalid_filter() {
        let broker = Broker::new(test_config()).unwrap();
        broker.start().unwrap();

        let err = broker
            .subscribe("sub-1", "a/#/b", QoS::AtMostOnce, noop_handler())
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidFilter(_)));

        broker.stop().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_reports_existence() {
        let broker = Broker::new(test_config()).unwrap();
        broker.start().unwrap();

        broker
            .subscribe("sub-1", "alerts/#", QoS::AtMostOnce, noop_handler())
            .unwrap();
        assert_eq!(broker.subscription_count(), 1);
        assert_eq!(broker.subscriber_count(), 1);

        assert!(broker.unsubscribe("sub-1", "alerts/#").unwrap());
        assert!(!broker.unsubscribe("sub-1", "alerts/#").unwrap());
        assert_eq!(broker.subscription_count(), 0);
        assert_eq!(broker.subscriber_count(), 0);

        broker.stop().await;
    }

    #[tokio::test]
    async fn test_wait_for_connection() {
        let broker = Arc::new(Broker::new(test_config()).unwrap());

        let err = broker
            .wait_for_connection(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout));

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.wait_for_connection(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        broker.start().unwrap();
        assert_ok!(waiter.await.unwrap());

        broker.stop().await;
    }

    #[tokio::test]
    async fn test_config_rejected_at_construction() {
        let config = Config {
            default_qos: 2,
            max_qos: 0,
            ..Config::default()
        };
        assert!(Broker::new(config).is_err());
    }
}
