//! AxiomQ - embedded MQTT-style message bus for the Axiom console backend
//!
//! An in-process pub/sub broker with MQTT topic semantics: wildcard
//! subscription filters, retained messages, and QoS 0/1/2 delivery
//! tiers. Producers and consumers live in the same process; there is no
//! network wire format.

pub mod broker;
pub mod bus;
pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod retained;
pub mod topic;

pub use broker::{Broker, BrokerState, BusEvent, DeadLetterFn};
pub use bus::{Bus, BusClient};
pub use config::{BackPressure, Config, ConfigError};
pub use error::{BusError, HandlerError, HandlerResult};
pub use message::{handler_fn, AbandonedDelivery, Delivery, Message, MessageHandler, QoS};
pub use metrics::Metrics;
pub use retained::{RetainedMessage, RetainedStore};
pub use topic::{topic_matches_filter, Subscription, SubscriptionStore};
