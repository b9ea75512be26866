//! Core message types shared across the bus

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::HandlerResult;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Returns the minimum of two QoS levels (effective delivery QoS)
    pub fn min(self, other: Self) -> Self {
        if (self as u8) < (other as u8) {
            self
        } else {
            other
        }
    }
}

/// A published message as accepted by the router
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// What a subscriber's handler receives
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The topic the message was published to (never a filter)
    pub topic: Arc<str>,
    pub payload: Bytes,
    /// Effective QoS: min(publisher QoS, granted subscription QoS)
    pub qos: QoS,
    /// True when this delivery materialised from the retained store
    pub retained: bool,
    /// True on QoS >= 1 redelivery attempts
    pub duplicate: bool,
}

/// A message whose delivery was abandoned after exhausting retries.
///
/// Passed to the dead-letter callback; never surfaced through the
/// publish return value.
#[derive(Debug, Clone)]
pub struct AbandonedDelivery {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub subscriber_id: Arc<str>,
    pub qos: QoS,
    pub attempts: u32,
}

/// Subscriber message handler
///
/// Handlers run on per-subscriber dispatch tasks. A slow handler delays
/// only its own subscriber's queue. For QoS >= 1, returning an error (or
/// exceeding the per-message deadline) triggers redelivery, so handlers
/// must be idempotent.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery) -> HandlerResult;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) -> HandlerResult {
        (self.0)(delivery).await
    }
}

/// Wrap an async closure as a [`MessageHandler`]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_from_u8() {
        assert_eq!(QoS::from_u8(0), Some(QoS::AtMostOnce));
        assert_eq!(QoS::from_u8(1), Some(QoS::AtLeastOnce));
        assert_eq!(QoS::from_u8(2), Some(QoS::ExactlyOnce));
        assert_eq!(QoS::from_u8(3), None);
    }

    #[test]
    fn test_qos_min() {
        assert_eq!(QoS::ExactlyOnce.min(QoS::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(QoS::AtMostOnce.min(QoS::ExactlyOnce), QoS::AtMostOnce);
        assert_eq!(QoS::AtLeastOnce.min(QoS::AtLeastOnce), QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_handler_fn() {
        let handler = handler_fn(|delivery: Delivery| async move {
            if delivery.payload.is_empty() {
                Err("empty payload".into())
            } else {
                Ok(())
            }
        });

        let ok = handler
            .handle(Delivery {
                topic: "a/b".into(),
                payload: Bytes::from_static(b"x"),
                qos: QoS::AtMostOnce,
                retained: false,
                duplicate: false,
            })
            .await;
        assert!(ok.is_ok());

        let err = handler
            .handle(Delivery {
                topic: "a/b".into(),
                payload: Bytes::new(),
                qos: QoS::AtMostOnce,
                retained: false,
                duplicate: false,
            })
            .await;
        assert!(err.is_err());
    }
}
