//! Message Router
//!
//! Accepts published messages onto a bounded queue and fans them out to
//! the per-subscriber dispatch queues. The queue is sharded by topic
//! hash, so all publishes to one topic flow through one worker and reach
//! each subscriber's queue in publish order.

use std::hash::BuildHasher;
use std::sync::Arc;
use std::time::Instant;

use ahash::RandomState;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use crate::broker::dispatch::{DeliveryJob, DispatchCtx, SubscriberHandle};
use crate::config::BackPressure;
use crate::error::BusError;
use crate::message::{Delivery, Message, QoS};
use crate::topic::SubscriptionStore;

/// A message accepted for routing
pub(crate) struct RouteJob {
    pub message: Message,
}

/// Shared state for router workers
pub(crate) struct RouterCtx {
    pub subscriptions: Arc<SubscriptionStore>,
    pub dispatchers: Arc<DashMap<Arc<str>, SubscriberHandle>>,
    pub dispatch: Arc<DispatchCtx>,
}

/// Sending side of the sharded route queue
pub(crate) struct RouteQueue {
    shards: Vec<mpsc::Sender<RouteJob>>,
    hasher: RandomState,
}

impl RouteQueue {
    /// Build the queue, returning the receivers for the router workers
    pub fn new(worker_count: usize, shard_capacity: usize) -> (Self, Vec<mpsc::Receiver<RouteJob>>) {
        let mut shards = Vec::with_capacity(worker_count);
        let mut receivers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let (tx, rx) = mpsc::channel(shard_capacity);
            shards.push(tx);
            receivers.push(rx);
        }
        (
            Self {
                shards,
                hasher: RandomState::new(),
            },
            receivers,
        )
    }

    /// Enqueue a message for routing, honouring the back-pressure policy
    pub async fn enqueue(
        &self,
        message: Message,
        back_pressure: BackPressure,
        enqueue_timeout: std::time::Duration,
    ) -> Result<(), BusError> {
        let shard = (self.hasher.hash_one(message.topic.as_ref()) % self.shards.len() as u64) as usize;
        let job = RouteJob { message };

        match back_pressure {
            BackPressure::DropAndError => self.shards[shard].try_send(job).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => BusError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => BusError::NotConnected,
            }),
            BackPressure::BlockWithTimeout => {
                match tokio::time::timeout(enqueue_timeout, self.shards[shard].send(job)).await {
                    Err(_) => Err(BusError::Timeout),
                    Ok(Err(_)) => Err(BusError::NotConnected),
                    Ok(Ok(())) => Ok(()),
                }
            }
        }
    }
}

/// Router worker: drain one route queue shard until shutdown
pub(crate) async fn route_worker(
    ctx: Arc<RouterCtx>,
    mut rx: mpsc::Receiver<RouteJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            result = shutdown_rx.recv() => {
                if matches!(result, Err(broadcast::error::RecvError::Lagged(_))) {
                    continue;
                }
                break;
            }
            job = rx.recv() => {
                let Some(job) = job else { break };
                route(&ctx, job.message);
            }
        }
    }
    trace!("router worker stopped");
}

/// Fan a message out to every matching subscription
fn route(ctx: &Arc<RouterCtx>, message: Message) {
    let matches = ctx.subscriptions.matches(&message.topic);
    trace!("routing {} to {} subscriptions", message.topic, matches.len());

    for sub in matches {
        let effective_qos = message.qos.min(sub.qos);
        deliver_to_subscriber(
            ctx,
            Delivery {
                topic: message.topic.clone(),
                payload: message.payload.clone(),
                qos: effective_qos,
                retained: false,
                duplicate: false,
            },
            sub.subscriber_id,
            sub.handler,
        );
    }
}

/// Enqueue one delivery onto a subscriber's dispatch queue.
///
/// Shared by the routing fan-out and the retained-message materialisation
/// on subscribe. A full subscriber queue drops the delivery rather than
/// stalling other subscribers; QoS >= 1 drops go to the dead-letter path.
pub(crate) fn deliver_to_subscriber(
    ctx: &Arc<RouterCtx>,
    delivery: Delivery,
    subscriber_id: Arc<str>,
    handler: Arc<dyn crate::message::MessageHandler>,
) {
    let Some(handle) = ctx.dispatchers.get(&subscriber_id) else {
        // Subscriber disconnected between the index snapshot and now
        return;
    };

    let id = if delivery.qos > QoS::AtMostOnce {
        let id = ctx.dispatch.inflight.insert(
            delivery.topic.clone(),
            subscriber_id.clone(),
            delivery.qos,
            Instant::now() + ctx.dispatch.qos1_deadline,
        );
        crate::broker::dispatch::sync_inflight_gauge(&ctx.dispatch);
        Some(id)
    } else {
        None
    };

    let job = DeliveryJob {
        id,
        delivery,
        handler,
    };

    if let Err(job) = handle.try_deliver(job) {
        debug!("subscriber queue full, dropping delivery to {}", subscriber_id);
        ctx.dispatch
            .metrics
            .queue_dropped_total
            .with_label_values(&["subscriber"])
            .inc();
        if let Some(id) = job.id {
            crate::broker::dispatch::abandon(&ctx.dispatch, &subscriber_id, &job, id);
        }
    }
}
