//! Per-subscriber delivery dispatch
//!
//! Every subscriber owns a single-consumer queue drained by one task, so
//! deliveries for a (subscriber, topic) pair stay FIFO and a slow handler
//! only delays its own subscriber. The dispatch task drives the QoS
//! ladder: invoke under deadline, retry with exponential backoff, abandon
//! to the dead-letter callback after the attempt budget.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::broker::inflight::{DeliveryState, InflightTable};
use crate::broker::{BusEvent, DeadLetterFn};
use crate::message::{AbandonedDelivery, Delivery, MessageHandler, QoS};
use crate::metrics::Metrics;

/// A delivery queued for one subscriber
pub(crate) struct DeliveryJob {
    /// In-flight message id; None for QoS 0
    pub id: Option<u64>,
    pub delivery: Delivery,
    pub handler: Arc<dyn MessageHandler>,
}

/// Shared context for all dispatch tasks
pub(crate) struct DispatchCtx {
    pub qos1_deadline: Duration,
    pub qos2_phase_deadline: Duration,
    pub max_attempts: u32,
    pub retry_initial: Duration,
    pub retry_cap: Duration,
    pub inflight: Arc<InflightTable>,
    pub metrics: Arc<Metrics>,
    pub dead_letter: Option<Arc<DeadLetterFn>>,
    pub shutdown: broadcast::Sender<()>,
    pub events: broadcast::Sender<BusEvent>,
}

/// Sending half of a subscriber's dispatch queue
pub(crate) struct SubscriberHandle {
    tx: mpsc::Sender<DeliveryJob>,
}

impl SubscriberHandle {
    pub fn try_deliver(&self, job: DeliveryJob) -> Result<(), DeliveryJob> {
        self.tx.try_send(job).map_err(|e| e.into_inner())
    }
}

/// Create a subscriber's queue and spawn its dispatch task
pub(crate) fn spawn_dispatcher(
    ctx: Arc<DispatchCtx>,
    subscriber_id: Arc<str>,
    queue_capacity: usize,
) -> SubscriberHandle {
    let (tx, rx) = mpsc::channel(queue_capacity);
    tokio::spawn(dispatch_loop(ctx, subscriber_id, rx));
    SubscriberHandle { tx }
}

async fn dispatch_loop(
    ctx: Arc<DispatchCtx>,
    subscriber_id: Arc<str>,
    mut rx: mpsc::Receiver<DeliveryJob>,
) {
    let mut shutdown_rx = ctx.shutdown.subscribe();
    trace!("dispatcher for {} started", subscriber_id);

    loop {
        tokio::select! {
            biased;

            result = shutdown_rx.recv() => {
                if matches!(result, Err(broadcast::error::RecvError::Lagged(_))) {
                    continue;
                }
                // Cancel pending work: queued QoS >= 1 jobs go to the
                // dead-letter path, everything else is dropped.
                while let Ok(job) = rx.try_recv() {
                    if let Some(id) = job.id {
                        abandon(&ctx, &subscriber_id, &job, id);
                    }
                }
                break;
            }
            job = rx.recv() => {
                let Some(job) = job else { break };
                process(&ctx, &subscriber_id, job, &mut shutdown_rx).await;
            }
        }
    }

    trace!("dispatcher for {} stopped", subscriber_id);
}

async fn process(
    ctx: &Arc<DispatchCtx>,
    subscriber_id: &Arc<str>,
    job: DeliveryJob,
    shutdown_rx: &mut broadcast::Receiver<()>,
) {
    match (job.delivery.qos, job.id) {
        (QoS::AtMostOnce, _) | (_, None) => {
            // At most once: a single attempt, failures are dropped
            if deliver_attempt(ctx, &job, false, ctx.qos1_deadline).await.is_ok() {
                ctx.metrics.deliveries_total.with_label_values(&["0"]).inc();
            } else {
                debug!(
                    "dropping qos 0 delivery to {} on {}",
                    subscriber_id, job.delivery.topic
                );
            }
        }
        (QoS::AtLeastOnce, Some(id)) => {
            match run_ladder(ctx, &job, id, ctx.qos1_deadline, shutdown_rx).await {
                LadderOutcome::Delivered => {
                    ctx.inflight.record_ack(id);
                    ctx.metrics.deliveries_total.with_label_values(&["1"]).inc();
                    sync_inflight_gauge(ctx);
                }
                LadderOutcome::Exhausted | LadderOutcome::Cancelled => {
                    abandon(ctx, subscriber_id, &job, id);
                }
            }
        }
        (QoS::ExactlyOnce, Some(id)) => {
            // A duplicate of an already-accepted message must not reach
            // the handler again.
            match ctx.inflight.state(id) {
                Some(DeliveryState::Pending) | Some(DeliveryState::AwaitingRec) => {
                    match run_ladder(ctx, &job, id, ctx.qos2_phase_deadline, shutdown_rx).await {
                        LadderOutcome::Delivered => {
                            // Handler acceptance is the rec; the release
                            // and its comp complete the handshake.
                            if ctx.inflight.record_rec(id) {
                                ctx.inflight.record_comp(id);
                                ctx.metrics.deliveries_total.with_label_values(&["2"]).inc();
                            }
                            sync_inflight_gauge(ctx);
                        }
                        LadderOutcome::Exhausted | LadderOutcome::Cancelled => {
                            abandon(ctx, subscriber_id, &job, id);
                        }
                    }
                }
                Some(DeliveryState::AwaitingComp) => {
                    trace!("duplicate release for in-flight message {}", id);
                    ctx.inflight.record_comp(id);
                    sync_inflight_gauge(ctx);
                }
                _ => {
                    trace!("ignoring duplicate of completed message {}", id);
                }
            }
        }
    }
}

enum LadderOutcome {
    Delivered,
    Exhausted,
    Cancelled,
}

/// Retry ladder for QoS >= 1: exponential backoff between attempts,
/// cancelled by the shutdown signal.
async fn run_ladder(
    ctx: &Arc<DispatchCtx>,
    job: &DeliveryJob,
    id: u64,
    deadline: Duration,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> LadderOutcome {
    let mut backoff = ctx.retry_initial;

    loop {
        let attempt_no = ctx.inflight.begin_attempt(id, Instant::now() + deadline);
        if attempt_no == 0 {
            // Entry vanished (already abandoned elsewhere)
            return LadderOutcome::Cancelled;
        }

        if deliver_attempt(ctx, job, attempt_no > 1, deadline).await.is_ok() {
            return LadderOutcome::Delivered;
        }

        if attempt_no >= ctx.max_attempts {
            return LadderOutcome::Exhausted;
        }

        ctx.metrics.delivery_retries_total.inc();
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.recv() => return LadderOutcome::Cancelled,
        }
        backoff = backoff.saturating_mul(2).min(ctx.retry_cap);
    }
}

/// One handler invocation under a deadline
async fn deliver_attempt(
    ctx: &Arc<DispatchCtx>,
    job: &DeliveryJob,
    duplicate: bool,
    deadline: Duration,
) -> Result<(), ()> {
    let mut delivery = job.delivery.clone();
    delivery.duplicate = duplicate;
    let topic = delivery.topic.clone();

    match timeout(deadline, job.handler.handle(delivery)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            warn!("handler failed for {}: {}", topic, e);
            ctx.metrics.delivery_failures_total.inc();
            Err(())
        }
        Err(_) => {
            warn!("handler deadline exceeded for {}", topic);
            ctx.metrics.delivery_failures_total.inc();
            Err(())
        }
    }
}

/// Abandon a QoS >= 1 delivery: surface through metrics, the event
/// stream, and the dead-letter callback.
pub(crate) fn abandon(ctx: &Arc<DispatchCtx>, subscriber_id: &Arc<str>, job: &DeliveryJob, id: u64) {
    let Some(entry) = ctx.inflight.abandon(id) else {
        return;
    };

    warn!(
        "abandoning delivery to {} on {} after {} attempts",
        subscriber_id, job.delivery.topic, entry.attempts
    );
    ctx.metrics.deliveries_abandoned_total.inc();
    sync_inflight_gauge(ctx);
    let _ = ctx.events.send(BusEvent::DeliveryAbandoned {
        topic: job.delivery.topic.clone(),
        subscriber_id: subscriber_id.clone(),
    });

    if let Some(dead_letter) = &ctx.dead_letter {
        dead_letter(AbandonedDelivery {
            topic: job.delivery.topic.clone(),
            payload: job.delivery.payload.clone(),
            subscriber_id: subscriber_id.clone(),
            qos: job.delivery.qos,
            attempts: entry.attempts,
        });
    }
}

pub(crate) fn sync_inflight_gauge(ctx: &Arc<DispatchCtx>) {
    ctx.metrics
        .inflight_current
        .set(ctx.inflight.outstanding() as i64);
}
