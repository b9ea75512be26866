//! Prometheus metrics for the bus
//!
//! The broker updates these counters and gauges on the hot path; the
//! embedding application owns the `Registry` and serves it however it
//! likes (the Axiom console exposes it through its existing metrics
//! endpoint).

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// All bus metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Publish metrics
    pub messages_published_total: IntCounter,

    // Delivery metrics
    pub deliveries_total: IntCounterVec,
    pub delivery_failures_total: IntCounter,
    pub delivery_retries_total: IntCounter,
    pub deliveries_abandoned_total: IntCounter,

    // Queue metrics
    pub queue_dropped_total: IntCounterVec,

    // In-flight QoS 1/2 handshakes
    pub inflight_current: IntGauge,

    // Subscription metrics
    pub subscriptions_current: IntGauge,

    // Retained messages
    pub retained_current: IntGauge,
    pub retained_bytes_current: IntGauge,
    pub retained_dropped_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_published_total = IntCounter::with_opts(Opts::new(
            "axiomq_messages_published_total",
            "Total messages accepted by publish since startup",
        ))
        .unwrap();

        let deliveries_total = IntCounterVec::new(
            Opts::new(
                "axiomq_deliveries_total",
                "Total successful handler deliveries by effective QoS",
            ),
            &["qos"],
        )
        .unwrap();

        let delivery_failures_total = IntCounter::with_opts(Opts::new(
            "axiomq_delivery_failures_total",
            "Total handler invocations that errored or timed out",
        ))
        .unwrap();

        let delivery_retries_total = IntCounter::with_opts(Opts::new(
            "axiomq_delivery_retries_total",
            "Total QoS >= 1 redelivery attempts",
        ))
        .unwrap();

        let deliveries_abandoned_total = IntCounter::with_opts(Opts::new(
            "axiomq_deliveries_abandoned_total",
            "Total deliveries abandoned after exhausting retries",
        ))
        .unwrap();

        let queue_dropped_total = IntCounterVec::new(
            Opts::new(
                "axiomq_queue_dropped_total",
                "Total messages dropped due to queue overflow, by queue",
            ),
            &["queue"],
        )
        .unwrap();

        let inflight_current = IntGauge::with_opts(Opts::new(
            "axiomq_inflight_current",
            "Current QoS >= 1 messages with an incomplete handshake",
        ))
        .unwrap();

        let subscriptions_current = IntGauge::with_opts(Opts::new(
            "axiomq_subscriptions_current",
            "Current number of live subscriptions",
        ))
        .unwrap();

        let retained_current = IntGauge::with_opts(Opts::new(
            "axiomq_retained_current",
            "Current number of retained messages",
        ))
        .unwrap();

        let retained_bytes_current = IntGauge::with_opts(Opts::new(
            "axiomq_retained_bytes_current",
            "Total payload bytes currently retained",
        ))
        .unwrap();

        let retained_dropped_total = IntCounter::with_opts(Opts::new(
            "axiomq_retained_dropped_total",
            "Total retained payloads rejected for exceeding the size limit",
        ))
        .unwrap();

        registry
            .register(Box::new(messages_published_total.clone()))
            .unwrap();
        registry.register(Box::new(deliveries_total.clone())).unwrap();
        registry
            .register(Box::new(delivery_failures_total.clone()))
            .unwrap();
        registry
            .register(Box::new(delivery_retries_total.clone()))
            .unwrap();
        registry
            .register(Box::new(deliveries_abandoned_total.clone()))
            .unwrap();
        registry.register(Box::new(queue_dropped_total.clone())).unwrap();
        registry.register(Box::new(inflight_current.clone())).unwrap();
        registry
            .register(Box::new(subscriptions_current.clone()))
            .unwrap();
        registry.register(Box::new(retained_current.clone())).unwrap();
        registry
            .register(Box::new(retained_bytes_current.clone()))
            .unwrap();
        registry
            .register(Box::new(retained_dropped_total.clone()))
            .unwrap();

        Self {
            registry,
            messages_published_total,
            deliveries_total,
            delivery_failures_total,
            delivery_retries_total,
            deliveries_abandoned_total,
            queue_dropped_total,
            inflight_current,
            subscriptions_current,
            retained_current,
            retained_bytes_current,
            retained_dropped_total,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_gather() {
        let metrics = Metrics::new();
        metrics.messages_published_total.inc();
        metrics.deliveries_total.with_label_values(&["1"]).inc();
        metrics.inflight_current.set(3);

        let families = metrics.registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "axiomq_messages_published_total"));
        assert!(families
            .iter()
            .any(|f| f.get_name() == "axiomq_inflight_current"));
    }
}
