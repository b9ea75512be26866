//! In-flight QoS 1/2 delivery tracking
//!
//! Every QoS >= 1 delivery gets a broker-unique message id and an entry
//! in a sharded table. The dispatcher drives each entry through an
//! explicit state machine keyed by `next_deadline`; ids are recycled once
//! a handshake reaches a terminal state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::message::QoS;

/// Delivery handshake states for a QoS >= 1 message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Queued, no attempt made yet
    Pending,
    /// QoS 1: delivered, waiting for handler acknowledgement
    AwaitingAck,
    /// QoS 2: delivered, waiting for handler acceptance
    AwaitingRec,
    /// QoS 2: accepted, release issued
    AwaitingComp,
    /// Handshake finished
    Complete,
    /// Given up after exhausting retries
    Abandoned,
}

/// A QoS >= 1 message whose handshake has not completed
#[derive(Debug, Clone)]
pub struct InflightMessage {
    pub id: u64,
    pub topic: Arc<str>,
    pub subscriber_id: Arc<str>,
    pub qos: QoS,
    pub state: DeliveryState,
    pub attempts: u32,
    pub next_deadline: Instant,
}

/// Message id allocator. Ids are positive and recycled once their
/// handshake reaches a terminal state.
struct IdAllocator {
    inner: Mutex<IdInner>,
}

struct IdInner {
    next: u64,
    free: Vec<u64>,
}

impl IdAllocator {
    fn new() -> Self {
        Self {
            inner: Mutex::new(IdInner {
                next: 1,
                free: Vec::new(),
            }),
        }
    }

    fn acquire(&self) -> u64 {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.free.pop() {
            id
        } else {
            let id = inner.next;
            inner.next += 1;
            id
        }
    }

    fn release(&self, id: u64) {
        self.inner.lock().free.push(id);
    }
}

/// Sharded in-flight table
///
/// Shard selection is `id % shard_count`, which spreads contention across
/// dispatcher workers.
pub struct InflightTable {
    shards: Vec<Mutex<AHashMap<u64, InflightMessage>>>,
    ids: IdAllocator,
    outstanding: AtomicUsize,
}

impl InflightTable {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(AHashMap::new())).collect(),
            ids: IdAllocator::new(),
            outstanding: AtomicUsize::new(0),
        }
    }

    fn shard(&self, id: u64) -> &Mutex<AHashMap<u64, InflightMessage>> {
        &self.shards[(id % self.shards.len() as u64) as usize]
    }

    /// Register a new QoS >= 1 delivery; returns its message id
    pub fn insert(
        &self,
        topic: Arc<str>,
        subscriber_id: Arc<str>,
        qos: QoS,
        deadline: Instant,
    ) -> u64 {
        let id = self.ids.acquire();
        self.shard(id).lock().insert(
            id,
            InflightMessage {
                id,
                topic,
                subscriber_id,
                qos,
                state: DeliveryState::Pending,
                attempts: 0,
                next_deadline: deadline,
            },
        );
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Record a delivery attempt: bumps the attempt counter, arms the
    /// deadline, and moves Pending to the awaiting state for its QoS.
    /// Returns the attempt number.
    pub fn begin_attempt(&self, id: u64, deadline: Instant) -> u32 {
        let mut shard = self.shard(id).lock();
        match shard.get_mut(&id) {
            Some(entry) => {
                entry.attempts += 1;
                entry.next_deadline = deadline;
                if matches!(entry.state, DeliveryState::Pending) {
                    entry.state = match entry.qos {
                        QoS::ExactlyOnce => DeliveryState::AwaitingRec,
                        _ => DeliveryState::AwaitingAck,
                    };
                }
                entry.attempts
            }
            None => 0,
        }
    }

    /// Current state of an entry, if still tracked
    pub fn state(&self, id: u64) -> Option<DeliveryState> {
        self.shard(id).lock().get(&id).map(|entry| entry.state)
    }

    /// QoS 1 acknowledgement: completes the handshake and recycles the
    /// id. Returns false if the entry was already gone.
    pub fn record_ack(&self, id: u64) -> bool {
        let removed = self.shard(id).lock().remove(&id).is_some();
        if removed {
            self.finish(id);
        }
        removed
    }

    /// QoS 2 acceptance: AwaitingRec -> AwaitingComp. Returns true only
    /// for the transition; a duplicate acceptance is a no-op.
    pub fn record_rec(&self, id: u64) -> bool {
        let mut shard = self.shard(id).lock();
        match shard.get_mut(&id) {
            Some(entry) if entry.state == DeliveryState::AwaitingRec => {
                entry.state = DeliveryState::AwaitingComp;
                true
            }
            _ => false,
        }
    }

    /// QoS 2 completion: AwaitingComp -> Complete, recycles the id
    pub fn record_comp(&self, id: u64) -> bool {
        let removed = {
            let mut shard = self.shard(id).lock();
            match shard.get(&id) {
                Some(entry) if entry.state == DeliveryState::AwaitingComp => {
                    shard.remove(&id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.finish(id);
        }
        removed
    }

    /// Give up on a delivery; returns the entry for dead-letter handling
    pub fn abandon(&self, id: u64) -> Option<InflightMessage> {
        let entry = self.shard(id).lock().remove(&id);
        if let Some(mut entry) = entry {
            entry.state = DeliveryState::Abandoned;
            self.finish(id);
            Some(entry)
        } else {
            None
        }
    }

    fn finish(&self, id: u64) {
        self.ids.release(id);
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    /// Number of messages with an incomplete handshake
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}
