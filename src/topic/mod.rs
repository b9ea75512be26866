//! Topic matching and subscription management
//!
//! Implements topic name/filter validation and the subscription index: a
//! filter trie mapping topic filters to the subscriptions registered on
//! them. The index is many-reader/one-writer; routing takes a consistent
//! snapshot of the matching subscriptions for each published topic.

mod trie;
pub mod validation;

pub use trie::FilterTrie;
pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::message::{MessageHandler, QoS};

/// A subscription entry
#[derive(Clone)]
pub struct Subscription {
    /// Owner of the subscription; also keys the dispatch queue
    pub subscriber_id: Arc<str>,
    /// The filter this subscription was registered under
    pub filter: Arc<str>,
    /// Granted QoS (requested capped at the broker maximum)
    pub qos: QoS,
    /// Handler invoked for matching deliveries
    pub handler: Arc<dyn MessageHandler>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subscriber_id", &self.subscriber_id)
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .finish()
    }
}

/// Thread-safe subscription index backed by a filter trie
pub struct SubscriptionStore {
    trie: RwLock<FilterTrie<Vec<Subscription>>>,
    /// Live subscription count per subscriber, for dispatcher cleanup
    per_subscriber: DashMap<Arc<str>, usize>,
    total: AtomicUsize,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(FilterTrie::new()),
            per_subscriber: DashMap::new(),
            total: AtomicUsize::new(0),
        }
    }

    /// Insert or replace a subscription.
    ///
    /// At most one entry exists per (subscriber, filter); the previous
    /// handler is dropped before the replacement becomes visible to
    /// `matches`. Returns true when an entry was replaced.
    pub fn subscribe(&self, subscription: Subscription) -> bool {
        let subscriber_id = subscription.subscriber_id.clone();
        let filter = subscription.filter.clone();

        let replaced = {
            let mut trie = self.trie.write();
            if let Some(subs) = trie.get_mut(&filter) {
                let before = subs.len();
                subs.retain(|s| s.subscriber_id != subscription.subscriber_id);
                let replaced = subs.len() != before;
                subs.push(subscription);
                replaced
            } else {
                trie.insert(&filter, vec![subscription]);
                false
            }
        };

        if !replaced {
            *self.per_subscriber.entry(subscriber_id).or_insert(0) += 1;
            self.total.fetch_add(1, Ordering::Relaxed);
        }
        replaced
    }

    /// Remove a subscription; returns whether an entry existed
    pub fn unsubscribe(&self, subscriber_id: &str, filter: &str) -> bool {
        let removed = {
            let mut trie = self.trie.write();
            if let Some(subs) = trie.get_mut(filter) {
                let before = subs.len();
                subs.retain(|s| s.subscriber_id.as_ref() != subscriber_id);
                let removed = subs.len() != before;
                if subs.is_empty() {
                    trie.remove(filter);
                }
                removed
            } else {
                false
            }
        };

        if removed {
            self.decrement(subscriber_id, 1);
        }
        removed
    }

    /// Remove every subscription owned by a subscriber; returns how many
    /// entries were removed
    pub fn unsubscribe_all(&self, subscriber_id: &str) -> usize {
        let mut removed = 0;
        {
            let mut trie = self.trie.write();
            trie.retain(|subs| {
                let before = subs.len();
                subs.retain(|s| s.subscriber_id.as_ref() != subscriber_id);
                removed += before - subs.len();
                !subs.is_empty()
            });
        }

        if removed > 0 {
            self.decrement(subscriber_id, removed);
        }
        removed
    }

    fn decrement(&self, subscriber_id: &str, by: usize) {
        self.total.fetch_sub(by, Ordering::Relaxed);
        if let Some(mut count) = self.per_subscriber.get_mut(subscriber_id) {
            *count = count.saturating_sub(by);
            let empty = *count == 0;
            drop(count);
            if empty {
                self.per_subscriber
                    .remove_if(subscriber_id, |_, count| *count == 0);
            }
        }
    }

    /// Snapshot of all subscriptions whose filter matches the topic.
    ///
    /// Enumeration order is the trie walk order: stable within a run for
    /// a fixed set of subscriptions.
    pub fn matches(&self, topic: &str) -> SmallVec<[Subscription; 8]> {
        let trie = self.trie.read();
        let mut result: SmallVec<[Subscription; 8]> = SmallVec::new();
        trie.matches(topic, |subs| {
            result.extend(subs.iter().cloned());
        });
        result
    }

    /// Live subscription count across all subscribers
    pub fn len(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live subscriptions owned by a subscriber
    pub fn count_for(&self, subscriber_id: &str) -> usize {
        self.per_subscriber
            .get(subscriber_id)
            .map(|c| *c)
            .unwrap_or(0)
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}
