//! Retained message store
//!
//! Keeps the last retained payload per exact topic. Entries are delivered
//! to new subscribers whose filter matches, and deleted by a retained
//! publish with an empty payload. The store is in-memory only; retained
//! state does not survive a broker restart.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;

use crate::message::QoS;
use crate::topic::topic_matches_filter;

/// A retained message
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub stored_at: Instant,
}

/// Outcome of a store operation, for logging and gauge updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainedUpdate {
    /// Entry created or overwritten
    Stored,
    /// Entry deleted by an empty payload
    Removed,
    /// Empty payload for a topic with no entry
    Unchanged,
}

/// Thread-safe retained message store
pub struct RetainedStore {
    entries: DashMap<Arc<str>, RetainedMessage>,
    payload_bytes: AtomicUsize,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            payload_bytes: AtomicUsize::new(0),
        }
    }

    /// Store a retained message; an empty payload deletes the entry
    pub fn store(&self, topic: Arc<str>, payload: Bytes, qos: QoS) -> RetainedUpdate {
        if payload.is_empty() {
            return match self.entries.remove(&topic) {
                Some((_, old)) => {
                    self.payload_bytes.fetch_sub(old.payload.len(), Ordering::Relaxed);
                    RetainedUpdate::Removed
                }
                None => RetainedUpdate::Unchanged,
            };
        }

        self.payload_bytes.fetch_add(payload.len(), Ordering::Relaxed);
        let replaced = self.entries.insert(
            topic.clone(),
            RetainedMessage {
                topic,
                payload,
                qos,
                stored_at: Instant::now(),
            },
        );
        if let Some(old) = replaced {
            self.payload_bytes.fetch_sub(old.payload.len(), Ordering::Relaxed);
        }
        RetainedUpdate::Stored
    }

    /// Snapshot of every retained message whose topic matches the filter
    pub fn matching(&self, filter: &str) -> Vec<RetainedMessage> {
        self.entries
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total payload bytes currently retained
    pub fn payload_bytes(&self) -> usize {
        self.payload_bytes.load(Ordering::Relaxed)
    }
}

impl Default for RetainedStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_str(store: &RetainedStore, topic: &str, payload: &str, qos: QoS) -> RetainedUpdate {
        store.store(topic.into(), Bytes::copy_from_slice(payload.as_bytes()), qos)
    }

    #[test]
    fn test_store_and_match() {
        let store = RetainedStore::new();
        assert_eq!(
            store_str(&store, "status/main", "online", QoS::AtLeastOnce),
            RetainedUpdate::Stored
        );

        let matches = store.matching("status/#");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].payload.as_ref(), b"online");
        assert_eq!(matches[0].qos, QoS::AtLeastOnce);

        assert!(store.matching("metrics/#").is_empty());
    }

    #[test]
    fn test_one_entry_per_topic() {
        let store = RetainedStore::new();
        store_str(&store, "status/main", "online", QoS::AtMostOnce);
        store_str(&store, "status/main", "degraded", QoS::AtMostOnce);

        let matches = store.matching("status/main");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].payload.as_ref(), b"degraded");
        assert_eq!(store.len(), 1);
        assert_eq!(store.payload_bytes(), "degraded".len());
    }

    #[test]
    fn test_empty_payload_deletes() {
        let store = RetainedStore::new();
        store_str(&store, "status/main", "online", QoS::AtMostOnce);

        assert_eq!(
            store_str(&store, "status/main", "", QoS::AtMostOnce),
            RetainedUpdate::Removed
        );
        assert!(store.matching("status/#").is_empty());
        assert_eq!(store.payload_bytes(), 0);

        // Deleting an absent topic is a no-op
        assert_eq!(
            store_str(&store, "status/main", "", QoS::AtMostOnce),
            RetainedUpdate::Unchanged
        );
    }

    #[test]
    fn test_matching_is_exact_per_topic() {
        let store = RetainedStore::new();
        store_str(&store, "sensors/room1/temp", "21", QoS::AtMostOnce);
        store_str(&store, "sensors/room2/temp", "24", QoS::AtMostOnce);
        store_str(&store, "sensors/room1/humidity", "40", QoS::AtMostOnce);

        assert_eq!(store.matching("sensors/+/temp").len(), 2);
        assert_eq!(store.matching("sensors/room1/#").len(), 2);
        assert_eq!(store.matching("sensors/room1/temp").len(), 1);
    }
}
