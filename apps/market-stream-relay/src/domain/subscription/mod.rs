//! Subscription Bookkeeping
//!
//! Reference-counted subscription sets keyed by anything hashable. The relay
//! keeps two independent books: one keyed by [`StreamKey`](crate::domain::stream::StreamKey)
//! for raw streams, one keyed by lowercase symbol for summaries.
//!
//! # Design
//!
//! A [`SubscriptionBook`] tracks:
//! - Which keys each subscriber holds
//! - Which subscribers hold each key
//!
//! Transitions report whether a key became active (first subscriber) or
//! inactive (last subscriber left), so the owner can start or stop the
//! upstream resource behind it. Empty sets are removed eagerly; a key is
//! present in the book iff at least one subscriber holds it.
//!
//! The book itself is plain data with no locking; the registry wraps it.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a downstream subscriber (one client session).
pub type SubscriberId = u64;

/// Result of adding a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// First subscriber for the key; the key is now active.
    Activated,
    /// Joined a key that already had subscribers.
    Joined,
    /// The subscriber already held the key.
    AlreadySubscribed,
}

/// Result of removing a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// Last subscriber left; the key is no longer active.
    Deactivated,
    /// Left a key that still has other subscribers.
    Left,
    /// The subscriber did not hold the key.
    NotSubscribed,
}

// =============================================================================
// Subscription Book
// =============================================================================

/// Bidirectional subscriber/key index.
///
/// # Example
///
/// ```rust
/// use market_stream_relay::domain::subscription::{AddOutcome, RemoveOutcome, SubscriptionBook};
///
/// let mut book: SubscriptionBook<String> = SubscriptionBook::new();
///
/// assert_eq!(book.add(1, "btcusdt".to_string()), AddOutcome::Activated);
/// assert_eq!(book.add(2, "btcusdt".to_string()), AddOutcome::Joined);
///
/// // Subscriber 1 leaves - still held by subscriber 2
/// assert_eq!(book.remove(1, &"btcusdt".to_string()), RemoveOutcome::Left);
///
/// // Subscriber 2 leaves - key is released
/// assert_eq!(book.remove(2, &"btcusdt".to_string()), RemoveOutcome::Deactivated);
/// assert!(book.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct SubscriptionBook<K> {
    /// Map from subscriber to the keys they hold.
    by_subscriber: HashMap<SubscriberId, HashSet<K>>,
    /// Map from key to the subscribers holding it.
    by_key: HashMap<K, HashSet<SubscriberId>>,
}

impl<K> Default for SubscriptionBook<K> {
    fn default() -> Self {
        Self {
            by_subscriber: HashMap::new(),
            by_key: HashMap::new(),
        }
    }
}

impl<K: Clone + Eq + Hash> SubscriptionBook<K> {
    /// Create an empty book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `key` for `subscriber`.
    pub fn add(&mut self, subscriber: SubscriberId, key: K) -> AddOutcome {
        let held = self.by_subscriber.entry(subscriber).or_default();
        if !held.insert(key.clone()) {
            return AddOutcome::AlreadySubscribed;
        }

        let subscribers = self.by_key.entry(key).or_default();
        subscribers.insert(subscriber);

        if subscribers.len() == 1 {
            AddOutcome::Activated
        } else {
            AddOutcome::Joined
        }
    }

    /// Remove `key` for `subscriber`.
    pub fn remove(&mut self, subscriber: SubscriberId, key: &K) -> RemoveOutcome {
        let Some(held) = self.by_subscriber.get_mut(&subscriber) else {
            return RemoveOutcome::NotSubscribed;
        };

        if !held.remove(key) {
            return RemoveOutcome::NotSubscribed;
        }

        if held.is_empty() {
            self.by_subscriber.remove(&subscriber);
        }

        self.detach(subscriber, key)
    }

    /// Remove every key held by `subscriber`.
    ///
    /// Returns the keys that became inactive.
    pub fn remove_subscriber(&mut self, subscriber: SubscriberId) -> Vec<K> {
        let Some(held) = self.by_subscriber.remove(&subscriber) else {
            return vec![];
        };

        held.into_iter()
            .filter(|key| self.detach(subscriber, key) == RemoveOutcome::Deactivated)
            .collect()
    }

    /// Drop `subscriber` from the key side of the index.
    fn detach(&mut self, subscriber: SubscriberId, key: &K) -> RemoveOutcome {
        let Some(subscribers) = self.by_key.get_mut(key) else {
            return RemoveOutcome::NotSubscribed;
        };

        subscribers.remove(&subscriber);

        if subscribers.is_empty() {
            self.by_key.remove(key);
            RemoveOutcome::Deactivated
        } else {
            RemoveOutcome::Left
        }
    }

    /// Keys held by a subscriber.
    #[must_use]
    pub fn keys_of(&self, subscriber: SubscriberId) -> Vec<K> {
        self.by_subscriber
            .get(&subscriber)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Subscribers holding a key.
    #[must_use]
    pub fn subscribers_of(&self, key: &K) -> Vec<SubscriberId> {
        self.by_key
            .get(key)
            .map(|subs| subs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of subscribers holding a key.
    #[must_use]
    pub fn subscriber_count(&self, key: &K) -> usize {
        self.by_key.get(key).map_or(0, HashSet::len)
    }

    /// Whether `subscriber` holds `key`.
    #[must_use]
    pub fn contains(&self, subscriber: SubscriberId, key: &K) -> bool {
        self.by_subscriber
            .get(&subscriber)
            .is_some_and(|keys| keys.contains(key))
    }

    /// Whether `subscriber` holds any key in this book.
    #[must_use]
    pub fn is_subscribed_anywhere(&self, subscriber: SubscriberId) -> bool {
        self.by_subscriber.contains_key(&subscriber)
    }

    /// All keys with at least one subscriber.
    #[must_use]
    pub fn active_keys(&self) -> Vec<K> {
        self.by_key.keys().cloned().collect()
    }

    /// Whether the book holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Current counts.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            key_count: self.by_key.len(),
            subscriber_count: self.by_subscriber.len(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics for one book.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SubscriptionStats {
    /// Number of active keys.
    pub key_count: usize,
    /// Number of subscribers holding at least one key.
    pub subscriber_count: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> SubscriptionBook<String> {
        SubscriptionBook::new()
    }

    fn key(s: &str) -> String {
        s.to_string()
    }

    #[test]
    fn add_new_key_activates() {
        let mut book = book();

        assert_eq!(book.add(1, key("btcusdt")), AddOutcome::Activated);
        assert_eq!(book.subscriber_count(&key("btcusdt")), 1);
    }

    #[test]
    fn add_existing_key_joins() {
        let mut book = book();

        book.add(1, key("btcusdt"));

        assert_eq!(book.add(2, key("btcusdt")), AddOutcome::Joined);
        assert_eq!(book.subscriber_count(&key("btcusdt")), 2);
    }

    #[test]
    fn add_duplicate_is_idempotent() {
        let mut book = book();

        book.add(1, key("btcusdt"));

        assert_eq!(book.add(1, key("btcusdt")), AddOutcome::AlreadySubscribed);
        assert_eq!(book.subscriber_count(&key("btcusdt")), 1);
    }

    #[test]
    fn remove_with_remaining_subscribers_leaves() {
        let mut book = book();

        book.add(1, key("btcusdt"));
        book.add(2, key("btcusdt"));

        assert_eq!(book.remove(1, &key("btcusdt")), RemoveOutcome::Left);
        assert_eq!(book.subscribers_of(&key("btcusdt")), vec![2]);
    }

    #[test]
    fn remove_last_subscriber_deactivates() {
        let mut book = book();

        book.add(1, key("btcusdt"));

        assert_eq!(book.remove(1, &key("btcusdt")), RemoveOutcome::Deactivated);
        assert!(book.is_empty());
        assert!(!book.is_subscribed_anywhere(1));
    }

    #[test]
    fn remove_unknown_is_noop() {
        let mut book = book();

        book.add(1, key("btcusdt"));

        assert_eq!(book.remove(2, &key("btcusdt")), RemoveOutcome::NotSubscribed);
        assert_eq!(book.remove(1, &key("ethusdt")), RemoveOutcome::NotSubscribed);
        assert_eq!(book.subscriber_count(&key("btcusdt")), 1);
    }

    #[test]
    fn remove_subscriber_reports_deactivated_keys() {
        let mut book = book();

        book.add(1, key("btcusdt"));
        book.add(1, key("ethusdt"));
        book.add(2, key("btcusdt"));

        let released = book.remove_subscriber(1);

        assert_eq!(released, vec![key("ethusdt")]);
        assert_eq!(book.active_keys(), vec![key("btcusdt")]);
        assert!(book.keys_of(1).is_empty());
    }

    #[test]
    fn remove_subscriber_twice_is_noop() {
        let mut book = book();

        book.add(1, key("btcusdt"));

        assert_eq!(book.remove_subscriber(1).len(), 1);
        assert!(book.remove_subscriber(1).is_empty());
    }

    #[test]
    fn contains_tracks_membership() {
        let mut book = book();

        book.add(1, key("btcusdt"));

        assert!(book.contains(1, &key("btcusdt")));
        assert!(!book.contains(1, &key("ethusdt")));
        assert!(!book.contains(2, &key("btcusdt")));
    }

    #[test]
    fn keys_of_returns_held_keys() {
        let mut book = book();

        book.add(1, key("btcusdt"));
        book.add(1, key("ethusdt"));
        book.add(2, key("solusdt"));

        let mut keys = book.keys_of(1);
        keys.sort();

        assert_eq!(keys, vec![key("btcusdt"), key("ethusdt")]);
        assert_eq!(book.keys_of(2), vec![key("solusdt")]);
        assert!(book.keys_of(999).is_empty());
    }

    #[test]
    fn stats_are_accurate() {
        let mut book = book();

        book.add(1, key("btcusdt"));
        book.add(1, key("ethusdt"));
        book.add(2, key("btcusdt"));

        assert_eq!(
            book.stats(),
            SubscriptionStats {
                key_count: 2,
                subscriber_count: 2,
            }
        );
    }

    #[test]
    fn thread_safety_concurrent_subscriptions() {
        use std::sync::Arc;
        use std::thread;

        use parking_lot::RwLock;

        let book = Arc::new(RwLock::new(book()));
        let mut handles = vec![];

        for i in 0..10u64 {
            let b = Arc::clone(&book);
            handles.push(thread::spawn(move || {
                let mut guard = b.write();
                guard.add(i, format!("sym{i}"));
                guard.add(i, key("shared"));
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = book.read().stats();
        assert_eq!(stats.subscriber_count, 10);
        // 10 unique symbols + 1 shared
        assert_eq!(stats.key_count, 11);
    }

    #[test]
    fn thread_safety_concurrent_disconnects() {
        use std::sync::Arc;
        use std::thread;

        use parking_lot::RwLock;

        let book = Arc::new(RwLock::new(book()));

        for i in 0..10u64 {
            book.write().add(i, key("shared"));
        }

        let mut handles = vec![];

        for i in 0..10u64 {
            let b = Arc::clone(&book);
            handles.push(thread::spawn(move || b.write().remove_subscriber(i)));
        }

        let released: usize = handles.into_iter().map(|h| h.join().unwrap().len()).sum();

        // Exactly one disconnect observes the shared key going idle
        assert_eq!(released, 1);
        assert!(book.read().is_empty());
    }
}
