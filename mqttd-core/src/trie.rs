//! Subscription trie
//!
//! Filters are stored level by level. Every node has a literal-child map, an
//! optional `+` child and an optional `#` child, and the subscribers whose
//! filter ends exactly at that node.
//!
//! The first level of every filter selects a root in a [`DashMap`], so
//! operations on filters with different first levels lock different shards
//! and never contend on one global lock. Each insert and remove touches a
//! single root and is atomic with respect to matching.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::protocol::packets::SubscriptionOptions;
use crate::protocol::QoS;
use crate::topics::{MULTI_LEVEL_WILDCARD, SINGLE_LEVEL_WILDCARD};

/// What a subscriber registered for one filter.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SubscriberEntry {
    pub options: SubscriptionOptions,
    pub identifier: Option<u32>,
}

impl SubscriberEntry {
    pub fn new(options: SubscriptionOptions, identifier: Option<u32>) -> Self {
        Self { options, identifier }
    }
}

/// One logical delivery target for a topic, merged across every matching filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberMatch<K> {
    pub subscriber: K,
    /// Highest QoS granted by any matching filter
    pub qos: QoS,
    pub identifiers: Vec<u32>,
    /// Set only when every matching filter asked for no-local
    pub no_local: bool,
    /// Set when any matching filter asked for retain-as-published
    pub retain_as_published: bool,
}

impl<K: Copy> SubscriberMatch<K> {
    fn new(subscriber: K, entry: &SubscriberEntry) -> Self {
        Self {
            subscriber,
            qos: entry.options.qos,
            identifiers: entry.identifier.into_iter().collect(),
            no_local: entry.options.no_local,
            retain_as_published: entry.options.retain_as_published,
        }
    }

    fn absorb(&mut self, entry: &SubscriberEntry) {
        self.qos = self.qos.max(entry.options.qos);
        self.identifiers.extend(entry.identifier);
        self.no_local &= entry.options.no_local;
        self.retain_as_published |= entry.options.retain_as_published;
    }
}

#[derive(Debug)]
struct Node<K> {
    children: HashMap<String, Node<K>>,
    plus: Option<Box<Node<K>>>,
    hash: Option<Box<Node<K>>>,
    subscribers: HashMap<K, SubscriberEntry>,
}

impl<K> Default for Node<K> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            plus: None,
            hash: None,
            subscribers: HashMap::new(),
        }
    }
}

impl<K: Copy + Eq + Hash> Node<K> {
    fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.children.is_empty() && self.plus.is_none() && self.hash.is_none()
    }

    fn insert(&mut self, levels: &[&str], subscriber: K, entry: SubscriberEntry) -> Option<SubscriberEntry> {
        let Some((head, tail)) = levels.split_first() else {
            return self.subscribers.insert(subscriber, entry);
        };
        let child: &mut Node<K> = match *head {
            SINGLE_LEVEL_WILDCARD => self.plus.get_or_insert_with(Box::default),
            MULTI_LEVEL_WILDCARD => self.hash.get_or_insert_with(Box::default),
            literal => self.children.entry(literal.to_owned()).or_default(),
        };
        child.insert(tail, subscriber, entry)
    }

    /// Removes the subscriber and prunes emptied children on the way back up.
    fn remove(&mut self, levels: &[&str], subscriber: &K) -> Option<SubscriberEntry> {
        let Some((head, tail)) = levels.split_first() else {
            return self.subscribers.remove(subscriber);
        };
        match *head {
            SINGLE_LEVEL_WILDCARD => {
                let child = self.plus.as_mut()?;
                let removed = child.remove(tail, subscriber);
                if child.is_empty() {
                    self.plus = None;
                }
                removed
            }
            MULTI_LEVEL_WILDCARD => {
                let child = self.hash.as_mut()?;
                let removed = child.remove(tail, subscriber);
                if child.is_empty() {
                    self.hash = None;
                }
                removed
            }
            literal => {
                let child = self.children.get_mut(literal)?;
                let removed = child.remove(tail, subscriber);
                if child.is_empty() {
                    self.children.remove(literal);
                }
                removed
            }
        }
    }

    fn collect(&self, levels: &[&str], out: &mut HashMap<K, SubscriberMatch<K>>) {
        // '#' matches the remaining levels, including none (the parent itself)
        if let Some(hash) = &self.hash {
            merge(&hash.subscribers, out);
        }

        let Some((head, tail)) = levels.split_first() else {
            merge(&self.subscribers, out);
            return;
        };

        if let Some(child) = self.children.get(*head) {
            child.collect(tail, out);
        }
        if let Some(plus) = &self.plus {
            plus.collect(tail, out);
        }
    }
}

fn merge<K: Copy + Eq + Hash>(subscribers: &HashMap<K, SubscriberEntry>, out: &mut HashMap<K, SubscriberMatch<K>>) {
    for (subscriber, entry) in subscribers {
        out.entry(*subscriber)
            .and_modify(|m| m.absorb(entry))
            .or_insert_with(|| SubscriberMatch::new(*subscriber, entry));
    }
}

/// Concurrent topic-filter trie keyed by an opaque subscriber handle.
#[derive(Debug)]
pub struct TopicTrie<K: Eq + Hash> {
    roots: DashMap<String, Node<K>>,
    count: AtomicUsize,
}

impl<K: Copy + Eq + Hash + Ord> Default for TopicTrie<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy + Eq + Hash + Ord> TopicTrie<K> {
    pub fn new() -> Self {
        Self {
            roots: DashMap::new(),
            count: AtomicUsize::new(0),
        }
    }

    /// Registers `subscriber` under `filter`, replacing its previous options
    /// for that filter. Returns the replaced entry, `None` for a new subscription.
    ///
    /// The filter must already be validated.
    pub fn insert(&self, filter: &str, subscriber: K, entry: SubscriberEntry) -> Option<SubscriberEntry> {
        let levels: Vec<&str> = filter.split('/').collect();
        let (first, rest) = split_root(&levels);
        let previous = self
            .roots
            .entry(first.to_owned())
            .or_default()
            .insert(rest, subscriber, entry);
        if previous.is_none() {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        previous
    }

    /// Removes exactly the (filter, subscriber) pair. Other filters of the same
    /// subscriber, and other subscribers of the same filter, are untouched.
    pub fn remove(&self, filter: &str, subscriber: &K) -> Option<SubscriberEntry> {
        let levels: Vec<&str> = filter.split('/').collect();
        let (first, rest) = split_root(&levels);

        let removed = self.roots.get_mut(first)?.remove(rest, subscriber);
        // the shard guard is released above; re-check emptiness under the lock
        self.roots.remove_if(first, |_, node| node.is_empty());

        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Every subscriber with at least one filter matching `topic`, once each,
    /// ordered by subscriber handle.
    pub fn find_matching(&self, topic: &str) -> Vec<SubscriberMatch<K>> {
        let levels: Vec<&str> = topic.split('/').collect();
        let (first, rest) = split_root(&levels);
        let mut found = HashMap::new();

        // one root guard at a time so a waiting writer cannot deadlock us
        if let Some(node) = self.roots.get(first) {
            node.collect(rest, &mut found);
        }
        if !first.starts_with('$') {
            if let Some(node) = self.roots.get(SINGLE_LEVEL_WILDCARD) {
                node.collect(rest, &mut found);
            }
            if let Some(node) = self.roots.get(MULTI_LEVEL_WILDCARD) {
                merge(&node.subscribers, &mut found);
            }
        }

        let mut matches: Vec<_> = found.into_values().collect();
        matches.sort_by_key(|m| m.subscriber);
        matches
    }

    /// Number of (filter, subscriber) pairs
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn split_root<'a, 'b>(levels: &'b [&'a str]) -> (&'a str, &'b [&'a str]) {
    match levels.split_first() {
        Some((first, rest)) => (*first, rest),
        None => ("", &[]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packets::RetainHandling;
    use std::sync::Arc;

    // ===== HELPER FUNCTIONS =====

    fn entry(qos: QoS) -> SubscriberEntry {
        SubscriberEntry::new(SubscriptionOptions::new(qos), None)
    }

    fn subscribers(trie: &TopicTrie<u32>, topic: &str) -> Vec<u32> {
        trie.find_matching(topic).iter().map(|m| m.subscriber).collect()
    }

    // ===== EXACT MATCH TESTS =====

    #[test]
    fn test_exact_subscription() {
        let trie = TopicTrie::new();
        trie.insert("sensors/temp", 1u32, entry(QoS::AtMostOnce));

        assert_eq!(subscribers(&trie, "sensors/temp"), vec![1]);
        assert!(subscribers(&trie, "sensors/humidity").is_empty());
        assert!(subscribers(&trie, "sensors").is_empty());
        assert!(subscribers(&trie, "sensors/temp/x").is_empty());
    }

    #[test]
    fn test_multiple_subscribers_same_filter() {
        let trie = TopicTrie::new();
        trie.insert("a/b", 3u32, entry(QoS::AtMostOnce));
        trie.insert("a/b", 1, entry(QoS::AtMostOnce));
        trie.insert("a/b", 2, entry(QoS::AtMostOnce));

        assert_eq!(subscribers(&trie, "a/b"), vec![1, 2, 3]);
        assert_eq!(trie.len(), 3);
    }

    // ===== WILDCARD TESTS =====

    #[test]
    fn test_hash_wildcard_subscription() {
        let trie = TopicTrie::new();
        trie.insert("sensors/#", 1u32, entry(QoS::AtMostOnce));

        assert_eq!(subscribers(&trie, "sensors"), vec![1]);
        assert_eq!(subscribers(&trie, "sensors/temperature"), vec![1]);
        assert_eq!(subscribers(&trie, "sensors/a/b"), vec![1]);
        assert_eq!(subscribers(&trie, "sensors/a/b/c/d/e/f"), vec![1]);
        assert!(subscribers(&trie, "other/x").is_empty());
    }

    #[test]
    fn test_plus_wildcard_subscription() {
        let trie = TopicTrie::new();
        trie.insert("sensors/+/humidity", 1u32, entry(QoS::AtMostOnce));

        assert_eq!(subscribers(&trie, "sensors/device1/humidity"), vec![1]);
        assert!(subscribers(&trie, "sensors/device1/room1/humidity").is_empty());
        assert!(subscribers(&trie, "sensors/device1/temp").is_empty());
    }

    #[test]
    fn test_root_wildcards() {
        let trie = TopicTrie::new();
        trie.insert("#", 1u32, entry(QoS::AtMostOnce));
        trie.insert("+", 2, entry(QoS::AtMostOnce));
        trie.insert("+/#", 3, entry(QoS::AtMostOnce));

        assert_eq!(subscribers(&trie, "sensors"), vec![1, 2, 3]);
        assert_eq!(subscribers(&trie, "sensors/temp"), vec![1, 3]);
    }

    #[test]
    fn test_dollar_topics_skip_root_wildcards() {
        let trie = TopicTrie::new();
        trie.insert("#", 1u32, entry(QoS::AtMostOnce));
        trie.insert("+/uptime", 2, entry(QoS::AtMostOnce));
        trie.insert("$SYS/#", 3, entry(QoS::AtMostOnce));

        assert_eq!(subscribers(&trie, "$SYS/uptime"), vec![3]);
        assert_eq!(subscribers(&trie, "host/uptime"), vec![1, 2]);
    }

    #[test]
    fn test_empty_levels() {
        let trie = TopicTrie::new();
        trie.insert("/+", 1u32, entry(QoS::AtMostOnce));
        trie.insert("a//b", 2, entry(QoS::AtMostOnce));

        assert_eq!(subscribers(&trie, "/x"), vec![1]);
        assert_eq!(subscribers(&trie, "a//b"), vec![2]);
        assert!(subscribers(&trie, "a/b").is_empty());
    }

    // ===== DEDUPLICATION TESTS =====

    #[test]
    fn test_duplicate_subscribers_via_wildcards() {
        let trie = TopicTrie::new();
        trie.insert("sensors/temp", 1u32, entry(QoS::AtMostOnce));
        trie.insert("sensors/+", 1, entry(QoS::ExactlyOnce));
        trie.insert("sensors/#", 1, entry(QoS::AtLeastOnce));

        let matches = trie.find_matching("sensors/temp");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].qos, QoS::ExactlyOnce);
    }

    #[test]
    fn test_subscription_identifiers_collected() {
        let trie = TopicTrie::new();
        trie.insert("a/+", 1u32, SubscriberEntry::new(SubscriptionOptions::new(QoS::AtMostOnce), Some(10)));
        trie.insert("a/#", 1, SubscriberEntry::new(SubscriptionOptions::new(QoS::AtMostOnce), Some(20)));
        trie.insert("a/b", 1, entry(QoS::AtMostOnce));

        let mut ids = trie.find_matching("a/b")[0].identifiers.clone();
        ids.sort_unstable();
        assert_eq!(ids, vec![10, 20]);
    }

    #[test]
    fn test_merged_option_flags() {
        let no_local = SubscriptionOptions {
            qos: QoS::AtMostOnce,
            no_local: true,
            retain_as_published: false,
            retain_handling: RetainHandling::SendOnSubscribe,
        };
        let keep_retain = SubscriptionOptions {
            qos: QoS::AtMostOnce,
            no_local: false,
            retain_as_published: true,
            retain_handling: RetainHandling::DoNotSend,
        };

        let trie = TopicTrie::new();
        trie.insert("x/y", 1u32, SubscriberEntry::new(no_local, None));
        assert!(trie.find_matching("x/y")[0].no_local);

        trie.insert("x/#", 1, SubscriberEntry::new(keep_retain, None));
        let merged = &trie.find_matching("x/y")[0];
        assert!(!merged.no_local);
        assert!(merged.retain_as_published);
    }

    // ===== INSERT / REMOVE TESTS =====

    #[test]
    fn test_reinsert_replaces_options() {
        let trie = TopicTrie::new();
        assert!(trie.insert("a", 1u32, entry(QoS::AtMostOnce)).is_none());
        let previous = trie.insert("a", 1, entry(QoS::AtLeastOnce));
        assert_eq!(previous, Some(entry(QoS::AtMostOnce)));
        assert_eq!(trie.len(), 1);
        assert_eq!(trie.find_matching("a")[0].qos, QoS::AtLeastOnce);
    }

    #[test]
    fn test_removal_is_exact() {
        let trie = TopicTrie::new();
        trie.insert("sensors/#", 1u32, entry(QoS::AtMostOnce));
        trie.insert("sensors/temp", 1, entry(QoS::AtMostOnce));
        trie.insert("sensors/#", 2, entry(QoS::AtMostOnce));

        assert!(trie.remove("sensors/#", &1).is_some());

        assert_eq!(subscribers(&trie, "sensors/temp"), vec![1, 2]);
        assert_eq!(subscribers(&trie, "sensors/humidity"), vec![2]);
        assert_eq!(trie.len(), 2);
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let trie = TopicTrie::new();
        trie.insert("a/b", 1u32, entry(QoS::AtMostOnce));

        assert!(trie.remove("a/c", &1).is_none());
        assert!(trie.remove("a/b", &2).is_none());
        assert!(trie.remove("z", &1).is_none());
        assert_eq!(trie.len(), 1);
    }

    #[test]
    fn test_remove_twice() {
        let trie = TopicTrie::new();
        trie.insert("a/+/c", 1u32, entry(QoS::AtMostOnce));

        assert!(trie.remove("a/+/c", &1).is_some());
        assert!(trie.remove("a/+/c", &1).is_none());
        assert!(trie.is_empty());
    }

    #[test]
    fn test_pruning_drops_empty_roots() {
        let trie = TopicTrie::new();
        trie.insert("a/b/c/d", 1u32, entry(QoS::AtMostOnce));
        trie.insert("#", 2, entry(QoS::AtMostOnce));
        trie.remove("a/b/c/d", &1);
        trie.remove("#", &2);

        assert!(trie.roots.is_empty());
    }

    // ===== CONCURRENCY TESTS =====

    #[test]
    fn test_concurrent_disjoint_inserts() {
        let trie = Arc::new(TopicTrie::new());
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let trie = Arc::clone(&trie);
                std::thread::spawn(move || {
                    for i in 0..100u32 {
                        trie.insert(&format!("t{}/{}", t, i), t * 1000 + i, entry(QoS::AtMostOnce));
                    }
                    for i in (0..100u32).step_by(2) {
                        trie.remove(&format!("t{}/{}", t, i), &(t * 1000 + i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(trie.len(), 8 * 50);
        assert_eq!(subscribers(&trie, "t3/7"), vec![3007]);
        assert!(subscribers(&trie, "t3/8").is_empty());
    }
}
