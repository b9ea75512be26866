//! Filter trie for subscription matching
//!
//! A prefix tree keyed by topic level. Wildcard filters occupy dedicated
//! slots per node: a `+` child and a `#` terminal value, so matching a
//! published topic walks at most one extra branch per level.

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

#[derive(Debug)]
struct TrieNode<V> {
    /// Value for a filter ending at this node
    value: Option<V>,
    /// Children keyed by literal topic level
    children: AHashMap<CompactString, TrieNode<V>>,
    /// Child for the single-level wildcard (+)
    plus: Option<Box<TrieNode<V>>>,
    /// Value for a multi-level wildcard (#) terminating here
    hash: Option<V>,
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        Self {
            value: None,
            children: AHashMap::with_capacity(4),
            plus: None,
            hash: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.value.is_none() && self.hash.is_none() && self.plus.is_none() && self.children.is_empty()
    }
}

impl<V> Default for TrieNode<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Filter trie mapping topic filters to values
#[derive(Debug)]
pub struct FilterTrie<V> {
    root: TrieNode<V>,
}

impl<V> FilterTrie<V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
        }
    }

    /// Insert a filter with its value, replacing any existing value for
    /// the same filter
    pub fn insert(&mut self, filter: &str, value: V) {
        let mut node = &mut self.root;
        for level in filter.split('/') {
            match level {
                "#" => {
                    node.hash = Some(value);
                    return;
                }
                "+" => {
                    node = node.plus.get_or_insert_with(|| Box::new(TrieNode::new()));
                }
                _ => {
                    node = node.children.entry(CompactString::new(level)).or_default();
                }
            }
        }
        node.value = Some(value);
    }

    /// Get a mutable reference to the value at a filter, if present
    pub fn get_mut(&mut self, filter: &str) -> Option<&mut V> {
        let mut node = &mut self.root;
        for level in filter.split('/') {
            match level {
                "#" => return node.hash.as_mut(),
                "+" => node = node.plus.as_mut()?,
                _ => node = node.children.get_mut(level)?,
            }
        }
        node.value.as_mut()
    }

    /// Remove a filter and return its value. Empty interior nodes are
    /// pruned on the way back up.
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::remove_at(&mut self.root, &levels)
    }

    fn remove_at(node: &mut TrieNode<V>, levels: &[&str]) -> Option<V> {
        let Some((level, rest)) = levels.split_first() else {
            return node.value.take();
        };

        match *level {
            "#" => node.hash.take(),
            "+" => {
                let child = node.plus.as_mut()?;
                let removed = Self::remove_at(child, rest);
                if child.is_empty() {
                    node.plus = None;
                }
                removed
            }
            _ => {
                let child = node.children.get_mut(*level)?;
                let removed = Self::remove_at(child, rest);
                if child.is_empty() {
                    node.children.remove(*level);
                }
                removed
            }
        }
    }

    /// Remove every value for which the predicate returns true
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&mut V) -> bool,
    {
        Self::retain_at(&mut self.root, &mut keep);
    }

    fn retain_at<F>(node: &mut TrieNode<V>, keep: &mut F)
    where
        F: FnMut(&mut V) -> bool,
    {
        if let Some(v) = node.value.as_mut() {
            if !keep(v) {
                node.value = None;
            }
        }
        if let Some(v) = node.hash.as_mut() {
            if !keep(v) {
                node.hash = None;
            }
        }
        if let Some(child) = node.plus.as_mut() {
            Self::retain_at(child, keep);
            if child.is_empty() {
                node.plus = None;
            }
        }
        node.children.retain(|_, child| {
            Self::retain_at(child, keep);
            !child.is_empty()
        });
    }

    /// Visit every stored value
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&V),
    {
        Self::for_each_at(&self.root, &mut f);
    }

    fn for_each_at<F>(node: &TrieNode<V>, f: &mut F)
    where
        F: FnMut(&V),
    {
        if let Some(v) = node.value.as_ref() {
            f(v);
        }
        if let Some(v) = node.hash.as_ref() {
            f(v);
        }
        if let Some(child) = node.plus.as_ref() {
            Self::for_each_at(child, f);
        }
        for child in node.children.values() {
            Self::for_each_at(child, f);
        }
    }

    /// Invoke the callback for every filter value matching a topic name.
    ///
    /// Topics starting with `$` do not match `+` or `#` at the root.
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        let system = topic.starts_with('$');
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::matches_at(&self.root, &levels, 0, system, &mut callback);
    }

    fn matches_at<F>(node: &TrieNode<V>, levels: &[&str], depth: usize, system: bool, callback: &mut F)
    where
        F: FnMut(&V),
    {
        let wildcard_allowed = !(system && depth == 0);

        // # matches the remaining suffix, including the empty one
        if wildcard_allowed {
            if let Some(v) = node.hash.as_ref() {
                callback(v);
            }
        }

        let Some(level) = levels.get(depth) else {
            if let Some(v) = node.value.as_ref() {
                callback(v);
            }
            return;
        };

        if wildcard_allowed {
            if let Some(child) = node.plus.as_ref() {
                Self::matches_at(child, levels, depth + 1, system, callback);
            }
        }

        if let Some(child) = node.children.get(*level) {
            Self::matches_at(child, levels, depth + 1, system, callback);
        }
    }
}

impl<V> Default for FilterTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(trie: &FilterTrie<u32>, topic: &str) -> Vec<u32> {
        let mut out = Vec::new();
        trie.matches(topic, |v| out.push(*v));
        out.sort_unstable();
        out
    }

    #[test]
    fn test_exact_match() {
        let mut trie = FilterTrie::new();
        trie.insert("alerts/high", 1);

        assert_eq!(collect(&trie, "alerts/high"), vec![1]);
        assert!(collect(&trie, "alerts/low").is_empty());
        assert!(collect(&trie, "alerts").is_empty());
    }

    #[test]
    fn test_plus_wildcard() {
        let mut trie = FilterTrie::new();
        trie.insert("alerts/+", 1);
        trie.insert("+/high", 2);
        trie.insert("+/+", 3);

        assert_eq!(collect(&trie, "alerts/high"), vec![1, 2, 3]);
        assert_eq!(collect(&trie, "alerts/low"), vec![1, 3]);
        assert!(collect(&trie, "alerts").is_empty());
        // + matches an empty level
        assert_eq!(collect(&trie, "alerts/"), vec![1, 3]);
    }

    #[test]
    fn test_hash_wildcard() {
        let mut trie = FilterTrie::new();
        trie.insert("#", 1);
        trie.insert("alerts/#", 2);

        assert_eq!(collect(&trie, "alerts/high/disk"), vec![1, 2]);
        // # covers the empty suffix
        assert_eq!(collect(&trie, "alerts"), vec![1, 2]);
        assert_eq!(collect(&trie, "metrics"), vec![1]);
    }

    #[test]
    fn test_system_topics_skip_root_wildcards() {
        let mut trie = FilterTrie::new();
        trie.insert("#", 1);
        trie.insert("+/status", 2);
        trie.insert("$internal/#", 3);

        assert_eq!(collect(&trie, "$internal/status"), vec![3]);
        assert_eq!(collect(&trie, "node/status"), vec![1, 2]);
    }

    #[test]
    fn test_remove_prunes_empty_branches() {
        let mut trie = FilterTrie::new();
        trie.insert("a/b/c", 1);
        trie.insert("a/+", 2);

        assert_eq!(trie.remove("a/b/c"), Some(1));
        assert_eq!(trie.remove("a/b/c"), None);
        assert!(collect(&trie, "a/b/c").is_empty());
        assert_eq!(collect(&trie, "a/b"), vec![2]);

        assert_eq!(trie.remove("a/+"), Some(2));
        assert!(trie.root.is_empty());
    }

    #[test]
    fn test_entry_replaces() {
        let mut trie = FilterTrie::new();
        trie.insert("a", 1);
        trie.insert("a", 2);
        assert_eq!(collect(&trie, "a"), vec![2]);
    }

    #[test]
    fn test_retain_and_for_each() {
        let mut trie = FilterTrie::new();
        trie.insert("a", 1);
        trie.insert("a/#", 2);
        trie.insert("+/b", 3);

        let mut seen = Vec::new();
        trie.for_each(|v| seen.push(*v));
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3]);

        trie.retain(|v| *v != 2);
        assert_eq!(collect(&trie, "a/c"), Vec::<u32>::new());
        assert_eq!(collect(&trie, "a"), vec![1]);
        assert_eq!(collect(&trie, "a/b"), vec![3]);
    }
}
