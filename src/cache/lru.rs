//! Bounded LRU set
//!
//! Request-local: used for search bookkeeping that must stay within a fixed
//! memory budget. Not synchronised; each search owns its own set.

use std::collections::HashMap;
use std::hash::Hash;

/// Node in the LRU linked list
struct LruNode<K> {
    key: K,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Set with a capacity bound; inserting past capacity evicts the least recently used key
pub struct LruSet<K>
where
    K: Eq + Hash + Clone,
{
    capacity: usize,
    /// key -> node index
    index: HashMap<K, usize>,
    nodes: Vec<LruNode<K>>,
    /// Most recently used
    head: Option<usize>,
    /// Least recently used
    tail: Option<usize>,
    free_list: Vec<usize>,
    evictions: u64,
}

impl<K> LruSet<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            index: HashMap::with_capacity(capacity.min(1 << 16)),
            nodes: Vec::new(),
            head: None,
            tail: None,
            free_list: Vec::new(),
            evictions: 0,
        }
    }

    /// Insert `key`, returning `false` if it was already present.
    ///
    /// A present key is refreshed to most recently used.
    pub fn insert(&mut self, key: K) -> bool {
        if let Some(&idx) = self.index.get(&key) {
            self.move_to_head(idx);
            return false;
        }

        if self.index.len() >= self.capacity {
            self.evict_lru();
        }

        let idx = self.allocate_node(key.clone());
        self.index.insert(key, idx);
        self.push_to_head(idx);
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of keys dropped to honour the capacity
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    fn allocate_node(&mut self, key: K) -> usize {
        let node = LruNode {
            key,
            prev: None,
            next: None,
        };
        match self.free_list.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn push_to_head(&mut self, idx: usize) {
        match self.head {
            Some(old_head) => {
                self.nodes[old_head].prev = Some(idx);
                self.nodes[idx].next = Some(old_head);
                self.nodes[idx].prev = None;
            }
            None => {
                // List was empty
                self.tail = Some(idx);
                self.nodes[idx].next = None;
                self.nodes[idx].prev = None;
            }
        }
        self.head = Some(idx);
    }

    fn move_to_head(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_to_head(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let prev = self.nodes[idx].prev;
        let next = self.nodes[idx].next;

        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }

        self.nodes[idx].prev = None;
        self.nodes[idx].next = None;
    }

    fn evict_lru(&mut self) {
        if let Some(idx) = self.tail {
            self.unlink(idx);
            let key = self.nodes[idx].key.clone();
            self.index.remove(&key);
            self.free_list.push(idx);
            self.evictions += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_contains() {
        let mut set = LruSet::new(3);
        assert!(set.insert(1u64));
        assert!(set.insert(2));
        assert!(!set.insert(1));
        assert!(set.contains(&1));
        assert!(set.contains(&2));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut set = LruSet::new(2);
        set.insert("a");
        set.insert("b");
        // refresh "a" so "b" becomes the eviction candidate
        set.insert("a");
        set.insert("c");

        assert!(set.contains(&"a"));
        assert!(!set.contains(&"b"));
        assert!(set.contains(&"c"));
        assert_eq!(set.evictions(), 1);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_capacity_one() {
        let mut set = LruSet::new(0);
        assert_eq!(set.capacity(), 1);
        set.insert(1);
        set.insert(2);
        assert!(!set.contains(&1));
        assert!(set.contains(&2));
    }

    #[test]
    fn test_node_reuse_after_eviction() {
        let mut set = LruSet::new(2);
        for k in 0..100u32 {
            set.insert(k);
        }
        assert_eq!(set.len(), 2);
        assert!(set.contains(&98));
        assert!(set.contains(&99));
        assert_eq!(set.evictions(), 98);
    }
}
