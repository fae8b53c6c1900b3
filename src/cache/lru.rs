//! Recency index shared by every tier.
//!
//! An intrusive doubly linked list stored in a slab, plus a key → slot map.
//! Front is least recently used, back is most recently used. Touch, remove
//! and pop-front are all O(1). Keys inserted without further touches leave
//! in insertion order, so equal recency breaks ties FIFO.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug)]
struct Node<K> {
    key: K,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Ordered set of keys from least to most recently used.
#[derive(Debug)]
pub struct LruIndex<K> {
    slots: Vec<Option<Node<K>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K: Eq + Hash + Clone> Default for LruIndex<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> LruIndex<K> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.contains_key(key)
    }

    /// Insert `key` as most recently used. An existing key is touched instead.
    ///
    /// Returns true if the key was not present before.
    pub fn insert(&mut self, key: K) -> bool {
        if let Some(&slot) = self.index.get(&key) {
            self.move_to_back(slot);
            return false;
        }

        let node = Node {
            key: key.clone(),
            prev: self.tail,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };

        match self.tail {
            Some(tail) => self.node_mut(tail).next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.index.insert(key, slot);
        true
    }

    /// Mark `key` as most recently used. Returns false if absent.
    pub fn touch<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.index.get(key) {
            Some(&slot) => {
                self.move_to_back(slot);
                true
            }
            None => false,
        }
    }

    /// Remove `key`. Returns false if absent.
    pub fn remove<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.index.remove(key) {
            Some(slot) => {
                self.unlink(slot);
                self.slots[slot] = None;
                self.free.push(slot);
                true
            }
            None => false,
        }
    }

    /// Least recently used key, if any.
    pub fn front(&self) -> Option<&K> {
        self.head.map(|slot| &self.node(slot).key)
    }

    /// Remove and return the least recently used key.
    pub fn pop_front(&mut self) -> Option<K> {
        let slot = self.head?;
        let key = self.node(slot).key.clone();
        self.remove(&key);
        Some(key)
    }

    /// Keys from least to most recently used.
    pub fn iter(&self) -> Iter<'_, K> {
        Iter {
            lru: self,
            cursor: self.head,
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
    }

    fn node(&self, slot: usize) -> &Node<K> {
        self.slots[slot]
            .as_ref()
            .unwrap_or_else(|| unreachable!("lru slot {slot} is vacant"))
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node<K> {
        self.slots[slot]
            .as_mut()
            .unwrap_or_else(|| unreachable!("lru slot {slot} is vacant"))
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let node = self.node(slot);
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(slot);
        node.prev = None;
        node.next = None;
    }

    fn move_to_back(&mut self, slot: usize) {
        if self.tail == Some(slot) {
            return;
        }
        self.unlink(slot);
        let old_tail = self.tail;
        {
            let node = self.node_mut(slot);
            node.prev = old_tail;
            node.next = None;
        }
        match old_tail {
            Some(tail) => self.node_mut(tail).next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }
}

/// Iterator over an [`LruIndex`], oldest first.
pub struct Iter<'a, K> {
    lru: &'a LruIndex<K>,
    cursor: Option<usize>,
}

impl<'a, K: Eq + Hash + Clone> Iterator for Iter<'a, K> {
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.cursor?;
        let node = self.lru.node(slot);
        self.cursor = node.next;
        Some(&node.key)
    }
}
