//! Bounded cache of recent records, indexed by a configurable field.

use crate::field::get_deep;
use crate::stream::Record;
use std::collections::{HashMap, VecDeque};

/// Keeps the last `capacity` records that carry a string at `key`.
///
/// Eviction is oldest-first by insertion; re-inserting an existing key
/// replaces the record but keeps its original position.
#[derive(Debug)]
pub struct RecentCache {
    key: String,
    capacity: usize,
    records: HashMap<String, Record>,
    order: VecDeque<String>,
}

impl RecentCache {
    pub fn new(key: impl Into<String>, capacity: usize) -> Self {
        Self {
            key: key.into(),
            capacity,
            records: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Stores `record` if it has a string at the cache key. Returns whether it was stored.
    pub fn insert(&mut self, record: &Record) -> bool {
        if self.capacity == 0 {
            return false;
        }
        let id = match get_deep(&self.key, record).and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None => return false,
        };
        if self.records.insert(id.clone(), Record::clone(record)).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.records.remove(&oldest);
            }
        }
        true
    }

    pub fn get(&self, id: &str) -> Option<Record> {
        self.records.get(id).cloned()
    }
}
