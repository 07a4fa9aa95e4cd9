//! The working set: live objects of one kind in one simulated cluster.
use std::{collections::HashMap, sync::RwLock};

use prometheus::IntGauge;

use crate::random::Random;

/// Objects stored in a [`WorkingSet`], identified by a key unique within their kind.
pub trait Keyed {
    /// Key of the object, relative to the kind's prefix.
    fn key(&self) -> String;
}

#[derive(Debug)]
struct Inner<T> {
    keys: HashMap<String, usize>,
    values: Vec<T>,
}

/// Index supporting O(1) insertion, uniform random pick and random removal.
///
/// Values are kept in a dense vector alongside a key to position map. Removal
/// swaps the last value into the freed slot and rewrites its position.
#[derive(Debug)]
pub struct WorkingSet<T> {
    inner: RwLock<Inner<T>>,
    size: Option<IntGauge>,
}

impl<T> Default for WorkingSet<T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner {
                keys: HashMap::new(),
                values: Vec::new(),
            }),
            size: None,
        }
    }
}

impl<T: Keyed + Clone> WorkingSet<T> {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a working set reporting its size through `size`.
    pub fn with_gauge(size: IntGauge) -> Self {
        Self {
            size: Some(size),
            ..Self::default()
        }
    }

    /// Insert `value` unless its key is already present. Returns whether it was inserted.
    pub fn add(&self, value: T) -> bool {
        self.store(value, false)
    }

    /// Insert `value`, replacing the entry with the same key if any.
    pub fn upsert(&self, value: T) {
        self.store(value, true);
    }

    /// A uniformly picked live value, `None` when the set is empty.
    pub fn get(&self, rnd: &Random) -> Option<T> {
        let inner = self.inner.read().expect("should be able to acquire lock");
        if inner.values.is_empty() {
            return None;
        }
        let idx = rnd.index(inner.values.len());
        Some(inner.values[idx].clone())
    }

    /// Remove and return a uniformly picked live value, `None` when the set is empty.
    pub fn remove(&self, rnd: &Random) -> Option<T> {
        let mut inner = self.inner.write().expect("should be able to acquire lock");
        if inner.values.is_empty() {
            return None;
        }
        let idx = rnd.index(inner.values.len());
        let value = inner.values.swap_remove(idx);
        inner.keys.remove(&value.key());
        if let Some(moved) = inner.values.get(idx) {
            let key = moved.key();
            inner.keys.insert(key, idx);
        }
        self.report(inner.values.len());
        Some(value)
    }

    /// Whether the set holds three values or fewer. Updates and removals are skipped then.
    pub fn almost_empty(&self) -> bool {
        self.len() <= 3
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("should be able to acquire lock")
            .values
            .len()
    }

    /// Keys of the live values, in storage order.
    #[cfg(test)]
    pub fn keys(&self) -> Vec<String> {
        let inner = self.inner.read().expect("should be able to acquire lock");
        inner.values.iter().map(Keyed::key).collect()
    }

    /// Copies of the live values, in storage order.
    #[cfg(test)]
    pub fn values(&self) -> Vec<T> {
        self.inner
            .read()
            .expect("should be able to acquire lock")
            .values
            .clone()
    }

    fn store(&self, value: T, overwrite: bool) -> bool {
        let key = value.key();
        let mut inner = self.inner.write().expect("should be able to acquire lock");
        if let Some(&idx) = inner.keys.get(&key) {
            if overwrite {
                inner.values[idx] = value;
            }
            return overwrite;
        }

        let idx = inner.values.len();
        inner.keys.insert(key, idx);
        inner.values.push(value);
        self.report(inner.values.len());
        true
    }

    fn report(&self, len: usize) {
        if let Some(size) = &self.size {
            size.set(len as i64);
        }
    }
}
