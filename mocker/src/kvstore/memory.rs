use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use async_trait::async_trait;

use super::{Error, KvStore};

/// A write observed by a recording [`MemoryStore`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Update(String),
    Delete(String),
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, Vec<u8>>,
    users: BTreeMap<String, BTreeSet<String>>,
    writes: u64,
    history: Option<Vec<Event>>,
}

/// In process backend used for dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of updates and deletes applied so far.
    pub fn writes(&self) -> u64 {
        self.state.lock().expect("should be able to acquire lock").writes
    }

    /// Number of keys currently stored.
    pub fn key_count(&self) -> usize {
        self.state
            .lock()
            .expect("should be able to acquire lock")
            .entries
            .len()
    }
}

#[cfg(test)]
impl MemoryStore {
    /// A store that also keeps the ordered list of writes.
    pub fn recording() -> Self {
        let store = Self::default();
        store.state.lock().unwrap().history = Some(Vec::new());
        store
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().entries.get(key).cloned()
    }

    /// Stored keys starting with `prefix`, with the prefix stripped.
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .entries
            .keys()
            .filter_map(|key| key.strip_prefix(prefix).map(str::to_owned))
            .collect()
    }

    pub fn history(&self) -> Vec<Event> {
        self.state.lock().unwrap().history.clone().unwrap_or_default()
    }

    pub fn roles(&self, user: &str) -> Option<Vec<String>> {
        let state = self.state.lock().unwrap();
        state.users.get(user).map(|roles| roles.iter().cloned().collect())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn update(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let mut state = self.state.lock().expect("should be able to acquire lock");
        state.entries.insert(key.to_owned(), value);
        state.writes += 1;
        if let Some(history) = &mut state.history {
            history.push(Event::Update(key.to_owned()));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let mut state = self.state.lock().expect("should be able to acquire lock");
        state.entries.remove(key);
        state.writes += 1;
        if let Some(history) = &mut state.history {
            history.push(Event::Delete(key.to_owned()));
        }
        Ok(())
    }

    async fn user_enforce_presence(&self, user: &str, roles: &[String]) -> Result<(), Error> {
        let mut state = self.state.lock().expect("should be able to acquire lock");
        state
            .users
            .entry(user.to_owned())
            .or_default()
            .extend(roles.iter().cloned());
        Ok(())
    }
}
