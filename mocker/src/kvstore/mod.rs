//! Key-value store backends the mocker publishes into.
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE, Engine as _};

mod etcd;
mod memory;

pub use etcd::EtcdHttpClient;
pub use memory::MemoryStore;
#[cfg(test)]
pub use memory::Event;

/// Failures reported by a backend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kvstore request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("kvstore rejected {op} of {key:?}: {message}")]
    Rejected {
        op: &'static str,
        key: String,
        message: String,
    },
}

/// Define the behavior we consume from the key-value store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Write `value` at `key`, creating or overwriting it.
    async fn update(&self, key: &str, value: Vec<u8>) -> Result<(), Error>;
    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), Error>;
    /// Make sure `user` exists and holds every role in `roles`.
    async fn user_enforce_presence(&self, user: &str, roles: &[String]) -> Result<(), Error>;

    /// Encode binary data into the textual form the backend stores for identities.
    fn encode(&self, data: &[u8]) -> String {
        URL_SAFE.encode(data)
    }
}
