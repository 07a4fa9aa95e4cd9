//! The four kinds of state a simulated cluster publishes.
use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::{cluster::ClusterInfo, config::Encryption, kvstore::KvStore, random::Random};

pub mod endpoint;
pub mod identity;
pub mod node;
pub mod service;

pub use endpoint::Endpoints;
pub use identity::Identities;
pub use node::Nodes;
pub use service::Services;

/// Outcome of one step of a kind's producer.
#[derive(Clone, Debug, PartialEq)]
pub enum Change<T> {
    Upsert(T),
    Delete(T),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Nodes,
    Identities,
    Endpoints,
    Services,
}

impl Kind {
    #[cfg(test)]
    pub const ALL: [Kind; 4] = [Kind::Nodes, Kind::Identities, Kind::Endpoints, Kind::Services];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Nodes => "nodes",
            Kind::Identities => "identities",
            Kind::Endpoints => "ips",
            Kind::Services => "services",
        }
    }

    fn resource(&self) -> &'static str {
        match self {
            Kind::Nodes => "nodes/v1",
            Kind::Identities => "identities/v1",
            Kind::Endpoints => "ip/v1",
            Kind::Services => "services/v1",
        }
    }

    /// Directory holding the objects of this kind published by `cluster`.
    pub fn data_prefix(&self, prefix: &str, cluster: &str) -> String {
        let base = format!("{prefix}/state/{}/{cluster}", self.resource());
        match self {
            Kind::Identities => format!("{base}/id"),
            _ => base,
        }
    }

    /// Key announcing that `cluster` completed the initial synchronization of this kind.
    ///
    /// The suffix names the cache prefix readers consume the data from.
    pub fn synced_key(&self, prefix: &str, cluster: &str) -> String {
        format!("{prefix}/synced/{cluster}/{prefix}/cache/{}", self.resource())
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters shared by the producers of one cluster.
#[derive(Clone)]
pub struct Params {
    pub cluster: ClusterInfo,
    pub rnd: Arc<Random>,
    pub backend: Arc<dyn KvStore>,
    pub enable_ipv6: bool,
    pub encryption: Encryption,
    pub node_annotations: BTreeMap<String, String>,
}
