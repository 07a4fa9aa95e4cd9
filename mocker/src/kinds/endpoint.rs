use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
};

use anyhow::{anyhow, Result};
use serde::Serialize;

use super::{Change, Identities, Nodes, Params};
use crate::{
    cache::{Keyed, WorkingSet},
    store::Marshal,
};

/// Mapping from a pod IP to its security identity and hosting node.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IpIdentityPair {
    #[serde(rename = "IP")]
    pub ip: IpAddr,
    #[serde(rename = "HostIP")]
    pub host_ip: Ipv4Addr,
    #[serde(rename = "ID")]
    pub id: u32,
    #[serde(rename = "Key")]
    pub key: u8,
    #[serde(rename = "K8sNamespace")]
    pub k8s_namespace: String,
    #[serde(rename = "K8sPodName")]
    pub k8s_pod_name: String,
}

impl Keyed for IpIdentityPair {
    fn key(&self) -> String {
        self.ip.to_string()
    }
}

impl Marshal for IpIdentityPair {
    fn marshal(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Producer of the endpoints of one cluster, referencing its live nodes and identities.
pub struct Endpoints {
    params: Params,
    set: WorkingSet<IpIdentityPair>,
    nodes: Arc<Nodes>,
    identities: Arc<Identities>,
}

impl Endpoints {
    pub fn new(
        params: Params,
        set: WorkingSet<IpIdentityPair>,
        nodes: Arc<Nodes>,
        identities: Arc<Identities>,
    ) -> Self {
        Self {
            params,
            set,
            nodes,
            identities,
        }
    }

    pub fn next(&self, synced: bool) -> Result<Change<IpIdentityPair>> {
        let rnd = &self.params.rnd;
        if synced && rnd.should_update_unlikely() && !self.set.almost_empty() {
            if let Some(mut endpoint) = self.set.get(rnd) {
                endpoint.id = self.identity()?;
                self.set.upsert(endpoint.clone());
                return Ok(Change::Upsert(endpoint));
            }
        }

        if synced && rnd.should_remove() && !self.set.almost_empty() {
            if let Some(endpoint) = self.set.remove(rnd) {
                return Ok(Change::Delete(endpoint));
            }
        }

        loop {
            let endpoint = self.mint()?;
            if self.set.add(endpoint.clone()) {
                return Ok(Change::Upsert(endpoint));
            }
        }
    }

    fn mint(&self) -> Result<IpIdentityPair> {
        let rnd = &self.params.rnd;
        let ip = if self.params.enable_ipv6 {
            rnd.pod_ip()
        } else {
            rnd.pod_ip4().into()
        };
        let host_ip = self
            .nodes
            .random_host_ip()
            .ok_or_else(|| anyhow!("no live node to host endpoint {ip}"))?;
        Ok(IpIdentityPair {
            ip,
            host_ip,
            id: self.identity()?,
            key: self.params.encryption.key(),
            k8s_pod_name: rnd.name(),
            k8s_namespace: rnd.namespace(),
        })
    }

    fn identity(&self) -> Result<u32> {
        self.identities
            .random_identity()
            .ok_or_else(|| anyhow!("no live identity to assign to endpoint"))
    }

    #[cfg(test)]
    pub(crate) fn working_set(&self) -> &WorkingSet<IpIdentityPair> {
        &self.set
    }
}
