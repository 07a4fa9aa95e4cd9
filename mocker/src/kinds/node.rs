use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use anyhow::Result;
use ipnetwork::{Ipv4Network, Ipv6Network};
use serde::Serialize;

use super::{Change, Params};
use crate::{cache::Keyed, cache::WorkingSet, config::Encryption, store::Marshal};

/// Reserved identity of nodes belonging to a remote cluster.
pub const RESERVED_IDENTITY_REMOTE_NODE: u32 = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum AddressType {
    InternalIP,
    CiliumInternalIP,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Address {
    #[serde(rename = "Type")]
    pub kind: AddressType,
    #[serde(rename = "IP")]
    pub ip: IpAddr,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Node {
    pub name: String,
    pub cluster: String,
    #[serde(rename = "IPAddresses")]
    pub ip_addresses: Vec<Address>,
    #[serde(rename = "IPv4AllocCIDR")]
    pub ipv4_alloc_cidr: Ipv4Network,
    #[serde(rename = "IPv6AllocCIDR", skip_serializing_if = "Option::is_none")]
    pub ipv6_alloc_cidr: Option<Ipv6Network>,
    #[serde(rename = "IPv4HealthIP")]
    pub ipv4_health_ip: Ipv4Addr,
    #[serde(rename = "IPv6HealthIP", skip_serializing_if = "Option::is_none")]
    pub ipv6_health_ip: Option<Ipv6Addr>,
    #[serde(rename = "IPv4IngressIP")]
    pub ipv4_ingress_ip: Ipv4Addr,
    #[serde(rename = "IPv6IngressIP", skip_serializing_if = "Option::is_none")]
    pub ipv6_ingress_ip: Option<Ipv6Addr>,
    #[serde(rename = "ClusterID")]
    pub cluster_id: u32,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub node_identity: u32,
    pub encryption_key: u8,
    #[serde(rename = "WireguardPubKey", skip_serializing_if = "Option::is_none")]
    pub wireguard_pub_key: Option<String>,
}

impl Node {
    /// First IPv4 `InternalIP` of the node.
    pub fn internal_ipv4(&self) -> Option<Ipv4Addr> {
        self.ip_addresses.iter().find_map(|addr| match addr {
            Address {
                kind: AddressType::InternalIP,
                ip: IpAddr::V4(ip),
            } => Some(*ip),
            _ => None,
        })
    }
}

impl Keyed for Node {
    fn key(&self) -> String {
        self.name.clone()
    }
}

impl Marshal for Node {
    fn marshal(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Producer of the nodes of one cluster.
pub struct Nodes {
    params: Params,
    set: WorkingSet<Node>,
}

impl Nodes {
    pub fn new(params: Params, set: WorkingSet<Node>) -> Self {
        Self { params, set }
    }

    /// Internal IPv4 address of a random live node.
    pub fn random_host_ip(&self) -> Option<Ipv4Addr> {
        self.set.get(&self.params.rnd)?.internal_ipv4()
    }

    pub fn next(&self, synced: bool) -> Result<Change<Node>> {
        let rnd = &self.params.rnd;
        if synced && rnd.should_remove() && !self.set.almost_empty() {
            if let Some(node) = self.set.remove(rnd) {
                return Ok(Change::Delete(node));
            }
        }

        loop {
            let node = self.mint()?;
            if self.set.add(node.clone()) {
                return Ok(Change::Upsert(node));
            }
        }
    }

    fn mint(&self) -> Result<Node> {
        let Params {
            cluster,
            rnd,
            enable_ipv6,
            encryption,
            node_annotations,
            ..
        } = &self.params;
        let name = rnd.name();

        let mut node = Node {
            labels: BTreeMap::from([
                ("kubernetes.io/hostname".to_owned(), name.clone()),
                ("kubernetes.io/arch".to_owned(), "amd64".to_owned()),
                ("kubernetes.io/os".to_owned(), "linux".to_owned()),
            ]),
            name,
            cluster: cluster.name.clone(),
            ip_addresses: vec![
                Address {
                    kind: AddressType::InternalIP,
                    ip: rnd.node_ip4().into(),
                },
                Address {
                    kind: AddressType::CiliumInternalIP,
                    ip: rnd.pod_ip4().into(),
                },
            ],
            ipv4_alloc_cidr: rnd.cidr4()?,
            ipv6_alloc_cidr: None,
            ipv4_health_ip: rnd.pod_ip4(),
            ipv6_health_ip: None,
            ipv4_ingress_ip: rnd.pod_ip4(),
            ipv6_ingress_ip: None,
            cluster_id: cluster.id,
            annotations: node_annotations.clone(),
            node_identity: RESERVED_IDENTITY_REMOTE_NODE,
            encryption_key: encryption.key(),
            wireguard_pub_key: None,
        };

        if *enable_ipv6 {
            node.ip_addresses.push(Address {
                kind: AddressType::InternalIP,
                ip: rnd.node_ip6().into(),
            });
            node.ip_addresses.push(Address {
                kind: AddressType::CiliumInternalIP,
                ip: rnd.pod_ip6().into(),
            });
            node.ipv6_alloc_cidr = Some(rnd.cidr6()?);
            node.ipv6_health_ip = Some(rnd.pod_ip6());
            node.ipv6_ingress_ip = Some(rnd.pod_ip6());
        }

        if *encryption == Encryption::Wireguard {
            node.wireguard_pub_key = Some(rnd.wireguard_public_key()?);
        }

        Ok(node)
    }

    #[cfg(test)]
    pub(crate) fn working_set(&self) -> &WorkingSet<Node> {
        &self.set
    }
}
