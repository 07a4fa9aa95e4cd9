use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;

use super::{Change, Params};
use crate::{
    cache::{Keyed, WorkingSet},
    store::Marshal,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum L4Type {
    #[serde(rename = "TCP")]
    Tcp,
}

/// Protocol and port of a service frontend or backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct L4Addr {
    #[serde(rename = "Protocol")]
    pub protocol: L4Type,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Scope")]
    pub scope: u8,
}

impl L4Addr {
    fn tcp(port: u16) -> Self {
        Self {
            protocol: L4Type::Tcp,
            port,
            scope: 0,
        }
    }
}

/// Named ports exposed at one address.
pub type PortConfiguration = BTreeMap<String, L4Addr>;

fn ports(foo: u16, bar: u16) -> PortConfiguration {
    BTreeMap::from([
        ("foo".to_owned(), L4Addr::tcp(foo)),
        ("bar".to_owned(), L4Addr::tcp(bar)),
    ])
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterService {
    pub cluster: String,
    pub namespace: String,
    pub name: String,
    pub frontends: BTreeMap<String, PortConfiguration>,
    pub backends: BTreeMap<String, PortConfiguration>,
    pub labels: BTreeMap<String, String>,
    pub selector: BTreeMap<String, String>,
    pub include_external: bool,
    pub shared: bool,
    #[serde(rename = "clusterID")]
    pub cluster_id: u32,
}

impl Keyed for ClusterService {
    fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl Marshal for ClusterService {
    fn marshal(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Producer of the global services of one cluster.
pub struct Services {
    params: Params,
    set: WorkingSet<ClusterService>,
}

impl Services {
    pub fn new(params: Params, set: WorkingSet<ClusterService>) -> Self {
        Self { params, set }
    }

    pub fn next(&self, synced: bool) -> Result<Change<ClusterService>> {
        let rnd = &self.params.rnd;
        if synced && rnd.should_update_likely() && !self.set.almost_empty() {
            if let Some(mut service) = self.set.get(rnd) {
                self.update_backends(&mut service.backends);
                self.set.upsert(service.clone());
                return Ok(Change::Upsert(service));
            }
        }

        if synced && rnd.should_remove() && !self.set.almost_empty() {
            if let Some(service) = self.set.remove(rnd) {
                return Ok(Change::Delete(service));
            }
        }

        loop {
            let service = self.mint();
            if self.set.add(service.clone()) {
                return Ok(Change::Upsert(service));
            }
        }
    }

    fn mint(&self) -> ClusterService {
        let Params {
            cluster,
            rnd,
            enable_ipv6,
            ..
        } = &self.params;

        let mut frontends = BTreeMap::from([(rnd.svc_ip4().to_string(), ports(80, 90))]);
        if *enable_ipv6 {
            frontends.insert(rnd.svc_ip6().to_string(), ports(80, 90));
        }

        let mut wanted = rnd.service_backends();
        if *enable_ipv6 {
            wanted *= 2;
        }
        let mut backends = BTreeMap::new();
        while backends.len() < wanted {
            self.add_backend(&mut backends);
        }

        let labels = rnd.service_labels();
        ClusterService {
            cluster: cluster.name.clone(),
            cluster_id: cluster.id,
            namespace: rnd.namespace(),
            name: rnd.name(),
            selector: labels.clone(),
            labels,
            frontends,
            backends,
            include_external: true,
            shared: true,
        }
    }

    /// Drop a random backend, or add a new one.
    fn update_backends(&self, backends: &mut BTreeMap<String, PortConfiguration>) {
        let rnd = &self.params.rnd;
        if rnd.should_remove() && !backends.is_empty() {
            let idx = rnd.index(backends.len());
            if let Some(key) = backends.keys().nth(idx).cloned() {
                backends.remove(&key);
            }
            return;
        }
        self.add_backend(backends);
    }

    fn add_backend(&self, backends: &mut BTreeMap<String, PortConfiguration>) {
        let rnd = &self.params.rnd;
        backends.insert(rnd.pod_ip4().to_string(), ports(8080, 9090));
        if self.params.enable_ipv6 {
            backends.insert(rnd.pod_ip6().to_string(), ports(8080, 9090));
        }
    }

    #[cfg(test)]
    pub(crate) fn working_set(&self) -> &WorkingSet<ClusterService> {
        &self.set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use expect_test::expect;

    use crate::kinds::tests::params;

    #[test]
    fn minted_services_are_shared() {
        let services = Services::new(params(2), WorkingSet::new());
        for _ in 0..50 {
            let Change::Upsert(service) = services.next(false).unwrap() else {
                panic!("bootstrap must mint")
            };
            assert_eq!(service.cluster, "cluster-002");
            assert_eq!(service.cluster_id, 2);
            assert_eq!(service.key(), format!("{}/{}", service.namespace, service.name));
            assert_eq!(service.labels, service.selector);
            assert!((1..=6).contains(&service.labels.len()));
            assert_eq!(service.frontends.len(), 1);
            assert!(service.backends.len() < 50);
            assert!(service.shared && service.include_external);
        }
    }

    #[test]
    fn ipv6_doubles_addresses() {
        let mut params = params(1);
        params.enable_ipv6 = true;
        let services = Services::new(params, WorkingSet::new());
        let Change::Upsert(service) = services.next(false).unwrap() else {
            panic!("bootstrap must mint")
        };
        assert_eq!(service.frontends.len(), 2);
        assert_eq!(service.backends.len() % 2, 0);
        assert_eq!(
            service.backends.keys().filter(|ip| ip.contains(':')).count() * 2,
            service.backends.len()
        );
    }

    #[test]
    fn churn_mostly_mutates_backends() {
        let services = Services::new(params(1), WorkingSet::new());
        for _ in 0..10 {
            services.next(false).unwrap();
        }

        let mut updates = 0;
        for _ in 0..200 {
            let before = services.working_set().len();
            match services.next(true).unwrap() {
                Change::Upsert(_) if services.working_set().len() == before => updates += 1,
                Change::Delete(_) => assert!(before > 3),
                Change::Upsert(_) => {}
            }
        }
        assert!(updates > 150, "{updates} updates");
    }

    #[test]
    fn backend_update_adds_or_removes_one() {
        let services = Services::new(params(1), WorkingSet::new());
        let mut backends = BTreeMap::new();
        services.update_backends(&mut backends);
        assert_eq!(backends.len(), 1, "empty map only grows");

        for _ in 0..100 {
            let before = backends.len();
            services.update_backends(&mut backends);
            assert_eq!(backends.len().abs_diff(before), 1);
        }
    }

    #[test]
    fn wire_format() {
        let service = ClusterService {
            cluster: "cluster-001".to_owned(),
            namespace: "otter".to_owned(),
            name: "brave-heron".to_owned(),
            frontends: BTreeMap::from([("172.20.0.0".to_owned(), ports(80, 90))]),
            backends: BTreeMap::from([("10.0.0.4".to_owned(), ports(8080, 9090))]),
            labels: BTreeMap::from([("app".to_owned(), "quiet".to_owned())]),
            selector: BTreeMap::from([("app".to_owned(), "quiet".to_owned())]),
            include_external: true,
            shared: true,
            cluster_id: 1,
        };
        assert_eq!(service.key(), "otter/brave-heron");
        let json: serde_json::Value = serde_json::from_slice(&service.marshal().unwrap()).unwrap();
        expect![[r#"
            {
              "backends": {
                "10.0.0.4": {
                  "bar": {
                    "Port": 9090,
                    "Protocol": "TCP",
                    "Scope": 0
                  },
                  "foo": {
                    "Port": 8080,
                    "Protocol": "TCP",
                    "Scope": 0
                  }
                }
              },
              "cluster": "cluster-001",
              "clusterID": 1,
              "frontends": {
                "172.20.0.0": {
                  "bar": {
                    "Port": 90,
                    "Protocol": "TCP",
                    "Scope": 0
                  },
                  "foo": {
                    "Port": 80,
                    "Protocol": "TCP",
                    "Scope": 0
                  }
                }
              },
              "includeExternal": true,
              "labels": {
                "app": "quiet"
              },
              "name": "brave-heron",
              "namespace": "otter",
              "selector": {
                "app": "quiet"
              },
              "shared": true
            }"#]]
        .assert_eq(&serde_json::to_string_pretty(&json).unwrap());
    }
}
