use anyhow::Result;

use super::{Change, Params};
use crate::{
    cache::{Keyed, WorkingSet},
    store::Marshal,
};

pub const LABEL_SOURCE_K8S: &str = "k8s";

/// A security label. Ordering compares keys first.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Label {
    pub key: String,
    pub value: String,
    pub source: String,
}

impl Label {
    pub fn k8s(key: &str, value: &str) -> Self {
        Self {
            key: key.to_owned(),
            value: value.to_owned(),
            source: LABEL_SOURCE_K8S.to_owned(),
        }
    }

    /// `source:key=value;`
    pub fn format_for_kvstore(&self) -> String {
        format!("{}:{}={};", self.source, self.key, self.value)
    }
}

/// A numeric identity and its encoded label set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub id: u32,
    pub value: String,
}

impl Keyed for Identity {
    fn key(&self) -> String {
        self.id.to_string()
    }
}

impl Marshal for Identity {
    fn marshal(&self) -> Result<Vec<u8>> {
        Ok(self.value.clone().into_bytes())
    }
}

/// Producer of the identities of one cluster.
pub struct Identities {
    params: Params,
    set: WorkingSet<Identity>,
}

impl Identities {
    pub fn new(params: Params, set: WorkingSet<Identity>) -> Self {
        Self { params, set }
    }

    /// Number of a random live identity.
    pub fn random_identity(&self) -> Option<u32> {
        self.set.get(&self.params.rnd).map(|identity| identity.id)
    }

    pub fn next(&self, synced: bool) -> Result<Change<Identity>> {
        let rnd = &self.params.rnd;
        if synced && rnd.should_remove() && !self.set.almost_empty() {
            if let Some(identity) = self.set.remove(rnd) {
                return Ok(Change::Delete(identity));
            }
        }

        loop {
            let identity = self.mint();
            if self.set.add(identity.clone()) {
                return Ok(Change::Upsert(identity));
            }
        }
    }

    fn mint(&self) -> Identity {
        let Params {
            cluster,
            rnd,
            backend,
            ..
        } = &self.params;
        let labels: String = rnd
            .identity_labels(&cluster.name)
            .iter()
            .map(Label::format_for_kvstore)
            .collect();
        Identity {
            id: rnd.identity(cluster.id),
            value: backend.encode(labels.as_bytes()),
        }
    }

    #[cfg(test)]
    pub(crate) fn working_set(&self) -> &WorkingSet<Identity> {
        &self.set
    }
}
