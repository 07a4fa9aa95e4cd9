//! Source of every random or monotonically allocated value minted by the mocker.
use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Mutex,
};

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ipnetwork::{Ipv4Network, Ipv6Network};
use petname::Petnames;
use rand::{rngs::OsRng, rngs::StdRng, seq::SliceRandom, Rng, RngCore, SeedableRng};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::kinds::identity::{Label, LABEL_SOURCE_K8S};

/// Prefix length of the IPv4 pod CIDRs handed out to nodes.
pub const CIDR4_PREFIX: u8 = 28;
/// Prefix length of the IPv6 pod CIDRs handed out to nodes.
pub const CIDR6_PREFIX: u8 = 120;

/// Lowest identity number (within a cluster) that does not collide with reserved identities.
const MIN_CLUSTER_LOCAL_IDENTITY: u32 = 256;
const MAX_CLUSTER_LOCAL_IDENTITY: u32 = 1 << 16;

/// Seeds of the monotonic allocators.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RandomConfig {
    pub node_ip4: Ipv4Addr,
    pub node_ip6: Ipv6Addr,
    pub pod_ip4: Ipv4Addr,
    pub pod_ip6: Ipv6Addr,
    pub svc_ip4: Ipv4Addr,
    pub svc_ip6: Ipv6Addr,
    pub pod_cidr4: Ipv4Addr,
    pub pod_cidr6: Ipv6Addr,
}

impl Default for RandomConfig {
    fn default() -> Self {
        Self {
            node_ip4: Ipv4Addr::new(172, 16, 0, 0),
            node_ip6: Ipv6Addr::new(0xfc00, 0xc111, 0, 0, 0, 0, 0, 0),
            pod_ip4: Ipv4Addr::new(10, 0, 0, 0),
            pod_ip6: Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0),
            svc_ip4: Ipv4Addr::new(172, 20, 0, 0),
            svc_ip6: Ipv6Addr::new(0xfd00, 0xffff, 0, 0, 0, 0, 0, 0),
            pod_cidr4: Ipv4Addr::new(10, 128, 0, 0),
            pod_cidr6: Ipv6Addr::new(0xfd00, 1, 0, 0, 0, 0, 0, 0),
        }
    }
}

/// Addresses that can be stepped forward.
trait Step: Copy {
    const BITS: u8;
    fn advance(self, by: u128) -> Self;
}

impl Step for Ipv4Addr {
    const BITS: u8 = 32;
    fn advance(self, by: u128) -> Self {
        Ipv4Addr::from(u32::from(self).wrapping_add(by as u32))
    }
}

impl Step for Ipv6Addr {
    const BITS: u8 = 128;
    fn advance(self, by: u128) -> Self {
        Ipv6Addr::from(u128::from(self).wrapping_add(by))
    }
}

/// Monotonic allocator: every draw returns the current value and advances by `stride`.
#[derive(Debug)]
struct Sequence<A> {
    next: Mutex<A>,
    stride: u128,
}

impl<A: Step> Sequence<A> {
    fn addresses(seed: A) -> Self {
        Self {
            next: Mutex::new(seed),
            stride: 1,
        }
    }

    /// Prefixes of length `prefix`, the seed must be the network address.
    fn prefixes(seed: A, prefix: u8) -> Self {
        Self {
            next: Mutex::new(seed),
            stride: 1u128 << (A::BITS - prefix),
        }
    }

    fn draw(&self) -> A {
        let mut next = self.next.lock().expect("should be able to acquire lock");
        let current = *next;
        *next = current.advance(self.stride);
        current
    }
}

/// Process wide generator shared by every engine of every cluster.
pub struct Random {
    rng: Mutex<StdRng>,
    words: Petnames<'static>,

    node_ip4: Sequence<Ipv4Addr>,
    node_ip6: Sequence<Ipv6Addr>,
    pod_ip4: Sequence<Ipv4Addr>,
    pod_ip6: Sequence<Ipv6Addr>,
    svc_ip4: Sequence<Ipv4Addr>,
    svc_ip6: Sequence<Ipv6Addr>,
    cidr4: Sequence<Ipv4Addr>,
    cidr6: Sequence<Ipv6Addr>,
}

impl std::fmt::Debug for Random {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Random").finish_non_exhaustive()
    }
}

impl Random {
    /// Create a generator seeded from system entropy.
    pub fn new(cfg: &RandomConfig) -> Result<Self> {
        Self::with_rng(cfg, StdRng::from_entropy())
    }

    /// Create a generator whose random decisions are reproducible.
    pub fn with_seed(cfg: &RandomConfig, seed: u64) -> Result<Self> {
        Self::with_rng(cfg, StdRng::seed_from_u64(seed))
    }

    fn with_rng(cfg: &RandomConfig, rng: StdRng) -> Result<Self> {
        let cidr4 = Ipv4Network::new(cfg.pod_cidr4, CIDR4_PREFIX)
            .context("invalid IPv4 pod CIDR seed")?
            .network();
        let cidr6 = Ipv6Network::new(cfg.pod_cidr6, CIDR6_PREFIX)
            .context("invalid IPv6 pod CIDR seed")?
            .network();

        Ok(Self {
            rng: Mutex::new(rng),
            words: Petnames::default(),
            node_ip4: Sequence::addresses(cfg.node_ip4),
            node_ip6: Sequence::addresses(cfg.node_ip6),
            pod_ip4: Sequence::addresses(cfg.pod_ip4),
            pod_ip6: Sequence::addresses(cfg.pod_ip6),
            svc_ip4: Sequence::addresses(cfg.svc_ip4),
            svc_ip6: Sequence::addresses(cfg.svc_ip6),
            cidr4: Sequence::prefixes(cidr4, CIDR4_PREFIX),
            cidr6: Sequence::prefixes(cidr6, CIDR6_PREFIX),
        })
    }

    fn rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().expect("should be able to acquire lock");
        f(&mut rng)
    }

    fn pick(&self, words: &[&str]) -> String {
        self.rng(|rng| words.choose(rng).map(|w| (*w).to_owned()))
            .unwrap_or_default()
    }

    /// Two word pronounceable name, e.g. `gentle-otter`.
    pub fn name(&self) -> String {
        self.rng(|rng| self.words.generate(rng, 2, "-"))
    }

    /// Single word name.
    pub fn namespace(&self) -> String {
        self.pick(&self.words.names)
    }

    fn adjective(&self) -> String {
        self.pick(&self.words.adjectives)
    }

    /// Three words joined by dots, shaped like a label key.
    fn label_key(&self) -> String {
        self.rng(|rng| self.words.generate(rng, 3, "."))
    }

    pub fn node_ip4(&self) -> Ipv4Addr {
        self.node_ip4.draw()
    }

    pub fn node_ip6(&self) -> Ipv6Addr {
        self.node_ip6.draw()
    }

    pub fn pod_ip4(&self) -> Ipv4Addr {
        self.pod_ip4.draw()
    }

    pub fn pod_ip6(&self) -> Ipv6Addr {
        self.pod_ip6.draw()
    }

    /// Pod address of either family, picked uniformly.
    pub fn pod_ip(&self) -> IpAddr {
        if self.rng(|rng| rng.gen_bool(0.5)) {
            IpAddr::V4(self.pod_ip4())
        } else {
            IpAddr::V6(self.pod_ip6())
        }
    }

    pub fn svc_ip4(&self) -> Ipv4Addr {
        self.svc_ip4.draw()
    }

    pub fn svc_ip6(&self) -> Ipv6Addr {
        self.svc_ip6.draw()
    }

    pub fn cidr4(&self) -> Result<Ipv4Network> {
        Ok(Ipv4Network::new(self.cidr4.draw(), CIDR4_PREFIX)?)
    }

    pub fn cidr6(&self) -> Result<Ipv6Network> {
        Ok(Ipv6Network::new(self.cidr6.draw(), CIDR6_PREFIX)?)
    }

    /// Uniform index in `[0, length)`, `length` must not be zero.
    pub fn index(&self, length: usize) -> usize {
        debug_assert!(length > 0, "index drawn from an empty range");
        self.rng(|rng| rng.gen_range(0..length))
    }

    /// True one time out of five.
    pub fn should_update_unlikely(&self) -> bool {
        self.rng(|rng| rng.gen_range(0..5) == 0)
    }

    /// True 99 times out of 100.
    pub fn should_update_likely(&self) -> bool {
        self.rng(|rng| rng.gen_range(0..100) != 0)
    }

    /// True one time out of two.
    pub fn should_remove(&self) -> bool {
        self.rng(|rng| rng.gen_range(0..2) == 1)
    }

    /// Identity number scoped to the cluster: the cluster ID occupies the upper 16 bits.
    pub fn identity(&self, cluster_id: u32) -> u32 {
        let local =
            self.rng(|rng| rng.gen_range(MIN_CLUSTER_LOCAL_IDENTITY..MAX_CLUSTER_LOCAL_IDENTITY));
        (cluster_id << 16) | local
    }

    /// Sorted labels of a pod identity living in `cluster`.
    pub fn identity_labels(&self, cluster: &str) -> Vec<Label> {
        let extra = self.rng(|rng| rng.gen_range(1..=8));
        let namespace = self.namespace();

        let mut labels = Vec::with_capacity(extra + 4);
        labels.push(Label::k8s("io.kubernetes.pod.namespace", &namespace));
        labels.push(Label::k8s(
            "io.cilium.k8s.namespace.labels.kubernetes.io/metadata.name",
            &namespace,
        ));
        labels.push(Label::k8s(
            "io.cilium.k8s.policy.serviceaccount",
            &self.namespace(),
        ));
        labels.push(Label::k8s("io.cilium.k8s.policy.cluster", cluster));
        for _ in 0..extra {
            labels.push(Label {
                source: LABEL_SOURCE_K8S.to_owned(),
                key: self.label_key(),
                value: self.adjective(),
            });
        }

        labels.sort();
        labels
    }

    /// Number of backends of a newly minted service.
    pub fn service_backends(&self) -> usize {
        self.rng(|rng| rng.gen_range(0..50))
    }

    /// Between one and six `name -> adjective` labels.
    pub fn service_labels(&self) -> BTreeMap<String, String> {
        let count = self.rng(|rng| rng.gen_range(1..=6));
        let mut labels = BTreeMap::new();
        while labels.len() < count {
            labels.insert(self.label_key(), self.adjective());
        }
        labels
    }

    /// Base64 encoded public half of a freshly generated WireGuard key pair.
    pub fn wireguard_public_key(&self) -> Result<String> {
        let mut private = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut private)
            .context("failed to generate WireGuard private key")?;
        let public = PublicKey::from(&StaticSecret::from(private));
        Ok(STANDARD.encode(public.as_bytes()))
    }
}
