//! Command line options of the mocker and their validation.
use std::{
    collections::BTreeMap,
    fmt,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use clap::{Args, ValueEnum};

use crate::random::RandomConfig;

/// Highest cluster ID: it must fit the upper 16 bits of an identity.
pub const MAX_CLUSTER_ID: u64 = u16::MAX as u64;

/// Options to the mocker command
#[derive(Args, Debug, Clone)]
pub struct Opts {
    /// URL of the etcd v3 JSON gateway the mocked state is published into.
    #[arg(long, env = "MOCKER_KVSTORE_ENDPOINT", required_unless_present = "dry_run")]
    kvstore_endpoint: Option<String>,

    /// PEM bundle of the certificate authorities trusted for the etcd endpoint.
    #[arg(long, env = "MOCKER_KVSTORE_CA")]
    kvstore_ca: Option<PathBuf>,

    /// PEM client certificate presented to etcd.
    #[arg(long, env = "MOCKER_KVSTORE_CERT", requires = "kvstore_key")]
    kvstore_cert: Option<PathBuf>,

    /// PEM private key of the client certificate.
    #[arg(long, env = "MOCKER_KVSTORE_KEY", requires = "kvstore_cert")]
    kvstore_key: Option<PathBuf>,

    /// etcd user to authenticate as.
    #[arg(long, env = "MOCKER_KVSTORE_USERNAME", requires = "kvstore_password")]
    kvstore_username: Option<String>,

    /// Password of the etcd user.
    #[arg(long, env = "MOCKER_KVSTORE_PASSWORD", requires = "kvstore_username")]
    kvstore_password: Option<Password>,

    /// Publish into an in-process store instead of etcd, to profile the generator alone.
    #[arg(long, env = "MOCKER_DRY_RUN", conflicts_with = "kvstore_endpoint")]
    dry_run: bool,

    /// Prefix of every key written to the kvstore.
    #[arg(long, env = "MOCKER_KVSTORE_PREFIX", default_value = "cilium")]
    kvstore_prefix: String,

    /// Also emit IPv6 addresses.
    #[arg(long, env = "MOCKER_ENABLE_IPV6")]
    enable_ipv6: bool,

    /// Encryption mode advertised by nodes and endpoints.
    #[arg(long, value_enum, env = "MOCKER_ENCRYPTION", default_value_t = Encryption::Disabled)]
    encryption: Encryption,

    /// Number of clusters to mock.
    #[arg(long, env = "MOCKER_CLUSTERS", default_value_t = 1)]
    clusters: u32,

    /// Cluster ID of the first mocked cluster, the following ones are numbered sequentially.
    #[arg(long, env = "MOCKER_FIRST_CLUSTER_ID", default_value_t = 1)]
    first_cluster_id: u32,

    /// Maximum number of connected clusters advertised in the cluster configuration.
    #[arg(long, env = "MOCKER_MAX_CONNECTED_CLUSTERS", default_value_t = 255)]
    max_connected_clusters: u32,

    /// Number of nodes to mock (per cluster).
    #[arg(long, env = "MOCKER_NODES", default_value_t = 10)]
    nodes: u32,
    /// Node churn rate (per cluster).
    #[arg(long, env = "MOCKER_NODES_QPS", default_value_t = 0.0)]
    nodes_qps: f64,

    /// Number of identities to mock (per cluster).
    #[arg(long, env = "MOCKER_IDENTITIES", default_value_t = 10)]
    identities: u32,
    /// Identity churn rate (per cluster).
    #[arg(long, env = "MOCKER_IDENTITIES_QPS", default_value_t = 0.0)]
    identities_qps: f64,

    /// Number of endpoints to mock (per cluster).
    #[arg(long, env = "MOCKER_ENDPOINTS", default_value_t = 10)]
    endpoints: u32,
    /// Endpoint churn rate (per cluster).
    #[arg(long, env = "MOCKER_ENDPOINTS_QPS", default_value_t = 0.0)]
    endpoints_qps: f64,

    /// Number of services to mock (per cluster).
    #[arg(long, env = "MOCKER_SERVICES", default_value_t = 10)]
    services: u32,
    /// Service churn rate (per cluster).
    #[arg(long, env = "MOCKER_SERVICES_QPS", default_value_t = 0.0)]
    services_qps: f64,

    /// Extra annotations stamped on every node, as comma separated key=value pairs.
    #[arg(long, env = "MOCKER_NODE_ANNOTATIONS", value_delimiter = ',', value_parser = parse_key_value)]
    node_annotations: Vec<(String, String)>,

    /// First IPv4 address handed out to nodes.
    #[arg(long, env = "MOCKER_RANDOM_NODE_IP4", default_value = "172.16.0.0")]
    random_node_ip4: Ipv4Addr,
    /// First IPv6 address handed out to nodes.
    #[arg(long, env = "MOCKER_RANDOM_NODE_IP6", default_value = "fc00:c111::")]
    random_node_ip6: Ipv6Addr,
    /// First IPv4 address handed out to pods.
    #[arg(long, env = "MOCKER_RANDOM_POD_IP4", default_value = "10.0.0.0")]
    random_pod_ip4: Ipv4Addr,
    /// First IPv6 address handed out to pods.
    #[arg(long, env = "MOCKER_RANDOM_POD_IP6", default_value = "fd00::")]
    random_pod_ip6: Ipv6Addr,
    /// First IPv4 address handed out to services.
    #[arg(long, env = "MOCKER_RANDOM_SVC_IP4", default_value = "172.20.0.0")]
    random_svc_ip4: Ipv4Addr,
    /// First IPv6 address handed out to services.
    #[arg(long, env = "MOCKER_RANDOM_SVC_IP6", default_value = "fd00:ffff::")]
    random_svc_ip6: Ipv6Addr,
    /// First IPv4 pod CIDR handed out to nodes.
    #[arg(long, env = "MOCKER_RANDOM_POD_CIDR4", default_value = "10.128.0.0")]
    random_pod_cidr4: Ipv4Addr,
    /// First IPv6 pod CIDR handed out to nodes.
    #[arg(long, env = "MOCKER_RANDOM_POD_CIDR6", default_value = "fd00:1::")]
    random_pod_cidr6: Ipv6Addr,

    /// Seed of the random source, for reproducible runs.
    #[arg(long, env = "MOCKER_SEED")]
    seed: Option<u64>,

    /// Address serving /readyz, /healthz and /metrics.
    #[arg(long, env = "MOCKER_HEALTH_ADDR", default_value = "0.0.0.0:9880")]
    health_addr: SocketAddr,

    /// Seconds between two kvstore heartbeats, 0 disables them.
    #[arg(long, env = "MOCKER_HEARTBEAT_INTERVAL", default_value_t = 60)]
    heartbeat_interval: u64,

    /// Changes buffered per cluster and kind before producers wait for the kvstore.
    #[arg(long, env = "MOCKER_QUEUE_SIZE", default_value_t = 1024)]
    queue_size: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Encryption {
    #[default]
    Disabled,
    Ipsec,
    Wireguard,
}

impl Encryption {
    /// Encryption key index advertised by nodes and endpoints.
    pub fn key(&self) -> u8 {
        match self {
            Encryption::Disabled => 0,
            Encryption::Ipsec => 1,
            Encryption::Wireguard => 255,
        }
    }
}

/// Bootstrap population and churn rate of one kind.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Workload {
    pub target: u32,
    pub qps: f64,
}

impl Workload {
    /// Whether the kind churns once bootstrapped.
    pub fn churns(&self) -> bool {
        self.target != 0 && self.qps > 0.0
    }
}

/// Secret option value, kept out of debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct Password(String);

impl Password {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<String> for Password {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientCert {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Username and password exchanged for an auth token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Password,
}

/// How to reach and authenticate to etcd.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EtcdConfig {
    pub endpoint: String,
    pub ca: Option<PathBuf>,
    pub client_cert: Option<ClientCert>,
    pub credentials: Option<Credentials>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backend {
    Etcd(EtcdConfig),
    Memory,
}

/// Validated mocker configuration.
#[derive(Clone, Debug)]
pub struct MockerConfig {
    pub backend: Backend,
    pub prefix: String,

    pub clusters: u32,
    pub first_cluster_id: u32,
    pub max_connected_clusters: u32,

    pub nodes: Workload,
    pub identities: Workload,
    pub endpoints: Workload,
    pub services: Workload,

    pub enable_ipv6: bool,
    pub encryption: Encryption,
    pub node_annotations: BTreeMap<String, String>,

    pub random: RandomConfig,
    pub seed: Option<u64>,

    pub health_addr: SocketAddr,
    pub heartbeat_interval: Option<Duration>,
    pub queue_size: usize,
}

impl MockerConfig {
    pub fn try_from_opts(opts: Opts) -> Result<Self> {
        tracing::debug!(?opts, "building config from opts");

        let backend = match (opts.dry_run, opts.kvstore_endpoint) {
            (true, _) => Backend::Memory,
            (false, Some(endpoint)) if !endpoint.is_empty() => Backend::Etcd(EtcdConfig {
                endpoint,
                ca: opts.kvstore_ca,
                client_cert: match (opts.kvstore_cert, opts.kvstore_key) {
                    (Some(cert), Some(key)) => Some(ClientCert { cert, key }),
                    (None, None) => None,
                    _ => bail!("a client certificate needs both --kvstore-cert and --kvstore-key"),
                },
                credentials: match (opts.kvstore_username, opts.kvstore_password) {
                    (Some(username), Some(password)) => Some(Credentials { username, password }),
                    (None, None) => None,
                    _ => bail!("etcd authentication needs both a username and a password"),
                },
            }),
            (false, _) => bail!("a kvstore endpoint is required unless running dry"),
        };

        let prefix = opts.kvstore_prefix.trim_matches('/').to_owned();
        if prefix.is_empty() {
            bail!("kvstore prefix must not be empty");
        }

        if opts.clusters == 0 {
            bail!("at least one cluster must be mocked");
        }
        let last_cluster_id = u64::from(opts.first_cluster_id) + u64::from(opts.clusters) - 1;
        if opts.first_cluster_id == 0 || last_cluster_id > MAX_CLUSTER_ID {
            bail!(
                "cluster IDs {}..={last_cluster_id} must lie within 1..={MAX_CLUSTER_ID}",
                opts.first_cluster_id
            );
        }

        let nodes = workload("nodes", opts.nodes, opts.nodes_qps)?;
        let identities = workload("identities", opts.identities, opts.identities_qps)?;
        let endpoints = workload("endpoints", opts.endpoints, opts.endpoints_qps)?;
        let services = workload("services", opts.services, opts.services_qps)?;
        if endpoints.target > 0 && (nodes.target == 0 || identities.target == 0) {
            bail!("endpoints reference nodes and identities, which must then be mocked too");
        }

        if opts.queue_size == 0 {
            bail!("queue size must be positive");
        }

        Ok(Self {
            backend,
            prefix,
            clusters: opts.clusters,
            first_cluster_id: opts.first_cluster_id,
            max_connected_clusters: opts.max_connected_clusters,
            nodes,
            identities,
            endpoints,
            services,
            enable_ipv6: opts.enable_ipv6,
            encryption: opts.encryption,
            node_annotations: opts.node_annotations.into_iter().collect(),
            random: RandomConfig {
                node_ip4: opts.random_node_ip4,
                node_ip6: opts.random_node_ip6,
                pod_ip4: opts.random_pod_ip4,
                pod_ip6: opts.random_pod_ip6,
                svc_ip4: opts.random_svc_ip4,
                svc_ip6: opts.random_svc_ip6,
                pod_cidr4: opts.random_pod_cidr4,
                pod_cidr6: opts.random_pod_cidr6,
            },
            seed: opts.seed,
            health_addr: opts.health_addr,
            heartbeat_interval: (opts.heartbeat_interval > 0)
                .then(|| Duration::from_secs(opts.heartbeat_interval)),
            queue_size: opts.queue_size,
        })
    }

    /// IDs of the mocked clusters.
    pub fn cluster_ids(&self) -> impl Iterator<Item = u32> {
        let first = self.first_cluster_id;
        (0..self.clusters).map(move |i| first + i)
    }
}

fn workload(kind: &str, target: u32, qps: f64) -> Result<Workload> {
    if !qps.is_finite() || qps < 0.0 {
        bail!("{kind} QPS must be a non negative number, got {qps}");
    }
    Ok(Workload { target, qps })
}

fn parse_key_value(s: &str) -> Result<(String, String)> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("expected key=value, got {s:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        bail!("empty key in {s:?}");
    }
    Ok((key.to_owned(), value.trim().to_owned()))
}
