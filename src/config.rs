//! Gateway configuration.
//!
//! All runtime knobs live in [`GatewayConfig`]. The struct carries plain
//! public fields with sensible defaults plus `with_*` setters for the
//! builder-style call sites in `main` and in tests.

use std::net::SocketAddr;
use std::time::Duration;

use multiaddr::Multiaddr;

/// Default public IPFS bootstrap peers, used when none are configured.
pub const DEFAULT_BOOTSTRAP_PEERS: &[&str] = &[
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
    "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
    "/ip4/104.131.131.82/udp/4001/quic-v1/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
];

/// Default libp2p listen addresses for the gateway host.
pub const DEFAULT_P2P_LISTEN_ADDRS: &[&str] =
    &["/ip4/0.0.0.0/tcp/0", "/ip4/0.0.0.0/udp/0/quic-v1"];

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// TCP endpoint the HTTP gateway listens on.
    pub http_listen_addr: SocketAddr,
    /// Value of the `Access-Control-Allow-Origin` header.
    pub http_allow_origin: String,
    /// Prefer buffered JSON over NDJSON when the client accepts `*/*`.
    pub http_response_prefer_json: bool,
    /// Run a second, eagerly-refreshed DHT client and use it once warm.
    pub use_accelerated_dht: bool,
    /// Cascade label this instance advertises.
    pub ipni_cascade_label: String,
    /// Reject lookups lacking a matching `?cascade=` query parameter.
    pub ipni_require_cascade_query_param: bool,
    /// Skip the public-dialability address filter.
    pub addr_filter_disabled: bool,
    /// Maximum providers requested from the DHT; zero means unbounded.
    pub find_providers_limit: usize,
    /// Capacity of the peer-routing attempt cache.
    pub pr_attempt_cache_max_size: usize,
    /// Freshness window of the peer-routing attempt cache.
    pub pr_attempt_cache_max_age: Duration,
    /// Initial DHT contacts.
    pub bootstrap_peers: Vec<Multiaddr>,
    /// libp2p listen multiaddrs for the gateway host.
    pub p2p_listen_addrs: Vec<Multiaddr>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_listen_addr: "0.0.0.0:40080".parse().expect("static addr parses"),
            http_allow_origin: "*".to_string(),
            http_response_prefer_json: false,
            use_accelerated_dht: false,
            ipni_cascade_label: "ipfs-dht".to_string(),
            ipni_require_cascade_query_param: false,
            addr_filter_disabled: false,
            find_providers_limit: 0,
            pr_attempt_cache_max_size: 1024,
            pr_attempt_cache_max_age: Duration::from_secs(20 * 60),
            bootstrap_peers: parse_static_addrs(DEFAULT_BOOTSTRAP_PEERS),
            p2p_listen_addrs: parse_static_addrs(DEFAULT_P2P_LISTEN_ADDRS),
        }
    }
}

impl GatewayConfig {
    pub fn with_http_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.http_listen_addr = addr;
        self
    }

    pub fn with_http_allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.http_allow_origin = origin.into();
        self
    }

    pub fn with_http_response_prefer_json(mut self, prefer: bool) -> Self {
        self.http_response_prefer_json = prefer;
        self
    }

    pub fn with_use_accelerated_dht(mut self, use_acc: bool) -> Self {
        self.use_accelerated_dht = use_acc;
        self
    }

    pub fn with_ipni_cascade_label(mut self, label: impl Into<String>) -> Self {
        self.ipni_cascade_label = label.into();
        self
    }

    pub fn with_ipni_require_cascade_query_param(mut self, require: bool) -> Self {
        self.ipni_require_cascade_query_param = require;
        self
    }

    pub fn with_addr_filter_disabled(mut self, disabled: bool) -> Self {
        self.addr_filter_disabled = disabled;
        self
    }

    pub fn with_find_providers_limit(mut self, limit: usize) -> Self {
        self.find_providers_limit = limit;
        self
    }

    pub fn with_pr_attempt_cache(mut self, max_size: usize, max_age: Duration) -> Self {
        self.pr_attempt_cache_max_size = max_size;
        self.pr_attempt_cache_max_age = max_age;
        self
    }

    pub fn with_bootstrap_peers(mut self, peers: Vec<Multiaddr>) -> Self {
        self.bootstrap_peers = peers;
        self
    }

    pub fn with_p2p_listen_addrs(mut self, addrs: Vec<Multiaddr>) -> Self {
        self.p2p_listen_addrs = addrs;
        self
    }
}

fn parse_static_addrs(addrs: &[&str]) -> Vec<Multiaddr> {
    addrs
        .iter()
        .map(|a| a.parse().expect("static multiaddr parses"))
        .collect()
}
