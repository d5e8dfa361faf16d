use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use multiaddr::Multiaddr;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use cascadht::{Gateway, GatewayConfig};

#[derive(Parser, Debug)]
#[command(name = "cascadht")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// HTTP server listen address in address:port format.
    #[arg(long, default_value = "0.0.0.0:40080")]
    http_listen_addr: SocketAddr,

    /// Value of the Access-Control-Allow-Origin header.
    #[arg(long, default_value = "*")]
    http_allow_origin: String,

    /// Prefer responding with JSON instead of NDJSON when the Accept header
    /// is set to "*/*".
    #[arg(long)]
    http_response_prefer_json: bool,

    /// Use the accelerated DHT client when it is warmed up.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    use_accelerated_dht: bool,

    /// The IPNI cascade label associated to this instance.
    #[arg(long, default_value = "ipfs-dht")]
    ipni_cascade_label: String,

    /// Require an IPNI "cascade" query parameter with matching label in
    /// order to respond to lookup requests.
    #[arg(long)]
    ipni_require_cascade_query_param: bool,

    /// Skip the publicly-dialable address filter on provider records.
    #[arg(long)]
    addr_filter_disabled: bool,

    /// Maximum number of provider records to find; zero means no limit.
    #[arg(long, default_value_t = 0)]
    find_providers_limit: usize,

    /// Capacity of the peer-routing attempt cache.
    #[arg(long, default_value_t = 1024)]
    pr_attempt_cache_max_size: usize,

    /// Freshness window of the peer-routing attempt cache, in seconds.
    #[arg(long, default_value_t = 20 * 60)]
    pr_attempt_cache_max_age_secs: u64,

    /// Bootstrap peer multiaddrs, each ending in /p2p/<peer-id>. Defaults to
    /// the public IPFS bootstrap peers.
    #[arg(long = "bootstrap-peer", value_name = "MULTIADDR")]
    bootstrap_peers: Vec<Multiaddr>,

    /// libp2p host listen multiaddrs.
    #[arg(long = "p2p-listen-addr", value_name = "MULTIADDR")]
    p2p_listen_addrs: Vec<Multiaddr>,

    /// The logging level, applied when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mut config = GatewayConfig::default()
        .with_http_listen_addr(args.http_listen_addr)
        .with_http_allow_origin(args.http_allow_origin)
        .with_http_response_prefer_json(args.http_response_prefer_json)
        .with_use_accelerated_dht(args.use_accelerated_dht)
        .with_ipni_cascade_label(args.ipni_cascade_label)
        .with_ipni_require_cascade_query_param(args.ipni_require_cascade_query_param)
        .with_addr_filter_disabled(args.addr_filter_disabled)
        .with_find_providers_limit(args.find_providers_limit)
        .with_pr_attempt_cache(
            args.pr_attempt_cache_max_size,
            Duration::from_secs(args.pr_attempt_cache_max_age_secs),
        );
    if !args.bootstrap_peers.is_empty() {
        config = config.with_bootstrap_peers(args.bootstrap_peers);
    }
    if !args.p2p_listen_addrs.is_empty() {
        config = config.with_p2p_listen_addrs(args.p2p_listen_addrs);
    }

    let gateway = Gateway::start(config)
        .await
        .context("failed to start cascadht")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("terminating...");
    match gateway.shutdown().await {
        Ok(()) => info!("shut down server successfully"),
        Err(e) => warn!(err = %e, "failure occurred while shutting down server"),
    }

    Ok(())
}
