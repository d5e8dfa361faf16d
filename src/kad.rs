//! Kademlia-backed content routing.
//!
//! A [`KadRouter`] is a cheap-to-clone handle over a swarm actor that owns
//! the libp2p stack. Callers talk to it through an async command channel;
//! the actor drives the swarm event loop, tracks outstanding queries by
//! `QueryId`, and feeds discovered peer addresses into the shared
//! [`Peerstore`].
//!
//! Two router variants exist. The standard client answers queries against
//! whatever routing table it has. The accelerated client refreshes its table
//! eagerly and reports `ready()` only once the initial refresh completed, so
//! the selector can fall back to the standard client while it warms up.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use cid::Cid;
use futures::StreamExt;
use libp2p::identify;
use libp2p::kad::{self, store::MemoryStore, QueryId, RecordKey};
use libp2p::swarm::{NetworkBehaviour, Swarm, SwarmEvent};
use libp2p::{noise, tcp, tls, yamux, PeerId, StreamProtocol, SwarmBuilder};
use multiaddr::Protocol;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::peerstore::{Peerstore, ADDRESS_TTL};
use crate::routing::{ContentRouting, PeerRecord};

const PROTOCOL_VERSION: &str = concat!("/", env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

const IPFS_KAD_PROTO_NAME: StreamProtocol = StreamProtocol::new("/ipfs/kad/1.0.0");

/// Refresh cadence of the accelerated client's routing table.
const ACCELERATED_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterMode {
    Standard,
    Accelerated,
}

#[derive(NetworkBehaviour)]
struct Behaviour {
    kad: kad::Behaviour<MemoryStore>,
    identify: identify::Behaviour,
}

/// Handle to a swarm actor serving DHT queries.
#[derive(Clone)]
pub struct KadRouter {
    cmd_tx: mpsc::Sender<Command>,
    warmed: Arc<AtomicBool>,
    mode: RouterMode,
}

enum Command {
    FindProviders {
        key: RecordKey,
        limit: usize,
        tx: mpsc::UnboundedSender<PeerRecord>,
    },
    FindPeer {
        peer_id: PeerId,
        reply: oneshot::Sender<Result<PeerRecord>>,
    },
    Shutdown,
}

impl KadRouter {
    /// Builds the libp2p host and spawns the swarm actor.
    pub fn spawn(config: &GatewayConfig, mode: RouterMode, peerstore: Arc<Peerstore>) -> Result<Self> {
        let bootstrap_peers = {
            let mut peers = Vec::with_capacity(config.bootstrap_peers.len());
            for addr in &config.bootstrap_peers {
                let mut dial_addr = addr.clone();
                let Some(Protocol::P2p(peer_id)) = dial_addr.pop() else {
                    return Err(anyhow!("bootstrap peer {addr} does not end in /p2p/<peer-id>"));
                };
                peers.push((peer_id, dial_addr));
            }
            peers
        };

        let mut swarm = SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                (tls::Config::new, noise::Config::new),
                yamux::Config::default,
            )?
            .with_quic()
            .with_dns()?
            .with_behaviour(|key| {
                let peer_id = key.public().to_peer_id();
                let mut kad_config = kad::Config::new(IPFS_KAD_PROTO_NAME);
                if mode == RouterMode::Accelerated {
                    let _ = kad_config
                        .set_periodic_bootstrap_interval(Some(ACCELERATED_REFRESH_INTERVAL));
                }
                let mut kad = kad::Behaviour::with_config(
                    peer_id,
                    MemoryStore::new(peer_id),
                    kad_config,
                );
                kad.set_mode(Some(kad::Mode::Client));

                for (peer_id, addr) in &bootstrap_peers {
                    let _ = kad.add_address(peer_id, addr.clone());
                }
                if let Err(err) = kad.bootstrap() {
                    warn!(%err, "failed to bootstrap kademlia");
                }

                Behaviour {
                    kad,
                    identify: identify::Behaviour::new(
                        identify::Config::new(PROTOCOL_VERSION.to_owned(), key.public())
                            .with_agent_version(format!(
                                "{}/{}",
                                env!("CARGO_PKG_NAME"),
                                env!("CARGO_PKG_VERSION")
                            )),
                    ),
                }
            })?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
            .build();

        for addr in &config.p2p_listen_addrs {
            let _ = swarm
                .listen_on(addr.clone())
                .map_err(|e| anyhow!("failed to listen on {addr}: {e}"))?;
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let warmed = Arc::new(AtomicBool::new(false));

        let actor = SwarmActor {
            swarm,
            peerstore,
            cmd_rx,
            warmed: Arc::clone(&warmed),
            pending_providers: HashMap::new(),
            pending_find_peer: HashMap::new(),
        };
        let _ = tokio::spawn(actor.run());

        info!(?mode, "dht client started");
        Ok(Self {
            cmd_tx,
            warmed,
            mode,
        })
    }

    /// Stops the swarm actor; outstanding queries end with their channels.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }
}

#[async_trait]
impl ContentRouting for KadRouter {
    async fn find_providers(&self, key: Cid, limit: usize) -> Result<mpsc::Receiver<PeerRecord>> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        self.cmd_tx
            .send(Command::FindProviders {
                // Provider records are keyed by the multihash, not the CID.
                key: RecordKey::new(&key.hash().to_bytes()),
                limit,
                tx: raw_tx,
            })
            .await
            .map_err(|_| anyhow!("router is shut down"))?;

        // Bridge the actor's non-blocking emission into the bounded stream
        // the engine consumes; dropping the receiver tears the query down.
        let (out_tx, out_rx) = mpsc::channel(1);
        let _ = tokio::spawn(async move {
            while let Some(record) = raw_rx.recv().await {
                if out_tx.send(record).await.is_err() {
                    break;
                }
            }
        });
        Ok(out_rx)
    }

    async fn find_peer(&self, peer_id: PeerId) -> Result<PeerRecord> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::FindPeer {
                peer_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow!("router is shut down"))?;
        reply_rx.await.map_err(|_| anyhow!("router is shut down"))?
    }

    fn ready(&self) -> bool {
        match self.mode {
            RouterMode::Standard => true,
            RouterMode::Accelerated => self.warmed.load(Ordering::Acquire),
        }
    }
}

struct ProviderQuery {
    tx: mpsc::UnboundedSender<PeerRecord>,
    seen: HashSet<PeerId>,
    remaining: Option<usize>,
}

struct FindPeerQuery {
    target: PeerId,
    reply: oneshot::Sender<Result<PeerRecord>>,
}

struct SwarmActor {
    swarm: Swarm<Behaviour>,
    peerstore: Arc<Peerstore>,
    cmd_rx: mpsc::Receiver<Command>,
    warmed: Arc<AtomicBool>,
    pending_providers: HashMap<QueryId, ProviderQuery>,
    pending_find_peer: HashMap<QueryId, FindPeerQuery>,
}

impl SwarmActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(Command::FindProviders { key, limit, tx }) => {
                        let id = self.swarm.behaviour_mut().kad.get_providers(key);
                        let _ = self.pending_providers.insert(id, ProviderQuery {
                            tx,
                            seen: HashSet::new(),
                            remaining: (limit > 0).then_some(limit),
                        });
                    }
                    Some(Command::FindPeer { peer_id, reply }) => {
                        let id = self.swarm.behaviour_mut().kad.get_closest_peers(peer_id);
                        let _ = self.pending_find_peer.insert(id, FindPeerQuery {
                            target: peer_id,
                            reply,
                        });
                    }
                    Some(Command::Shutdown) | None => break,
                },
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(BehaviourEvent::Kad(event)) => self.handle_kad_event(event),
            SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                self.peerstore
                    .add_addrs(&peer_id, info.listen_addrs.iter().cloned(), ADDRESS_TTL);
                for addr in info.listen_addrs {
                    let _ = self.swarm.behaviour_mut().kad.add_address(&peer_id, addr);
                }
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                debug!(%address, "listening");
            }
            _ => {}
        }
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::OutboundQueryProgressed { id, result, step, .. } => match result {
                kad::QueryResult::GetProviders(result) => {
                    match result {
                        Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) => {
                            self.forward_providers(id, providers);
                        }
                        Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => {}
                        Err(e) => {
                            debug!(query = ?id, err = %e, "provider query failed");
                        }
                    }
                    if step.last {
                        let _ = self.pending_providers.remove(&id);
                    }
                }
                kad::QueryResult::GetClosestPeers(result) => {
                    let Some(query) = self.pending_find_peer.remove(&id) else {
                        return;
                    };
                    let peers = match result {
                        Ok(kad::GetClosestPeersOk { peers, .. }) => peers,
                        Err(kad::GetClosestPeersError::Timeout { peers, .. }) => peers,
                    };
                    let found = peers
                        .into_iter()
                        .find(|info| info.peer_id == query.target && !info.addrs.is_empty());
                    let _ = query.reply.send(match found {
                        Some(info) => {
                            self.peerstore
                                .add_addrs(&query.target, info.addrs.iter().cloned(), ADDRESS_TTL);
                            Ok(PeerRecord::new(query.target, info.addrs))
                        }
                        None => Err(anyhow!("peer {} not found", query.target)),
                    });
                }
                kad::QueryResult::Bootstrap(result) => {
                    match result {
                        Ok(_) if step.last => {
                            self.warmed.store(true, Ordering::Release);
                            debug!("routing table refresh complete");
                        }
                        Ok(_) => {}
                        Err(e) => debug!(err = %e, "bootstrap query failed"),
                    }
                }
                _ => {}
            },
            kad::Event::RoutingUpdated { peer, addresses, .. } => {
                self.peerstore
                    .add_addrs(&peer, addresses.into_vec(), ADDRESS_TTL);
            }
            _ => {}
        }
    }

    /// Emits newly seen providers, enriched with peerstore addresses, and
    /// finishes the query when the caller's limit is reached or the caller
    /// has gone away.
    fn forward_providers(&mut self, id: QueryId, providers: HashSet<PeerId>) {
        let Some(query) = self.pending_providers.get_mut(&id) else {
            return;
        };
        let mut done = false;
        for peer_id in providers {
            if !query.seen.insert(peer_id) {
                continue;
            }
            let record = PeerRecord::new(peer_id, self.peerstore.addrs(&peer_id));
            if query.tx.send(record).is_err() {
                done = true;
                break;
            }
            if let Some(remaining) = query.remaining.as_mut() {
                *remaining -= 1;
                if *remaining == 0 {
                    done = true;
                    break;
                }
            }
        }
        if done {
            let _ = self.pending_providers.remove(&id);
            if let Some(mut query) = self.swarm.behaviour_mut().kad.query_mut(&id) {
                query.finish();
            }
        }
    }
}
