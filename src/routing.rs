//! Content-routing contract consumed by the discovery engine.
//!
//! The trait is defined separately from its implementations so the engine
//! and HTTP layer can be exercised against deterministic in-process routers
//! in tests, while production wires in the kad-backed swarm actor.

use anyhow::Result;
use async_trait::async_trait;
use cid::Cid;
use libp2p::PeerId;
use multiaddr::Multiaddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A peer known to serve some content-addressed data, together with the
/// addresses it is reachable on. The address list may be empty on arrival
/// from the DHT; the discovery engine enriches it before emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerRecord {
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer_id, addrs }
    }
}

/// Asynchronous provider and peer lookup against a content-routing overlay.
#[async_trait]
pub trait ContentRouting: Send + Sync + 'static {
    /// Starts a provider query for `key` and returns the stream of records
    /// as they are discovered. `limit` caps the number of records; zero
    /// means unbounded. Dropping the receiver aborts the query.
    async fn find_providers(&self, key: Cid, limit: usize) -> Result<mpsc::Receiver<PeerRecord>>;

    /// Resolves the addresses of a single peer.
    async fn find_peer(&self, peer_id: PeerId) -> Result<PeerRecord>;

    /// Whether this client is warmed up enough to serve queries. Only the
    /// accelerated client ever reports false.
    fn ready(&self) -> bool;
}

/// Picks between the standard and the accelerated routing client.
///
/// The accelerated client is preferred whenever it is configured and reports
/// ready; selection is re-evaluated on every call.
pub struct RoutingSelector<R> {
    standard: Arc<R>,
    accelerated: Option<Arc<R>>,
}

impl<R> Clone for RoutingSelector<R> {
    fn clone(&self) -> Self {
        Self {
            standard: Arc::clone(&self.standard),
            accelerated: self.accelerated.as_ref().map(Arc::clone),
        }
    }
}

impl<R: ContentRouting> RoutingSelector<R> {
    pub fn new(standard: Arc<R>, accelerated: Option<Arc<R>>) -> Self {
        Self {
            standard,
            accelerated,
        }
    }

    pub fn selected(&self) -> &Arc<R> {
        match &self.accelerated {
            Some(accelerated) if accelerated.ready() => accelerated,
            _ => &self.standard,
        }
    }
}
