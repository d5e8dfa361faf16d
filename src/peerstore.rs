//! In-memory peer address book with per-address expiry.
//!
//! The swarm actor feeds it from identify exchanges and routing-table
//! updates; the discovery engine reads it to enrich provider records that
//! arrive without addresses, and writes back addresses recovered by
//! background peer resolution.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use libp2p::PeerId;
use lru::LruCache;
use multiaddr::Multiaddr;
use tokio::time::Instant;

/// TTL applied to addresses learned through peer routing.
pub const ADDRESS_TTL: Duration = Duration::from_secs(60 * 60);

/// Peers tracked at most; least-recently-used entries are evicted.
const MAX_TRACKED_PEERS: usize = 8 * 1024;

struct AddrEntry {
    addr: Multiaddr,
    expires_at: Instant,
}

pub struct Peerstore {
    peers: Mutex<LruCache<PeerId, Vec<AddrEntry>>>,
}

impl Default for Peerstore {
    fn default() -> Self {
        Self::new()
    }
}

impl Peerstore {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_TRACKED_PEERS).expect("capacity is non-zero"),
            )),
        }
    }

    /// Returns the unexpired addresses known for `peer_id`.
    pub fn addrs(&self, peer_id: &PeerId) -> Vec<Multiaddr> {
        let now = Instant::now();
        let mut peers = self
            .peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(entries) = peers.get_mut(peer_id) else {
            return Vec::new();
        };
        entries.retain(|entry| entry.expires_at > now);
        if entries.is_empty() {
            let _ = peers.pop(peer_id);
            return Vec::new();
        }
        entries.iter().map(|entry| entry.addr.clone()).collect()
    }

    /// Merges `addrs` for `peer_id`, extending the expiry of already-known
    /// addresses to at least `now + ttl`.
    pub fn add_addrs(&self, peer_id: &PeerId, addrs: impl IntoIterator<Item = Multiaddr>, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        let mut peers = self
            .peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entries = peers.get_or_insert_mut(*peer_id, Vec::new);
        for addr in addrs {
            match entries.iter_mut().find(|entry| entry.addr == addr) {
                Some(entry) => entry.expires_at = entry.expires_at.max(expires_at),
                None => entries.push(AddrEntry { addr, expires_at }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Multiaddr {
        s.parse().expect("valid multiaddr")
    }

    #[test]
    fn unknown_peer_has_no_addrs() {
        let store = Peerstore::new();
        assert!(store.addrs(&PeerId::random()).is_empty());
    }

    #[test]
    fn added_addrs_are_returned_and_deduplicated() {
        let store = Peerstore::new();
        let peer = PeerId::random();
        let a = addr("/ip4/1.2.3.4/tcp/4001");

        store.add_addrs(&peer, [a.clone(), a.clone()], ADDRESS_TTL);
        store.add_addrs(&peer, [a.clone()], ADDRESS_TTL);

        assert_eq!(store.addrs(&peer), vec![a]);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_addrs_are_pruned() {
        let store = Peerstore::new();
        let peer = PeerId::random();

        store.add_addrs(&peer, [addr("/ip4/1.2.3.4/tcp/4001")], Duration::from_secs(1));
        assert_eq!(store.addrs(&peer).len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.addrs(&peer).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_extends_expiry() {
        let store = Peerstore::new();
        let peer = PeerId::random();
        let a = addr("/ip4/1.2.3.4/tcp/4001");

        store.add_addrs(&peer, [a.clone()], Duration::from_secs(1));
        tokio::time::advance(Duration::from_millis(500)).await;
        store.add_addrs(&peer, [a.clone()], Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(store.addrs(&peer), vec![a]);
    }
}
