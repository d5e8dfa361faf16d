//! Peer-routing attempt cache.
//!
//! Address resolution for a provider with no known addresses is a full DHT
//! walk. This cache remembers when the gateway last tried one for a given
//! peer and gates retries to at most once per freshness window, bounding the
//! blast radius of popular-but-unreachable providers across concurrent
//! lookups.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use libp2p::PeerId;
use lru::LruCache;
use tokio::time::Instant;

pub struct PeerRoutingAttemptCache {
    attempts: Mutex<LruCache<PeerId, Instant>>,
    max_age: Duration,
}

impl PeerRoutingAttemptCache {
    pub fn new(max_entries: usize, max_age: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).expect("capacity is at least one");
        Self {
            attempts: Mutex::new(LruCache::new(capacity)),
            max_age,
        }
    }

    /// Returns true iff the caller should attempt address resolution for
    /// `peer_id`: no attempt is on record, or the last one has aged out.
    /// A true return records the attempt; a false return leaves the recorded
    /// timestamp untouched.
    pub fn attempt(&self, peer_id: PeerId) -> bool {
        let mut attempts = self
            .attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(at) = attempts.get(&peer_id) {
            if at.elapsed() < self.max_age {
                return false;
            }
        }
        let _ = attempts.put(peer_id, Instant::now());
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
