//! Provider discovery engine.
//!
//! One lookup fans out into a DHT provider query plus zero-or-more background
//! per-peer address resolutions, and fans back in to a single bounded output
//! stream consumed by the HTTP handler. All three streams have capacity one,
//! so a slow consumer stalls upstream discovery instead of buffering it.
//!
//! The coordinator task owns the loop; resolver tasks only ever touch the
//! peerstore and the `fp` channel. Termination closes the output stream
//! first, then awaits resolvers, then drops the `fp` channel. A resolver for
//! a given peer is admitted at most once per attempt-cache freshness window,
//! across all concurrent lookups.

use std::sync::Arc;

use cid::Cid;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace};

use crate::addr_filter::is_publicly_dialable_addr;
use crate::attempt_cache::PeerRoutingAttemptCache;
use crate::config::GatewayConfig;
use crate::peerstore::{Peerstore, ADDRESS_TTL};
use crate::routing::{ContentRouting, PeerRecord, RoutingSelector};

/// The results of one lookup. Dropping it cancels the underlying query and
/// any in-flight resolvers.
pub struct ProviderStream {
    records: mpsc::Receiver<PeerRecord>,
    _guard: DropGuard,
}

impl ProviderStream {
    /// Receives the next enriched provider record; `None` means the lookup
    /// has terminated.
    pub async fn recv(&mut self) -> Option<PeerRecord> {
        self.records.recv().await
    }
}

pub struct DiscoveryEngine<R> {
    routing: RoutingSelector<R>,
    peerstore: Arc<Peerstore>,
    attempts: Arc<PeerRoutingAttemptCache>,
    addr_filter_disabled: bool,
    find_providers_limit: usize,
    shutdown: CancellationToken,
}

impl<R: ContentRouting> DiscoveryEngine<R> {
    pub fn new(
        config: &GatewayConfig,
        routing: RoutingSelector<R>,
        peerstore: Arc<Peerstore>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            routing,
            peerstore,
            attempts: Arc::new(PeerRoutingAttemptCache::new(
                config.pr_attempt_cache_max_size,
                config.pr_attempt_cache_max_age,
            )),
            addr_filter_disabled: config.addr_filter_disabled,
            find_providers_limit: config.find_providers_limit,
            shutdown,
        }
    }

    /// Starts a cascading provider lookup for `key`. Records arrive on the
    /// returned stream as they are discovered and enriched, in production
    /// order; the stream ends when the query is exhausted, the lookup is
    /// cancelled, or the process shuts down.
    pub fn cascade_find_providers(&self, key: Cid) -> ProviderStream {
        let cancel = self.shutdown.child_token();
        let (out_tx, out_rx) = mpsc::channel(1);

        let coordinator = Coordinator {
            routing: self.routing.clone(),
            peerstore: Arc::clone(&self.peerstore),
            attempts: Arc::clone(&self.attempts),
            addr_filter_disabled: self.addr_filter_disabled,
            limit: self.find_providers_limit,
            cancel: cancel.clone(),
        };
        let _ = tokio::spawn(coordinator.run(key, out_tx));

        ProviderStream {
            records: out_rx,
            _guard: cancel.drop_guard(),
        }
    }
}

struct Coordinator<R> {
    routing: RoutingSelector<R>,
    peerstore: Arc<Peerstore>,
    attempts: Arc<PeerRoutingAttemptCache>,
    addr_filter_disabled: bool,
    limit: usize,
    cancel: CancellationToken,
}

impl<R: ContentRouting> Coordinator<R> {
    async fn run(self, key: Cid, out_tx: mpsc::Sender<PeerRecord>) {
        let mut dht_rx = match self.routing.selected().find_providers(key, self.limit).await {
            Ok(rx) => rx,
            Err(e) => {
                debug!(key = %key, err = %e, "failed to start provider query");
                return;
            }
        };

        let (fp_tx, mut fp_rx) = mpsc::channel::<PeerRecord>(1);
        let mut resolvers: JoinSet<()> = JoinSet::new();

        // Dropped once the DHT stream is exhausted; no resolver spawns after
        // that, so `fp_rx` ends when the last in-flight resolver finishes.
        let mut fp_tx = Some(fp_tx);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                resolved = fp_rx.recv() => {
                    let Some(record) = resolved else { break };
                    if !self.filter_and_deliver(record, &out_tx).await {
                        break;
                    }
                }
                found = dht_rx.recv(), if fp_tx.is_some() => {
                    let Some(mut record) = found else {
                        fp_tx = None;
                        continue;
                    };
                    if record.addrs.is_empty() {
                        record.addrs = self.peerstore.addrs(&record.peer_id);
                    }
                    if record.addrs.is_empty() {
                        if self.attempts.attempt(record.peer_id) {
                            if let Some(fp_tx) = &fp_tx {
                                self.spawn_resolver(&mut resolvers, record.peer_id, fp_tx.clone());
                            }
                        } else {
                            trace!(peer = %record.peer_id, "skipped recently attempted peer routing");
                        }
                        continue;
                    }
                    if !self.filter_and_deliver(record, &out_tx).await {
                        break;
                    }
                }
            }
        }

        // Signal end-of-results before waiting out the stragglers; resolvers
        // unblock via the cancellation the consumer triggers on drop.
        drop(out_tx);
        while resolvers.join_next().await.is_some() {}
        drop(fp_rx);
    }

    /// Applies the public-address filter and delivers the record, blocking on
    /// the consumer. Returns false when the loop should terminate.
    async fn filter_and_deliver(&self, record: PeerRecord, out_tx: &mpsc::Sender<PeerRecord>) -> bool {
        let record = if self.addr_filter_disabled {
            record
        } else {
            let addrs: Vec<_> = record
                .addrs
                .into_iter()
                .filter(is_publicly_dialable_addr)
                .collect();
            if addrs.is_empty() {
                debug!(peer = %record.peer_id, "dropped provider with no publicly dialable addrs");
                return true;
            }
            PeerRecord::new(record.peer_id, addrs)
        };
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = out_tx.send(record) => sent.is_ok(),
        }
    }

    fn spawn_resolver(
        &self,
        resolvers: &mut JoinSet<()>,
        peer_id: libp2p::PeerId,
        fp_tx: mpsc::Sender<PeerRecord>,
    ) {
        let routing = self.routing.clone();
        let peerstore = Arc::clone(&self.peerstore);
        let cancel = self.cancel.clone();
        let _ = resolvers.spawn(async move {
            let found = tokio::select! {
                _ = cancel.cancelled() => return,
                found = routing.selected().find_peer(peer_id) => found,
            };
            match found {
                Ok(record) if !record.addrs.is_empty() => {
                    peerstore.add_addrs(&peer_id, record.addrs.iter().cloned(), ADDRESS_TTL);
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = fp_tx.send(record) => {}
                    }
                }
                Ok(_) => debug!(peer = %peer_id, "peer routing found no addrs"),
                Err(e) => debug!(peer = %peer_id, err = %e, "failed to find peer"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use libp2p::PeerId;
    use multiaddr::Multiaddr;
    use multihash::Multihash;

    use super::*;

    struct StubRouting {
        providers: Mutex<Vec<PeerRecord>>,
        peers: HashMap<PeerId, Vec<Multiaddr>>,
        find_peer_calls: AtomicUsize,
    }

    impl StubRouting {
        fn new(providers: Vec<PeerRecord>) -> Self {
            Self {
                providers: Mutex::new(providers),
                peers: HashMap::new(),
                find_peer_calls: AtomicUsize::new(0),
            }
        }

        fn with_peer(mut self, peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
            let _ = self.peers.insert(peer_id, addrs);
            self
        }
    }

    #[async_trait]
    impl ContentRouting for StubRouting {
        async fn find_providers(
            &self,
            _key: Cid,
            limit: usize,
        ) -> Result<mpsc::Receiver<PeerRecord>> {
            let mut providers = self
                .providers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone();
            if limit > 0 {
                providers.truncate(limit);
            }
            let (tx, rx) = mpsc::channel(1);
            let _ = tokio::spawn(async move {
                for record in providers {
                    if tx.send(record).await.is_err() {
                        break;
                    }
                }
            });
            Ok(rx)
        }

        async fn find_peer(&self, peer_id: PeerId) -> Result<PeerRecord> {
            let _ = self.find_peer_calls.fetch_add(1, Ordering::SeqCst);
            match self.peers.get(&peer_id) {
                Some(addrs) => Ok(PeerRecord::new(peer_id, addrs.clone())),
                None => Err(anyhow!("peer not found")),
            }
        }

        fn ready(&self) -> bool {
            true
        }
    }

    fn engine_over(routing: StubRouting, config: GatewayConfig) -> DiscoveryEngine<StubRouting> {
        DiscoveryEngine::new(
            &config,
            RoutingSelector::new(Arc::new(routing), None),
            Arc::new(Peerstore::new()),
            CancellationToken::new(),
        )
    }

    fn key() -> Cid {
        Cid::new_v1(0x55, Multihash::wrap(0x12, &[9u8; 32]).expect("digest fits"))
    }

    fn addr(s: &str) -> Multiaddr {
        s.parse().expect("valid multiaddr")
    }

    async fn collect(stream: &mut ProviderStream) -> Vec<PeerRecord> {
        let mut records = Vec::new();
        while let Some(record) = stream.recv().await {
            records.push(record);
        }
        records
    }

    #[tokio::test]
    async fn preserves_production_order_for_addressed_providers() {
        let providers: Vec<_> = (0..4)
            .map(|i| PeerRecord::new(PeerId::random(), vec![addr(&format!("/ip4/1.2.3.{i}/tcp/4001"))]))
            .collect();
        let engine = engine_over(StubRouting::new(providers.clone()), GatewayConfig::default());

        let mut stream = engine.cascade_find_providers(key());
        assert_eq!(collect(&mut stream).await, providers);
    }

    #[tokio::test]
    async fn enriches_addressless_provider_through_peer_routing() {
        let lonely = PeerId::random();
        let public = addr("/ip4/5.6.7.8/tcp/4001");
        let routing = StubRouting::new(vec![PeerRecord::new(lonely, Vec::new())])
            .with_peer(lonely, vec![public.clone()]);
        let engine = engine_over(routing, GatewayConfig::default());

        let mut stream = engine.cascade_find_providers(key());
        let records = collect(&mut stream).await;
        assert_eq!(records, vec![PeerRecord::new(lonely, vec![public])]);
    }

    #[tokio::test]
    async fn drops_unresolvable_provider_without_failing_the_lookup() {
        let reachable = PeerRecord::new(PeerId::random(), vec![addr("/ip4/1.2.3.4/tcp/4001")]);
        let routing = StubRouting::new(vec![
            PeerRecord::new(PeerId::random(), Vec::new()),
            reachable.clone(),
        ]);
        let engine = engine_over(routing, GatewayConfig::default());

        let mut stream = engine.cascade_find_providers(key());
        assert_eq!(collect(&mut stream).await, vec![reachable]);
    }

    #[tokio::test]
    async fn attempt_cache_admits_one_resolution_per_window() {
        let lonely = PeerId::random();
        let routing = Arc::new(StubRouting::new(vec![PeerRecord::new(lonely, Vec::new())]));
        let engine = DiscoveryEngine::new(
            &GatewayConfig::default(),
            RoutingSelector::new(Arc::clone(&routing), None),
            Arc::new(Peerstore::new()),
            CancellationToken::new(),
        );

        let mut first = engine.cascade_find_providers(key());
        let mut second = engine.cascade_find_providers(key());
        let (first, second) = tokio::join!(collect(&mut first), collect(&mut second));
        assert!(first.is_empty());
        assert!(second.is_empty());
        assert_eq!(routing.find_peer_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn filters_non_public_addrs_unless_disabled() {
        let peer = PeerId::random();
        let public = addr("/ip4/1.2.3.4/tcp/4001");
        let loopback = addr("/ip4/127.0.0.1/tcp/4001");
        let provider = PeerRecord::new(peer, vec![public.clone(), loopback.clone()]);

        let engine = engine_over(StubRouting::new(vec![provider.clone()]), GatewayConfig::default());
        let mut stream = engine.cascade_find_providers(key());
        assert_eq!(
            collect(&mut stream).await,
            vec![PeerRecord::new(peer, vec![public.clone()])]
        );

        let engine = engine_over(
            StubRouting::new(vec![provider.clone()]),
            GatewayConfig::default().with_addr_filter_disabled(true),
        );
        let mut stream = engine.cascade_find_providers(key());
        assert_eq!(collect(&mut stream).await, vec![provider]);
    }

    #[tokio::test]
    async fn provider_with_only_local_addrs_is_dropped_entirely() {
        let provider = PeerRecord::new(PeerId::random(), vec![addr("/ip4/127.0.0.1/tcp/4001")]);
        let engine = engine_over(StubRouting::new(vec![provider]), GatewayConfig::default());

        let mut stream = engine.cascade_find_providers(key());
        assert!(collect(&mut stream).await.is_empty());
    }

    #[tokio::test]
    async fn honors_find_providers_limit() {
        let providers: Vec<_> = (0..5)
            .map(|i| PeerRecord::new(PeerId::random(), vec![addr(&format!("/ip4/1.2.3.{i}/tcp/4001"))]))
            .collect();
        let engine = engine_over(
            StubRouting::new(providers),
            GatewayConfig::default().with_find_providers_limit(1),
        );

        let mut stream = engine.cascade_find_providers(key());
        assert_eq!(collect(&mut stream).await.len(), 1);
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_the_lookup() {
        let providers: Vec<_> = (0..64)
            .map(|_| PeerRecord::new(PeerId::random(), vec![addr("/ip4/1.2.3.4/tcp/4001")]))
            .collect();
        let engine = engine_over(StubRouting::new(providers), GatewayConfig::default());

        let mut stream = engine.cascade_find_providers(key());
        let _ = stream.recv().await.expect("first record");
        drop(stream);

        // The coordinator observes the cancellation and stops pulling; give
        // it a moment and verify nothing deadlocks.
        tokio::time::timeout(Duration::from_secs(1), tokio::task::yield_now())
            .await
            .expect("no deadlock");
    }

    #[tokio::test]
    async fn process_shutdown_ends_open_lookups() {
        let shutdown = CancellationToken::new();
        // A provider stream that never terminates on its own.
        struct HangingRouting;
        #[async_trait]
        impl ContentRouting for HangingRouting {
            async fn find_providers(
                &self,
                _key: Cid,
                _limit: usize,
            ) -> Result<mpsc::Receiver<PeerRecord>> {
                let (tx, rx) = mpsc::channel(1);
                let _ = tokio::spawn(async move {
                    let () = std::future::pending().await;
                    drop(tx);
                });
                Ok(rx)
            }
            async fn find_peer(&self, _peer_id: PeerId) -> Result<PeerRecord> {
                Err(anyhow!("unreachable"))
            }
            fn ready(&self) -> bool {
                true
            }
        }

        let engine = DiscoveryEngine::new(
            &GatewayConfig::default(),
            RoutingSelector::new(Arc::new(HangingRouting), None),
            Arc::new(Peerstore::new()),
            shutdown.clone(),
        );

        let mut stream = engine.cascade_find_providers(key());
        shutdown.cancel();
        let ended = tokio::time::timeout(Duration::from_secs(1), stream.recv())
            .await
            .expect("stream ends on shutdown");
        assert!(ended.is_none());
    }
}
