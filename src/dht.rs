//! The adapter between the engine and a Kademlia DHT node.
//!
//! The DHT implementation itself (routing table, RPCs) is a collaborator
//! behind the [`DhtBackend`] contract; this module owns what the engine
//! needs from it: announcing the info hash and funneling discovered peers
//! into the session, pinging remotes learned through PORT messages, and
//! filtering announce traffic.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::{addr::ScionAddr, error::*, peer::Peer, Sha1Hash};

/// How often the announcement is refreshed so we do not become questionable
/// to other nodes and keep receiving fresh peers.
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// A peer as reported by the DHT.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhtPeer {
    pub ia: String,
    pub host: String,
    pub port: u16,
}

impl DhtPeer {
    pub fn addr(&self) -> ScionAddr {
        ScionAddr::new(self.ia.clone(), self.host.clone(), self.port)
    }
}

/// One announce traversal: a stream of discovered peers. Dropping it closes
/// the traversal.
pub struct AnnounceTraversal {
    pub peers: UnboundedReceiver<DhtPeer>,
}

impl AnnounceTraversal {
    pub fn close(self) {}
}

/// The operations the engine needs from a DHT server implementation.
pub trait DhtBackend: Send + Sync {
    /// Seeds the routing table from the given bootstrap nodes.
    fn bootstrap(&self, nodes: Vec<ScionAddr>);

    /// Announces `(info_hash, port)` and returns the traversal yielding
    /// peers for the same info hash.
    fn announce(
        &self,
        info_hash: Sha1Hash,
        port: u16,
        noseed: bool,
    ) -> Result<AnnounceTraversal>;

    /// Pings the DHT node at the given address.
    fn ping(&self, addr: &ScionAddr);

    fn close(&self);
}

/// Counters over the node's announce traffic.
#[derive(Debug, Default)]
pub struct DhtStats {
    pub announces_started: AtomicU32,
    pub announces_handled: AtomicU32,
    pub blocked_peers: AtomicU32,
    pub received_peers_while_traversing: AtomicU32,
}

/// The function invoked for every acceptable peer the DHT reports.
pub type OnNewPeerReceived = Box<dyn Fn(Peer) + Send + Sync>;

/// A DHT node bound to one torrent.
pub struct DhtNode {
    backend: Arc<dyn DhtBackend>,
    info_hash: Sha1Hash,
    node_addr: ScionAddr,
    /// The port the controlling peer listens on; announced to the DHT.
    peer_port: u16,
    stats: DhtStats,
    on_new_peer_received: OnNewPeerReceived,
    cancel: CancellationToken,
}

impl DhtNode {
    /// Creates a new DHT node: seeds the routing table, announces our
    /// presence, and keeps re-announcing every 15 minutes until closed.
    pub fn new(
        backend: Arc<dyn DhtBackend>,
        node_addr: ScionAddr,
        info_hash: Sha1Hash,
        starting_nodes: Vec<ScionAddr>,
        peer_port: u16,
        on_new_peer_received: OnNewPeerReceived,
    ) -> Arc<Self> {
        log::info!(
            "Creating dht node listening on {} with peer port {}",
            node_addr,
            peer_port
        );

        let mut bootstrap_nodes = starting_nodes;
        bootstrap_nodes.push(node_addr.clone());
        backend.bootstrap(unique_starting_nodes(bootstrap_nodes));

        let node = Arc::new(Self {
            backend,
            info_hash,
            node_addr,
            peer_port,
            stats: DhtStats::default(),
            on_new_peer_received,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(Arc::clone(&node).announce_loop());

        node
    }

    /// The port this node's DHT server listens on.
    pub fn port(&self) -> Option<u16> {
        Some(self.node_addr.port)
    }

    pub fn stats(&self) -> &DhtStats {
        &self.stats
    }

    /// Pings the DHT node at the given address, making it aware of us.
    pub fn ping(&self, addr: &ScionAddr) {
        log::debug!("Sending dht ping to {}", addr);
        self.backend.ping(addr);
    }

    /// The ingress filter for announces other nodes send us: count peers
    /// for the wrong torrent or with unusable ports, act on none of them
    /// (peers are only adopted from our own traversals).
    pub fn handle_announce_peer(
        &self,
        info_hash: Sha1Hash,
        addr: &ScionAddr,
        port: u16,
        port_ok: bool,
    ) {
        log::debug!(
            "Handling announce for {} - {} - {} - {}",
            hex::encode(info_hash),
            addr,
            port,
            port_ok
        );
        if info_hash != self.info_hash || !port_ok || port == 0 {
            self.stats.blocked_peers.fetch_add(1, Ordering::Relaxed);
            log::info!("Rejected announced peer {}", addr);
            return;
        }
        self.stats.announces_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn close(&self) {
        self.cancel.cancel();
        log::info!("Dht stats: {:?}", self.stats);
        self.backend.close();
    }

    /// Announce every 15 minutes; each period the previous traversal is
    /// closed and a fresh one opened so the peer stream stays fresh.
    async fn announce_loop(self: Arc<Self>) {
        let mut traversal = self.start_announce();

        let start = tokio::time::Instant::now() + ANNOUNCE_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, ANNOUNCE_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(old) = traversal.take() {
                        log::info!("Closing announce traversal");
                        old.close();
                    }
                    traversal = self.start_announce();
                }
                peer = recv_peer(&mut traversal) => match peer {
                    Some(peer) => self.handle_discovered_peer(peer),
                    // stream drained; wait for the next announce period
                    None => traversal = None,
                }
            }
        }
    }

    fn start_announce(&self) -> Option<AnnounceTraversal> {
        log::info!("Announcing via dht");
        self.stats.announces_started.fetch_add(1, Ordering::Relaxed);
        match self.backend.announce(self.info_hash, self.peer_port, false) {
            Ok(traversal) => Some(traversal),
            Err(e) => {
                log::error!("Announce failed: {}", e);
                None
            }
        }
    }

    fn handle_discovered_peer(&self, peer: DhtPeer) {
        log::debug!("Handling discovered peer {:?}", peer);
        self.stats
            .received_peers_while_traversing
            .fetch_add(1, Ordering::Relaxed);

        if peer.port == 0 {
            log::info!("Received zero port peer during announcing");
            self.stats.blocked_peers.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if peer.ia == self.node_addr.ia && peer.host == self.node_addr.host {
            log::info!("Received self during announcing");
            self.stats.blocked_peers.fetch_add(1, Ordering::Relaxed);
            return;
        }

        (self.on_new_peer_received)(Peer::new(peer.addr().to_string(), 0));
    }
}

/// Waits for the next peer of the current traversal, or forever if there is
/// no live traversal.
async fn recv_peer(
    traversal: &mut Option<AnnounceTraversal>,
) -> Option<DhtPeer> {
    match traversal {
        Some(traversal) => traversal.peers.recv().await,
        None => futures::future::pending().await,
    }
}

/// Deduplicates bootstrap nodes, keeping their first occurrence.
fn unique_starting_nodes(nodes: Vec<ScionAddr>) -> Vec<ScionAddr> {
    let mut unique: Vec<ScionAddr> = Vec::with_capacity(nodes.len());
    for node in nodes {
        if !unique.contains(&node) {
            unique.push(node);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use super::*;
    use crate::testutil::StubDht;

    fn node_addr() -> ScionAddr {
        ScionAddr::new("1-ff00:0:1", "127.0.0.1", 7000)
    }

    fn spawn_node(
        backend: Arc<StubDht>,
    ) -> (Arc<DhtNode>, Arc<Mutex<Vec<Peer>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let node = DhtNode::new(
            backend,
            node_addr(),
            [7; 20],
            vec![ScionAddr::new("1-ff00:0:9", "10.0.0.9", 7000)],
            43000,
            Box::new(move |peer| sink.lock().unwrap().push(peer)),
        );
        (node, received)
    }

    #[tokio::test]
    async fn test_bootstrap_and_announce() {
        let backend = Arc::new(StubDht::default());
        let (node, _) = spawn_node(Arc::clone(&backend));
        tokio::task::yield_now().await;

        // starting nodes are deduplicated and include the local node
        let bootstraps = backend.bootstraps.lock().unwrap().clone();
        assert_eq!(bootstraps.len(), 1);
        assert_eq!(bootstraps[0].len(), 2);
        assert!(bootstraps[0].contains(&node_addr()));

        let announces = backend.announces.lock().unwrap().clone();
        assert_eq!(announces, vec![([7; 20], 43000, false)]);
        assert_eq!(
            node.stats().announces_started.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_discovered_peers_are_filtered_and_forwarded() {
        let backend = Arc::new(StubDht::default());
        let (node, received) = spawn_node(Arc::clone(&backend));
        tokio::task::yield_now().await;

        backend.feed(DhtPeer {
            ia: "1-ff00:0:2".into(),
            host: "10.0.0.2".into(),
            port: 0, // blocked: zero port
        });
        backend.feed(DhtPeer {
            ia: "1-ff00:0:1".into(),
            host: "127.0.0.1".into(),
            port: 4000, // blocked: ourselves
        });
        backend.feed(DhtPeer {
            ia: "1-ff00:0:2".into(),
            host: "10.0.0.2".into(),
            port: 43000,
        });
        // let the announce loop drain the feed
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::timeout(Duration::from_secs(1), async {
            while received.lock().unwrap().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(
            received[0],
            Peer::new("1-ff00:0:2,[10.0.0.2]:43000", 0)
        );
        assert_eq!(node.stats().blocked_peers.load(Ordering::Relaxed), 2);
        assert_eq!(
            node.stats()
                .received_peers_while_traversing
                .load(Ordering::Relaxed),
            3
        );
    }

    #[tokio::test]
    async fn test_announce_ingress_filter() {
        let backend = Arc::new(StubDht::default());
        let (node, _) = spawn_node(backend);

        let remote = ScionAddr::new("1-ff00:0:2", "10.0.0.2", 43000);
        node.handle_announce_peer([0; 20], &remote, 43000, true);
        node.handle_announce_peer([7; 20], &remote, 0, true);
        node.handle_announce_peer([7; 20], &remote, 43000, false);
        node.handle_announce_peer([7; 20], &remote, 43000, true);

        assert_eq!(node.stats().blocked_peers.load(Ordering::Relaxed), 3);
        assert_eq!(node.stats().announces_handled.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_port_and_close() {
        let backend = Arc::new(StubDht::default());
        let (node, _) = spawn_node(Arc::clone(&backend));
        assert_eq!(node.port(), Some(7000));

        node.close();
        assert!(backend.closed.load(Ordering::Relaxed));
    }

    #[test]
    fn test_unique_starting_nodes() {
        let a = ScionAddr::new("1-ff00:0:1", "10.0.0.1", 7000);
        let b = ScionAddr::new("1-ff00:0:2", "10.0.0.2", 7000);
        let unique =
            unique_starting_nodes(vec![a.clone(), b.clone(), a.clone()]);
        assert_eq!(unique, vec![a, b]);
    }
}
