pub(crate) mod codec;

use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex},
};

/// Connection information for a single remote peer.
///
/// The address is a path-aware endpoint string; the index is an ordering
/// hint supplied by the discovery source and is not authoritative. Together
/// they form the peer's identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Peer {
    pub addr: String,
    pub index: u32,
}

impl Peer {
    pub fn new(addr: impl Into<String>, index: u32) -> Self {
        Self {
            addr: addr.into(),
            index,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.addr, self.index)
    }
}

/// A deduplicated set of known peers.
///
/// Cloning is shallow; all clones share the same underlying set. The DHT
/// adapter inserts peers from its own tasks while connection drivers read
/// it, so every operation locks internally.
#[derive(Clone, Debug, Default)]
pub struct PeerSet {
    peers: Arc<Mutex<HashSet<Peer>>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a peer and returns whether it was newly added. Callers use
    /// the return value to avoid spawning duplicate workers for one peer.
    pub fn add(&self, peer: Peer) -> bool {
        self.peers.lock().unwrap().insert(peer)
    }

    pub fn remove(&self, peer: &Peer) -> bool {
        self.peers.lock().unwrap().remove(peer)
    }

    pub fn contains(&self, peer: &Peer) -> bool {
        self.peers.lock().unwrap().contains(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a snapshot of the current peers.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.lock().unwrap().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_is_idempotent() {
        let peers = PeerSet::new();
        let peer = Peer::new("19-ffaa:1:c3f,[127.0.0.1]:43000", 0);

        assert!(peers.add(peer.clone()));
        assert!(!peers.add(peer.clone()));
        assert_eq!(peers.len(), 1);
        assert!(peers.contains(&peer));
    }

    #[test]
    fn test_identity_is_addr_and_index() {
        let peers = PeerSet::new();
        peers.add(Peer::new("19-ffaa:1:c3f,[127.0.0.1]:43000", 0));
        peers.add(Peer::new("19-ffaa:1:c3f,[127.0.0.1]:43000", 1));
        assert_eq!(peers.len(), 2);
    }

    #[test]
    fn test_remove() {
        let peers = PeerSet::new();
        let peer = Peer::new("19-ffaa:1:c3f,[127.0.0.1]:43000", 0);
        peers.add(peer.clone());
        assert!(peers.remove(&peer));
        assert!(!peers.remove(&peer));
        assert!(peers.is_empty());
    }

    #[test]
    fn test_clones_share_storage() {
        let peers = PeerSet::new();
        let clone = peers.clone();
        clone.add(Peer::new("19-ffaa:1:c3f,[127.0.0.1]:43000", 0));
        assert_eq!(peers.len(), 1);
    }
}
