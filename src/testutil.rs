//! Shared fixtures for the engine tests.

use std::sync::{atomic::AtomicBool, Mutex};

use sha1::{Digest, Sha1};
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::{
    addr::ScionAddr,
    dht::{AnnounceTraversal, DhtBackend, DhtPeer},
    error::*,
    pathselection::{Path, PathInterface},
    Sha1Hash,
};

/// Builds a two hop path from a spec like `"a-b"`: one interface in AS `a`
/// and one in AS `b`, both with interface id 1.
pub(crate) fn path(spec: &str) -> Path {
    Path::new(
        spec.split('-')
            .map(|ia| PathInterface {
                ia: format!("1-ff00:0:{}", ia),
                id: 1,
            })
            .collect(),
    )
}

pub(crate) fn paths(specs: &[&str]) -> Vec<Path> {
    specs.iter().map(|spec| path(spec)).collect()
}

/// Deterministic pseudo random file content.
pub(crate) fn file_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// The SHA-1 digests of the content's pieces.
pub(crate) fn hash_pieces(content: &[u8], piece_len: usize) -> Vec<Sha1Hash> {
    content
        .chunks(piece_len)
        .map(|piece| Sha1::digest(piece).into())
        .collect()
}

/// A single file metainfo whose piece hashes match the given content.
pub(crate) fn sample_metainfo(
    content: &[u8],
    piece_length: u32,
) -> crate::metainfo::Metainfo {
    let pieces: Vec<u8> = hash_pieces(content, piece_length as usize)
        .iter()
        .flat_map(|hash| hash.iter().copied())
        .collect();
    let mut raw = Vec::new();
    raw.extend_from_slice(b"d4:infod6:length");
    raw.extend_from_slice(format!("i{}e", content.len()).as_bytes());
    raw.extend_from_slice(b"4:name4:file12:piece length");
    raw.extend_from_slice(format!("i{}e", piece_length).as_bytes());
    raw.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
    raw.extend_from_slice(&pieces);
    raw.extend_from_slice(b"ee");
    crate::metainfo::Metainfo::from_bytes(&raw).unwrap()
}

/// A scripted DHT backend recording every interaction.
#[derive(Default)]
pub(crate) struct StubDht {
    pub bootstraps: Mutex<Vec<Vec<ScionAddr>>>,
    pub announces: Mutex<Vec<(Sha1Hash, u16, bool)>>,
    pub pings: Mutex<Vec<ScionAddr>>,
    pub closed: AtomicBool,
    feed: Mutex<Option<UnboundedSender<DhtPeer>>>,
}

impl StubDht {
    /// Pushes a peer into the most recent announce traversal.
    pub fn feed(&self, peer: DhtPeer) {
        if let Some(tx) = &*self.feed.lock().unwrap() {
            let _ = tx.send(peer);
        }
    }

    pub fn ping_count(&self) -> usize {
        self.pings.lock().unwrap().len()
    }
}

impl DhtBackend for StubDht {
    fn bootstrap(&self, nodes: Vec<ScionAddr>) {
        self.bootstraps.lock().unwrap().push(nodes);
    }

    fn announce(
        &self,
        info_hash: Sha1Hash,
        port: u16,
        noseed: bool,
    ) -> Result<AnnounceTraversal> {
        self.announces.lock().unwrap().push((info_hash, port, noseed));
        let (tx, rx) = mpsc::unbounded_channel();
        *self.feed.lock().unwrap() = Some(tx);
        Ok(AnnounceTraversal { peers: rx })
    }

    fn ping(&self, addr: &ScionAddr) {
        self.pings.lock().unwrap().push(addr.clone());
    }

    fn close(&self) {
        self.closed
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }
}
