//! Network paths and the cross peer path deconfliction store.
//!
//! A path is an ordered list of `(AS, interface)` hops through the
//! path-aware underlay. Two paths conflict iff they share any hop. When the
//! seeder serves several leechers at once it wants every leecher on paths
//! disjoint from the other leechers' paths, subject to what is available;
//! [`PathSelectionStore`] maintains that global property by redistributing
//! paths whenever a new peer is admitted.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

/// One `(AS, interface id)` hop of a path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PathInterface {
    pub ia: String,
    pub id: u64,
}

impl fmt::Display for PathInterface {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#{}", self.ia, self.id)
    }
}

/// An ordered sequence of inter-AS hops.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Path {
    pub hops: Vec<PathInterface>,
}

impl Path {
    pub fn new(hops: Vec<PathInterface>) -> Self {
        Self { hops }
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    /// Two paths conflict iff any `(AS, interface)` pair appears on both.
    pub fn conflicts_with(&self, other: &Path) -> bool {
        self.hops
            .iter()
            .any(|hop| other.hops.iter().any(|other_hop| hop == other_hop))
    }

    /// The stable string form, usable as a map key.
    pub fn fingerprint(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for hop in &self.hops {
            if !first {
                write!(f, ">")?;
            }
            write!(f, "{}", hop)?;
            first = false;
        }
        Ok(())
    }
}

/// A set of paths offered to or chosen by a path selector.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PathSet {
    pub paths: Vec<Path>,
}

impl PathSet {
    pub fn new(paths: Vec<Path>) -> Self {
        Self { paths }
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.iter().any(|p| p == path)
    }

    /// Returns the `n` paths with the smallest hop count.
    pub fn shortest(&self, n: usize) -> PathSet {
        let mut paths = self.paths.clone();
        paths.sort_by_key(|p| p.hop_count());
        paths.truncate(n);
        PathSet::new(paths)
    }
}

/// The paths available to and in use by one active remote peer.
///
/// `used` is always a subset of `available` and internally free of
/// conflicts.
#[derive(Clone, Debug)]
pub struct PeerPathEntry {
    pub peer_addr: String,
    pub available: Vec<Path>,
    pub used: Vec<Path>,
}

impl PeerPathEntry {
    /// A fresh entry for admission: nothing used yet.
    pub fn new(peer_addr: impl Into<String>, available: Vec<Path>) -> Self {
        Self {
            peer_addr: peer_addr.into(),
            available,
            used: Vec::new(),
        }
    }
}

/// The global peer to path assignment, shared by all of a seeder's
/// dial-back sockets.
///
/// The lock is only ever held over in-memory work; callers reconfigure
/// sockets after releasing it.
#[derive(Debug, Default)]
pub struct PathSelectionStore {
    data: Mutex<HashMap<String, PeerPathEntry>>,
}

pub type SharedPathStore = Arc<PathSelectionStore>;

impl PathSelectionStore {
    pub fn new() -> SharedPathStore {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    /// Returns a snapshot of the entry for the given peer.
    pub fn get(&self, peer_addr: &str) -> Option<PeerPathEntry> {
        self.data.lock().unwrap().get(peer_addr).cloned()
    }

    /// Drops the entry for a disconnected peer. Paths stolen from other
    /// peers on admission are not handed back; they are re-spread when the
    /// next peer is admitted.
    pub fn remove(&self, peer_addr: &str) -> Option<PeerPathEntry> {
        self.data.lock().unwrap().remove(peer_addr)
    }

    /// Admits a new peer, assigning it used paths out of its available set
    /// while keeping the assignment as disjoint across peers as the
    /// availability allows.
    ///
    /// For each available path that conflicts with a path in use by another
    /// peer, the path is stolen from the first (fewest used paths first)
    /// peer that still has more used paths than the new entry; a peer is
    /// robbed at most once per admission so that consecutive steals spread
    /// over peers. A conflicting path nobody can spare is skipped.
    pub fn admit(&self, mut entry: PeerPathEntry) {
        let mut data = self.data.lock().unwrap();

        let mut candidates: Vec<String> = data.keys().cloned().collect();
        // ascending by used path count; ties broken by address so that
        // admission order is deterministic
        candidates.sort_by(|a, b| {
            (data[a].used.len(), a).cmp(&(data[b].used.len(), b))
        });

        for path in entry.available.clone() {
            if candidates.is_empty() {
                entry.used.push(path);
                continue;
            }

            let mut any_conflict = false;
            let mut victim: Option<(String, usize)> = None;
            for addr in &candidates {
                let target = &data[addr];
                if let Some(pos) = target
                    .used
                    .iter()
                    .position(|used| used.conflicts_with(&path))
                {
                    any_conflict = true;
                    if target.used.len() > entry.used.len() {
                        victim = Some((addr.clone(), pos));
                        break;
                    }
                }
            }

            match victim {
                Some((addr, pos)) => {
                    let stolen = data.get_mut(&addr).unwrap().used.remove(pos);
                    log::debug!(
                        "Stole path {} from peer {} for peer {}",
                        stolen,
                        addr,
                        entry.peer_addr
                    );
                    entry.used.push(path);
                    // the victim is out for the rest of this admission, and
                    // only peers still ahead of us remain steal targets
                    candidates.retain(|a| {
                        *a != addr && data[a].used.len() > entry.used.len()
                    });
                }
                None if any_conflict => {
                    // everyone conflicting is already at or below our count
                    log::debug!(
                        "Skipping contended path {} for peer {}",
                        path,
                        entry.peer_addr
                    );
                }
                None => entry.used.push(path),
            }
        }

        // the entry itself must end up pairwise disjoint: keep the first of
        // any conflicting pair
        let mut kept: Vec<Path> = Vec::with_capacity(entry.used.len());
        for path in entry.used.drain(..) {
            if !kept.iter().any(|k| k.conflicts_with(&path)) {
                kept.push(path);
            }
        }
        entry.used = kept;

        log::info!(
            "Admitted peer {} with {}/{} paths in use",
            entry.peer_addr,
            entry.used.len(),
            entry.available.len()
        );
        data.insert(entry.peer_addr.clone(), entry);
    }
}
