//! Concurrent peer indices.
//!
//! The [`PeerStore`] holds every peer record the manager knows about, online
//! or not, in two indices guarded by a single reader/writer lock:
//!
//! - by hash (`"address:listen_port"`, unique)
//! - by remote IP (many peers may share an IP when their listen ports differ)
//!
//! Mutators take the write lock; enumerations copy `Arc`s out under the read
//! lock and release it before any I/O or long work happens on the snapshot.

use crate::peer::Peer;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct Indices {
    by_hash: HashMap<String, Arc<Peer>>,
    by_ip: HashMap<String, HashMap<String, Arc<Peer>>>,
}

/// Thread-safe CRUD over the known peer set.
#[derive(Default)]
pub struct PeerStore {
    inner: RwLock<Indices>,
}

impl PeerStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a peer into both indices.
    ///
    /// Returns false (and leaves the store unchanged) if a peer with the
    /// same hash is already present.
    pub fn add(&self, peer: Arc<Peer>) -> bool {
        let mut inner = self.inner.write();
        if inner.by_hash.contains_key(peer.hash()) {
            return false;
        }
        inner
            .by_hash
            .insert(peer.hash().to_string(), Arc::clone(&peer));
        inner
            .by_ip
            .entry(peer.address().to_string())
            .or_default()
            .insert(peer.hash().to_string(), peer);
        true
    }

    /// Removes a peer from both indices. Returns the removed record, if any.
    pub fn remove(&self, peer: &Peer) -> Option<Arc<Peer>> {
        let mut inner = self.inner.write();
        let removed = inner.by_hash.remove(peer.hash());
        if let Some(by_hash) = inner.by_ip.get_mut(peer.address()) {
            by_hash.remove(peer.hash());
            if by_hash.is_empty() {
                inner.by_ip.remove(peer.address());
            }
        }
        removed
    }

    /// Looks up a peer by hash.
    pub fn get(&self, hash: &str) -> Option<Arc<Peer>> {
        self.inner.read().by_hash.get(hash).cloned()
    }

    /// Returns every peer known at the given remote IP.
    pub fn get_by_ip(&self, ip: &str) -> Vec<Arc<Peer>> {
        self.inner
            .read()
            .by_ip
            .get(ip)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// True if any peer is known at the given remote IP.
    pub fn knows_ip(&self, ip: &str) -> bool {
        self.inner.read().by_ip.contains_key(ip)
    }

    /// Copies out every peer record.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.inner.read().by_hash.values().cloned().collect()
    }

    /// Number of known peers, online or not.
    pub fn len(&self) -> usize {
        self.inner.read().by_hash.len()
    }

    /// True when no peers are known.
    pub fn is_empty(&self) -> bool {
        self.inner.read().by_hash.is_empty()
    }

    /// Counts peers that are not `Offline`, split by direction.
    ///
    /// Returns `(incoming, outgoing)`. Computed from live peer state under
    /// the read lock, so the sum always equals the number of non-offline
    /// peers at the moment of the call.
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.read();
        let mut incoming = 0;
        let mut outgoing = 0;
        for peer in inner.by_hash.values() {
            if !peer.is_offline() {
                if peer.is_outgoing() {
                    outgoing += 1;
                } else {
                    incoming += 1;
                }
            }
        }
        (incoming, outgoing)
    }
}
