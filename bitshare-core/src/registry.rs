//! In-memory registries shared by the daemon's listeners: which hashes are seeded here,
//! and which peers advertise which hashes. Each call takes the lock once; lookups return
//! copies, never references into the map.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;

use parking_lot::RwLock;

use crate::seed::Seed;

/// Content hash -> most recently announced seed. Last writer wins.
#[derive(Default)]
pub struct SeedRegistry {
    by_hash: RwLock<HashMap<String, Seed>>,
}

impl SeedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, replacing any seed previously announced for the same hash.
    /// Returns the replaced seed.
    pub fn insert(&self, seed: Seed) -> Option<Seed> {
        let hash = seed.hash();
        self.by_hash.write().insert(hash, seed)
    }

    pub fn lookup(&self, hash: &str) -> Option<Seed> {
        self.by_hash.read().get(hash).cloned()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.by_hash.read().contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.by_hash.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.read().is_empty()
    }
}

/// Content hash -> set of peer addresses known to hold it.
#[derive(Default)]
pub struct PeerRegistry {
    by_hash: RwLock<HashMap<String, BTreeSet<SocketAddr>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent. Returns true if the address was not yet known for this hash.
    pub fn insert(&self, hash: &str, peer: SocketAddr) -> bool {
        self.by_hash
            .write()
            .entry(hash.to_string())
            .or_default()
            .insert(peer)
    }

    /// Snapshot of the peers known for `hash`.
    pub fn lookup(&self, hash: &str) -> Option<BTreeSet<SocketAddr>> {
        self.by_hash.read().get(hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_hash.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use std::sync::Arc;

    fn seed_at(path: &str) -> Seed {
        Seed::new(
            Manifest::new("iso", vec![("iso/debian.iso".to_string(), 700)]),
            path,
        )
    }

    #[test]
    fn seed_last_writer_wins() {
        let reg = SeedRegistry::new();
        let first = seed_at("/mnt/a");
        let second = seed_at("/mnt/b");
        assert_eq!(first.hash(), second.hash());

        assert!(reg.insert(first.clone()).is_none());
        assert_eq!(reg.insert(second.clone()), Some(first));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.lookup(&second.hash()), Some(second));
    }

    #[test]
    fn seed_lookup_absent() {
        let reg = SeedRegistry::new();
        assert!(reg.is_empty());
        assert!(reg.lookup("deadbeef").is_none());
        assert!(!reg.contains("deadbeef"));
    }

    #[test]
    fn peer_insert_is_idempotent() {
        let reg = PeerRegistry::new();
        let addr: SocketAddr = "192.168.1.20:45781".parse().unwrap();
        assert!(reg.insert("h", addr));
        assert!(!reg.insert("h", addr));
        let peers = reg.lookup("h").unwrap();
        assert_eq!(peers.len(), 1);
        assert!(peers.contains(&addr));
    }

    #[test]
    fn peer_lookup_is_a_copy() {
        let reg = PeerRegistry::new();
        let a: SocketAddr = "10.0.0.2:1".parse().unwrap();
        let b: SocketAddr = "10.0.0.3:1".parse().unwrap();
        reg.insert("h", a);
        let mut snapshot = reg.lookup("h").unwrap();
        snapshot.insert(b);
        assert_eq!(reg.lookup("h").unwrap().len(), 1);
        assert!(reg.lookup("other").is_none());
    }

    #[test]
    fn concurrent_inserts() {
        let reg = Arc::new(PeerRegistry::new());
        let handles: Vec<_> = (0..8u16)
            .map(|i| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    for port in 0..100u16 {
                        let addr = SocketAddr::from(([10, 0, 0, i as u8], port));
                        reg.insert("shared", addr);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.lookup("shared").unwrap().len(), 800);
    }
}
