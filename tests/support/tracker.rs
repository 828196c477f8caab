use bytes::Bytes;
use dht_transport::{PeerAddress, PeerId};
use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

use super::bloom::BloomFilter;

struct TrackerEntry {
    peer: PeerAddress,
    expires: Instant,
}

/// In-memory tracker storage: peers announced under a (location,
/// domain) key pair, each entry with its own time to live.
pub struct TrackerStorage {
    ttl: Duration,
    entries: Mutex<Vec<((Bytes, Bytes), TrackerEntry)>>,
}

impl TrackerStorage {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, location: Bytes, domain: Bytes, peer: PeerAddress) {
        let mut entries = self.entries.lock();
        let key = (location, domain);
        entries.retain(|(k, entry)| !(k == &key && entry.peer.id == peer.id));
        entries.push((
            key,
            TrackerEntry {
                peer,
                expires: Instant::now() + self.ttl,
            },
        ));
    }

    /// Peers announced under the key, expired entries pruned, peers in
    /// the exclusion filter left out.
    pub fn peers(
        &self,
        location: &Bytes,
        domain: &Bytes,
        exclude: Option<&BloomFilter>,
    ) -> Vec<PeerAddress> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|(_, entry)| entry.expires > now);

        entries
            .iter()
            .filter(|((l, d), _)| l == location && d == domain)
            .filter(|(_, entry)| !exclude.is_some_and(|it| it.contains(&entry.peer.id)))
            .map(|(_, entry)| entry.peer.clone())
            .collect()
    }

    pub fn size(&self, location: &Bytes, domain: &Bytes) -> usize {
        self.peers(location, domain, None).len()
    }

    pub fn contains(&self, location: &Bytes, domain: &Bytes, id: &PeerId) -> bool {
        self.peers(location, domain, None)
            .iter()
            .any(|it| it.id == *id)
    }
}
