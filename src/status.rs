use std::sync::Arc;

use codec::PeerAddress;
use parking_lot::RwLock;

use crate::error::Error;

/// Callback surface for peer-liveness observations.
///
/// Fired when a send to a directly reachable peer fails at the
/// transport level, so the routing layer can demote the peer. Relayed
/// recipients never trigger it; their relays failing says nothing
/// about them.
pub trait PeerStatusListener: Send + Sync {
    fn peer_failed(&self, peer: &PeerAddress, reason: &Error);
}

#[derive(Default, Clone)]
pub(crate) struct StatusListeners {
    listeners: Arc<RwLock<Vec<Arc<dyn PeerStatusListener>>>>,
}

impl StatusListeners {
    pub fn add(&self, listener: Arc<dyn PeerStatusListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove(&self, listener: &Arc<dyn PeerStatusListener>) {
        self.listeners
            .write()
            .retain(|it| !Arc::ptr_eq(it, listener));
    }

    pub fn peer_failed(&self, peer: &PeerAddress, reason: &Error) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.peer_failed(peer, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr},
        sync::atomic::{AtomicUsize, Ordering},
    };

    use codec::{PeerId, PeerSocketAddress};

    use super::*;

    struct Counter(AtomicUsize);

    impl PeerStatusListener for Counter {
        fn peer_failed(&self, _: &PeerAddress, _: &Error) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn add_notify_remove() {
        let listeners = StatusListeners::default();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let listener: Arc<dyn PeerStatusListener> = counter.clone();

        let peer = PeerAddress::new(
            PeerId::from_low_u64(1),
            PeerSocketAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1, 1),
        );

        listeners.add(listener.clone());
        listeners.peer_failed(&peer, &Error::IdleTimeout);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        listeners.remove(&listener);
        listeners.peer_failed(&peer, &Error::IdleTimeout);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
