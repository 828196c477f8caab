use std::sync::Arc;

use codec::PeerAddress;
use tokio::{sync::OwnedSemaphorePermit, task::JoinHandle, time::Duration};

use crate::{channel::tcp::TcpChannel, sender::SendCore};

struct ConnectionInner {
    peer: PeerAddress,
    channel: Arc<TcpChannel>,
    heartbeat: JoinHandle<()>,
    // slot stays borrowed for as long as the connection lives.
    _permit: OwnedSemaphorePermit,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.heartbeat.abort();
        self.channel.close();
    }
}

/// Long-lived channel to one peer, reused across sends.
///
/// Owned by whoever opened it; clones share the same channel. A
/// heartbeat ping keeps the NAT binding warm until the connection is
/// closed or the channel drops.
#[derive(Clone)]
pub struct PeerConnection {
    inner: Arc<ConnectionInner>,
}

impl PeerConnection {
    pub(crate) fn open(
        core: &Arc<SendCore>,
        peer: PeerAddress,
        channel: Arc<TcpChannel>,
        permit: OwnedSemaphorePermit,
        interval: Duration,
    ) -> Self {
        let heartbeat = tokio::spawn(heartbeat(core.clone(), channel.clone(), peer.clone(), interval));

        Self {
            inner: Arc::new(ConnectionInner {
                peer,
                channel,
                heartbeat,
                _permit: permit,
            }),
        }
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.inner.peer
    }

    pub fn is_active(&self) -> bool {
        self.inner.channel.is_active()
    }

    pub fn close(&self) {
        self.inner.heartbeat.abort();
        self.inner.channel.close();
    }

    pub(crate) fn channel(&self) -> &Arc<TcpChannel> {
        &self.inner.channel
    }
}

async fn heartbeat(
    core: Arc<SendCore>,
    channel: Arc<TcpChannel>,
    peer: PeerAddress,
    interval: Duration,
) {
    let mut timer = tokio::time::interval(interval);
    timer.tick().await;

    loop {
        timer.tick().await;
        if !channel.is_active() {
            break;
        }

        let mut ping = core.ping.ping(&peer.socket);
        ping.id = core.fresh_id();
        ping.sender = core.local.clone();
        ping.keep_alive = true;
        ping.fire_and_forget = true;

        if channel.write(&ping).await.is_err() {
            break;
        }

        log::trace!("heartbeat: peer={:?}", peer.id);
    }
}
