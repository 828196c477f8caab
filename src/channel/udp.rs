use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use bytes::BytesMut;
use codec::{Message, Signer};
use tokio::{net::UdpSocket, time::Duration};

use super::{ChannelShared, idle_sleep};
use crate::{dispatch::Inbound, error::Error, sender::SendCore};

/// One UDP endpoint: a bound socket with its receive loop in a task.
///
/// Datagrams are atomic, so sends go straight through `send_to` with
/// no write lock; the kernel interleaves packets, never bytes.
pub(crate) struct UdpChannel {
    pub shared: Arc<ChannelShared>,
    socket: Arc<UdpSocket>,
    signer: Option<Arc<dyn Signer>>,
}

impl UdpChannel {
    /// Bind to `port` (0 for an ephemeral port) and spawn the receive
    /// loop.
    pub async fn bind(
        port: u16,
        core: &Arc<SendCore>,
        idle: Option<Duration>,
    ) -> Result<Arc<Self>, Error> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(|e| Error::ChannelCreation(e.to_string()))?;

        Ok(Self::spawn(socket, core, idle))
    }

    pub fn spawn(socket: UdpSocket, core: &Arc<SendCore>, idle: Option<Duration>) -> Arc<Self> {
        let shared = core.channels.register(core.pending.clone(), idle);
        let channel = Arc::new(Self {
            shared,
            socket: Arc::new(socket),
            signer: core.signer.clone(),
        });

        tokio::spawn(run(channel.clone(), core.clone()));
        channel
    }

    pub fn local_port(&self) -> u16 {
        self.socket
            .local_addr()
            .map(|it| it.port())
            .unwrap_or_default()
    }

    pub fn close(&self) {
        self.shared.close();
    }

    /// Encode and send one datagram.
    pub async fn send(&self, message: &Message, target: SocketAddr) -> Result<(), Error> {
        let mut bytes = BytesMut::new();
        message.encode(&mut bytes, self.signer.as_deref())?;

        if let Err(e) = self.socket.send_to(&bytes, target).await {
            self.close();
            return Err(Error::Write(e.to_string()));
        }

        self.shared.touch();
        log::trace!(
            "udp channel send: size={}, addr={}, id={}",
            bytes.len(),
            target,
            message.id
        );

        Ok(())
    }
}

async fn run(channel: Arc<UdpChannel>, core: Arc<SendCore>) {
    let mut buf = vec![0u8; 65536];
    let mut closed = channel.shared.subscribe_close();

    let error = loop {
        // a close that raced the subscription above must not be lost.
        if !channel.shared.is_active() {
            break Some(Error::Connect("channel closed".to_string()));
        }

        let deadline = channel.shared.idle_deadline();

        tokio::select! {
            result = channel.socket.recv_from(&mut buf) => match result {
                Ok((size, addr)) => {
                    channel.shared.touch();
                    log::trace!("udp channel receive: size={}, addr={}", size, addr);

                    match Message::decode(&buf[..size]) {
                        Ok(message) => {
                            core.dispatch(message, Inbound::Udp(&channel, addr)).await;
                        }
                        Err(e) => {
                            log::debug!("udp datagram discarded: addr={}, error={}", addr, e);
                        }
                    }
                }
                Err(e) => {
                    // also fires when a remote host shut down; not
                    // fatal for the socket.
                    log::warn!("udp socket receive error: {:?}", e);
                }
            },
            // locally closed: completions still armed by other sends
            // on this channel must not hang.
            _ = closed.changed() => break Some(Error::Connect("channel closed".to_string())),
            _ = idle_sleep(deadline) => {
                if channel.shared.idle_expired() {
                    break Some(Error::IdleTimeout);
                }
            }
        }
    };

    channel.shared.deactivate();
    if let Some(error) = &error {
        crate::error::log_failure(
            &format!("udp channel dropped: port={}", channel.local_port()),
            error,
        );
        channel.shared.fail_armed(error);
    }

    core.channels.deregister(channel.shared.id);
}
