//! ## DHT transport core
//!
//! Given a prepared application message and a destination peer
//! descriptor, the transport selects a delivery strategy (direct,
//! reverse connection, relay, hole punch), establishes the needed
//! channels, performs NAT piercing when required, writes the message
//! with the right framing and timeouts, correlates the reply to the
//! waiting caller and reports success, failure or cancellation.
//!
//! The surrounding DHT node is a collaborator: it prepares messages,
//! supplies peer descriptors with socket and relay addresses, handles
//! inbound requests, and consumes the completion signal.

pub mod config;
pub mod error;

mod channel;
mod completion;
mod connection;
mod dispatch;
mod registry;
mod sender;
mod status;
mod strategy;
mod watchdog;

pub use codec::{self, Command, Kind, Message, PeerAddress, PeerId, PeerSocketAddress, Signer};

pub use self::{
    completion::{Outcome, ResponseCompletion},
    config::TransportConfig,
    connection::PeerConnection,
    error::Error,
    sender::SendOptions,
    status::PeerStatusListener,
    strategy::{StrategyVerdict, pick_relay, select as select_strategy, validate as validate_strategy},
};

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use tokio::net::{TcpListener, UdpSocket};

use self::{channel::tcp::TcpChannel, channel::udp::UdpChannel, sender::SendCore};

/// Builds standalone PING requests, used for relay probing and
/// connection heartbeats. The factory fills the descriptors (the
/// recipient's socket must be `target`); the transport stamps the id
/// and the transport flags.
pub trait PingFactory: Send + Sync {
    fn ping(&self, target: &PeerSocketAddress) -> Message;
}

/// Inbound requests the transport does not consume end up here; the
/// optional response is written back on the originating channel.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Option<Message>;
}

pub struct TransportOptions {
    /// The local peer descriptor. Ports may be 0; the bound ports are
    /// patched in and visible through [`Transport::local_peer`].
    pub local: PeerAddress,
    pub config: TransportConfig,
    pub ping: Arc<dyn PingFactory>,
    pub handler: Arc<dyn RequestHandler>,
    pub signer: Option<Arc<dyn Signer>>,
}

/// One node's transport: a TCP listener, a UDP endpoint, the channel
/// pool and the correlation state behind the `send_*` calls.
pub struct Transport {
    core: Arc<SendCore>,
    acceptor: tokio::task::JoinHandle<()>,
}

impl Transport {
    /// Bind the node's sockets and start serving inbound traffic.
    pub async fn bind(options: TransportOptions) -> Result<Self, Error> {
        let ip = options.local.socket.ip;

        let listener = TcpListener::bind(SocketAddr::new(ip, options.local.socket.tcp_port))
            .await
            .map_err(|e| Error::ChannelCreation(e.to_string()))?;
        let udp = UdpSocket::bind(SocketAddr::new(ip, options.local.socket.udp_port))
            .await
            .map_err(|e| Error::ChannelCreation(e.to_string()))?;

        let tcp_port = listener
            .local_addr()
            .map_err(|e| Error::ChannelCreation(e.to_string()))?
            .port();
        let udp_port = udp
            .local_addr()
            .map_err(|e| Error::ChannelCreation(e.to_string()))?
            .port();

        let local = options.local.with_ports(tcp_port, udp_port);
        let core = SendCore::new(
            local,
            options.config,
            options.ping,
            options.handler,
            options.signer,
        );

        // the long-lived server endpoint never idles out.
        UdpChannel::spawn(udp, &core, None);
        let acceptor = tokio::spawn(accept_loop(listener, core.clone()));

        log::info!(
            "transport listening: peer={:?}, tcp={}, udp={}",
            core.local.id,
            tcp_port,
            udp_port
        );

        Ok(Self { core, acceptor })
    }

    /// The local descriptor with the actually bound ports.
    pub fn local_peer(&self) -> &PeerAddress {
        &self.core.local
    }

    /// Send over TCP. The strategy selector may turn this into a
    /// reverse connection or a relay route; the returned completion
    /// resolves either way.
    pub fn send_tcp(&self, message: Message) -> ResponseCompletion {
        self.core.submit(message, false, SendOptions::default())
    }

    pub fn send_tcp_with(&self, message: Message, options: SendOptions) -> ResponseCompletion {
        self.core.submit(message, false, options)
    }

    /// Send over UDP. The selector may route through a relay or start
    /// a hole punch.
    pub fn send_udp(&self, message: Message) -> ResponseCompletion {
        self.core.submit(message, true, SendOptions::default())
    }

    pub fn send_udp_with(&self, message: Message, options: SendOptions) -> ResponseCompletion {
        self.core.submit(message, true, options)
    }

    /// Open a long-lived connection to `peer`, kept warm with
    /// heartbeats, for reuse across sends via [`SendOptions`].
    pub async fn open_peer_connection(
        &self,
        peer: PeerAddress,
        heartbeat: Option<tokio::time::Duration>,
    ) -> Result<PeerConnection, Error> {
        let permit = self.core.pool.acquire_tcp()?;
        let addr = peer.socket.tcp();
        let stream =
            channel::tcp::connect(addr, self.core.config.connect_timeout_duration()).await?;
        let channel = TcpChannel::spawn(stream, addr, &self.core, None);
        let interval = heartbeat.unwrap_or(self.core.config.heartbeat_duration());

        Ok(PeerConnection::open(
            &self.core, peer, channel, permit, interval,
        ))
    }

    /// Ids of the reverse-connection originals currently cached.
    pub fn cached_requests(&self) -> Vec<u32> {
        self.core.pending.cached_request_ids()
    }

    /// Outstanding request count, terminal states excluded.
    pub fn pending_requests(&self) -> usize {
        self.core.pending.pending_len()
    }

    pub fn add_status_listener(&self, listener: Arc<dyn PeerStatusListener>) {
        self.core.status.add(listener);
    }

    pub fn remove_status_listener(&self, listener: &Arc<dyn PeerStatusListener>) {
        self.core.status.remove(listener);
    }

    /// Stop serving and resolve every in-flight send with
    /// `Error::Shutdown`.
    pub async fn shutdown(&self) {
        log::info!("transport shutting down: peer={:?}", self.core.local.id);
        self.acceptor.abort();
        self.core.shutdown();
    }
}

async fn accept_loop(listener: TcpListener, core: Arc<SendCore>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                log::info!("tcp socket accept: addr={}", addr);
                TcpChannel::spawn(stream, addr, &core, Some(core.config.idle_tcp()));
            }
            Err(e) => {
                log::warn!("tcp accept error: {:?}", e);
            }
        }
    }
}
