pub mod bloom;
pub mod tracker;

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::{sync::mpsc::UnboundedSender, time::Duration};

use dht_transport::{
    Command, Kind, Message, PeerAddress, PeerId, PeerSocketAddress, PingFactory, RequestHandler,
    Transport, TransportConfig, TransportOptions,
};

use self::{bloom::BloomFilter, tracker::TrackerStorage};

// payload keys the test node speaks.
pub const KEY_LOCATION: u8 = 1;
pub const KEY_DOMAIN: u8 = 2;
pub const KEY_FILTER: u8 = 3;
pub const KEY_STORED_PEER: u8 = 4;
pub const KEY_DATA: u8 = 5;

pub fn loopback(id: u64) -> PeerAddress {
    PeerAddress::new(
        PeerId::from_low_u64(id),
        PeerSocketAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 0),
    )
}

pub struct Pinger {
    local: PeerAddress,
}

impl PingFactory for Pinger {
    fn ping(&self, target: &PeerSocketAddress) -> Message {
        let mut ping = Message::new(
            Command::PING,
            Kind::Request1,
            self.local.clone(),
            PeerAddress::new(PeerId::from_low_u64(0), *target),
        );
        ping.udp = true;
        ping
    }
}

/// What the node answers to a HOLEP setup request, when it plays the
/// relay in a punch exchange.
pub enum HolepMode {
    /// Echo back a fixed integer list, malformed or not.
    FixedInts(Vec<u32>),
    /// Pair each offered local port with one of these remote ports.
    PairWith(Vec<u16>),
}

/// Scriptable node logic behind a test transport: tracker storage,
/// relay behaviors, and a log of everything it handled.
#[derive(Default)]
pub struct NodeHandler {
    pub tracker: Option<Arc<TrackerStorage>>,
    pub seen: Mutex<Vec<Message>>,
    /// Per-command reply kind override, e.g. answer NEIGHBOR with
    /// DENIED.
    pub reply_overrides: Mutex<Vec<(Command, Kind)>>,
    /// Forwarded a copy of every RCON setup request, so the test can
    /// play the instructed peer.
    pub rcon_notify: Mutex<Option<UnboundedSender<Message>>>,
    pub holep: Mutex<Option<HolepMode>>,
}

impl NodeHandler {
    pub fn with_tracker(tracker: Arc<TrackerStorage>) -> Self {
        Self {
            tracker: Some(tracker),
            ..Self::default()
        }
    }

    pub fn seen_commands(&self) -> Vec<Command> {
        self.seen.lock().iter().map(|it| it.command).collect()
    }

    pub fn seen_with(&self, command: Command) -> Vec<Message> {
        self.seen
            .lock()
            .iter()
            .filter(|it| it.command == command)
            .cloned()
            .collect()
    }

    fn tracker_add(&self, message: &Message) -> Option<Message> {
        let tracker = self.tracker.as_ref()?;
        let location = message.payload_get(KEY_LOCATION)?.clone();
        let domain = message.payload_get(KEY_DOMAIN)?.clone();
        tracker.add(location, domain, message.sender.clone());

        let mut reply = Message::reply(message, Kind::Ok);
        let mut stored = BytesMut::new();
        message.sender.encode(&mut stored);
        reply.payload_put(KEY_STORED_PEER, stored.freeze());
        Some(reply)
    }

    fn tracker_get(&self, message: &Message) -> Option<Message> {
        let tracker = self.tracker.as_ref()?;
        let location = message.payload_get(KEY_LOCATION)?.clone();
        let domain = message.payload_get(KEY_DOMAIN)?.clone();
        let filter = message
            .payload_get(KEY_FILTER)
            .and_then(|it| BloomFilter::from_bytes(it));

        let peers = tracker.peers(&location, &domain, filter.as_ref());

        let mut reply = Message::reply(message, Kind::Ok);
        reply.payload_put(KEY_DATA, encode_peers(&peers));
        Some(reply)
    }
}

#[async_trait]
impl RequestHandler for NodeHandler {
    async fn handle(&self, message: Message) -> Option<Message> {
        self.seen.lock().push(message.clone());

        let overridden = self
            .reply_overrides
            .lock()
            .iter()
            .find(|(command, _)| *command == message.command)
            .map(|(_, kind)| *kind);
        if let Some(kind) = overridden {
            return Some(Message::reply(&message, kind));
        }

        match message.command {
            Command::TRACKER_ADD => self.tracker_add(&message),
            Command::TRACKER_GET => self.tracker_get(&message),
            Command::RCON => {
                if let Some(notify) = &*self.rcon_notify.lock() {
                    let _ = notify.send(message.clone());
                }

                Some(Message::reply(&message, Kind::Ok))
            }
            Command::HOLEP => {
                let mut reply = Message::reply(&message, Kind::Ok);
                match &*self.holep.lock() {
                    Some(HolepMode::FixedInts(ints)) => reply.ints = ints.clone(),
                    Some(HolepMode::PairWith(remotes)) => {
                        for (local, remote) in message.ints.iter().zip(remotes.iter()) {
                            reply.ints.push(*local);
                            reply.ints.push(*remote as u32);
                        }
                    }
                    None => {}
                }

                Some(reply)
            }
            _ => Some(Message::reply(&message, Kind::Ok)),
        }
    }
}

pub fn encode_peers(peers: &[PeerAddress]) -> Bytes {
    let mut bytes = BytesMut::new();
    bytes.put_u16(peers.len() as u16);
    for peer in peers {
        peer.encode(&mut bytes);
    }

    bytes.freeze()
}

pub fn decode_peers(mut bytes: &[u8]) -> Vec<PeerAddress> {
    use bytes::Buf;

    if bytes.remaining() < 2 {
        return Vec::new();
    }

    let count = bytes.get_u16() as usize;
    let mut peers = Vec::with_capacity(count);
    for _ in 0..count {
        match PeerAddress::decode(&mut bytes) {
            Ok(peer) => peers.push(peer),
            Err(_) => break,
        }
    }

    peers
}

/// One bound node: transport plus its scripted handler.
pub struct TestPeer {
    pub transport: Transport,
    pub handler: Arc<NodeHandler>,
    pub tracker: Arc<TrackerStorage>,
}

impl TestPeer {
    pub fn local(&self) -> PeerAddress {
        self.transport.local_peer().clone()
    }

    /// This peer's endpoint the way another descriptor would list it
    /// as a relay.
    pub fn relay_socket(&self) -> PeerSocketAddress {
        self.transport.local_peer().socket
    }
}

pub async fn spawn_peer(id: u64) -> anyhow::Result<TestPeer> {
    spawn_peer_with(loopback(id), TransportConfig::default()).await
}

pub async fn spawn_peer_with(
    local: PeerAddress,
    config: TransportConfig,
) -> anyhow::Result<TestPeer> {
    let tracker = Arc::new(TrackerStorage::new(Duration::from_secs(60)));
    let handler = Arc::new(NodeHandler::with_tracker(tracker.clone()));

    let transport = Transport::bind(TransportOptions {
        ping: Arc::new(Pinger {
            local: local.clone(),
        }),
        handler: handler.clone(),
        signer: None,
        local,
        config,
    })
    .await?;

    Ok(TestPeer {
        transport,
        handler,
        tracker,
    })
}
