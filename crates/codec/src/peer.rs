use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};

use crate::Error;

/// 160-bit peer identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub const LEN: usize = 20;

    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Identifier with only the low 8 bytes set, handy for tests and
    /// small fixed ids.
    ///
    /// # Test
    ///
    /// ```
    /// use dht_transport_codec::peer::PeerId;
    ///
    /// let id = PeerId::from_low_u64(0x50);
    ///
    /// assert_eq!(id.0[19], 0x50);
    /// assert_eq!(id.0[..12], [0u8; 12]);
    /// ```
    pub fn from_low_u64(value: u64) -> Self {
        let mut bytes = [0u8; 20];
        bytes[12..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Low 8 bytes as an integer, used to seed deterministic choices
    /// made on behalf of this peer.
    pub fn low_u64(&self) -> u64 {
        u64::from_be_bytes(self.0[12..].try_into().expect("peer id is 20 bytes"))
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x")?;
        for it in &self.0 {
            write!(f, "{:02x}", it)?;
        }

        Ok(())
    }
}

/// One reachable endpoint of a peer. Port `0` stands for "unset".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerSocketAddress {
    pub ip: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
}

impl PeerSocketAddress {
    pub fn new(ip: IpAddr, tcp_port: u16, udp_port: u16) -> Self {
        Self {
            ip,
            tcp_port,
            udp_port,
        }
    }

    pub fn tcp(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    pub fn udp(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    pub fn encode(&self, bytes: &mut BytesMut) {
        match self.ip {
            IpAddr::V4(ip) => {
                bytes.put_u8(4);
                bytes.put(ip.octets().as_slice());
            }
            IpAddr::V6(ip) => {
                bytes.put_u8(6);
                bytes.put(ip.octets().as_slice());
            }
        }

        bytes.put_u16(self.tcp_port);
        bytes.put_u16(self.udp_port);
    }

    pub fn decode(bytes: &mut &[u8]) -> Result<Self, Error> {
        if bytes.remaining() < 1 {
            return Err(Error::InvalidInput);
        }

        let ip = match bytes.get_u8() {
            4 => {
                if bytes.remaining() < 4 {
                    return Err(Error::InvalidInput);
                }

                let mut octets = [0u8; 4];
                bytes.copy_to_slice(&mut octets);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            6 => {
                if bytes.remaining() < 16 {
                    return Err(Error::InvalidInput);
                }

                let mut octets = [0u8; 16];
                bytes.copy_to_slice(&mut octets);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            family => return Err(Error::UnknownAddressFamily(family)),
        };

        if bytes.remaining() < 4 {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            ip,
            tcp_port: bytes.get_u16(),
            udp_port: bytes.get_u16(),
        })
    }
}

const FIREWALLED_TCP: u8 = 0b0000_0001;
const FIREWALLED_UDP: u8 = 0b0000_0010;
const RELAYED: u8 = 0b0000_0100;

/// Full descriptor of a peer: identity, primary endpoint, NAT flags
/// and the relays willing to forward traffic for it.
///
/// The descriptor is an immutable value; the `with_*` builders produce
/// modified copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub id: PeerId,
    pub socket: PeerSocketAddress,
    pub firewalled_tcp: bool,
    pub firewalled_udp: bool,
    pub relayed: bool,
    pub relays: Vec<PeerSocketAddress>,
}

impl PeerAddress {
    pub fn new(id: PeerId, socket: PeerSocketAddress) -> Self {
        Self {
            id,
            socket,
            firewalled_tcp: false,
            firewalled_udp: false,
            relayed: false,
            relays: Vec::new(),
        }
    }

    pub fn with_socket(&self, socket: PeerSocketAddress) -> Self {
        Self {
            socket,
            ..self.clone()
        }
    }

    pub fn with_ports(&self, tcp_port: u16, udp_port: u16) -> Self {
        Self {
            socket: PeerSocketAddress::new(self.socket.ip, tcp_port, udp_port),
            ..self.clone()
        }
    }

    pub fn with_relayed(&self, relayed: bool) -> Self {
        Self {
            relayed,
            ..self.clone()
        }
    }

    pub fn with_firewalled(&self, tcp: bool, udp: bool) -> Self {
        Self {
            firewalled_tcp: tcp,
            firewalled_udp: udp,
            ..self.clone()
        }
    }

    pub fn with_relays(&self, relays: Vec<PeerSocketAddress>) -> Self {
        Self {
            relays,
            ..self.clone()
        }
    }

    /// Copy with every NAT marker removed, the shape a descriptor takes
    /// once a direct path to the peer has been punched.
    pub fn without_nat(&self) -> Self {
        Self {
            firewalled_tcp: false,
            firewalled_udp: false,
            relayed: false,
            relays: Vec::new(),
            ..self.clone()
        }
    }

    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.put(self.id.0.as_slice());

        let mut flags = 0u8;
        if self.firewalled_tcp {
            flags |= FIREWALLED_TCP;
        }
        if self.firewalled_udp {
            flags |= FIREWALLED_UDP;
        }
        if self.relayed {
            flags |= RELAYED;
        }

        bytes.put_u8(flags);
        self.socket.encode(bytes);

        bytes.put_u8(self.relays.len() as u8);
        for relay in &self.relays {
            relay.encode(bytes);
        }
    }

    pub fn decode(bytes: &mut &[u8]) -> Result<Self, Error> {
        if bytes.remaining() < PeerId::LEN + 1 {
            return Err(Error::InvalidInput);
        }

        let mut id = [0u8; 20];
        bytes.copy_to_slice(&mut id);

        let flags = bytes.get_u8();
        let socket = PeerSocketAddress::decode(bytes)?;

        if bytes.remaining() < 1 {
            return Err(Error::InvalidInput);
        }

        let count = bytes.get_u8() as usize;
        let mut relays = Vec::with_capacity(count);
        for _ in 0..count {
            relays.push(PeerSocketAddress::decode(bytes)?);
        }

        Ok(Self {
            id: PeerId(id),
            socket,
            firewalled_tcp: flags & FIREWALLED_TCP != 0,
            firewalled_udp: flags & FIREWALLED_UDP != 0,
            relayed: flags & RELAYED != 0,
            relays,
        })
    }
}
