use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{Error, MAX_MESSAGE_SIZE, Signer, peer::PeerAddress};

/// RPC command carried by a message.
///
/// The transport core only interprets a handful of commands; everything
/// else is opaque and passes straight through to the node logic, so the
/// command is an open byte rather than a closed enum.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command(pub u8);

impl Command {
    pub const PING: Command = Command(0);
    pub const NEIGHBOR: Command = Command(4);
    pub const DIRECT_DATA: Command = Command(6);
    pub const TRACKER_ADD: Command = Command(7);
    pub const TRACKER_GET: Command = Command(8);
    pub const RELAY: Command = Command(14);
    pub const RCON: Command = Command(16);
    pub const HOLEP: Command = Command(18);
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Command::PING => write!(f, "PING"),
            Command::NEIGHBOR => write!(f, "NEIGHBOR"),
            Command::DIRECT_DATA => write!(f, "DIRECT_DATA"),
            Command::TRACKER_ADD => write!(f, "TRACKER_ADD"),
            Command::TRACKER_GET => write!(f, "TRACKER_GET"),
            Command::RELAY => write!(f, "RELAY"),
            Command::RCON => write!(f, "RCON"),
            Command::HOLEP => write!(f, "HOLEP"),
            Command(other) => write!(f, "COMMAND({})", other),
        }
    }
}

/// Message kind: four request slots plus the terminal reply kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Kind {
    Request1 = 1,
    Request2 = 2,
    Request3 = 3,
    Request4 = 4,
    Ok = 5,
    Denied = 6,
    NotFound = 7,
    Exception = 8,
}

impl Kind {
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Kind::Request1 | Kind::Request2 | Kind::Request3 | Kind::Request4
        )
    }
}

const FLAG_UDP: u8 = 0b0000_0001;
const FLAG_KEEP_ALIVE: u8 = 0b0000_0010;
const FLAG_FIRE_AND_FORGET: u8 = 0b0000_0100;
const FLAG_SIGNED: u8 = 0b0000_1000;
const FLAG_INTS: u8 = 0b0001_0000;
const FLAG_BUFFERS: u8 = 0b0010_0000;
const FLAG_PAYLOAD: u8 = 0b0100_0000;

/// One request or reply on the wire.
///
/// Mutable until first send; retries and hole-punch duplicates are made
/// with [`Message::duplicate`], which assigns a fresh id and clones the
/// buffers (each clone reads independently over shared storage).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u32,
    pub version: u8,
    pub command: Command,
    pub kind: Kind,
    pub udp: bool,
    pub keep_alive: bool,
    pub fire_and_forget: bool,
    pub sender: PeerAddress,
    pub recipient: PeerAddress,
    pub ints: Vec<u32>,
    pub buffers: Vec<Bytes>,
    pub payload: Vec<(u8, Bytes)>,
    pub signature: Option<Bytes>,
}

impl Message {
    pub fn new(command: Command, kind: Kind, sender: PeerAddress, recipient: PeerAddress) -> Self {
        Self {
            id: 0,
            version: 1,
            command,
            kind,
            udp: false,
            keep_alive: false,
            fire_and_forget: false,
            sender,
            recipient,
            ints: Vec::new(),
            buffers: Vec::new(),
            payload: Vec::new(),
            signature: None,
        }
    }

    /// Build the reply to a request: same id, command and transport
    /// flags, sender and recipient swapped.
    pub fn reply(request: &Message, kind: Kind) -> Self {
        Self {
            id: request.id,
            version: request.version,
            command: request.command,
            kind,
            udp: request.udp,
            keep_alive: request.keep_alive,
            fire_and_forget: false,
            sender: request.recipient.clone(),
            recipient: request.sender.clone(),
            ints: Vec::new(),
            buffers: Vec::new(),
            payload: Vec::new(),
            signature: None,
        }
    }

    /// Whether a reply should be correlated for this message.
    pub fn expects_reply(&self) -> bool {
        self.kind.is_request() && !self.fire_and_forget
    }

    /// Copy for a retry or a hole-punch duplicate. The duplicate gets
    /// its own id; a stale signature would not cover the rewritten
    /// descriptors, so it is dropped and re-signed on encode.
    pub fn duplicate(&self, id: u32) -> Self {
        Self {
            id,
            signature: None,
            ..self.clone()
        }
    }

    pub fn payload_get(&self, key: u8) -> Option<&Bytes> {
        self.payload
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    pub fn payload_put(&mut self, key: u8, value: Bytes) {
        self.payload.push((key, value));
    }

    /// Serialize into `bytes`, signing when the message was built with
    /// a signature request and a signer is available.
    pub fn encode(&self, bytes: &mut BytesMut, signer: Option<&dyn Signer>) -> Result<(), Error> {
        bytes.clear();
        bytes.put_u8(self.version);
        bytes.put_u8(self.command.0);
        bytes.put_u8(self.kind.into());

        let mut flags = 0u8;
        if self.udp {
            flags |= FLAG_UDP;
        }
        if self.keep_alive {
            flags |= FLAG_KEEP_ALIVE;
        }
        if self.fire_and_forget {
            flags |= FLAG_FIRE_AND_FORGET;
        }
        if !self.ints.is_empty() {
            flags |= FLAG_INTS;
        }
        if !self.buffers.is_empty() {
            flags |= FLAG_BUFFERS;
        }
        if !self.payload.is_empty() {
            flags |= FLAG_PAYLOAD;
        }

        let signed = signer.is_some() || self.signature.is_some();
        if signed {
            flags |= FLAG_SIGNED;
        }

        bytes.put_u8(flags);
        bytes.put_u32(self.id);
        self.sender.encode(bytes);
        self.recipient.encode(bytes);

        if !self.ints.is_empty() {
            bytes.put_u16(self.ints.len() as u16);
            for it in &self.ints {
                bytes.put_u32(*it);
            }
        }

        if !self.buffers.is_empty() {
            bytes.put_u8(self.buffers.len() as u8);
            for buffer in &self.buffers {
                bytes.put_u32(buffer.len() as u32);
                bytes.put(buffer.clone());
            }
        }

        if !self.payload.is_empty() {
            bytes.put_u8(self.payload.len() as u8);
            for (key, value) in &self.payload {
                bytes.put_u8(*key);
                bytes.put_u32(value.len() as u32);
                bytes.put(value.clone());
            }
        }

        if signed {
            let signature = match signer {
                Some(signer) => signer.sign(bytes),
                None => self.signature.clone().ok_or(Error::InvalidInput)?,
            };

            bytes.put_u16(signature.len() as u16);
            bytes.put(signature);
        }

        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(Error::Oversized(bytes.len()));
        }

        Ok(())
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use std::net::{IpAddr, Ipv4Addr};
    /// use dht_transport_codec::*;
    ///
    /// let peer = |id: u64, port: u16| {
    ///     PeerAddress::new(
    ///         PeerId::from_low_u64(id),
    ///         PeerSocketAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port, port),
    ///     )
    /// };
    ///
    /// let mut message = Message::new(
    ///     Command::PING,
    ///     Kind::Request1,
    ///     peer(0x50, 2424),
    ///     peer(0x20, 8088),
    /// );
    ///
    /// message.id = 42;
    /// message.udp = true;
    ///
    /// let mut bytes = BytesMut::new();
    /// message.encode(&mut bytes, None).unwrap();
    ///
    /// assert_eq!(Message::decode(&bytes[..]).unwrap(), message);
    /// ```
    pub fn decode(mut bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(Error::Oversized(bytes.len()));
        }

        if bytes.remaining() < 8 {
            return Err(Error::InvalidInput);
        }

        let version = bytes.get_u8();
        let command = Command(bytes.get_u8());
        let kind = Kind::try_from(bytes.get_u8()).map_err(|it| Error::UnknownKind(it.number))?;
        let flags = bytes.get_u8();
        let id = bytes.get_u32();

        let sender = PeerAddress::decode(&mut bytes)?;
        let recipient = PeerAddress::decode(&mut bytes)?;

        let mut ints = Vec::new();
        if flags & FLAG_INTS != 0 {
            if bytes.remaining() < 2 {
                return Err(Error::InvalidInput);
            }

            let count = bytes.get_u16() as usize;
            if bytes.remaining() < count * 4 {
                return Err(Error::InvalidInput);
            }

            ints.reserve(count);
            for _ in 0..count {
                ints.push(bytes.get_u32());
            }
        }

        let mut buffers = Vec::new();
        if flags & FLAG_BUFFERS != 0 {
            if bytes.remaining() < 1 {
                return Err(Error::InvalidInput);
            }

            let count = bytes.get_u8() as usize;
            buffers.reserve(count);
            for _ in 0..count {
                buffers.push(take_chunk(&mut bytes)?);
            }
        }

        let mut payload = Vec::new();
        if flags & FLAG_PAYLOAD != 0 {
            if bytes.remaining() < 1 {
                return Err(Error::InvalidInput);
            }

            let count = bytes.get_u8() as usize;
            payload.reserve(count);
            for _ in 0..count {
                if bytes.remaining() < 1 {
                    return Err(Error::InvalidInput);
                }

                let key = bytes.get_u8();
                payload.push((key, take_chunk(&mut bytes)?));
            }
        }

        let mut signature = None;
        if flags & FLAG_SIGNED != 0 {
            if bytes.remaining() < 2 {
                return Err(Error::InvalidInput);
            }

            let size = bytes.get_u16() as usize;
            if bytes.remaining() < size {
                return Err(Error::InvalidInput);
            }

            signature = Some(Bytes::copy_from_slice(&bytes[..size]));
            bytes.advance(size);
        }

        Ok(Self {
            id,
            version,
            command,
            kind,
            udp: flags & FLAG_UDP != 0,
            keep_alive: flags & FLAG_KEEP_ALIVE != 0,
            fire_and_forget: flags & FLAG_FIRE_AND_FORGET != 0,
            sender,
            recipient,
            ints,
            buffers,
            payload,
            signature,
        })
    }
}

fn take_chunk(bytes: &mut &[u8]) -> Result<Bytes, Error> {
    if bytes.remaining() < 4 {
        return Err(Error::InvalidInput);
    }

    let size = bytes.get_u32() as usize;
    if bytes.remaining() < size {
        return Err(Error::InvalidInput);
    }

    let chunk = Bytes::copy_from_slice(&bytes[..size]);
    bytes.advance(size);
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::peer::{PeerId, PeerSocketAddress};

    fn peer(id: u64, port: u16) -> PeerAddress {
        PeerAddress::new(
            PeerId::from_low_u64(id),
            PeerSocketAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port, port),
        )
    }

    fn sample() -> Message {
        let mut message = Message::new(
            Command::TRACKER_ADD,
            Kind::Request1,
            peer(0x50, 2424),
            peer(0x20, 8088),
        );

        message.id = 7;
        message.keep_alive = true;
        message.ints = vec![4000, 4001, 4002];
        message.buffers = vec![Bytes::from_static(b"bloom")];
        message.payload_put(1, Bytes::from_static(b"location"));
        message.payload_put(2, Bytes::from_static(b"domain"));
        message
    }

    #[test]
    fn full_round_trip() {
        let message = sample();

        let mut bytes = BytesMut::new();
        message.encode(&mut bytes, None).unwrap();

        assert_eq!(Message::decode(&bytes[..]).unwrap(), message);
    }

    #[test]
    fn signed_round_trip() {
        struct Reverse;

        impl Signer for Reverse {
            fn sign(&self, bytes: &[u8]) -> Bytes {
                bytes.iter().rev().copied().take(8).collect()
            }

            fn verify(&self, bytes: &[u8], signature: &[u8]) -> bool {
                self.sign(bytes) == signature
            }
        }

        let message = sample();
        let mut bytes = BytesMut::new();
        message.encode(&mut bytes, Some(&Reverse)).unwrap();

        let decoded = Message::decode(&bytes[..]).unwrap();
        assert_eq!(decoded.signature.as_ref().map(|it| it.len()), Some(8));
        assert_eq!(decoded.ints, message.ints);
    }

    #[test]
    fn duplicate_gets_fresh_id_and_independent_buffers() {
        let message = sample();
        let duplicate = message.duplicate(99);

        assert_eq!(duplicate.id, 99);
        assert_eq!(duplicate.command, message.command);
        assert_eq!(duplicate.buffers, message.buffers);
        assert!(duplicate.signature.is_none());
    }

    #[test]
    fn reply_swaps_descriptors() {
        let request = sample();
        let reply = Message::reply(&request, Kind::Ok);

        assert_eq!(reply.id, request.id);
        assert_eq!(reply.sender, request.recipient);
        assert_eq!(reply.recipient, request.sender);
        assert!(!reply.expects_reply());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let message = sample();
        let mut bytes = BytesMut::new();
        message.encode(&mut bytes, None).unwrap();
        bytes[2] = 200;

        assert!(matches!(
            Message::decode(&bytes[..]),
            Err(Error::UnknownKind(200))
        ));
    }

    #[test]
    fn truncated_message_is_rejected() {
        let message = sample();
        let mut bytes = BytesMut::new();
        message.encode(&mut bytes, None).unwrap();

        for size in [0, 5, 30, bytes.len() - 1] {
            assert!(Message::decode(&bytes[..size]).is_err());
        }
    }
}
