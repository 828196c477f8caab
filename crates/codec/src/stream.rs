use bytes::{Buf, BufMut, BytesMut};

use crate::{Error, MAX_MESSAGE_SIZE, Message, Signer};

/// Prepend the 4-byte length prefix and serialize `message` into
/// `bytes` as one TCP frame.
pub fn encode(
    message: &Message,
    bytes: &mut BytesMut,
    signer: Option<&dyn Signer>,
) -> Result<(), Error> {
    let mut body = BytesMut::new();
    message.encode(&mut body, signer)?;

    bytes.clear();
    bytes.reserve(4 + body.len());
    bytes.put_u32(body.len() as u32);
    bytes.put(body);
    Ok(())
}

/// Cumulating decoder for the stream transport.
///
/// Inbound bytes are appended to the internal buffer in whatever chunks
/// the socket produces; [`StreamDecoder::next`] yields one message per
/// complete frame and leaves partial frames buffered.
///
/// # Test
///
/// ```
/// use std::net::{IpAddr, Ipv4Addr};
/// use dht_transport_codec::*;
///
/// let peer = |port: u16| {
///     PeerAddress::new(
///         PeerId::from_low_u64(1),
///         PeerSocketAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port, port),
///     )
/// };
///
/// let message = Message::new(Command::PING, Kind::Request1, peer(1), peer(2));
///
/// let mut frame = bytes::BytesMut::new();
/// stream::encode(&message, &mut frame, None).unwrap();
///
/// let mut decoder = StreamDecoder::default();
///
/// // feed the frame one byte short: not decodable yet.
/// decoder.buffer().extend_from_slice(&frame[..frame.len() - 1]);
/// assert!(decoder.next().unwrap().is_none());
///
/// decoder.buffer().extend_from_slice(&frame[frame.len() - 1..]);
/// assert_eq!(decoder.next().unwrap(), Some(message));
/// assert!(decoder.next().unwrap().is_none());
/// ```
#[derive(Default)]
pub struct StreamDecoder {
    buffer: BytesMut,
}

impl StreamDecoder {
    /// The cumulation buffer the socket reads into. Capacity for the
    /// next read is reserved here so callers can pass it straight to
    /// `read_buf`.
    pub fn buffer(&mut self) -> &mut BytesMut {
        self.buffer.reserve(4096);
        &mut self.buffer
    }

    /// Pop the next complete frame, if any.
    pub fn next(&mut self) -> Result<Option<Message>, Error> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }

        let size = u32::from_be_bytes(self.buffer[..4].try_into()?) as usize;
        if size > MAX_MESSAGE_SIZE {
            return Err(Error::Oversized(size));
        }

        if self.buffer.len() < 4 + size {
            return Ok(None);
        }

        let frame = self.buffer.split_to(4 + size);
        Message::decode(&frame[4..]).map(Some)
    }
}
