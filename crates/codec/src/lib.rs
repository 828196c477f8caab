//! ## DHT wire codec
//!
//! Message grammar shared by the datagram (UDP) and stream (TCP)
//! transports: a fixed header (version, message id, command, kind,
//! flags), the sender and recipient peer descriptors, and the optional
//! sections (integer list, buffers, payload map, detached signature).
//!
//! A message travels as one datagram over UDP. Over TCP every message
//! is preceded by a 4-byte big-endian length prefix and the decoder
//! cumulates inbound bytes until a full frame is available.

pub mod message;
pub mod peer;
pub mod stream;

pub use self::{
    message::{Command, Kind, Message},
    peer::{PeerAddress, PeerId, PeerSocketAddress},
    stream::StreamDecoder,
};

use std::array::TryFromSliceError;

use bytes::Bytes;

/// The maximum size of a single encoded message, datagram or frame
/// body. Anything larger is rejected by both framers.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub enum Error {
    InvalidInput,
    UnknownKind(u8),
    UnknownAddressFamily(u8),
    Oversized(usize),
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

/// Detached-signature production for authenticated messages.
///
/// The transport core does not choose an algorithm; the node supplies
/// one. A signature covers every encoded byte that precedes it, so the
/// framer can sign without understanding the key material.
pub trait Signer: Send + Sync {
    fn sign(&self, bytes: &[u8]) -> Bytes;
    fn verify(&self, bytes: &[u8], signature: &[u8]) -> bool;
}
