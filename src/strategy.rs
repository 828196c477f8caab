use codec::{Command, PeerAddress, PeerId, PeerSocketAddress};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::error::Error;

/// Delivery strategy for one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyVerdict {
    /// The recipient is reachable, dial it.
    Direct,
    /// Ask a relay to make the recipient dial us back (TCP only).
    ReverseConnect,
    /// Route the message through one of the recipient's relays.
    Relay,
    /// Punch a UDP hole, both sides are behind NAT.
    HolePunch,
}

/// Pick the delivery strategy from the descriptors and the message.
///
/// Pure function; calling it twice with the same inputs yields the
/// same verdict.
pub fn select(
    sender: &PeerAddress,
    recipient: &PeerAddress,
    command: Command,
    udp: bool,
) -> Result<StrategyVerdict, Error> {
    if !recipient.relayed {
        return Ok(StrategyVerdict::Direct);
    }

    // a relayed descriptor without relays is unusable.
    if recipient.relays.is_empty() {
        return Err(Error::RelayUnavailable);
    }

    if !sender.relayed {
        return Ok(if udp {
            StrategyVerdict::Relay
        } else {
            StrategyVerdict::ReverseConnect
        });
    }

    if command == Command::DIRECT_DATA && udp {
        return Ok(StrategyVerdict::HolePunch);
    }

    Ok(StrategyVerdict::Relay)
}

/// Reject verdicts that make no sense for the wire the caller picked.
/// A reverse connection needs a TCP back-dial, so it can never carry a
/// UDP message.
pub fn validate(verdict: StrategyVerdict, udp: bool) -> Result<StrategyVerdict, Error> {
    if udp && verdict == StrategyVerdict::ReverseConnect {
        return Err(Error::InvalidStrategy(
            "reverse connection over udp".to_string(),
        ));
    }

    Ok(verdict)
}

/// Choose one relay uniformly at random for this attempt.
///
/// Seeded from the local peer id and the attempt ordinal so runs are
/// reproducible per peer.
pub fn pick_relay<'a>(
    relays: &'a [PeerSocketAddress],
    local: &PeerId,
    attempt: u64,
) -> Option<&'a PeerSocketAddress> {
    if relays.is_empty() {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(local.low_u64() ^ attempt.wrapping_mul(0x9E37_79B9));
    relays.get(rng.random_range(0..relays.len()))
}
