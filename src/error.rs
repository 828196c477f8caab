/// Terminal failure reasons for a send.
///
/// Orchestrators surface the leaf kind as the outer completion's
/// reason; nothing is swallowed or re-wrapped on the way out.
#[derive(Debug, Clone)]
pub enum Error {
    /// The selector refused the combination, e.g. a reverse connection
    /// over UDP. Fatal, no retry.
    InvalidStrategy(String),
    /// Pool exhausted or socket bind failed. Fatal for this attempt;
    /// the caller may retry.
    ChannelCreation(String),
    /// TCP connect failed: refused, timed out, or the channel dropped
    /// before it became active.
    Connect(String),
    /// Outbound write failed after connect. The channel is closed.
    Write(String),
    /// No inbound activity within the idle budget.
    IdleTimeout,
    /// Explicit DENIED reply from the peer. Not retryable here.
    Denied,
    /// No relay of the recipient was reachable.
    RelayUnavailable,
    /// Hole-punch reply missing its integer list, odd count, or wrong
    /// command.
    HolePunchMalformed(String),
    /// A message id collided with one already in flight.
    DuplicateId(u32),
    /// User or upstream cancellation.
    Cancelled,
    /// The transport is shutting down.
    Shutdown,
    /// Wire-level decode failure on the channel carrying the reply.
    Codec(codec::Error),
}

impl Error {
    /// Failure kinds that say something about the recipient's
    /// liveness. Only these trigger peer-status notifications.
    pub fn is_liveness(&self) -> bool {
        matches!(
            self,
            Error::Connect(_) | Error::Write(_) | Error::IdleTimeout
        )
    }
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidStrategy(it) => write!(f, "invalid strategy: {}", it),
            Error::ChannelCreation(it) => write!(f, "channel creation failed: {}", it),
            Error::Connect(it) => write!(f, "connect failed: {}", it),
            Error::Write(it) => write!(f, "write failed: {}", it),
            Error::IdleTimeout => write!(f, "idle timeout"),
            Error::Denied => write!(f, "denied by peer"),
            Error::RelayUnavailable => write!(f, "no relay reachable"),
            Error::HolePunchMalformed(it) => write!(f, "malformed hole punch reply: {}", it),
            Error::DuplicateId(it) => write!(f, "message id {} already in flight", it),
            Error::Cancelled => write!(f, "cancelled"),
            Error::Shutdown => write!(f, "shutting down"),
            Error::Codec(it) => write!(f, "codec error: {}", it),
        }
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        Self::Codec(value)
    }
}

/// Failures that race with cancellation or a closing channel are
/// routine and logged at debug; everything else is worth a warning.
pub(crate) fn log_failure(context: &str, error: &Error) {
    match error {
        Error::Cancelled | Error::Connect(_) => {
            log::debug!("{}: {}", context, error);
        }
        _ => {
            log::warn!("{}: {}", context, error);
        }
    }
}
