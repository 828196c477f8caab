use std::time::Duration;

use serde::Deserialize;

/// Transport tuning knobs.
///
/// Every field has a default matching the values the node ships with,
/// so a configuration file only needs to name what it changes.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", default)]
pub struct TransportConfig {
    ///
    /// TCP connect timeout in milliseconds.
    ///
    pub connect_timeout: u64,
    ///
    /// Idle timeout for TCP channels in milliseconds.
    ///
    /// If nothing is read or written within this budget while a reply
    /// is outstanding, the send fails and the channel is closed.
    ///
    pub idle_timeout_tcp: u64,
    ///
    /// Idle timeout for UDP channels in milliseconds.
    ///
    pub idle_timeout_udp: u64,
    ///
    /// How long a reverse-connection setup may wait for the remote
    /// peer to dial back, in milliseconds.
    ///
    pub rcon_timeout: u64,
    ///
    /// Maximum number of concurrently borrowed outbound TCP channels.
    ///
    pub max_tcp_channels: usize,
    ///
    /// Maximum number of concurrently borrowed outbound UDP channels.
    ///
    pub max_udp_channels: usize,
    ///
    /// Candidate local ports offered in a hole-punch exchange.
    ///
    pub hole_punch_ports: usize,
    ///
    /// Upper bound on cached reverse-connection originals. The oldest
    /// entry is evicted first.
    ///
    pub rcon_cache_size: usize,
    ///
    /// Heartbeat interval for long-lived peer connections in
    /// milliseconds.
    ///
    pub heartbeat: u64,
}

impl TransportConfig {
    fn connect_timeout() -> u64 {
        5000
    }

    fn idle_timeout_tcp() -> u64 {
        5000
    }

    fn idle_timeout_udp() -> u64 {
        2000
    }

    fn rcon_timeout() -> u64 {
        10000
    }

    fn max_tcp_channels() -> usize {
        64
    }

    fn max_udp_channels() -> usize {
        64
    }

    fn hole_punch_ports() -> usize {
        3
    }

    fn rcon_cache_size() -> usize {
        1024
    }

    fn heartbeat() -> u64 {
        15000
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.connect_timeout)
    }

    pub fn idle_tcp(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_tcp)
    }

    pub fn idle_udp(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_udp)
    }

    pub fn rcon_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.rcon_timeout)
    }

    pub fn heartbeat_duration(&self) -> Duration {
        Duration::from_millis(self.heartbeat)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Self::connect_timeout(),
            idle_timeout_tcp: Self::idle_timeout_tcp(),
            idle_timeout_udp: Self::idle_timeout_udp(),
            rcon_timeout: Self::rcon_timeout(),
            max_tcp_channels: Self::max_tcp_channels(),
            max_udp_channels: Self::max_udp_channels(),
            hole_punch_ports: Self::hole_punch_ports(),
            rcon_cache_size: Self::rcon_cache_size(),
            heartbeat: Self::heartbeat(),
        }
    }
}
