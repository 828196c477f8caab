use std::{net::SocketAddr, sync::Arc};

use codec::{Command, Kind, Message};

use crate::{
    channel::{tcp::TcpChannel, udp::UdpChannel},
    error::{Error, log_failure},
    registry::CachedRequest,
    sender::SendCore,
};

/// Where an inbound message arrived. Replies and reverse-connection
/// handoffs go back out the same way.
pub(crate) enum Inbound<'a> {
    Tcp(&'a Arc<TcpChannel>),
    Udp(&'a Arc<UdpChannel>, SocketAddr),
}

impl Inbound<'_> {
    async fn reply(&self, message: &Message) -> Result<(), Error> {
        match self {
            Inbound::Tcp(channel) => channel.write(message).await,
            Inbound::Udp(channel, addr) => channel.send(message, *addr).await,
        }
    }
}

impl SendCore {
    /// Route one inbound message: replies to the registry, back-dials
    /// to the reverse-connection cache, everything else to the node's
    /// request handler.
    pub(crate) async fn dispatch(self: &Arc<Self>, message: Message, via: Inbound<'_>) {
        if !message.kind.is_request() {
            let id = message.id;
            if !self.pending.resolve(message) {
                log::trace!("unmatched reply discarded: id={}", id);
            }

            return;
        }

        if message.command == Command::RCON && message.kind == Kind::Request2 {
            match via {
                Inbound::Tcp(channel) => self.deliver_cached(message.id, channel).await,
                Inbound::Udp(..) => {
                    log::warn!("back-dial over udp discarded: id={}", message.id);
                }
            }

            return;
        }

        let wants_reply = message.expects_reply();
        if let Some(reply) = self.handler.handle(message).await {
            if !wants_reply {
                return;
            }

            if let Err(e) = via.reply(&reply).await {
                log_failure("reply send failed", &e);
            }
        }
    }

    /// A peer we asked for a reverse connection dialed back: hand the
    /// parked original to the new channel and let ordinary reply
    /// correlation take over.
    async fn deliver_cached(self: &Arc<Self>, id: u32, channel: &Arc<TcpChannel>) {
        let Some(cached) = self.pending.take_cached(id) else {
            log::debug!("back-dial without a cached original: id={}", id);
            return;
        };

        let CachedRequest {
            message,
            completion,
            idle,
        } = cached;

        if completion.is_terminal() {
            return;
        }

        channel.shared.arm(completion.clone());
        channel.shared.set_idle(Some(idle));
        {
            let shared = channel.shared.clone();
            completion.add_cancel_hook(move || shared.close());
        }

        if let Err(e) = channel.write(&message).await {
            self.fail_send(&completion, e);
            return;
        }

        log::info!(
            "reverse connection original delivered: id={}, addr={}",
            id,
            channel.remote()
        );
    }
}
