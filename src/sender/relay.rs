use std::sync::Arc;

use codec::{Kind, Message, PeerSocketAddress};
use futures::{StreamExt, stream::FuturesUnordered};

use crate::{
    completion::{Outcome, ResponseCompletion},
    error::Error,
    sender::{SendCore, SendOptions},
};

impl SendCore {
    /// Pure relay send: probe the recipient's relays, route the
    /// message through the first one that answers, drop relays that
    /// fail and retry over the remainder. DENIED is terminal.
    pub(crate) async fn relay_send(
        self: &Arc<Self>,
        message: Message,
        completion: ResponseCompletion,
        udp: bool,
        options: SendOptions,
    ) {
        let mut relays = message.recipient.relays.clone();

        loop {
            if completion.is_terminal() {
                return;
            }

            if relays.is_empty() {
                return self.fail_send(&completion, Error::RelayUnavailable);
            }

            let Some(relay) = self.probe_relays(&relays, &options).await else {
                return self.fail_send(&completion, Error::RelayUnavailable);
            };

            if completion.is_terminal() {
                return;
            }

            // aim the descriptor at the winning relay; the peer sees
            // only that relay in the descriptor from here on.
            let mut attempt_message = message.duplicate(self.fresh_id());
            attempt_message.recipient = message
                .recipient
                .with_socket(relay)
                .with_relayed(true)
                .with_relays(vec![relay]);

            let attempt = ResponseCompletion::new(attempt_message.id);
            if let Err(e) = self.register(&attempt) {
                return self.fail_send(&completion, e);
            }
            {
                let attempt = attempt.clone();
                completion.add_cancel_hook(move || {
                    attempt.cancel();
                });
            }

            if udp {
                self.direct_udp(attempt_message, attempt.clone(), options.clone())
                    .await;
            } else {
                self.direct_tcp(attempt_message, attempt.clone(), options.clone())
                    .await;
            }

            match attempt.wait().await {
                Outcome::Ok(Some(reply)) if reply.kind == Kind::Denied => {
                    return self.fail_send(&completion, Error::Denied);
                }
                Outcome::Ok(Some(reply)) if reply.kind == Kind::Exception => {
                    log::debug!("relay reported an exception, trying the next one");
                    relays.retain(|it| *it != relay);
                }
                Outcome::Ok(reply) => {
                    self.pending.remove(completion.request_id());
                    completion.succeed(reply);
                    return;
                }
                Outcome::Failed(e) => {
                    // covers connect and channel-creation failures
                    // too, not only failures with a response in hand.
                    crate::error::log_failure("relay attempt failed", &e);
                    relays.retain(|it| *it != relay);
                }
                Outcome::Cancelled => {
                    completion.cancel();
                    return;
                }
            }
        }
    }

    /// Ping every relay in parallel; first to answer wins, the rest
    /// are cancelled.
    pub(crate) async fn probe_relays(
        self: &Arc<Self>,
        relays: &[PeerSocketAddress],
        options: &SendOptions,
    ) -> Option<PeerSocketAddress> {
        let mut probes = FuturesUnordered::new();
        let mut completions = Vec::new();

        for relay in relays.iter().copied() {
            let mut ping = self.ping.ping(&relay);
            ping.id = self.fresh_id();
            ping.udp = true;
            ping.sender = self.local.clone();

            let probe = ResponseCompletion::new(ping.id);
            if self.register(&probe).is_err() {
                continue;
            }

            completions.push(probe.clone());

            let core = self.clone();
            let probe_options = SendOptions {
                connection: None,
                ..options.clone()
            };

            probes.push(async move {
                core.direct_udp(ping, probe.clone(), probe_options).await;
                (relay, probe.wait().await)
            });
        }

        let mut winner = None;
        while let Some((relay, outcome)) = probes.next().await {
            if matches!(&outcome, Outcome::Ok(Some(reply)) if reply.kind == Kind::Ok) {
                winner = Some(relay);
                break;
            }

            log::debug!("relay probe got no answer: addr={}", relay.udp());
        }

        drop(probes);
        for probe in &completions {
            probe.cancel();
        }

        winner
    }
}
