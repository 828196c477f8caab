use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use codec::{Command, Kind, Message};
use parking_lot::Mutex;
use tokio::sync::OwnedSemaphorePermit;

use crate::{
    channel::udp::UdpChannel,
    completion::{Outcome, ResponseCompletion},
    error::Error,
    sender::{SendCore, SendOptions},
    strategy,
};

/// Progress of one punch: how many duplicates are still in flight and
/// the last leaf error, surfaced if none of them lands.
struct PunchState {
    outer: ResponseCompletion,
    command: Command,
    remaining: AtomicUsize,
    last_error: Mutex<Option<Error>>,
}

impl PunchState {
    /// One duplicate reached a terminal state. The first matching OK
    /// wins the punch; later ones only count down for logging.
    fn on_duplicate_done(&self, outcome: &Outcome) {
        let outstanding = self.remaining.fetch_sub(1, Ordering::SeqCst) - 1;

        match outcome {
            Outcome::Ok(Some(reply)) if reply.command == self.command && reply.kind == Kind::Ok => {
                if self.outer.succeed(Some(reply.clone())) {
                    log::info!("hole punched: id={}", reply.id);
                } else {
                    log::debug!(
                        "late hole punch success: id={}, outstanding={}",
                        reply.id,
                        outstanding
                    );
                }
            }
            other => {
                if let Outcome::Failed(e) = other {
                    *self.last_error.lock() = Some(e.clone());
                }

                if outstanding == 0 && !self.outer.is_terminal() {
                    let error = self.last_error.lock().take().unwrap_or(Error::Connect(
                        "no hole punch duplicate succeeded".to_string(),
                    ));
                    self.outer.fail(error);
                }
            }
        }
    }
}

impl SendCore {
    /// UDP hole punch: offer candidate local ports to the peer through
    /// a relay, then fire a duplicate of the original from every local
    /// port the peer paired with one of its own.
    pub(crate) async fn hole_punch(
        self: &Arc<Self>,
        message: Message,
        completion: ResponseCompletion,
        options: SendOptions,
    ) {
        if completion.is_terminal() {
            return;
        }

        let idle = options.idle_timeout.unwrap_or(self.config.idle_udp());

        // candidate sockets come first, their ports ride in the
        // request. No idle budget yet; every exit path below closes
        // them explicitly.
        let mut candidates = Vec::new();
        for _ in 0..self.config.hole_punch_ports.max(1) {
            match self.reserve_udp(0).await {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => {
                    close_all(candidates);
                    return self.fail_send(&completion, e);
                }
            }
        }

        let Some(relay) = strategy::pick_relay(&message.recipient.relays, &self.local.id, 0)
        else {
            close_all(candidates);
            return self.fail_send(&completion, Error::RelayUnavailable);
        };

        let mut request = Message::new(
            Command::HOLEP,
            Kind::Request1,
            message.sender.clone(),
            message.recipient.with_socket(*relay),
        );
        request.version = message.version;
        request.id = self.fresh_id();
        request.udp = true;
        request.ints = candidates
            .iter()
            .map(|(channel, _)| channel.local_port() as u32)
            .collect();

        let probe = ResponseCompletion::new(request.id);
        if let Err(e) = self.register(&probe) {
            close_all(candidates);
            return self.fail_send(&completion, e);
        }
        {
            let probe = probe.clone();
            completion.add_cancel_hook(move || {
                probe.cancel();
            });
        }

        self.direct_udp(request, probe.clone(), options).await;

        let reply = match probe.wait().await {
            Outcome::Ok(Some(reply)) => reply,
            Outcome::Ok(None) => {
                close_all(candidates);
                return self.fail_send(
                    &completion,
                    Error::HolePunchMalformed("empty reply".to_string()),
                );
            }
            Outcome::Failed(e) => {
                close_all(candidates);
                return self.fail_send(&completion, e);
            }
            Outcome::Cancelled => {
                close_all(candidates);
                completion.cancel();
                return;
            }
        };

        if reply.command != Command::HOLEP || reply.kind != Kind::Ok {
            close_all(candidates);
            return self.fail_send(
                &completion,
                Error::HolePunchMalformed("wrong command".to_string()),
            );
        }

        // the integer list must pair up local and remote ports.
        if reply.ints.is_empty() || reply.ints.len() % 2 != 0 {
            close_all(candidates);
            return self.fail_send(
                &completion,
                Error::HolePunchMalformed("odd port list".to_string()),
            );
        }

        let pairs = reply
            .ints
            .chunks(2)
            .map(|it| (it[0] as u16, it[1] as u16))
            .collect::<Vec<_>>();

        log::info!(
            "hole punch pairs agreed: id={}, count={}",
            message.id,
            pairs.len()
        );

        let state = Arc::new(PunchState {
            outer: completion.clone(),
            command: message.command,
            remaining: AtomicUsize::new(pairs.len()),
            last_error: Mutex::new(None),
        });

        for (local_port, remote_port) in pairs {
            // reuse the candidate bound to that port; bind anew when
            // the peer paired a port we did not offer.
            let reserved = match candidates
                .iter()
                .position(|(channel, _)| channel.local_port() == local_port)
            {
                Some(index) => Ok(candidates.remove(index)),
                None => self.reserve_udp(local_port).await,
            };

            let (channel, permit) = match reserved {
                Ok(reserved) => reserved,
                Err(e) => {
                    state.on_duplicate_done(&Outcome::Failed(e));
                    continue;
                }
            };

            let mut duplicate = message.duplicate(self.fresh_id());
            duplicate.udp = true;
            duplicate.sender = message.sender.without_nat().with_ports(0, local_port);
            duplicate.recipient = message.recipient.without_nat().with_ports(0, remote_port);

            let sent = ResponseCompletion::new(duplicate.id);
            if let Err(e) = self.register(&sent) {
                channel.close();
                drop(permit);
                state.on_duplicate_done(&Outcome::Failed(e));
                continue;
            }

            sent.add_release(move || drop(permit));
            channel.shared.arm(sent.clone());
            channel.shared.set_idle(Some(idle));
            {
                let shared = channel.shared.clone();
                sent.on_done(move |_| shared.close());
            }
            {
                let sent = sent.clone();
                completion.add_cancel_hook(move || {
                    sent.cancel();
                });
            }

            let punch = state.clone();
            sent.on_done(move |outcome| punch.on_duplicate_done(outcome));

            let target = SocketAddr::new(message.recipient.socket.ip, remote_port);
            if let Err(e) = channel.send(&duplicate, target).await {
                self.fail_send(&sent, e);
            }
        }

        // ports we offered but the peer did not pair up.
        close_all(candidates);
    }

    async fn reserve_udp(
        self: &Arc<Self>,
        port: u16,
    ) -> Result<(Arc<UdpChannel>, OwnedSemaphorePermit), Error> {
        let permit = self.pool.acquire_udp()?;
        let channel = UdpChannel::bind(port, self, None).await?;
        Ok((channel, permit))
    }
}

fn close_all(candidates: Vec<(Arc<UdpChannel>, OwnedSemaphorePermit)>) {
    for (channel, permit) in candidates {
        channel.close();
        drop(permit);
    }
}
