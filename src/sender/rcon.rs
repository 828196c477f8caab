use std::sync::Arc;

use codec::{Command, Kind, Message};

use crate::{
    completion::{Outcome, ResponseCompletion},
    error::Error,
    registry::CachedRequest,
    sender::{SendCore, SendOptions},
    strategy,
};

impl SendCore {
    /// Reverse-connection setup: ask a relay of the unreachable
    /// recipient to make it dial us back over TCP.
    ///
    /// The original is parked in the cache, keyed by its id, before
    /// the control message goes out; the back-dial names that id and
    /// the dispatcher hands the original to the new channel.
    pub(crate) async fn reverse_connect(
        self: &Arc<Self>,
        message: Message,
        completion: ResponseCompletion,
        options: SendOptions,
    ) {
        if completion.is_terminal() {
            return;
        }

        let idle = options.idle_timeout.unwrap_or(self.config.idle_tcp());
        let Some(relay) = strategy::pick_relay(&message.recipient.relays, &self.local.id, 0)
        else {
            return self.fail_send(&completion, Error::RelayUnavailable);
        };

        let mut setup = Message::new(
            Command::RCON,
            Kind::Request1,
            message.sender.clone(),
            message.recipient.with_socket(*relay),
        );
        setup.version = message.version;
        setup.id = self.fresh_id();
        setup.keep_alive = true;
        // the id the remote peer quotes when it dials back.
        setup.ints.push(message.id);

        let original_id = message.id;
        self.pending.cache_request(CachedRequest {
            message,
            completion: completion.clone(),
            idle,
        });
        {
            let pending = self.pending.clone();
            completion.add_cancel_hook(move || pending.discard_cached(original_id));
        }

        let setup_completion = ResponseCompletion::new(setup.id);
        if let Err(e) = self.register(&setup_completion) {
            self.pending.discard_cached(original_id);
            return self.fail_send(&completion, e);
        }
        {
            let setup = setup_completion.clone();
            completion.add_cancel_hook(move || {
                setup.cancel();
            });
        }

        let core = self.clone();
        let outer = completion.clone();
        setup_completion.on_done(move |outcome| match outcome {
            Outcome::Ok(Some(reply)) if reply.kind == Kind::Ok => {
                log::info!("reverse connection accepted by relay: id={}", original_id);

                // the relay said yes; all that can still go wrong is
                // the peer never dialing back.
                tokio::spawn(async move {
                    tokio::time::sleep(core.config.rcon_timeout_duration()).await;
                    if core.pending.take_cached(original_id).is_some() {
                        core.fail_send(&outer, Error::IdleTimeout);
                    }
                });
            }
            Outcome::Ok(Some(reply)) if reply.kind == Kind::Denied => {
                // fatal; no retry on another relay.
                core.pending.discard_cached(original_id);
                core.fail_send(&outer, Error::Denied);
            }
            Outcome::Ok(_) => {
                core.pending.discard_cached(original_id);
                core.fail_send(
                    &outer,
                    Error::Connect("unexpected reverse connection reply".to_string()),
                );
            }
            Outcome::Failed(e) => {
                core.pending.discard_cached(original_id);
                core.fail_send(&outer, e.clone());
            }
            Outcome::Cancelled => {
                core.pending.discard_cached(original_id);
                outer.cancel();
            }
        });

        self.direct_tcp(
            setup,
            setup_completion,
            SendOptions {
                idle_timeout: Some(idle),
                connect_timeout: options.connect_timeout,
                connection: None,
            },
        )
        .await;
    }
}
