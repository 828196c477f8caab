mod hole_punch;
mod rcon;
mod relay;

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use codec::{Message, PeerAddress, Signer};
use tokio::time::Duration;

use crate::{
    PingFactory, RequestHandler,
    channel::{ChannelPool, ChannelSet, tcp, tcp::TcpChannel, udp::UdpChannel},
    completion::{Outcome, ResponseCompletion},
    config::TransportConfig,
    connection::PeerConnection,
    error::Error,
    registry::PendingRegistry,
    status::StatusListeners,
    strategy::{self, StrategyVerdict},
};

/// Per-send overrides for the timeouts and the channel to use.
#[derive(Default, Clone)]
pub struct SendOptions {
    pub idle_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    /// A live long-lived connection to write on instead of opening a
    /// fresh channel.
    pub connection: Option<PeerConnection>,
}

/// Shared state of the transport: everything the send paths, the
/// channel tasks and the inbound dispatcher need.
pub(crate) struct SendCore {
    pub local: PeerAddress,
    pub config: TransportConfig,
    pub pool: ChannelPool,
    pub channels: ChannelSet,
    pub pending: Arc<PendingRegistry>,
    pub status: StatusListeners,
    pub ping: Arc<dyn PingFactory>,
    pub handler: Arc<dyn RequestHandler>,
    pub signer: Option<Arc<dyn Signer>>,
    next_id: AtomicU32,
    shutting_down: AtomicBool,
}

impl SendCore {
    pub fn new(
        local: PeerAddress,
        config: TransportConfig,
        ping: Arc<dyn PingFactory>,
        handler: Arc<dyn RequestHandler>,
        signer: Option<Arc<dyn Signer>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool: ChannelPool::new(config.max_tcp_channels, config.max_udp_channels),
            channels: ChannelSet::default(),
            pending: Arc::new(PendingRegistry::new(config.rcon_cache_size)),
            status: StatusListeners::default(),
            next_id: AtomicU32::new(rand::random::<u32>().max(1)),
            shutting_down: AtomicBool::new(false),
            local,
            config,
            ping,
            handler,
            signer,
        })
    }

    /// Next message id for transport-built messages. Never 0, which
    /// callers use for "assign one for me".
    pub fn fresh_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.pending.fail_all(Error::Shutdown);
        self.channels.close_all();
    }

    /// Register a completion and attach its registry cleanup: the
    /// cleanup listener is first in line, so the entry is gone before
    /// any user listener observes the outcome.
    pub(crate) fn register(&self, completion: &ResponseCompletion) -> Result<(), Error> {
        self.pending.insert(completion.clone())?;

        let pending = self.pending.clone();
        let id = completion.request_id();
        completion.on_done(move |_| {
            pending.remove(id);
        });

        Ok(())
    }

    /// Fail a send: the registry entry goes first, then the terminal
    /// transition, then the log line.
    pub(crate) fn fail_send(&self, completion: &ResponseCompletion, error: Error) {
        self.pending.remove(completion.request_id());
        crate::error::log_failure(
            &format!("send failed: id={}", completion.request_id()),
            &error,
        );
        completion.fail(error);
    }

    /// Entry point for one application send: stamp the message, pick a
    /// strategy and hand it to the matching orchestrator. Returns
    /// immediately; the caller awaits the completion.
    pub(crate) fn submit(
        self: &Arc<Self>,
        mut message: Message,
        udp: bool,
        options: SendOptions,
    ) -> ResponseCompletion {
        if message.id == 0 {
            message.id = self.fresh_id();
        }

        message.udp = udp;
        message.sender = self.local.clone();

        let completion = ResponseCompletion::new(message.id);
        if self.is_shutting_down() {
            completion.fail(Error::Shutdown);
            return completion;
        }

        let verdict = match strategy::select(&message.sender, &message.recipient, message.command, udp)
            .and_then(|it| strategy::validate(it, udp))
        {
            Ok(verdict) => verdict,
            Err(e) => {
                completion.fail(e);
                return completion;
            }
        };

        // every expected-reply send sits in the registry from here on:
        // duplicate ids are rejected up front and a shutdown reaches
        // sends still in their connect phase.
        if message.expects_reply() {
            if let Err(e) = self.register(&completion) {
                completion.fail(e);
                return completion;
            }
        }

        log::debug!(
            "send: id={}, command={:?}, verdict={:?}, udp={}",
            message.id,
            message.command,
            verdict,
            udp
        );

        let core = self.clone();
        let task = completion.clone();
        tokio::spawn(async move {
            match verdict {
                StrategyVerdict::Direct if udp => core.direct_udp(message, task, options).await,
                StrategyVerdict::Direct => core.direct_tcp(message, task, options).await,
                StrategyVerdict::ReverseConnect => {
                    core.reverse_connect(message, task, options).await
                }
                StrategyVerdict::Relay => core.relay_send(message, task, udp, options).await,
                StrategyVerdict::HolePunch => core.hole_punch(message, task, options).await,
            }
        });

        completion
    }

    /// Failure kinds that say something about the recipient are
    /// reported to the status listeners, unless the recipient is only
    /// reachable through relays anyway.
    fn watch_liveness(&self, message: &Message, completion: &ResponseCompletion) {
        if message.recipient.relayed {
            return;
        }

        let status = self.status.clone();
        let recipient = message.recipient.clone();
        completion.on_done(move |outcome| {
            if let Outcome::Failed(error) = outcome {
                if error.is_liveness() {
                    status.peer_failed(&recipient, error);
                }
            }
        });
    }

    /// Direct TCP send. The completion must already be registered when
    /// a reply is expected.
    pub(crate) async fn direct_tcp(
        self: &Arc<Self>,
        message: Message,
        completion: ResponseCompletion,
        options: SendOptions,
    ) {
        if completion.is_terminal() {
            return;
        }

        self.watch_liveness(&message, &completion);

        let idle = options.idle_timeout.unwrap_or(self.config.idle_tcp());
        let connect_timeout = options
            .connect_timeout
            .unwrap_or(self.config.connect_timeout_duration());

        if let Some(connection) = options.connection.as_ref().filter(|it| it.is_active()) {
            self.write_reusing(&message, &completion, connection, idle)
                .await;
            return;
        }

        let permit = match self.pool.acquire_tcp() {
            Ok(permit) => permit,
            Err(e) => return self.fail_send(&completion, e),
        };
        completion.add_release(move || drop(permit));

        let addr = message.recipient.socket.tcp();
        if addr.port() == 0 {
            return self.fail_send(
                &completion,
                Error::Connect("recipient has no tcp port".to_string()),
            );
        }

        let stream = tokio::select! {
            // resolved while dialing: cancellation or shutdown won.
            _ = completion.wait() => return,
            result = tcp::connect(addr, connect_timeout) => match result {
                Ok(stream) => stream,
                Err(e) => return self.fail_send(&completion, e),
            }
        };

        let channel = TcpChannel::spawn(stream, addr, self, Some(idle));
        {
            let shared = channel.shared.clone();
            completion.add_cancel_hook(move || shared.close());
        }

        if message.expects_reply() {
            channel.shared.arm(completion.clone());
        }

        if let Err(e) = channel.write(&message).await {
            self.fail_send(&completion, e);
            return;
        }

        if !message.expects_reply() {
            completion.succeed(None);
            if !message.keep_alive {
                channel.close();
            }
            return;
        }

        if !message.keep_alive {
            let shared = channel.shared.clone();
            completion.on_done(move |_| shared.close());
        }
    }

    /// Write over a supplied long-lived connection. Writes on the same
    /// connection serialize behind its write lock.
    async fn write_reusing(
        &self,
        message: &Message,
        completion: &ResponseCompletion,
        connection: &PeerConnection,
        idle: Duration,
    ) {
        let channel = connection.channel();

        if message.expects_reply() {
            channel.shared.arm(completion.clone());
            channel.shared.set_idle(Some(idle));

            // the connection outlives the exchange; disarm once done.
            let shared = channel.shared.clone();
            completion.on_done(move |_| shared.set_idle(None));
        }

        if let Err(e) = channel.write(message).await {
            self.fail_send(completion, e);
            return;
        }

        if !message.expects_reply() {
            completion.succeed(None);
        }
    }

    /// Direct UDP send on a fresh ephemeral channel. The completion
    /// must already be registered when a reply is expected.
    pub(crate) async fn direct_udp(
        self: &Arc<Self>,
        message: Message,
        completion: ResponseCompletion,
        options: SendOptions,
    ) {
        if completion.is_terminal() {
            return;
        }

        self.watch_liveness(&message, &completion);

        let idle = options.idle_timeout.unwrap_or(self.config.idle_udp());
        let permit = match self.pool.acquire_udp() {
            Ok(permit) => permit,
            Err(e) => return self.fail_send(&completion, e),
        };
        completion.add_release(move || drop(permit));

        let target = message.recipient.socket.udp();
        if target.port() == 0 {
            return self.fail_send(
                &completion,
                Error::Connect("recipient has no udp port".to_string()),
            );
        }

        let channel = match UdpChannel::bind(0, self, Some(idle)).await {
            Ok(channel) => channel,
            Err(e) => return self.fail_send(&completion, e),
        };
        {
            let shared = channel.shared.clone();
            completion.add_cancel_hook(move || shared.close());
        }

        if message.expects_reply() {
            channel.shared.arm(completion.clone());
        }

        if let Err(e) = channel.send(&message, target).await {
            self.fail_send(&completion, e);
            return;
        }

        if !message.expects_reply() {
            completion.succeed(None);
            channel.close();
            return;
        }

        let shared = channel.shared.clone();
        completion.on_done(move |_| shared.close());
    }
}
