use std::{net::SocketAddr, sync::Arc};

use bytes::BytesMut;
use codec::{Message, Signer, StreamDecoder, stream};
use tokio::{
    io::AsyncReadExt,
    io::AsyncWriteExt,
    net::{TcpStream, tcp::OwnedReadHalf, tcp::OwnedWriteHalf},
    time::Duration,
};

use super::{ChannelShared, idle_sleep};
use crate::{dispatch::Inbound, error::Error, sender::SendCore};

/// Dial with the configured connect budget.
pub(crate) async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, Error> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(Error::Connect(e.to_string())),
        Err(_) => Err(Error::Connect(format!(
            "connect timeout after {:?}",
            timeout
        ))),
    }
}

/// One TCP channel: the read loop runs in its own task, writes go
/// through the handle. The write half sits behind an async mutex, which
/// is what serializes concurrent sends on a reused connection.
pub(crate) struct TcpChannel {
    pub shared: Arc<ChannelShared>,
    remote: SocketAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    signer: Option<Arc<dyn Signer>>,
}

impl TcpChannel {
    /// Wire a freshly connected or accepted stream into the transport:
    /// register it with the channel set and spawn its read task.
    pub fn spawn(
        stream: TcpStream,
        remote: SocketAddr,
        core: &Arc<SendCore>,
        idle: Option<Duration>,
    ) -> Arc<Self> {
        let shared = core.channels.register(core.pending.clone(), idle);
        let (reader, writer) = stream.into_split();

        let channel = Arc::new(Self {
            shared,
            remote,
            writer: tokio::sync::Mutex::new(writer),
            signer: core.signer.clone(),
        });

        tokio::spawn(run(reader, channel.clone(), core.clone()));
        channel
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    pub fn close(&self) {
        self.shared.close();
    }

    /// Encode and write one frame. Any write failure closes the
    /// channel.
    pub async fn write(&self, message: &Message) -> Result<(), Error> {
        let mut bytes = BytesMut::new();
        stream::encode(message, &mut bytes, self.signer.as_deref())?;

        let result = {
            let mut writer = self.writer.lock().await;
            writer.write_all(&bytes).await
        };

        if let Err(e) = result {
            self.close();
            return Err(Error::Write(e.to_string()));
        }

        self.shared.touch();
        log::trace!(
            "tcp channel send: size={}, addr={}, id={}",
            bytes.len(),
            self.remote,
            message.id
        );

        Ok(())
    }
}

async fn run(mut reader: OwnedReadHalf, channel: Arc<TcpChannel>, core: Arc<SendCore>) {
    let mut decoder = StreamDecoder::default();
    let mut closed = channel.shared.subscribe_close();

    let error = 'outer: loop {
        // a close that raced the subscription above must not be lost.
        if !channel.shared.is_active() {
            break Some(Error::Connect("channel closed".to_string()));
        }

        let deadline = channel.shared.idle_deadline();

        tokio::select! {
            result = reader.read_buf(decoder.buffer()) => match result {
                Ok(0) => break Some(Error::Connect("channel closed by remote".to_string())),
                Ok(size) => {
                    channel.shared.touch();
                    log::trace!(
                        "tcp channel receive: size={}, addr={}",
                        size,
                        channel.remote
                    );

                    loop {
                        match decoder.next() {
                            Ok(Some(message)) => {
                                core.dispatch(message, Inbound::Tcp(&channel)).await;
                            }
                            Ok(None) => break,
                            Err(e) => break 'outer Some(Error::Codec(e)),
                        }
                    }
                }
                Err(e) => break Some(Error::Connect(e.to_string())),
            },
            // locally closed: completions still armed by other sends
            // on this channel must not hang.
            _ = closed.changed() => break Some(Error::Connect("channel closed".to_string())),
            _ = idle_sleep(deadline) => {
                // the deadline may have moved while we slept.
                if channel.shared.idle_expired() {
                    break Some(Error::IdleTimeout);
                }
            }
        }
    };

    channel.shared.deactivate();
    if let Some(error) = &error {
        crate::error::log_failure(
            &format!("tcp channel dropped: addr={}", channel.remote),
            error,
        );
        channel.shared.fail_armed(error);
    }

    core.channels.deregister(channel.shared.id);
}
