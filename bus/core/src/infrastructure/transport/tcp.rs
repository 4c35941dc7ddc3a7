// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! TCP broker substrate
//!
//! [`TcpBroker`] is a standalone pub/sub hub (`meshbus broker run`); every
//! agent process and mesh node reaches it through a [`TcpPubSub`] backend.
//!
//! ## Wire format
//!
//! Each frame is a big-endian `u32` body length followed by the body:
//!
//! ```text
//! +----+-------------+---------+---------+
//! | op | channel len | channel | payload |
//! | u8 |   u16 BE    |  UTF-8  |  bytes  |
//! +----+-------------+---------+---------+
//! ```
//!
//! | Op | Direction | Meaning |
//! |----|-----------|---------|
//! | `SUBSCRIBE` | client to broker | forward `channel` to this connection |
//! | `SUBSCRIBED` | broker to client | the subscription is live |
//! | `PUBLISH` | client to broker | fan `payload` out on `channel` |
//! | `DELIVER` | broker to client | a payload published on a subscribed channel |
//! | `PING` / `PONG` | both | liveness check |
//!
//! Frames on one connection are handled in order, so payloads from one
//! publisher on one channel reach every subscriber in publish order.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::memory::InMemoryPubSub;
use crate::domain::transport::{ByteStream, PubSubBackend, TransportError};

const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const OUTBOUND_QUEUE: usize = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

const OP_SUBSCRIBE: u8 = 1;
const OP_SUBSCRIBED: u8 = 2;
const OP_PUBLISH: u8 = 3;
const OP_DELIVER: u8 = 4;
const OP_PING: u8 = 5;
const OP_PONG: u8 = 6;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Frame truncated")]
    Truncated,

    #[error("Unknown frame op {0}")]
    UnknownOp(u8),

    #[error("Channel name is not UTF-8")]
    Channel,

    #[error("Channel name longer than {} bytes", u16::MAX)]
    ChannelTooLong,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Frame {
    Subscribe { channel: String },
    Subscribed { channel: String },
    Publish { channel: String, payload: Bytes },
    Deliver { channel: String, payload: Bytes },
    Ping,
    Pong,
}

impl Frame {
    fn encode(&self) -> Result<Bytes, FrameError> {
        let (op, channel, payload) = match self {
            Self::Subscribe { channel } => (OP_SUBSCRIBE, channel.as_str(), None),
            Self::Subscribed { channel } => (OP_SUBSCRIBED, channel.as_str(), None),
            Self::Publish { channel, payload } => (OP_PUBLISH, channel.as_str(), Some(payload)),
            Self::Deliver { channel, payload } => (OP_DELIVER, channel.as_str(), Some(payload)),
            Self::Ping => (OP_PING, "", None),
            Self::Pong => (OP_PONG, "", None),
        };
        let channel_len = u16::try_from(channel.len()).map_err(|_| FrameError::ChannelTooLong)?;

        let mut body = BytesMut::with_capacity(3 + channel.len() + payload.map_or(0, Bytes::len));
        body.put_u8(op);
        body.put_u16(channel_len);
        body.put_slice(channel.as_bytes());
        if let Some(payload) = payload {
            body.put_slice(payload);
        }
        Ok(body.freeze())
    }

    fn decode(mut body: Bytes) -> Result<Self, FrameError> {
        if body.remaining() < 3 {
            return Err(FrameError::Truncated);
        }
        let op = body.get_u8();
        let channel_len = usize::from(body.get_u16());
        if body.remaining() < channel_len {
            return Err(FrameError::Truncated);
        }
        let channel = String::from_utf8(body.split_to(channel_len).to_vec()).map_err(|_| FrameError::Channel)?;
        let payload = body;

        match op {
            OP_SUBSCRIBE => Ok(Self::Subscribe { channel }),
            OP_SUBSCRIBED => Ok(Self::Subscribed { channel }),
            OP_PUBLISH => Ok(Self::Publish { channel, payload }),
            OP_DELIVER => Ok(Self::Deliver { channel, payload }),
            OP_PING => Ok(Self::Ping),
            OP_PONG => Ok(Self::Pong),
            other => Err(FrameError::UnknownOp(other)),
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    let body = frame
        .encode()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// Next frame, or `None` when the peer closed the connection cleanly.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Frame>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds {MAX_FRAME_LEN}"),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Frame::decode(Bytes::from(body))
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Writes queued frames until every sender is gone or the socket fails.
fn spawn_writer<W>(mut writer: W, mut outbound: mpsc::Receiver<Frame>, closed: CancellationToken) -> tokio::task::JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                frame = outbound.recv() => frame,
                _ = closed.cancelled() => None,
            };
            let Some(frame) = frame else { break };
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!("Connection write failed: {}", e);
                break;
            }
        }
        closed.cancel();
    })
}

/// Standalone pub/sub hub serving [`TcpPubSub`] clients.
pub struct TcpBroker {
    listener: TcpListener,
    hub: InMemoryPubSub,
}

impl TcpBroker {
    pub async fn bind(addr: &str, channel_capacity: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            hub: InMemoryPubSub::with_capacity(channel_capacity),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts clients until `shutdown`, then closes every connection.
    pub async fn run(self, shutdown: CancellationToken) {
        match self.local_addr() {
            Ok(addr) => info!(addr = %addr, "Broker listening"),
            Err(e) => warn!("Broker listening on an unknown address: {}", e),
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Broker client connected");
                        tokio::spawn(serve_client(stream, peer, self.hub.clone(), shutdown.child_token()));
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
                _ = shutdown.cancelled() => break,
            }
        }
        info!("Broker stopped");
    }
}

async fn serve_client(stream: TcpStream, peer: SocketAddr, hub: InMemoryPubSub, closed: CancellationToken) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, "Could not disable Nagle: {}", e);
    }
    let (mut reader, writer) = stream.into_split();
    let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE);
    let writer_task = spawn_writer(writer, queue, closed.clone());
    let mut subscribed = HashSet::new();

    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = closed.cancelled() => break,
        };
        match frame {
            Ok(Some(Frame::Subscribe { channel })) => {
                if subscribed.insert(channel.clone()) {
                    if let Err(e) = forward(&hub, &channel, outbound.clone(), closed.clone()).await {
                        warn!(peer = %peer, channel = %channel, "Broker subscribe failed: {}", e);
                        subscribed.remove(&channel);
                        continue;
                    }
                }
                if outbound.send(Frame::Subscribed { channel }).await.is_err() {
                    break;
                }
            }
            Ok(Some(Frame::Publish { channel, payload })) => {
                if let Err(e) = hub.publish(&channel, payload).await {
                    warn!(peer = %peer, channel = %channel, "Broker publish failed: {}", e);
                }
            }
            Ok(Some(Frame::Ping)) => {
                if outbound.send(Frame::Pong).await.is_err() {
                    break;
                }
            }
            Ok(Some(other)) => warn!(peer = %peer, frame = ?other, "Ignoring unexpected frame from client"),
            Ok(None) => break,
            Err(e) => {
                warn!(peer = %peer, "Dropping broker client: {}", e);
                break;
            }
        }
    }

    closed.cancel();
    drop(outbound);
    if let Err(e) = writer_task.await {
        warn!(peer = %peer, "Broker writer ended abnormally: {}", e);
    }
    debug!(peer = %peer, "Broker client disconnected");
}

/// Relays one hub channel to a client connection until it closes.
async fn forward(
    hub: &InMemoryPubSub,
    channel: &str,
    outbound: mpsc::Sender<Frame>,
    closed: CancellationToken,
) -> Result<(), TransportError> {
    let mut stream = hub.subscribe(channel).await?;
    let channel = channel.to_string();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                item = stream.next() => {
                    let Some(payload) = item else { break };
                    let frame = Frame::Deliver { channel: channel.clone(), payload };
                    if outbound.send(frame).await.is_err() {
                        break;
                    }
                }
                _ = closed.cancelled() => break,
            }
        }
    });
    Ok(())
}

#[derive(Clone)]
struct Session {
    outbound: mpsc::Sender<Frame>,
    waiters: Arc<Mutex<Waiters>>,
    closed: CancellationToken,
}

#[derive(Default)]
struct Waiters {
    pongs: VecDeque<oneshot::Sender<()>>,
    subscriptions: HashMap<String, Vec<oneshot::Sender<()>>>,
}

/// [`PubSubBackend`] backed by a [`TcpBroker`].
///
/// Payloads from the broker are fanned out to local subscribers through an
/// in-process hub, so the broker forwards each channel once per process.
/// Subscriptions are replayed after a reconnect.
pub struct TcpPubSub {
    addr: String,
    local: InMemoryPubSub,
    session: Mutex<Option<Session>>,
    subscribed: Mutex<HashSet<String>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl TcpPubSub {
    pub fn new(addr: impl Into<String>, channel_capacity: usize) -> Self {
        Self {
            addr: addr.into(),
            local: InMemoryPubSub::with_capacity(channel_capacity),
            session: Mutex::new(None),
            subscribed: Mutex::new(HashSet::new()),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn broker_addr(&self) -> &str {
        &self.addr
    }

    /// Payloads lost by lagging local subscribers.
    pub fn dropped(&self) -> u64 {
        self.local.dropped()
    }

    fn session(&self) -> Result<Session, TransportError> {
        match self.session.lock().as_ref() {
            Some(session) if !session.closed.is_cancelled() => Ok(session.clone()),
            _ => Err(TransportError::Unavailable(format!("not connected to broker {}", self.addr))),
        }
    }

    async fn send(&self, session: &Session, frame: Frame) -> Result<(), TransportError> {
        session
            .outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::Unavailable(format!("connection to broker {} closed", self.addr)))
    }

    fn spawn_reader(&self, mut reader: tokio::net::tcp::OwnedReadHalf, session: &Session) {
        let local = self.local.clone();
        let waiters = session.waiters.clone();
        let closed = session.closed.clone();
        let addr = self.addr.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = read_frame(&mut reader) => frame,
                    _ = closed.cancelled() => break,
                };
                match frame {
                    Ok(Some(Frame::Deliver { channel, payload })) => {
                        if let Err(e) = local.publish(&channel, payload).await {
                            warn!(channel = %channel, "Local fan-out failed: {}", e);
                        }
                    }
                    Ok(Some(Frame::Pong)) => {
                        if let Some(waiter) = waiters.lock().pongs.pop_front() {
                            let _ = waiter.send(());
                        }
                    }
                    Ok(Some(Frame::Subscribed { channel })) => {
                        let mut waiters = waiters.lock();
                        if let Some(pending) = waiters.subscriptions.get_mut(&channel) {
                            if let Some(waiter) = pending.pop() {
                                let _ = waiter.send(());
                            }
                            if pending.is_empty() {
                                waiters.subscriptions.remove(&channel);
                            }
                        }
                    }
                    Ok(Some(other)) => warn!(broker = %addr, frame = ?other, "Ignoring unexpected frame from broker"),
                    Ok(None) => {
                        warn!(broker = %addr, "Broker closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!(broker = %addr, "Broker connection failed: {}", e);
                        break;
                    }
                }
            }
            closed.cancel();
            // Dropping the senders fails everyone still waiting on this session.
            let mut waiters = waiters.lock();
            waiters.pongs.clear();
            waiters.subscriptions.clear();
        });
    }

    async fn await_subscribed(&self, session: &Session, channel: &str) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        session
            .waiters
            .lock()
            .subscriptions
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        self.send(
            session,
            Frame::Subscribe {
                channel: channel.to_string(),
            },
        )
        .await?;

        match tokio::time::timeout(SUBSCRIBE_TIMEOUT, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Unavailable(format!(
                "connection to broker {} lost while subscribing",
                self.addr
            ))),
            Err(_) => Err(TransportError::Unavailable(format!(
                "broker {} did not confirm subscription to {channel}",
                self.addr
            ))),
        }
    }
}

#[async_trait]
impl PubSubBackend for TcpPubSub {
    async fn connect(&self) -> Result<(), TransportError> {
        let _guard = self.connect_lock.lock().await;
        if self.session().is_ok() {
            return Ok(());
        }

        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(TransportError::Unavailable(format!("broker {}: {e}", self.addr))),
            Err(_) => {
                return Err(TransportError::Unavailable(format!(
                    "broker {} did not accept within {CONNECT_TIMEOUT:?}",
                    self.addr
                )))
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(broker = %self.addr, "Could not disable Nagle: {}", e);
        }

        let (reader, writer) = stream.into_split();
        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE);
        let session = Session {
            outbound,
            waiters: Arc::new(Mutex::new(Waiters::default())),
            closed: CancellationToken::new(),
        };
        spawn_writer(writer, queue, session.closed.clone());
        self.spawn_reader(reader, &session);
        *self.session.lock() = Some(session.clone());

        let channels: Vec<String> = self.subscribed.lock().iter().cloned().collect();
        for channel in &channels {
            self.await_subscribed(&session, channel).await?;
        }
        info!(broker = %self.addr, resubscribed = channels.len(), "Connected to broker");
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError> {
        let session = self.session()?;
        self.send(
            &session,
            Frame::Publish {
                channel: channel.to_string(),
                payload,
            },
        )
        .await
    }

    async fn subscribe(&self, channel: &str) -> Result<ByteStream, TransportError> {
        let session = self.session()?;
        // The local receiver exists before the broker starts forwarding.
        let stream = self.local.subscribe(channel).await?;
        let fresh = self.subscribed.lock().insert(channel.to_string());
        if fresh {
            if let Err(e) = self.await_subscribed(&session, channel).await {
                self.subscribed.lock().remove(channel);
                return Err(e);
            }
        }
        Ok(stream)
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let session = self.session()?;
        let (tx, rx) = oneshot::channel();
        session.waiters.lock().pongs.push_back(tx);
        self.send(&session, Frame::Ping).await?;
        rx.await
            .map_err(|_| TransportError::Unavailable(format!("connection to broker {} lost", self.addr)))
    }

    fn name(&self) -> &str {
        "tcp"
    }
}

impl Drop for TcpPubSub {
    fn drop(&mut self) {
        if let Some(session) = self.session.lock().take() {
            session.closed.cancel();
        }
    }
}
