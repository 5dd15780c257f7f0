//! Multiplexed message transport between processes.
//!
//! A [`ChannelGroup`] owns every TCP connection of one process. Each
//! connection gets a reader task that decodes frames into the group's single
//! inbound queue and a writer task that drains an unbounded outbound queue,
//! so [`ChannelSender::send`] never blocks and preserves per-channel order.
//!
//! # Components
//!
//! - [`ChannelGroup`]: listener, connector and merged inbound queue
//! - [`ChannelSender`]: cloneable handle that enqueues messages for one peer
//! - [`proxy`]: typed per-role wrappers around a [`ChannelSender`]

pub mod proxy;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::error::{JobError, Result};
use crate::protocol::{Message, MessageCodec};

pub use proxy::{BackendProxy, FrontendProxy, JobProxy, SchedulerProxy};

/// Identifies one connection within a [`ChannelGroup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub enum ChannelEvent {
    Message(Message),
    /// The connection ended. `None` is an orderly close by the peer.
    Closed(Option<JobError>),
}

/// One event from one connection.
#[derive(Debug)]
pub struct Inbound {
    pub channel: ChannelId,
    pub event: ChannelEvent,
}

/// Enqueues messages for one peer.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    id: ChannelId,
    peer: Option<SocketAddr>,
    tx: mpsc::UnboundedSender<Message>,
    flush_tx: Option<mpsc::UnboundedSender<oneshot::Sender<()>>>,
}

impl ChannelSender {
    pub fn new(id: ChannelId, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            peer: None,
            tx,
            flush_tx: None,
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Remote socket address, when the channel is a TCP connection.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Queues `msg` for transmission. Fails only once the writer has stopped.
    pub fn send(&self, msg: impl Into<Message>) -> Result<()> {
        self.tx
            .send(msg.into())
            .map_err(|_| JobError::ChannelClosed(self.id.0))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Waits until every message queued before this call has been written
    /// to the socket, or the writer has stopped.
    pub async fn flush(&self) {
        let Some(flush_tx) = &self.flush_tx else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if flush_tx.send(done_tx).is_ok() {
            let _ = done_rx.await;
        }
    }
}

struct Shared {
    next_id: AtomicU64,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    senders: Mutex<HashMap<ChannelId, ChannelSender>>,
    /// Cancelled when the group is dropped; stops every reader.
    dropped: CancellationToken,
}

impl Shared {
    async fn attach(self: &Arc<Self>, stream: TcpStream) -> ChannelSender {
        let id = ChannelId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(channel = %id, error = %e, "Failed to set TCP_NODELAY");
        }
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (flush_tx, mut flush_rx) = mpsc::unbounded_channel::<oneshot::Sender<()>>();
        let mut sender = ChannelSender::new(id, out_tx);
        sender.flush_tx = Some(flush_tx);
        if let Some(peer) = peer {
            sender = sender.with_peer(peer);
        }
        self.senders.lock().await.insert(id, sender.clone());

        let inbound_tx = self.inbound_tx.clone();
        tokio::spawn(async move {
            let mut frames = FramedWrite::new(write_half, MessageCodec::new());
            loop {
                let result = tokio::select! {
                    biased;
                    msg = out_rx.recv() => match msg {
                        Some(msg) => frames.send(msg).await,
                        None => return,
                    },
                    Some(done) = flush_rx.recv() => {
                        // Anything sent before the flush request is already queued.
                        let mut result = Ok(());
                        while let Ok(msg) = out_rx.try_recv() {
                            result = frames.send(msg).await;
                            if result.is_err() {
                                break;
                            }
                        }
                        let _ = done.send(());
                        result
                    }
                };
                if let Err(e) = result {
                    tracing::debug!(channel = %id, error = %e, "Channel write failed");
                    let _ = inbound_tx.send(Inbound {
                        channel: id,
                        event: ChannelEvent::Closed(Some(e)),
                    });
                    return;
                }
            }
        });

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let mut frames = FramedRead::new(read_half, MessageCodec::new());
            let closed = loop {
                let next = tokio::select! {
                    _ = shared.dropped.cancelled() => break None,
                    next = frames.next() => next,
                };
                match next {
                    Some(Ok(msg)) => {
                        tracing::trace!(channel = %id, method = msg.name(), "Received message");
                        if shared
                            .inbound_tx
                            .send(Inbound {
                                channel: id,
                                event: ChannelEvent::Message(msg),
                            })
                            .is_err()
                        {
                            // Group dropped; nobody is listening any more.
                            return;
                        }
                    }
                    Some(Err(e)) => break Some(e),
                    None => break None,
                }
            };
            shared.senders.lock().await.remove(&id);
            let _ = shared.inbound_tx.send(Inbound {
                channel: id,
                event: ChannelEvent::Closed(closed),
            });
        });

        sender
    }
}

/// All connections of one process plus their merged inbound queue.
pub struct ChannelGroup {
    shared: Arc<Shared>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    local_addr: Option<SocketAddr>,
    accept_handle: Option<JoinHandle<()>>,
}

impl Default for ChannelGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelGroup {
    /// A group that only makes outbound connections.
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                next_id: AtomicU64::new(1),
                inbound_tx,
                senders: Mutex::new(HashMap::new()),
                dropped: CancellationToken::new(),
            }),
            inbound_rx,
            local_addr: None,
            accept_handle: None,
        }
    }

    /// A group that also accepts connections on `addr`.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let mut group = Self::new();
        group.local_addr = Some(listener.local_addr()?);

        let shared = Arc::clone(&group.shared);
        group.accept_handle = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let sender = shared.attach(stream).await;
                        tracing::debug!(channel = %sender.id(), peer = %peer, "Accepted connection");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                    }
                }
            }
        }));

        tracing::info!(addr = %group.local_addr.unwrap_or(addr), "Listening for channels");
        Ok(group)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Opens a channel to `addr` (`host:port`).
    pub async fn connect(&self, addr: &str) -> Result<ChannelSender> {
        let stream = TcpStream::connect(addr).await?;
        let sender = self.shared.attach(stream).await;
        tracing::debug!(channel = %sender.id(), addr, "Connected");
        Ok(sender)
    }

    /// Next event from any channel. Blocks until one arrives.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbound_rx.recv().await
    }

    /// The sender for a live channel, e.g. one accepted by the listener.
    pub async fn sender(&self, id: ChannelId) -> Option<ChannelSender> {
        self.shared.senders.lock().await.get(&id).cloned()
    }

    /// Forgets the group's handle for `id`; the connection shuts down once
    /// every other clone of its sender is dropped.
    pub async fn close(&self, id: ChannelId) {
        self.shared.senders.lock().await.remove(&id);
    }

    /// Waits up to `grace` for every live channel to write out what has
    /// been queued so far. Used before a process exits.
    pub async fn flush(&self, grace: Duration) {
        let senders: Vec<ChannelSender> =
            self.shared.senders.lock().await.values().cloned().collect();
        let all = futures::future::join_all(senders.iter().map(|s| s.flush()));
        if tokio::time::timeout(grace, all).await.is_err() {
            tracing::debug!("Timed out flushing channels");
        }
    }
}

impl Drop for ChannelGroup {
    fn drop(&mut self) {
        self.shared.dropped.cancel();
        if let Some(handle) = self.accept_handle.take() {
            handle.abort();
        }
    }
}
