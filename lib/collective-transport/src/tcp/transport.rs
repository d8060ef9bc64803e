// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Rank-addressed TCP transport.
//!
//! Every rank listens on its own address from the peer table. Outbound frames
//! go through one writer task per destination, created on first use; the
//! writer keeps retrying the connect until `connect_timeout` so peers may
//! start in any order. Frames addressed to the local rank never touch a
//! socket.

use anyhow::{Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::framing::{ControlFrame, ControlFrameCodec};
use super::listener::ControlListener;
use crate::transport::{
    HealthCheckError, InboundSender, InboundStream, MAX_CONTROL_PAYLOAD, Transport, TransportError,
    inbound_channel,
};
use crate::{PeerAddress, Rank};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_RETRY: Duration = Duration::from_millis(50);
const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// TCP transport for a fixed world of ranks.
pub struct TcpTransport {
    local_rank: Rank,
    peers: Vec<SocketAddr>,
    bind_addr: SocketAddr,

    // pre-bound listener handed over by the builder, consumed by start()
    listener: Mutex<Option<std::net::TcpListener>>,
    local_addr: OnceLock<SocketAddr>,
    loopback: OnceLock<InboundSender>,

    links: DashMap<Rank, LinkHandle>,
    writers: TaskTracker,

    connect_timeout: Duration,
    connect_retry: Duration,
    flush_timeout: Duration,

    cancel_token: CancellationToken,
}

/// Handle to a peer's writer task.
#[derive(Clone)]
struct LinkHandle {
    tx: flume::Sender<Bytes>,
    state: Arc<LinkState>,
}

#[derive(Default)]
struct LinkState {
    connected: AtomicBool,
    failed: AtomicBool,
    changed: Notify,
}

impl LinkState {
    fn mark_connected(&self) {
        self.connected.store(true, Ordering::Release);
        self.changed.notify_waiters();
    }

    fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
        self.changed.notify_waiters();
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Wait until the link either connects or fails.
    async fn settled(&self) -> Result<(), HealthCheckError> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_failed() {
                return Err(HealthCheckError::ConnectionFailed);
            }
            if self.is_connected() {
                return Ok(());
            }
            notified.await;
        }
    }
}

impl TcpTransport {
    /// Create a new builder.
    pub fn builder() -> TcpTransportBuilder {
        TcpTransportBuilder::new()
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    fn peer_socket(&self, rank: Rank) -> Result<SocketAddr, TransportError> {
        self.peers
            .get(rank.as_usize())
            .copied()
            .ok_or(TransportError::UnknownPeer(rank))
    }

    /// Get or create the writer link to a peer (lazy initialization)
    fn get_or_create_link(&self, rank: Rank) -> Result<LinkHandle, TransportError> {
        // Fast path: link exists
        if let Some(handle) = self.links.get(&rank) {
            return Ok(handle.clone());
        }

        let addr = self.peer_socket(rank)?;
        if self.cancel_token.is_cancelled() {
            return Err(TransportError::NotStarted);
        }

        let handle = self
            .links
            .entry(rank)
            .or_insert_with(|| {
                let (tx, rx) = flume::unbounded();
                let state = Arc::new(LinkState::default());
                self.writers.spawn(connection_writer_task(WriterTask {
                    local_rank: self.local_rank,
                    peer: rank,
                    addr,
                    rx,
                    state: state.clone(),
                    connect_timeout: self.connect_timeout,
                    connect_retry: self.connect_retry,
                    flush_timeout: self.flush_timeout,
                    cancel_token: self.cancel_token.clone(),
                }));
                debug!(peer = %rank, "Created writer link to {}", addr);
                LinkHandle { tx, state }
            })
            .clone();

        Ok(handle)
    }

    fn take_listener(&self) -> Result<std::net::TcpListener, TransportError> {
        if let Some(listener) = self.listener.lock().take() {
            return Ok(listener);
        }
        Ok(std::net::TcpListener::bind(self.bind_addr)?)
    }
}

impl Transport for TcpTransport {
    fn local_rank(&self) -> Rank {
        self.local_rank
    }

    fn rank_count(&self) -> u32 {
        self.peers.len() as u32
    }

    fn peer_address(&self, rank: Rank) -> Option<PeerAddress> {
        let addr = self.peers.get(rank.as_usize())?;
        Some(PeerAddress::from(format!("tcp://{addr}")))
    }

    fn start(&self) -> BoxFuture<'_, Result<InboundStream, TransportError>> {
        Box::pin(async move {
            if self.cancel_token.is_cancelled() {
                return Err(TransportError::NotStarted);
            }

            let (tx, rx) = inbound_channel();
            if self.loopback.set(tx.clone()).is_err() {
                return Err(TransportError::AlreadyStarted);
            }

            let std_listener = self.take_listener()?;
            std_listener.set_nonblocking(true)?;
            let listener = TokioTcpListener::from_std(std_listener)?;
            let local_addr = listener.local_addr()?;
            self.local_addr.set(local_addr).ok();

            let control = ControlListener::new(listener, tx, self.cancel_token.clone());
            tokio::spawn(control.run());

            info!(
                rank = %self.local_rank,
                nprocs = self.peers.len(),
                "TCP transport started on {}",
                local_addr
            );

            Ok(rx)
        })
    }

    fn send(&self, dest: Rank, payload: Bytes) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(TransportError::PayloadTooLarge(payload.len()));
            }
            let loopback = self.loopback.get().ok_or(TransportError::NotStarted)?;
            if self.cancel_token.is_cancelled() {
                return Err(TransportError::NotStarted);
            }

            if dest == self.local_rank {
                return if loopback.deliver(dest, payload) {
                    Ok(())
                } else {
                    Err(TransportError::NotStarted)
                };
            }

            let link = self.get_or_create_link(dest)?;
            if link.state.is_failed() || link.tx.send(payload).is_err() {
                return Err(TransportError::PeerUnreachable(dest));
            }
            Ok(())
        })
    }

    fn check_health(
        &self,
        rank: Rank,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<(), HealthCheckError>> {
        Box::pin(async move {
            if rank.as_usize() >= self.peers.len() {
                return Err(HealthCheckError::PeerNotRegistered);
            }
            if self.loopback.get().is_none() || self.cancel_token.is_cancelled() {
                return Err(HealthCheckError::TransportNotStarted);
            }
            if rank == self.local_rank {
                return Ok(());
            }

            let link = self
                .get_or_create_link(rank)
                .map_err(|_| HealthCheckError::TransportNotStarted)?;

            match tokio::time::timeout(timeout, link.state.settled()).await {
                Ok(result) => result,
                Err(_) if link.state.is_connected() => Ok(()),
                Err(_) => Err(HealthCheckError::NeverConnected),
            }
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.cancel_token.is_cancelled() {
                return;
            }
            info!(rank = %self.local_rank, "Shutting down TCP transport");
            self.cancel_token.cancel();
            self.writers.close();

            if tokio::time::timeout(self.flush_timeout, self.writers.wait())
                .await
                .is_err()
            {
                warn!(
                    rank = %self.local_rank,
                    "Writer links did not flush within {:?}",
                    self.flush_timeout
                );
            }
            self.links.clear();
        })
    }
}

struct WriterTask {
    local_rank: Rank,
    peer: Rank,
    addr: SocketAddr,
    rx: flume::Receiver<Bytes>,
    state: Arc<LinkState>,
    connect_timeout: Duration,
    connect_retry: Duration,
    flush_timeout: Duration,
    cancel_token: CancellationToken,
}

/// Connect (with retry), announce ourselves, then write queued payloads until
/// the link breaks or the transport shuts down.
///
/// Shutdown does not abandon queued payloads: a writer that is still
/// connecting keeps retrying for up to `flush_timeout` and drains its queue
/// once the peer accepts.
async fn connection_writer_task(task: WriterTask) {
    let WriterTask {
        local_rank,
        peer,
        addr,
        rx,
        state,
        connect_timeout,
        connect_retry,
        flush_timeout,
        cancel_token,
    } = task;

    let schedule = ConnectSchedule {
        timeout: connect_timeout,
        retry: connect_retry,
        flush_timeout,
    };
    let stream = match connect_with_retry(addr, schedule, &rx, &cancel_token).await {
        Some(stream) => stream,
        None => {
            if !cancel_token.is_cancelled() || !rx.is_empty() {
                warn!(
                    %peer,
                    pending = rx.len(),
                    "Could not connect to {} within {:?}",
                    addr,
                    connect_timeout
                );
            }
            state.mark_failed();
            return;
        }
    };

    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
    super::configure_keepalive(&stream, addr);

    let mut framed = Framed::new(stream, ControlFrameCodec::new());
    if let Err(e) = framed.send(ControlFrame::hello(local_rank)).await {
        error!(%peer, "Failed to send hello to {}: {}", addr, e);
        state.mark_failed();
        return;
    }

    state.mark_connected();
    debug!(%peer, "Connected to {}", addr);

    loop {
        tokio::select! {
            biased;

            recv = rx.recv_async() => {
                let Ok(payload) = recv else { break };
                if let Err(e) = framed.send(ControlFrame::control(local_rank, payload)).await {
                    error!(%peer, "TCP write error to {}: {}", addr, e);
                    state.mark_failed();
                    return;
                }
            }
            // peers never write on this link, so EOF or an error means it is gone
            inbound = framed.next() => {
                match inbound {
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => debug!(%peer, "Link to {} failed: {}", addr, e),
                    None => debug!(%peer, "Link to {} closed by peer", addr),
                }
                state.mark_failed();
                return;
            }
            _ = cancel_token.cancelled() => {
                debug!(%peer, "Writer link to {} cancelled, draining queue", addr);
                while let Ok(payload) = rx.try_recv() {
                    if framed.send(ControlFrame::control(local_rank, payload)).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = framed.close().await;
    debug!(%peer, "Connection to {} closed", addr);
}

#[derive(Clone, Copy)]
struct ConnectSchedule {
    timeout: Duration,
    retry: Duration,
    flush_timeout: Duration,
}

/// Returns `None` once `timeout` elapses, or on cancellation when `queue` is
/// empty. After cancellation a non-empty queue keeps the retries going at the
/// base interval until `flush_timeout`.
async fn connect_with_retry(
    addr: SocketAddr,
    schedule: ConnectSchedule,
    queue: &flume::Receiver<Bytes>,
    cancel_token: &CancellationToken,
) -> Option<TcpStream> {
    let mut deadline = Instant::now() + schedule.timeout;
    let mut flushing = false;
    let mut delay = schedule.retry;

    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Some(stream),
            Err(e) => debug!("Connect to {} failed: {}", addr, e),
        }

        if cancel_token.is_cancelled() && !flushing {
            if queue.is_empty() {
                return None;
            }
            debug!(pending = queue.len(), "Still connecting to {} on shutdown", addr);
            flushing = true;
            deadline = deadline.min(Instant::now() + schedule.flush_timeout);
            delay = schedule.retry;
        }

        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        let wait = delay.min(deadline - now);
        if flushing {
            tokio::time::sleep(wait).await;
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            // retry right away, then decide whether anything is left to flush
            _ = cancel_token.cancelled() => continue,
        }
        delay = (delay * 2).min(Duration::from_secs(1));
    }
}

/// Parse a TCP endpoint string into a SocketAddr
///
/// Accepts formats:
/// - "tcp://host:port"
/// - "host:port"
pub fn parse_tcp_endpoint(endpoint: &str) -> Result<SocketAddr> {
    let addr_str = endpoint.strip_prefix("tcp://").unwrap_or(endpoint);

    let mut addrs = addr_str
        .to_socket_addrs()
        .with_context(|| format!("failed to parse socket address '{endpoint}'"))?;

    addrs
        .next()
        .ok_or_else(|| anyhow::anyhow!("no addresses resolved for '{endpoint}'"))
}

/// Builder for TcpTransport
pub struct TcpTransportBuilder {
    rank: Option<Rank>,
    peers: Vec<String>,
    bind_addr: Option<SocketAddr>,
    listener: Option<std::net::TcpListener>,
    connect_timeout: Duration,
    connect_retry: Duration,
    flush_timeout: Duration,
}

impl TcpTransportBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            rank: None,
            peers: Vec::new(),
            bind_addr: None,
            listener: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connect_retry: DEFAULT_CONNECT_RETRY,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }

    /// Rank of this process (required)
    pub fn rank(mut self, rank: impl Into<Rank>) -> Self {
        self.rank = Some(rank.into());
        self
    }

    /// Rank-ordered peer endpoints, including this process (required)
    pub fn peers<I, S>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.peers = peers.into_iter().map(Into::into).collect();
        self
    }

    /// Bind address for the listener (default: this rank's peer endpoint)
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Use an already-bound listener instead of binding in `start`
    pub fn from_listener(mut self, listener: std::net::TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// How long a writer keeps retrying its connect (default: 10s)
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Initial delay between connect attempts (default: 50ms)
    pub fn connect_retry(mut self, retry: Duration) -> Self {
        self.connect_retry = retry;
        self
    }

    /// How long `shutdown` keeps writer links connecting and flushing (default: 2s)
    pub fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Build the TcpTransport
    pub fn build(self) -> Result<TcpTransport> {
        let local_rank = self
            .rank
            .ok_or_else(|| anyhow::anyhow!("rank is required"))?;
        anyhow::ensure!(!self.peers.is_empty(), "peers must not be empty");
        anyhow::ensure!(
            local_rank.as_usize() < self.peers.len(),
            "rank {} is outside a world of {} peers",
            local_rank,
            self.peers.len()
        );

        let peers = self
            .peers
            .iter()
            .map(|endpoint| parse_tcp_endpoint(endpoint))
            .collect::<Result<Vec<_>>>()?;

        let bind_addr = match (&self.listener, self.bind_addr) {
            (Some(listener), _) => listener.local_addr()?,
            (None, Some(addr)) => addr,
            (None, None) => peers[local_rank.as_usize()],
        };

        Ok(TcpTransport {
            local_rank,
            peers,
            bind_addr,
            listener: Mutex::new(self.listener),
            local_addr: OnceLock::new(),
            loopback: OnceLock::new(),
            links: DashMap::new(),
            writers: TaskTracker::new(),
            connect_timeout: self.connect_timeout,
            connect_retry: self.connect_retry,
            flush_timeout: self.flush_timeout,
            cancel_token: CancellationToken::new(),
        })
    }
}

impl Default for TcpTransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}
