// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use futures::future::BoxFuture;
use std::time::Duration;

use crate::{PeerAddress, Rank};

/// Largest control payload a transport must accept, in bytes.
///
/// Collective control messages are small and fixed-size; anything larger is a
/// caller bug and is rejected with [`TransportError::PayloadTooLarge`].
pub const MAX_CONTROL_PAYLOAD: usize = 4096;

/// Errors returned by [`Transport`] implementations.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// The peer cannot be reached: it crashed, left, or never came up.
    #[error("peer {0} is unreachable")]
    PeerUnreachable(Rank),

    /// The rank is outside `[0, rank_count)` for this transport.
    #[error("unknown peer {0}")]
    UnknownPeer(Rank),

    /// The transport has not been started, or has already been shut down.
    #[error("transport not started")]
    NotStarted,

    /// `start` was called twice.
    #[error("transport already started")]
    AlreadyStarted,

    /// The payload exceeds [`MAX_CONTROL_PAYLOAD`].
    #[error("control payload of {0} bytes exceeds the {MAX_CONTROL_PAYLOAD} byte limit")]
    PayloadTooLarge(usize),

    /// Socket level failure while binding or accepting.
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// The peer this error is about, if any.
    pub fn peer(&self) -> Option<Rank> {
        match self {
            TransportError::PeerUnreachable(rank) | TransportError::UnknownPeer(rank) => {
                Some(*rank)
            }
            _ => None,
        }
    }
}

/// Outcome of a liveness probe against a single peer.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckError {
    /// The rank is not part of this transport's world.
    #[error("peer not registered with transport")]
    PeerNotRegistered,

    /// The transport has not been started yet.
    #[error("transport not started")]
    TransportNotStarted,

    /// No connection has been established yet; the peer may still be starting.
    #[error("connection never established to peer")]
    NeverConnected,

    /// The connection failed or the peer is known to be gone.
    #[error("connection failed or peer unreachable")]
    ConnectionFailed,

    /// The probe did not finish within the requested timeout.
    #[error("health check timed out")]
    Timeout,
}

impl HealthCheckError {
    /// Returns `true` when the probe proves the peer is gone, as opposed to
    /// merely not being connected yet.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HealthCheckError::ConnectionFailed | HealthCheckError::PeerNotRegistered
        )
    }
}

/// Events delivered to the collective core by a running transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A control payload sent by `src`.
    Frame {
        /// Sending rank.
        src: Rank,
        /// Opaque control payload.
        payload: Bytes,
    },
    /// `rank` is gone. Delivered after every frame that rank sent.
    Departed {
        /// The departed rank.
        rank: Rank,
    },
}

/// Sender half of the inbound event channel, owned by a transport.
#[derive(Clone)]
pub struct InboundSender {
    tx: flume::Sender<InboundEvent>,
}

impl InboundSender {
    /// Deliver a frame from `src`. Returns `false` if the consumer is gone.
    pub fn deliver(&self, src: Rank, payload: Bytes) -> bool {
        self.tx.send(InboundEvent::Frame { src, payload }).is_ok()
    }

    /// Report that `rank` has departed. Returns `false` if the consumer is gone.
    pub fn departed(&self, rank: Rank) -> bool {
        self.tx.send(InboundEvent::Departed { rank }).is_ok()
    }

    /// Returns `true` once the [`InboundStream`] has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_disconnected()
    }
}

/// Receiver half of the inbound event channel, handed to the collective core.
pub struct InboundStream {
    rx: flume::Receiver<InboundEvent>,
}

impl InboundStream {
    /// Wait for the next event. Returns `None` once every sender is gone.
    pub async fn recv(&self) -> Option<InboundEvent> {
        self.rx.recv_async().await.ok()
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&self) -> Option<InboundEvent> {
        self.rx.try_recv().ok()
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns `true` when no events are queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create a matched [`InboundSender`] / [`InboundStream`] pair.
pub fn inbound_channel() -> (InboundSender, InboundStream) {
    let (tx, rx) = flume::unbounded();
    (InboundSender { tx }, InboundStream { rx })
}

/// A rank-addressed control-message transport.
///
/// The world is fixed when the transport is constructed: `rank_count` and
/// `local_rank` never change. The trait is object-safe so the collective core
/// can hold an `Arc<dyn Transport>`.
pub trait Transport: Send + Sync {
    /// Rank of this process.
    fn local_rank(&self) -> Rank;

    /// Number of processes in the run.
    fn rank_count(&self) -> u32;

    /// Advertised address of `rank`, or `None` if the rank is out of range.
    fn peer_address(&self, rank: Rank) -> Option<PeerAddress>;

    /// Start the transport and return the stream of inbound events.
    ///
    /// Frames sent to this rank before `start` are buffered where the
    /// transport can do so (the in-memory fabric) or retried by the sender
    /// (TCP connects with back-off).
    fn start(&self) -> BoxFuture<'_, Result<InboundStream, TransportError>>;

    /// Send a control payload to `dest`.
    ///
    /// Resolves once the payload is queued for delivery. An error always names
    /// the peer through [`TransportError::peer`] when one is involved.
    fn send(&self, dest: Rank, payload: Bytes) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Probe whether `rank` is reachable.
    fn check_health(
        &self,
        rank: Rank,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<(), HealthCheckError>>;

    /// Stop the transport.
    ///
    /// Frames already accepted by [`Transport::send`] are flushed before the
    /// returned future resolves, where the transport can do so within its own
    /// flush deadline. Idempotent.
    fn shutdown(&self) -> BoxFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_names_peer() {
        assert_eq!(
            TransportError::PeerUnreachable(Rank::new(3)).peer(),
            Some(Rank::new(3))
        );
        assert_eq!(
            TransportError::UnknownPeer(Rank::new(9)).peer(),
            Some(Rank::new(9))
        );
        assert_eq!(TransportError::NotStarted.peer(), None);
    }

    #[test]
    fn test_health_check_fatality() {
        assert!(HealthCheckError::ConnectionFailed.is_fatal());
        assert!(HealthCheckError::PeerNotRegistered.is_fatal());
        assert!(!HealthCheckError::NeverConnected.is_fatal());
        assert!(!HealthCheckError::Timeout.is_fatal());
        assert!(!HealthCheckError::TransportNotStarted.is_fatal());
    }

    #[tokio::test]
    async fn test_inbound_channel_preserves_order() {
        let (tx, rx) = inbound_channel();
        assert!(tx.deliver(Rank::new(1), Bytes::from_static(b"a")));
        assert!(tx.deliver(Rank::new(1), Bytes::from_static(b"b")));
        assert!(tx.departed(Rank::new(1)));
        assert_eq!(rx.len(), 3);

        assert_eq!(
            rx.recv().await,
            Some(InboundEvent::Frame {
                src: Rank::new(1),
                payload: Bytes::from_static(b"a")
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(InboundEvent::Frame {
                src: Rank::new(1),
                payload: Bytes::from_static(b"b")
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(InboundEvent::Departed { rank: Rank::new(1) })
        );
        assert!(rx.is_empty());
    }

    #[test]
    fn test_sender_observes_closed_stream() {
        let (tx, rx) = inbound_channel();
        assert!(!tx.is_closed());
        drop(rx);
        assert!(tx.is_closed());
        assert!(!tx.deliver(Rank::new(0), Bytes::new()));
    }
}
