// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process transport fabric.
//!
//! [`MemoryFabric`] wires N [`MemoryTransport`] endpoints together with
//! unbounded channels. Every endpoint's inbound channel exists from the moment
//! the fabric is built, so frames sent to a rank that has not started yet are
//! buffered rather than lost.
//!
//! [`MemoryFabric::kill`] simulates a crash: the rank stops receiving, sends to
//! it fail with [`TransportError::PeerUnreachable`], and every other endpoint
//! gets an [`InboundEvent::Departed`](crate::InboundEvent::Departed) notice.

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::transport::{
    HealthCheckError, InboundSender, InboundStream, MAX_CONTROL_PAYLOAD, Transport, TransportError,
    inbound_channel,
};
use crate::{PeerAddress, Rank};

struct Endpoint {
    tx: InboundSender,
    rx: Mutex<Option<InboundStream>>,
    alive: AtomicBool,
}

struct FabricInner {
    endpoints: Vec<Endpoint>,
}

impl FabricInner {
    fn endpoint(&self, rank: Rank) -> Option<&Endpoint> {
        self.endpoints.get(rank.as_usize())
    }

    fn depart(&self, rank: Rank) {
        let Some(endpoint) = self.endpoint(rank) else {
            return;
        };
        if !endpoint.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!(%rank, "memory endpoint departed");
        for (peer, other) in self.endpoints.iter().enumerate() {
            if peer != rank.as_usize() {
                other.tx.departed(rank);
            }
        }
    }
}

/// A set of connected in-process endpoints, one per rank.
#[derive(Clone)]
pub struct MemoryFabric {
    inner: Arc<FabricInner>,
}

impl MemoryFabric {
    /// Build a fabric for `size` ranks.
    pub fn new(size: u32) -> Self {
        let endpoints = (0..size)
            .map(|_| {
                let (tx, rx) = inbound_channel();
                Endpoint {
                    tx,
                    rx: Mutex::new(Some(rx)),
                    alive: AtomicBool::new(true),
                }
            })
            .collect();
        Self {
            inner: Arc::new(FabricInner { endpoints }),
        }
    }

    /// Number of ranks in the fabric.
    pub fn size(&self) -> u32 {
        self.inner.endpoints.len() as u32
    }

    /// Transport endpoint for `rank`.
    pub fn endpoint(&self, rank: Rank) -> Option<Arc<MemoryTransport>> {
        self.inner.endpoint(rank)?;
        Some(Arc::new(MemoryTransport {
            rank,
            fabric: self.inner.clone(),
        }))
    }

    /// One endpoint per rank, in rank order.
    pub fn endpoints(&self) -> Vec<Arc<MemoryTransport>> {
        (0..self.size())
            .filter_map(|rank| self.endpoint(Rank::new(rank)))
            .collect()
    }

    /// Crash `rank`: it stops receiving and every other endpoint is told it
    /// departed. Idempotent.
    pub fn kill(&self, rank: Rank) {
        self.inner.depart(rank);
    }

    /// Returns `true` while `rank` has neither been killed nor shut down.
    pub fn is_alive(&self, rank: Rank) -> bool {
        self.inner
            .endpoint(rank)
            .map(|e| e.alive.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}

/// One rank's view of a [`MemoryFabric`].
pub struct MemoryTransport {
    rank: Rank,
    fabric: Arc<FabricInner>,
}

impl Transport for MemoryTransport {
    fn local_rank(&self) -> Rank {
        self.rank
    }

    fn rank_count(&self) -> u32 {
        self.fabric.endpoints.len() as u32
    }

    fn peer_address(&self, rank: Rank) -> Option<PeerAddress> {
        self.fabric
            .endpoint(rank)
            .map(|_| PeerAddress::from(format!("mem://{rank}")))
    }

    fn start(&self) -> BoxFuture<'_, Result<InboundStream, TransportError>> {
        Box::pin(async move {
            let endpoint = self
                .fabric
                .endpoint(self.rank)
                .ok_or(TransportError::UnknownPeer(self.rank))?;
            if !endpoint.alive.load(Ordering::Acquire) {
                return Err(TransportError::NotStarted);
            }
            endpoint
                .rx
                .lock()
                .take()
                .ok_or(TransportError::AlreadyStarted)
        })
    }

    fn send(&self, dest: Rank, payload: Bytes) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(TransportError::PayloadTooLarge(payload.len()));
            }
            let source = self
                .fabric
                .endpoint(self.rank)
                .ok_or(TransportError::UnknownPeer(self.rank))?;
            if !source.alive.load(Ordering::Acquire) {
                return Err(TransportError::NotStarted);
            }
            let target = self
                .fabric
                .endpoint(dest)
                .ok_or(TransportError::UnknownPeer(dest))?;
            if !target.alive.load(Ordering::Acquire) || !target.tx.deliver(self.rank, payload) {
                return Err(TransportError::PeerUnreachable(dest));
            }
            Ok(())
        })
    }

    fn check_health(
        &self,
        rank: Rank,
        _timeout: Duration,
    ) -> BoxFuture<'_, Result<(), HealthCheckError>> {
        Box::pin(async move {
            let endpoint = self
                .fabric
                .endpoint(rank)
                .ok_or(HealthCheckError::PeerNotRegistered)?;
            if endpoint.alive.load(Ordering::Acquire) && !endpoint.tx.is_closed() {
                Ok(())
            } else {
                Err(HealthCheckError::ConnectionFailed)
            }
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.fabric.depart(self.rank);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InboundEvent;

    #[tokio::test]
    async fn test_frames_buffer_before_start() {
        let fabric = MemoryFabric::new(2);
        let a = fabric.endpoint(Rank::new(0)).unwrap();
        let b = fabric.endpoint(Rank::new(1)).unwrap();

        a.send(Rank::new(1), Bytes::from_static(b"early"))
            .await
            .unwrap();

        let inbound = b.start().await.unwrap();
        assert_eq!(
            inbound.recv().await,
            Some(InboundEvent::Frame {
                src: Rank::new(0),
                payload: Bytes::from_static(b"early"),
            })
        );
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let fabric = MemoryFabric::new(1);
        let a = fabric.endpoint(Rank::new(0)).unwrap();
        let _inbound = a.start().await.unwrap();
        assert!(matches!(
            a.start().await,
            Err(TransportError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_kill_notifies_peers_and_rejects_sends() {
        let fabric = MemoryFabric::new(3);
        let endpoints = fabric.endpoints();
        let inbound0 = endpoints[0].start().await.unwrap();
        let inbound2 = endpoints[2].start().await.unwrap();

        endpoints[1]
            .send(Rank::new(0), Bytes::from_static(b"last words"))
            .await
            .unwrap();
        fabric.kill(Rank::new(1));
        fabric.kill(Rank::new(1));
        assert!(!fabric.is_alive(Rank::new(1)));

        // frame first, then the departure notice
        assert!(matches!(
            inbound0.recv().await,
            Some(InboundEvent::Frame { src, .. }) if src == Rank::new(1)
        ));
        assert_eq!(
            inbound0.recv().await,
            Some(InboundEvent::Departed { rank: Rank::new(1) })
        );
        assert_eq!(
            inbound2.recv().await,
            Some(InboundEvent::Departed { rank: Rank::new(1) })
        );
        assert!(inbound2.is_empty());

        let err = endpoints[0]
            .send(Rank::new(1), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.peer(), Some(Rank::new(1)));
        assert!(matches!(err, TransportError::PeerUnreachable(_)));

        assert_eq!(
            endpoints[0]
                .check_health(Rank::new(1), Duration::from_millis(10))
                .await,
            Err(HealthCheckError::ConnectionFailed)
        );
        assert_eq!(
            endpoints[0]
                .check_health(Rank::new(2), Duration::from_millis(10))
                .await,
            Ok(())
        );
    }

    #[tokio::test]
    async fn test_unknown_peer_and_oversized_payload() {
        let fabric = MemoryFabric::new(2);
        let a = fabric.endpoint(Rank::new(0)).unwrap();
        assert!(fabric.endpoint(Rank::new(2)).is_none());
        assert!(a.peer_address(Rank::new(2)).is_none());
        assert_eq!(a.peer_address(Rank::new(1)).unwrap().as_str(), "mem://1");

        assert!(matches!(
            a.send(Rank::new(5), Bytes::new()).await,
            Err(TransportError::UnknownPeer(r)) if r == Rank::new(5)
        ));
        let big = Bytes::from(vec![0u8; MAX_CONTROL_PAYLOAD + 1]);
        assert!(matches!(
            a.send(Rank::new(1), big).await,
            Err(TransportError::PayloadTooLarge(_))
        ));
        assert_eq!(
            a.check_health(Rank::new(9), Duration::from_millis(1)).await,
            Err(HealthCheckError::PeerNotRegistered)
        );
    }
}
