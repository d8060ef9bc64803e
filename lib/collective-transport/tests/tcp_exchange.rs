// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for the TCP control transport

use bytes::Bytes;
use dynamo_collective_transport::tcp::{ControlFrame, ControlFrameCodec, TcpTransport};
use dynamo_collective_transport::{InboundEvent, InboundStream, Rank, Transport};
use futures::SinkExt;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::codec::Framed;

const WAIT: Duration = Duration::from_secs(10);

/// Bind `n` loopback listeners up front so every rank knows every address.
fn mesh(n: usize) -> Vec<TcpTransport> {
    let listeners: Vec<_> = (0..n)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    let peers: Vec<String> = listeners
        .iter()
        .map(|l| format!("tcp://{}", l.local_addr().unwrap()))
        .collect();

    listeners
        .into_iter()
        .enumerate()
        .map(|(rank, listener)| {
            TcpTransport::builder()
                .rank(rank as u32)
                .peers(peers.clone())
                .from_listener(listener)
                .connect_timeout(Duration::from_secs(5))
                .build()
                .unwrap()
        })
        .collect()
}

async fn next_event(inbound: &InboundStream) -> InboundEvent {
    timeout(WAIT, inbound.recv())
        .await
        .expect("timed out waiting for inbound event")
        .expect("inbound stream closed")
}

#[tokio::test]
async fn test_frames_arrive_in_send_order() {
    let transports = mesh(2);
    let _inbound0 = transports[0].start().await.unwrap();
    let inbound1 = transports[1].start().await.unwrap();

    for i in 0..32u8 {
        transports[0]
            .send(Rank::new(1), Bytes::from(vec![i]))
            .await
            .unwrap();
    }

    for i in 0..32u8 {
        match next_event(&inbound1).await {
            InboundEvent::Frame { src, payload } => {
                assert_eq!(src, Rank::new(0));
                assert_eq!(&payload[..], &[i]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    for t in &transports {
        t.shutdown().await;
    }
}

#[tokio::test]
async fn test_send_before_peer_starts_is_retried() {
    let transports = mesh(2);
    let _inbound0 = transports[0].start().await.unwrap();

    transports[0]
        .send(Rank::new(1), Bytes::from_static(b"early"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let inbound1 = transports[1].start().await.unwrap();

    assert_eq!(
        next_event(&inbound1).await,
        InboundEvent::Frame {
            src: Rank::new(0),
            payload: Bytes::from_static(b"early"),
        }
    );

    for t in &transports {
        t.shutdown().await;
    }
}

#[tokio::test]
async fn test_shutdown_flushes_then_reports_departure() {
    let transports = mesh(3);
    let inbound0 = transports[0].start().await.unwrap();
    let _inbound1 = transports[1].start().await.unwrap();
    let _inbound2 = transports[2].start().await.unwrap();

    transports[2]
        .send(Rank::new(0), Bytes::from_static(b"bye"))
        .await
        .unwrap();
    transports[2].shutdown().await;

    assert_eq!(
        next_event(&inbound0).await,
        InboundEvent::Frame {
            src: Rank::new(2),
            payload: Bytes::from_static(b"bye"),
        }
    );
    assert_eq!(
        next_event(&inbound0).await,
        InboundEvent::Departed { rank: Rank::new(2) }
    );

    transports[0].shutdown().await;
    transports[1].shutdown().await;
}

#[tokio::test]
async fn test_connection_without_hello_is_ignored() {
    let transports = mesh(1);
    let inbound = transports[0].start().await.unwrap();
    let addr = transports[0].local_addr().unwrap();

    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, ControlFrameCodec::new());
    framed
        .send(ControlFrame::control(Rank::new(0), Bytes::from_static(b"rogue")))
        .await
        .unwrap();
    drop(framed);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(inbound.is_empty());

    transports[0].shutdown().await;
}

#[tokio::test]
async fn test_link_to_stopped_peer_fails_health_check() {
    let transports = mesh(2);
    let _inbound0 = transports[0].start().await.unwrap();
    let inbound1 = transports[1].start().await.unwrap();

    transports[0]
        .send(Rank::new(1), Bytes::from_static(b"hi"))
        .await
        .unwrap();
    next_event(&inbound1).await;
    assert!(transports[0].check_health(Rank::new(1), WAIT).await.is_ok());

    transports[1].shutdown().await;

    // the idle link notices the peer closing without a write
    let verdict = timeout(WAIT, async {
        loop {
            match transports[0].check_health(Rank::new(1), WAIT).await {
                Ok(()) => tokio::time::sleep(Duration::from_millis(10)).await,
                Err(e) => break e,
            }
        }
    })
    .await
    .expect("link never reported the peer as gone");
    assert!(verdict.is_fatal());
    assert!(matches!(
        transports[0].send(Rank::new(1), Bytes::from_static(b"late")).await,
        Err(dynamo_collective_transport::TransportError::PeerUnreachable(_))
    ));

    transports[0].shutdown().await;
}

#[tokio::test]
async fn test_shutdown_delivers_to_peer_that_starts_late() {
    // rank 1's port stays closed until after rank 0 has begun shutting down
    let listener0 = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let late = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let peers = vec![
        format!("tcp://{}", listener0.local_addr().unwrap()),
        format!("tcp://{}", late.local_addr().unwrap()),
    ];
    drop(late);

    let early = TcpTransport::builder()
        .rank(0)
        .peers(peers.clone())
        .from_listener(listener0)
        .connect_retry(Duration::from_millis(10))
        .flush_timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let _inbound0 = early.start().await.unwrap();

    early
        .send(Rank::new(1), Bytes::from_static(b"last word"))
        .await
        .unwrap();

    let late_peer = async {
        tokio::time::sleep(Duration::from_millis(400)).await;
        let transport = TcpTransport::builder()
            .rank(1)
            .peers(peers.clone())
            .build()
            .unwrap();
        let inbound = transport.start().await.unwrap();
        let first = next_event(&inbound).await;
        let second = next_event(&inbound).await;
        transport.shutdown().await;
        (first, second)
    };

    let ((), (first, second)) = tokio::join!(early.shutdown(), late_peer);
    assert_eq!(
        first,
        InboundEvent::Frame {
            src: Rank::new(0),
            payload: Bytes::from_static(b"last word"),
        }
    );
    assert_eq!(second, InboundEvent::Departed { rank: Rank::new(0) });
}

#[tokio::test]
async fn test_shutdown_gives_up_after_flush_timeout() {
    let listener0 = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let peers = vec![
        format!("tcp://{}", listener0.local_addr().unwrap()),
        format!("tcp://{}", dead.local_addr().unwrap()),
    ];
    drop(dead);

    let transport = TcpTransport::builder()
        .rank(0)
        .peers(peers)
        .from_listener(listener0)
        .connect_retry(Duration::from_millis(10))
        .flush_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let _inbound = transport.start().await.unwrap();
    transport
        .send(Rank::new(1), Bytes::from_static(b"nobody home"))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    timeout(WAIT, transport.shutdown())
        .await
        .expect("shutdown hung on an unreachable peer");
    assert!(started.elapsed() < Duration::from_secs(2));
}
