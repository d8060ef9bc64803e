// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Global barrier over loopback TCP with ranks that start at different times
//! and terminate as soon as they are released.

mod common;

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use dynamo_collective::transport::tcp::TcpTransport;
use dynamo_collective::{CollectiveConfig, CollectiveRuntime, GroupHandle, Timeout};

use common::TEST_TIMEOUT;

/// Runs init, a single global barrier and term, starting after `delay`.
async fn barrier_then_term(
    transport: TcpTransport,
    delay: Duration,
) -> dynamo_collective::Result<()> {
    tokio::time::sleep(delay).await;
    let runtime = CollectiveRuntime::init(&CollectiveConfig::default(), Arc::new(transport)).await?;
    let outcome = runtime
        .barrier(GroupHandle::GLOBAL, Timeout::After(TEST_TIMEOUT))
        .await;
    runtime.term().await;
    outcome
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_late_rank_is_released_after_early_rank_terminates() {
    let early_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    // nothing listens on the late rank's port until it starts
    let late_port = TcpListener::bind("127.0.0.1:0").unwrap();
    let peers = vec![
        early_listener.local_addr().unwrap().to_string(),
        late_port.local_addr().unwrap().to_string(),
    ];
    drop(late_port);

    let early = TcpTransport::builder()
        .rank(0)
        .peers(peers.clone())
        .from_listener(early_listener)
        .build()
        .unwrap();
    let late = TcpTransport::builder().rank(1).peers(peers).build().unwrap();

    let (early, late) = tokio::join!(
        barrier_then_term(early, Duration::ZERO),
        barrier_then_term(late, Duration::from_millis(400)),
    );
    assert!(early.is_ok(), "rank 0: {early:?}");
    assert!(late.is_ok(), "rank 1: {late:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_staggered_world_of_four() {
    let listeners: Vec<_> = (0..4)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    let peers: Vec<String> = listeners
        .iter()
        .map(|l| l.local_addr().unwrap().to_string())
        .collect();
    drop(listeners);

    let runs: Vec<_> = (0..4u32)
        .map(|rank| {
            let transport = TcpTransport::builder()
                .rank(rank)
                .peers(peers.clone())
                .build()
                .unwrap();
            tokio::spawn(barrier_then_term(
                transport,
                Duration::from_millis(150 * u64::from(rank)),
            ))
        })
        .collect();

    for (rank, run) in runs.into_iter().enumerate() {
        let outcome = run.await.unwrap();
        assert!(outcome.is_ok(), "rank {rank}: {outcome:?}");
    }
}
