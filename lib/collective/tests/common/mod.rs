// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dynamo_collective::transport::memory::MemoryFabric;
use dynamo_collective::{BarrierConfig, CollectiveConfig, CollectiveRuntime, Rank};

/// Upper bound for any single rendezvous in a test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Config with a short liveness interval so failures surface quickly.
pub fn fast_config() -> CollectiveConfig {
    CollectiveConfig {
        barrier: BarrierConfig {
            liveness_interval_ms: 10,
            health_check_timeout_ms: 50,
        },
        ..Default::default()
    }
}

/// One runtime per rank over an in-process fabric.
pub async fn memory_world(
    nprocs: u32,
    config: &CollectiveConfig,
) -> Result<(MemoryFabric, Vec<Arc<CollectiveRuntime>>)> {
    let fabric = MemoryFabric::new(nprocs);
    let mut runtimes = Vec::with_capacity(nprocs as usize);
    for endpoint in fabric.endpoints() {
        runtimes.push(Arc::new(CollectiveRuntime::init(config, endpoint).await?));
    }
    Ok((fabric, runtimes))
}

/// Tear down runtimes that are no longer shared.
pub async fn term_all(runtimes: Vec<Arc<CollectiveRuntime>>) {
    for runtime in runtimes {
        if let Ok(runtime) = Arc::try_unwrap(runtime) {
            runtime.term().await;
        }
    }
}

pub fn ranks(raw: impl IntoIterator<Item = u32>) -> Vec<Rank> {
    raw.into_iter().map(Rank::new).collect()
}
