// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Four `collective-check` processes meeting over TCP on loopback, launched
//! one after another.

use std::net::TcpListener;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;

const NPROCS: usize = 4;

/// Gap between process launches, so early ranks enter the barrier while later
/// ones are not listening yet.
const LAUNCH_STAGGER: Duration = Duration::from_millis(300);

/// Reserve distinct loopback ports by binding and releasing them.
fn reserve_ports(n: usize) -> Result<Vec<u16>> {
    let listeners = (0..n)
        .map(|_| TcpListener::bind("127.0.0.1:0"))
        .collect::<std::io::Result<Vec<_>>>()?;
    listeners
        .iter()
        .map(|l| Ok(l.local_addr()?.port()))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_staggered_processes_pass_the_check() -> Result<()> {
    let peers = reserve_ports(NPROCS)?
        .into_iter()
        .map(|port| format!("127.0.0.1:{port}"))
        .collect::<Vec<_>>()
        .join(",");
    let dir = tempfile::tempdir()?;
    let log = dir.path().join("barrier.log");

    let mut children = Vec::new();
    for rank in 0..NPROCS {
        if rank > 0 {
            tokio::time::sleep(LAUNCH_STAGGER).await;
        }
        let child = Command::new(env!("CARGO_BIN_EXE_collective-check"))
            .arg("--rank")
            .arg(rank.to_string())
            .arg("--peers")
            .arg(&peers)
            .arg("--timeout-secs")
            .arg("30")
            .arg("--log")
            .arg(&log)
            .env_remove("DYN_COLLECTIVE_CONFIG_PATH")
            .env_remove("DYN_COLLECTIVE_TCP_RANK")
            .env("DYN_LOG", "warn")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning rank {rank}"))?;
        children.push(child);
    }

    for (rank, child) in children.into_iter().enumerate() {
        let output = tokio::time::timeout(Duration::from_secs(60), child.wait_with_output())
            .await
            .with_context(|| format!("rank {rank} did not finish"))??;
        assert!(
            output.status.success(),
            "rank {rank} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let lines = std::fs::read_to_string(&log)?;
    let lines: Vec<&str> = lines.lines().collect();
    assert_eq!(lines.len(), 2 * NPROCS, "{lines:?}");
    let last_pre = lines.iter().rposition(|l| l.starts_with("pre")).unwrap();
    let first_post = lines.iter().position(|l| l.starts_with("post")).unwrap();
    assert!(last_pre < first_post, "a rank left the barrier early: {lines:?}");
    Ok(())
}

#[tokio::test]
async fn test_bad_arguments_fail() -> Result<()> {
    let status = Command::new(env!("CARGO_BIN_EXE_collective-check"))
        .args(["--rank", "3", "--peers", "127.0.0.1:1,127.0.0.1:2"])
        .env_remove("DYN_COLLECTIVE_CONFIG_PATH")
        .env_remove("DYN_COLLECTIVE_TCP_RANK")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    assert!(!status.success());
    Ok(())
}
