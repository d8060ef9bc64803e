// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Multi-process smoke check for the collective runtime.
//!
//! Launch one instance per rank with the same `--peers` list:
//!
//! ```text
//! collective-check --rank 0 --peers 127.0.0.1:7000,127.0.0.1:7001
//! collective-check --rank 1 --peers 127.0.0.1:7000,127.0.0.1:7001
//! ```
//!
//! Each instance builds a group of every rank, checking sizes along the way,
//! meets the others in one barrier on the global group and terminates right
//! after it. With `--log`, every rank appends `pre <rank>` before and
//! `post <rank>` after the barrier so the launcher can verify nobody left
//! early.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use clap::Parser;
use dynamo_collective::{
    CollectiveConfig, CollectiveError, CollectiveRuntime, GroupHandle, Rank, Timeout, logging,
};

#[derive(Parser, Debug)]
#[command(name = "collective-check")]
#[command(about = "Run the group and barrier smoke check against a set of peers")]
struct Args {
    /// Rank of this process
    #[arg(long, env = "DYN_COLLECTIVE_TCP_RANK")]
    rank: u32,

    /// Rank-ordered peer endpoints, comma-separated (e.g. "127.0.0.1:7000,127.0.0.1:7001")
    #[arg(long, value_delimiter = ',', required = true)]
    peers: Vec<String>,

    /// Listener address (default: this rank's entry in --peers)
    #[arg(long)]
    bind: Option<String>,

    /// Upper bound for each barrier
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Shared file to append barrier progress to
    #[arg(long)]
    log: Option<PathBuf>,
}

fn append_line(path: Option<&Path>, line: &str) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    writeln!(file, "{line}")?;
    file.sync_data()?;
    Ok(())
}

async fn run(args: &Args, runtime: &CollectiveRuntime) -> Result<()> {
    let nprocs = runtime.rank_count();
    let timeout = Timeout::After(Duration::from_secs(args.timeout_secs));

    ensure!(
        runtime.group_count() == 1,
        "expected only the global group, found {}",
        runtime.group_count()
    );
    ensure!(runtime.group_size(GroupHandle::GLOBAL)? == nprocs as usize);

    let group = runtime.group_create()?;
    ensure!(runtime.group_size(group)? == 0, "new group is not empty");

    for raw in 0..nprocs {
        runtime.group_add(group, Rank::new(raw))?;
        let size = runtime.group_size(group)?;
        ensure!(
            size == raw as usize + 1,
            "size {size} after adding rank {raw}"
        );
    }

    ensure!(matches!(
        runtime.group_add(group, Rank::new(0)),
        Err(CollectiveError::DuplicateMember { .. })
    ));
    ensure!(matches!(
        runtime.group_add(group, Rank::new(nprocs)),
        Err(CollectiveError::UnknownRank { .. })
    ));
    ensure!(runtime.group_size(group)? == nprocs as usize);
    ensure!(runtime.group_count() == 2);

    let rank = runtime.local_rank();
    append_line(args.log.as_deref(), &format!("pre {rank}"))?;
    runtime
        .barrier(GroupHandle::GLOBAL, timeout)
        .await
        .context("barrier on global group")?;
    append_line(args.log.as_deref(), &format!("post {rank}"))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    let mut figment = CollectiveConfig::figment()
        .merge(("tcp.rank", args.rank))
        .merge(("tcp.peers", args.peers.clone()));
    if let Some(bind) = &args.bind {
        figment = figment.merge(("tcp.bind_addr", bind.clone()));
    }
    let config = CollectiveConfig::extract_from(figment)?;
    let tcp = config
        .tcp
        .as_ref()
        .context("tcp settings missing after merge")?;

    let transport = Arc::new(tcp.build_transport()?);
    let runtime = CollectiveRuntime::init(&config, transport).await?;
    tracing::info!(rank = args.rank, nprocs = runtime.rank_count(), "running collective check");

    let outcome = run(&args, &runtime).await;
    runtime.term().await;

    match &outcome {
        Ok(()) => tracing::info!(rank = args.rank, "collective check passed"),
        Err(e) => tracing::error!(rank = args.rank, "collective check failed: {e:#}"),
    }
    outcome
}
