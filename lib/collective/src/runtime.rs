// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-process collective context.

use std::sync::Arc;

use dynamo_collective_transport::{Rank, Transport};
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::barrier::{
    BarrierCoordinator, BarrierPhase, BarrierProgress, Mailbox, Timeout, run_dispatcher,
};
use crate::config::CollectiveConfig;
use crate::directory::RankDirectory;
use crate::error::Result;
use crate::group::{CommittedGroup, Group, GroupHandle, GroupRegistry};

/// Entry point for group management and barriers.
///
/// Created by [`CollectiveRuntime::init`] and torn down by
/// [`CollectiveRuntime::term`]. Group operations are synchronous and take the
/// registry lock briefly; [`CollectiveRuntime::barrier`] is async and runs
/// without holding it, so barriers on different groups proceed concurrently.
pub struct CollectiveRuntime {
    transport: Arc<dyn Transport>,
    directory: RankDirectory,
    registry: Mutex<GroupRegistry>,
    coordinator: BarrierCoordinator,
    cancel_token: CancellationToken,
    dispatcher: JoinHandle<()>,
}

impl CollectiveRuntime {
    /// Start `transport` and build the runtime around it.
    ///
    /// After this returns, `group_count() == 1` and the global group holds
    /// every rank the transport knows about.
    pub async fn init(config: &CollectiveConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let directory = RankDirectory::from_transport(transport.as_ref())?;
        let inbound = transport.start().await?;

        let mailbox = Arc::new(Mailbox::new());
        let cancel_token = CancellationToken::new();
        let dispatcher = tokio::spawn(run_dispatcher(
            inbound,
            mailbox.clone(),
            cancel_token.clone(),
        ));

        let coordinator = BarrierCoordinator::new(transport.clone(), mailbox, &config.barrier);
        let registry = GroupRegistry::new(directory.clone(), config.max_groups);

        info!(
            rank = %directory.local_rank(),
            nprocs = directory.nprocs(),
            max_groups = registry.max(),
            "collective runtime initialized"
        );

        Ok(Self {
            transport,
            directory,
            registry: Mutex::new(registry),
            coordinator,
            cancel_token,
            dispatcher,
        })
    }

    pub fn local_rank(&self) -> Rank {
        self.directory.local_rank()
    }

    pub fn rank_count(&self) -> u32 {
        self.directory.nprocs()
    }

    pub fn directory(&self) -> &RankDirectory {
        &self.directory
    }

    /// Create an empty group.
    pub fn group_create(&self) -> Result<GroupHandle> {
        self.registry.lock().create()
    }

    pub fn group_add(&self, handle: GroupHandle, rank: Rank) -> Result<()> {
        self.registry.lock().add(handle, rank)
    }

    /// Add all of `ranks` or none of them.
    pub fn group_add_many(&self, handle: GroupHandle, ranks: &[Rank]) -> Result<()> {
        self.registry.lock().add_many(handle, ranks)
    }

    pub fn group_size(&self, handle: GroupHandle) -> Result<usize> {
        self.registry.lock().size(handle)
    }

    /// Members of `handle` in insertion order.
    pub fn group_ranks(&self, handle: GroupHandle) -> Result<Vec<Rank>> {
        self.registry.lock().ranks(handle)
    }

    /// Groups currently held, including the global group.
    pub fn group_count(&self) -> usize {
        self.registry.lock().count()
    }

    pub fn group_max(&self) -> usize {
        self.registry.lock().max()
    }

    /// Freeze membership of `handle`. Idempotent.
    pub fn group_commit(&self, handle: GroupHandle) -> Result<()> {
        self.registry.lock().commit(handle).map(|_| ())
    }

    /// Release `handle`. The handle is invalid afterwards.
    pub fn group_delete(&self, handle: GroupHandle) -> Result<()> {
        if let Some(tag) = self.registry.lock().release(handle)? {
            self.coordinator.forget(tag);
        }
        Ok(())
    }

    /// Current barrier phase of `handle`. Uncommitted groups are idle.
    pub fn barrier_phase(&self, handle: GroupHandle) -> Result<BarrierPhase> {
        Ok(match self.registry.lock().lookup(handle)? {
            Group::Building(_) => BarrierPhase::Idle,
            Group::Committed(group) => group.phase(),
        })
    }

    /// Block until every member of `handle` has entered the barrier.
    ///
    /// Commits the group if needed. On [`CollectiveError::Timeout`] the call
    /// can be repeated and resumes the same barrier.
    ///
    /// [`CollectiveError::Timeout`]: crate::CollectiveError::Timeout
    pub async fn barrier(&self, handle: GroupHandle, timeout: Timeout) -> Result<()> {
        let (group, progress) = self.enter_barrier(handle)?;
        self.coordinator.barrier(&group, progress, timeout).await
    }

    /// Commit `handle` and claim it for a barrier under one registry lock, so
    /// a concurrent `group_delete` either runs first or is rejected.
    fn enter_barrier(
        &self,
        handle: GroupHandle,
    ) -> Result<(Arc<CommittedGroup>, OwnedMutexGuard<BarrierProgress>)> {
        let mut registry = self.registry.lock();
        let group = registry.commit(handle)?;
        let progress = group.try_enter()?;
        Ok((group, progress))
    }

    /// Release every group, flush the transport and stop the dispatcher.
    pub async fn term(self) {
        let rank = self.local_rank();
        self.registry.lock().clear();

        self.transport.shutdown().await;
        self.cancel_token.cancel();
        if let Err(e) = self.dispatcher.await {
            warn!(%rank, "inbound dispatcher ended abnormally: {}", e);
        }

        debug!(%rank, "transport shut down");
        info!(%rank, "collective runtime terminated");
    }
}

impl std::fmt::Debug for CollectiveRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectiveRuntime")
            .field("local_rank", &self.local_rank())
            .field("nprocs", &self.rank_count())
            .field("groups", &self.group_count())
            .finish()
    }
}
