// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use dynamo_collective_transport::{Rank, TransportError};

use crate::group::GroupHandle;

/// Result alias used throughout the collective core.
pub type Result<T, E = CollectiveError> = std::result::Result<T, E>;

/// Errors returned by group and barrier operations.
///
/// Every error goes back to the immediate caller. [`CollectiveError::Timeout`]
/// is recoverable by calling the barrier again; [`CollectiveError::CollectiveFailure`]
/// is not.
#[derive(thiserror::Error, Debug)]
pub enum CollectiveError {
    #[error("invalid group handle {0}")]
    InvalidHandle(GroupHandle),

    #[error("invalid operation on group {handle}: {reason}")]
    InvalidOperation {
        handle: GroupHandle,
        reason: &'static str,
    },

    #[error("rank {rank} is outside the run of {nprocs} processes")]
    UnknownRank { rank: Rank, nprocs: u32 },

    #[error("rank {rank} is already a member of group {handle}")]
    DuplicateMember { handle: GroupHandle, rank: Rank },

    #[error("group limit of {limit} reached")]
    ResourceExhausted { limit: usize },

    #[error("barrier on group {handle} timed out")]
    Timeout { handle: GroupHandle },

    #[error("collective on group {handle} failed: rank {rank} is unreachable")]
    CollectiveFailure { handle: GroupHandle, rank: Rank },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl CollectiveError {
    /// Returns `true` for errors after which retrying the same call can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CollectiveError::Timeout { .. })
    }

    /// The rank reported as failed, for [`CollectiveError::CollectiveFailure`].
    pub fn failed_rank(&self) -> Option<Rank> {
        match self {
            CollectiveError::CollectiveFailure { rank, .. } => Some(*rank),
            _ => None,
        }
    }
}
