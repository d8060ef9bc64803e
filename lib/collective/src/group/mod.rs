// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Groups: ordered rank sets that are built up, then committed.
//!
//! A group starts life as a `GroupBuilder` that accepts ranks. Commit turns
//! it into a [`CommittedGroup`], which has no mutators and is shared with the
//! barrier through an `Arc`. Insertion order defines each member's
//! group-local position.

mod handle;
mod registry;

pub use handle::GroupHandle;
pub use registry::GroupRegistry;

pub(crate) use handle::Generation;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use dynamo_collective_transport::Rank;
use tokio::sync::OwnedMutexGuard;

use crate::barrier::{BarrierPhase, BarrierProgress};
use crate::error::{CollectiveError, Result};

/// Wire identity of a committed group.
///
/// xxh3 over the handle and the ordered member list. Two processes only
/// exchange barrier traffic for a group when they agree on both.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct GroupTag(u64);

impl GroupTag {
    pub(crate) fn compute(handle: GroupHandle, members: &[Rank]) -> Self {
        let mut bytes = Vec::with_capacity(8 + members.len() * 4);
        bytes.extend_from_slice(&handle.raw().to_le_bytes());
        for rank in members {
            bytes.extend_from_slice(&rank.as_u32().to_le_bytes());
        }
        Self(xxhash_rust::xxh3::xxh3_64(&bytes))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for GroupTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A group still accepting members.
#[derive(Debug, Clone)]
pub(crate) struct GroupBuilder {
    handle: GroupHandle,
    members: Vec<Rank>,
    index: HashSet<Rank>,
}

impl GroupBuilder {
    pub(crate) fn new(handle: GroupHandle) -> Self {
        Self {
            handle,
            members: Vec::new(),
            index: HashSet::new(),
        }
    }

    pub(crate) fn members(&self) -> &[Rank] {
        &self.members
    }

    pub(crate) fn size(&self) -> usize {
        self.members.len()
    }

    /// Append `rank`. The caller has already checked the rank is in range.
    pub(crate) fn add(&mut self, rank: Rank) -> Result<()> {
        if !self.index.insert(rank) {
            return Err(CollectiveError::DuplicateMember {
                handle: self.handle,
                rank,
            });
        }
        self.members.push(rank);
        Ok(())
    }

    /// Append every rank in `ranks`, or none of them.
    pub(crate) fn add_many(&mut self, ranks: &[Rank]) -> Result<()> {
        let mut batch = HashSet::with_capacity(ranks.len());
        for &rank in ranks {
            if self.index.contains(&rank) || !batch.insert(rank) {
                return Err(CollectiveError::DuplicateMember {
                    handle: self.handle,
                    rank,
                });
            }
        }
        self.index.extend(batch);
        self.members.extend_from_slice(ranks);
        Ok(())
    }

    /// Freeze membership.
    pub(crate) fn commit(self, local_rank: Rank) -> CommittedGroup {
        CommittedGroup::new(self.handle, self.members.into(), local_rank)
    }
}

/// A group whose membership can no longer change.
pub struct CommittedGroup {
    handle: GroupHandle,
    members: Arc<[Rank]>,
    tag: GroupTag,
    position: Option<usize>,
    phase: parking_lot::Mutex<BarrierPhase>,
    pub(crate) progress: Arc<tokio::sync::Mutex<BarrierProgress>>,
}

impl CommittedGroup {
    pub(crate) fn new(handle: GroupHandle, members: Arc<[Rank]>, local_rank: Rank) -> Self {
        let tag = GroupTag::compute(handle, &members);
        let position = members.iter().position(|&r| r == local_rank);
        Self {
            handle,
            members,
            tag,
            position,
            phase: parking_lot::Mutex::new(BarrierPhase::Idle),
            progress: Arc::new(tokio::sync::Mutex::new(BarrierProgress::default())),
        }
    }

    /// Current barrier phase. Readable while a barrier is in flight.
    pub fn phase(&self) -> BarrierPhase {
        *self.phase.lock()
    }

    pub(crate) fn set_phase(&self, phase: BarrierPhase) {
        *self.phase.lock() = phase;
    }

    /// Claim the group for one barrier call. Held for the whole call; while it
    /// is held the group cannot be released.
    pub(crate) fn try_enter(&self) -> Result<OwnedMutexGuard<BarrierProgress>> {
        self.progress
            .clone()
            .try_lock_owned()
            .map_err(|_| CollectiveError::InvalidOperation {
                handle: self.handle,
                reason: "a barrier is already in progress on this group",
            })
    }

    pub fn handle(&self) -> GroupHandle {
        self.handle
    }

    pub fn members(&self) -> &[Rank] {
        &self.members
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn tag(&self) -> GroupTag {
        self.tag
    }

    /// Group-local position of this process, if it is a member.
    pub fn position(&self) -> Option<usize> {
        self.position
    }

    /// Member at group-local position `index`.
    pub fn rank_at(&self, index: usize) -> Option<Rank> {
        self.members.get(index).copied()
    }

    pub fn contains(&self, rank: Rank) -> bool {
        self.members.contains(&rank)
    }
}

impl fmt::Debug for CommittedGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommittedGroup")
            .field("handle", &self.handle)
            .field("members", &self.members)
            .field("tag", &self.tag)
            .field("position", &self.position)
            .field("phase", &self.phase())
            .finish()
    }
}

/// A registry entry.
#[derive(Debug)]
pub(crate) enum Group {
    Building(GroupBuilder),
    Committed(Arc<CommittedGroup>),
}

impl Group {
    pub(crate) fn size(&self) -> usize {
        match self {
            Group::Building(b) => b.size(),
            Group::Committed(c) => c.size(),
        }
    }

    pub(crate) fn members(&self) -> &[Rank] {
        match self {
            Group::Building(b) => b.members(),
            Group::Committed(c) => c.members(),
        }
    }

    pub(crate) fn is_committed(&self) -> bool {
        matches!(self, Group::Committed(_))
    }
}
