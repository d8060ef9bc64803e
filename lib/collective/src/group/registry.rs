// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-local table of groups, indexed by generational handle.

use std::sync::Arc;

use dynamo_collective_transport::Rank;
use tracing::{debug, trace};

use super::{CommittedGroup, Generation, Group, GroupBuilder, GroupHandle, GroupTag};
use crate::directory::RankDirectory;
use crate::error::{CollectiveError, Result};

struct Slot {
    generation: Generation,
    group: Option<Group>,
}

/// Owns every group known to this process.
///
/// Slot 0 always holds the committed global group. Released slots go on a
/// LIFO free list and come back with the next generation; a slot whose
/// generation is exhausted is retired instead of reused.
pub struct GroupRegistry {
    directory: RankDirectory,
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    max_groups: usize,
}

impl GroupRegistry {
    /// Create a registry holding only the global group.
    ///
    /// `max_groups` counts the global group and is clamped to at least 1.
    pub fn new(directory: RankDirectory, max_groups: usize) -> Self {
        let members: Arc<[Rank]> = directory.iter().map(|(rank, _)| rank).collect();
        let global = CommittedGroup::new(GroupHandle::GLOBAL, members, directory.local_rank());

        Self {
            directory,
            slots: vec![Slot {
                generation: GroupHandle::GLOBAL.generation(),
                group: Some(Group::Committed(Arc::new(global))),
            }],
            free: Vec::new(),
            live: 1,
            max_groups: max_groups.max(1),
        }
    }

    /// Number of groups currently held, including the global group.
    pub fn count(&self) -> usize {
        self.live
    }

    /// Configured group cap.
    pub fn max(&self) -> usize {
        self.max_groups
    }

    pub fn directory(&self) -> &RankDirectory {
        &self.directory
    }

    /// Create an empty, uncommitted group.
    pub fn create(&mut self) -> Result<GroupHandle> {
        if self.live >= self.max_groups {
            return Err(CollectiveError::ResourceExhausted {
                limit: self.max_groups,
            });
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.slots.len()).map_err(|_| {
                    CollectiveError::ResourceExhausted {
                        limit: self.max_groups,
                    }
                })?;
                self.slots.push(Slot {
                    generation: 0,
                    group: None,
                });
                index
            }
        };

        let slot = &mut self.slots[index as usize];
        let handle = GroupHandle::new(index, slot.generation);
        slot.group = Some(Group::Building(GroupBuilder::new(handle)));
        self.live += 1;

        debug!(%handle, count = self.live, "group created");
        Ok(handle)
    }

    fn slot(&self, handle: GroupHandle) -> Result<&Slot> {
        match self.slots.get(handle.index() as usize) {
            Some(slot) if slot.generation == handle.generation() && slot.group.is_some() => {
                Ok(slot)
            }
            _ => Err(CollectiveError::InvalidHandle(handle)),
        }
    }

    fn slot_mut(&mut self, handle: GroupHandle) -> Result<&mut Slot> {
        match self.slots.get_mut(handle.index() as usize) {
            Some(slot) if slot.generation == handle.generation() && slot.group.is_some() => {
                Ok(slot)
            }
            _ => Err(CollectiveError::InvalidHandle(handle)),
        }
    }

    pub(crate) fn lookup(&self, handle: GroupHandle) -> Result<&Group> {
        self.slot(handle)?
            .group
            .as_ref()
            .ok_or(CollectiveError::InvalidHandle(handle))
    }

    fn builder_mut(&mut self, handle: GroupHandle) -> Result<&mut GroupBuilder> {
        let slot = self.slot_mut(handle)?;
        match slot.group.as_mut() {
            Some(Group::Building(builder)) => Ok(builder),
            Some(Group::Committed(_)) => Err(CollectiveError::InvalidOperation {
                handle,
                reason: "group membership is committed",
            }),
            None => Err(CollectiveError::InvalidHandle(handle)),
        }
    }

    pub fn size(&self, handle: GroupHandle) -> Result<usize> {
        Ok(self.lookup(handle)?.size())
    }

    /// Members of `handle` in insertion order.
    pub fn ranks(&self, handle: GroupHandle) -> Result<Vec<Rank>> {
        Ok(self.lookup(handle)?.members().to_vec())
    }

    pub fn is_committed(&self, handle: GroupHandle) -> Result<bool> {
        Ok(self.lookup(handle)?.is_committed())
    }

    /// Append `rank` to an uncommitted group.
    pub fn add(&mut self, handle: GroupHandle, rank: Rank) -> Result<()> {
        self.lookup(handle)?;
        if handle.is_global() {
            return Err(CollectiveError::InvalidOperation {
                handle,
                reason: "the global group is immutable",
            });
        }
        // committed check comes before rank validation
        let directory = self.directory.clone();
        let builder = self.builder_mut(handle)?;
        directory.resolve(rank)?;
        builder.add(rank)?;

        trace!(%handle, %rank, size = builder.size(), "rank added");
        Ok(())
    }

    /// Append every rank in `ranks`, or none of them.
    pub fn add_many(&mut self, handle: GroupHandle, ranks: &[Rank]) -> Result<()> {
        self.lookup(handle)?;
        if handle.is_global() {
            return Err(CollectiveError::InvalidOperation {
                handle,
                reason: "the global group is immutable",
            });
        }
        let directory = self.directory.clone();
        let builder = self.builder_mut(handle)?;
        for &rank in ranks {
            directory.resolve(rank)?;
        }
        builder.add_many(ranks)?;

        trace!(%handle, added = ranks.len(), size = builder.size(), "ranks added");
        Ok(())
    }

    /// Freeze membership of `handle`. Idempotent.
    pub fn commit(&mut self, handle: GroupHandle) -> Result<Arc<CommittedGroup>> {
        let local_rank = self.directory.local_rank();
        let slot = self.slot_mut(handle)?;

        let committed = match slot.group.take() {
            Some(Group::Committed(committed)) => committed,
            Some(Group::Building(builder)) => {
                let committed = Arc::new(builder.commit(local_rank));
                debug!(
                    %handle,
                    size = committed.size(),
                    tag = %committed.tag(),
                    "group committed"
                );
                committed
            }
            None => return Err(CollectiveError::InvalidHandle(handle)),
        };

        slot.group = Some(Group::Committed(committed.clone()));
        Ok(committed)
    }

    /// Destroy the group behind `handle`.
    ///
    /// The global group cannot be released, and neither can a group with a
    /// barrier in progress. Returns the wire tag if the group was committed.
    pub fn release(&mut self, handle: GroupHandle) -> Result<Option<GroupTag>> {
        self.lookup(handle)?;
        if handle.is_global() {
            return Err(CollectiveError::InvalidOperation {
                handle,
                reason: "the global group cannot be released",
            });
        }

        let slot = self.slot_mut(handle)?;
        if let Some(Group::Committed(committed)) = &slot.group
            && committed.progress.try_lock().is_err()
        {
            return Err(CollectiveError::InvalidOperation {
                handle,
                reason: "a barrier is in progress on this group",
            });
        }

        let tag = match slot.group.take() {
            Some(Group::Committed(committed)) => Some(committed.tag()),
            _ => None,
        };
        let retired = match slot.generation.checked_add(1) {
            Some(next) => {
                slot.generation = next;
                false
            }
            None => true,
        };
        if !retired {
            self.free.push(handle.index());
        }
        self.live -= 1;

        debug!(%handle, retired, count = self.live, "group released");
        Ok(tag)
    }

    /// Drop every group except the global one.
    pub(crate) fn clear(&mut self) {
        for index in 1..self.slots.len() {
            let slot = &mut self.slots[index];
            if slot.group.take().is_some()
                && let Some(next) = slot.generation.checked_add(1)
            {
                slot.generation = next;
                self.free.push(index as u32);
            }
        }
        self.live = 1;
    }

    #[cfg(test)]
    fn set_generation(&mut self, index: u32, generation: Generation) {
        self.slots[index as usize].generation = generation;
    }
}
