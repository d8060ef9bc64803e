// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Group handle encoded in a single `u64` value.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

pub(crate) type Generation = u32;

const INDEX_BITS: u32 = 32;
const GENERATION_BITS: u32 = 32;

const INDEX_SHIFT: u32 = GENERATION_BITS;

const INDEX_MASK: u64 = ((1u64 << INDEX_BITS) - 1) << INDEX_SHIFT;
const GENERATION_MASK: u64 = (1u64 << GENERATION_BITS) - 1;

/// Opaque identifier for a group held by a [`GroupRegistry`](super::GroupRegistry).
///
/// Layout (MSB to LSB): `[slot_index: 32 bits][generation: 32 bits]`
///
/// Slot 0, generation 0 is reserved for [`GroupHandle::GLOBAL`]. Releasing a
/// group bumps its slot's generation, so a stale handle never aliases a group
/// created later in the same slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupHandle(u64);

impl GroupHandle {
    /// The group of all ranks `[0, nprocs)`, created at init.
    pub const GLOBAL: GroupHandle = GroupHandle(0);

    pub(crate) const fn new(index: u32, generation: Generation) -> Self {
        Self(((index as u64) << INDEX_SHIFT) | (generation as u64))
    }

    /// Reconstruct a handle from its raw u64 representation.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Return the raw u64 representation.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Extract the slot index (upper 32 bits).
    pub const fn index(&self) -> u32 {
        ((self.0 & INDEX_MASK) >> INDEX_SHIFT) as u32
    }

    /// Extract the generation counter (lower 32 bits).
    pub const fn generation(&self) -> Generation {
        (self.0 & GENERATION_MASK) as Generation
    }

    /// Returns `true` for [`GroupHandle::GLOBAL`].
    pub const fn is_global(&self) -> bool {
        self.0 == Self::GLOBAL.0
    }
}

impl Display for GroupHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_global() {
            return write!(f, "GroupHandle(global)");
        }
        write!(
            f,
            "GroupHandle(index={}, generation={})",
            self.index(),
            self.generation()
        )
    }
}
