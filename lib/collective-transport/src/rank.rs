// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process identity types shared by every transport.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Stable integer identity of a process within the run.
///
/// Ranks are dense: a run with `nprocs` processes uses exactly `[0, nprocs)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rank(u32);

impl Rank {
    /// Create a rank from its raw value.
    pub const fn new(rank: u32) -> Self {
        Self(rank)
    }

    /// Raw value of the rank.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// The rank as an index into rank-ordered tables.
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for Rank {
    fn from(rank: u32) -> Self {
        Self(rank)
    }
}

impl From<Rank> for u32 {
    fn from(rank: Rank) -> Self {
        rank.0
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network address of a rank, as advertised by its transport.
///
/// The format is transport specific (`tcp://10.0.0.4:5555`, `mem://3`). The
/// collective core treats it as opaque and only uses it for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerAddress(Arc<str>);

impl PeerAddress {
    /// Create a new address from any string-like value.
    pub fn new(address: impl Into<Arc<str>>) -> Self {
        Self(address.into())
    }

    /// The address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::ops::Deref for PeerAddress {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for PeerAddress {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for PeerAddress {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
