// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]

// Core
mod barrier;
mod directory;
mod error;
pub mod group;
mod runtime;

// Ambient
pub mod config;
pub mod logging;

// ── Re-exports ───────────────────────────────────────────────────────

pub use barrier::{BarrierPhase, Timeout};
pub use config::{BarrierConfig, CollectiveConfig, ConfigError, TcpConfig};
pub use directory::RankDirectory;
pub use error::{CollectiveError, Result};
pub use group::{CommittedGroup, GroupHandle, GroupRegistry, GroupTag};
pub use runtime::CollectiveRuntime;

pub use dynamo_collective_transport as transport;
pub use dynamo_collective_transport::{PeerAddress, Rank, Transport, TransportError};
