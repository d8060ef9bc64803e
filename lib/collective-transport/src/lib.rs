// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! Control-message transports for the collective runtime.
//!
//! The collective core never talks to sockets directly. It sees a [`Transport`]:
//! a rank-addressed channel for small control messages plus an ordered
//! [`InboundStream`] of frames and peer-departure notices.
//!
//! Two implementations ship with this crate:
//!
//! - [`memory::MemoryFabric`] connects N endpoints inside one process. It is
//!   used by tests and by single-process simulations, and can crash a rank on
//!   demand.
//! - [`tcp::TcpTransport`] carries frames over TCP with one lazily-established
//!   writer link per peer and an accept loop that reports departures.
//!
//! # Ordering
//!
//! Frames from one source are delivered in the order they were sent, and a
//! [`InboundEvent::Departed`] notice for a rank is delivered after every frame
//! that rank managed to send. The barrier relies on this to tell a peer that
//! finished and left apart from a peer that died before signalling.

mod rank;
mod transport;

pub mod memory;
pub mod tcp;

pub use rank::{PeerAddress, Rank};
pub use transport::{
    HealthCheckError, InboundEvent, InboundSender, InboundStream, MAX_CONTROL_PAYLOAD, Transport,
    TransportError, inbound_channel,
};
