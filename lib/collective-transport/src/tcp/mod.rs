// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! TCP control transport.
//!
//! - One lazily-connected writer link per peer, fed by an unbounded channel
//! - Connect retries with back-off until the configured deadline
//! - Hello frame on connect so the accept side can attribute the stream
//! - Departure notices when an identified inbound stream ends
//! - Keep-alive for dead connection detection

pub mod framing;
mod listener;
mod transport;

pub use framing::{ControlFrame, ControlFrameCodec, FrameKind};
pub use transport::{TcpTransport, TcpTransportBuilder, parse_tcp_endpoint};

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::warn;

fn configure_keepalive(stream: &TcpStream, peer: SocketAddr) {
    let sock = socket2::SockRef::from(stream);
    if let Err(e) = sock.set_tcp_keepalive(
        &socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(60))
            .with_interval(Duration::from_secs(10)),
    ) {
        warn!("Failed to set keepalive for {}: {}", peer, e);
    }
}
