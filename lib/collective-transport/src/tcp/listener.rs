// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Accept loop for the TCP control transport.
//!
//! Each inbound connection must open with a hello frame naming the sending
//! rank. Control frames are then forwarded to the [`InboundSender`] in arrival
//! order. When an identified connection ends for any reason other than our own
//! shutdown, the peer is reported as departed after its last frame.

use anyhow::Result;
use futures::StreamExt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::framing::{ControlFrameCodec, FrameKind};
use crate::{InboundSender, Rank};

/// How long an accepted connection may stay silent before sending its hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct ControlListener {
    listener: TokioTcpListener,
    inbound: InboundSender,
    cancel_token: CancellationToken,
}

impl ControlListener {
    pub(crate) fn new(
        listener: TokioTcpListener,
        inbound: InboundSender,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            listener,
            inbound,
            cancel_token,
        }
    }

    /// Accept connections until the cancel token fires.
    pub(crate) async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("TCP control listener bound to {}", addr);
        }

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("Accepted TCP connection from {}", peer_addr);
                            let inbound = self.inbound.clone();
                            let cancel_token = self.cancel_token.clone();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    Self::handle_connection(stream, peer_addr, inbound, cancel_token).await
                                {
                                    warn!("Error handling connection from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept TCP connection: {}", e);
                        }
                    }
                }
                _ = self.cancel_token.cancelled() => {
                    info!("TCP control listener shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        inbound: InboundSender,
        cancel_token: CancellationToken,
    ) -> Result<()> {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on {}: {}", peer_addr, e);
        }
        super::configure_keepalive(&stream, peer_addr);

        let mut framed = Framed::new(stream, ControlFrameCodec::new());

        let src = match tokio::time::timeout(HELLO_TIMEOUT, framed.next()).await {
            Ok(Some(Ok(frame))) if frame.kind == FrameKind::Hello => frame.src,
            Ok(Some(Ok(frame))) => {
                anyhow::bail!("expected hello from {}, got {:?}", peer_addr, frame.kind)
            }
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(None) => return Ok(()),
            Err(_) => anyhow::bail!("no hello from {} within {:?}", peer_addr, HELLO_TIMEOUT),
        };

        debug!(%src, "Connection from {} identified", peer_addr);

        loop {
            tokio::select! {
                frame_result = framed.next() => {
                    match frame_result {
                        Some(Ok(frame)) => {
                            if frame.kind != FrameKind::Control {
                                warn!(%src, "Ignoring unexpected {:?} frame", frame.kind);
                                continue;
                            }
                            if !inbound.deliver(src, frame.payload) {
                                debug!("Inbound stream closed; dropping connection from {}", src);
                                return Ok(());
                            }
                        }
                        Some(Err(e)) => {
                            error!(%src, "Frame decode error from {}: {}", peer_addr, e);
                            break;
                        }
                        None => {
                            debug!(%src, "Connection from {} closed", peer_addr);
                            break;
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    debug!(%src, "Connection handler for {} cancelled", peer_addr);
                    return Ok(());
                }
            }
        }

        Self::report_departure(&inbound, src, &cancel_token);
        Ok(())
    }

    fn report_departure(inbound: &InboundSender, src: Rank, cancel_token: &CancellationToken) {
        if !cancel_token.is_cancelled() {
            inbound.departed(src);
        }
    }
}
