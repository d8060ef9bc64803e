// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Length-prefixed framing for control messages over TCP.
//!
//! Wire format (11 bytes overhead):
//! ```text
//! [u16 BE: schema_version][u8: frame_kind][u32 BE: src_rank][u32 BE: payload_len][payload bytes]
//! ```
//!
//! Every connection opens with a [`FrameKind::Hello`] frame carrying the
//! sender's rank and an empty payload; the accept side uses it to attribute
//! the connection to a peer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::{MAX_CONTROL_PAYLOAD, Rank};

/// Current schema version
const SCHEMA_VERSION_V1: u16 = 1;

/// Fixed preamble size (version + kind + src + length)
pub(crate) const PREAMBLE_SIZE: usize = 2 + 1 + 4 + 4;

/// Kind of a TCP control frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// First frame on a connection; identifies the sender.
    Hello = 0,
    /// A control payload for the collective core.
    Control = 1,
}

impl FrameKind {
    /// Try to convert a u8 to a FrameKind
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameKind::Hello),
            1 => Some(FrameKind::Control),
            _ => None,
        }
    }
}

/// A decoded TCP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    /// Frame kind.
    pub kind: FrameKind,
    /// Rank of the sender.
    pub src: Rank,
    /// Control payload; empty for [`FrameKind::Hello`].
    pub payload: Bytes,
}

impl ControlFrame {
    /// Connection-opening frame for `src`.
    pub fn hello(src: Rank) -> Self {
        Self {
            kind: FrameKind::Hello,
            src,
            payload: Bytes::new(),
        }
    }

    /// Control frame carrying `payload` from `src`.
    pub fn control(src: Rank, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Control,
            src,
            payload,
        }
    }
}

/// Stateful codec for [`ControlFrame`]s.
#[derive(Debug, Clone)]
pub struct ControlFrameCodec {
    state: DecodeState,
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    AwaitingPreamble,
    AwaitingPayload {
        kind: FrameKind,
        src: Rank,
        payload_len: usize,
    },
}

impl ControlFrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            state: DecodeState::AwaitingPreamble,
        }
    }

    fn invalid(msg: String) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, msg)
    }
}

impl Default for ControlFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ControlFrameCodec {
    type Item = ControlFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::AwaitingPreamble => {
                    if src.len() < PREAMBLE_SIZE {
                        return Ok(None);
                    }

                    let schema_version = u16::from_be_bytes([src[0], src[1]]);
                    if schema_version != SCHEMA_VERSION_V1 {
                        return Err(Self::invalid(format!(
                            "Unsupported schema version: {} (expected {})",
                            schema_version, SCHEMA_VERSION_V1
                        )));
                    }

                    let kind = FrameKind::from_u8(src[2])
                        .ok_or_else(|| Self::invalid(format!("Invalid frame kind: {}", src[2])))?;
                    let rank = u32::from_be_bytes([src[3], src[4], src[5], src[6]]);
                    let payload_len = u32::from_be_bytes([src[7], src[8], src[9], src[10]]) as usize;

                    if payload_len > MAX_CONTROL_PAYLOAD {
                        return Err(Self::invalid(format!(
                            "Frame payload {} exceeds maximum {}",
                            payload_len, MAX_CONTROL_PAYLOAD
                        )));
                    }

                    src.advance(PREAMBLE_SIZE);
                    self.state = DecodeState::AwaitingPayload {
                        kind,
                        src: Rank::new(rank),
                        payload_len,
                    };
                }

                DecodeState::AwaitingPayload {
                    kind,
                    src: rank,
                    payload_len,
                } => {
                    if src.len() < payload_len {
                        src.reserve(payload_len - src.len());
                        return Ok(None);
                    }

                    let payload = src.split_to(payload_len).freeze();
                    self.state = DecodeState::AwaitingPreamble;

                    return Ok(Some(ControlFrame {
                        kind,
                        src: rank,
                        payload,
                    }));
                }
            }
        }
    }
}

impl Encoder<ControlFrame> for ControlFrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: ControlFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Self::invalid(format!(
                "Frame payload {} exceeds maximum {}",
                frame.payload.len(),
                MAX_CONTROL_PAYLOAD
            )));
        }

        dst.reserve(PREAMBLE_SIZE + frame.payload.len());
        dst.put_u16(SCHEMA_VERSION_V1);
        dst.put_u8(frame.kind as u8);
        dst.put_u32(frame.src.as_u32());
        dst.put_u32(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}
