// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Barrier control messages.
//!
//! Fixed 22 byte little-endian layout:
//! ```text
//! [u8: schema_version][u8: kind][u64: group_tag][u64: epoch][u32: arg]
//! ```
//! `arg` is the round for [`ControlMessage::Arrive`] and the failed rank for
//! [`ControlMessage::Abort`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dynamo_collective_transport::Rank;
use thiserror::Error;

use crate::group::GroupTag;

const CURRENT_SCHEMA_VERSION: u8 = 1;

pub(crate) const MESSAGE_SIZE: usize = 1 + 1 + 8 + 8 + 4;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageKind {
    Arrive = 1,
    Abort = 2,
}

impl TryFrom<u8> for MessageKind {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageKind::Arrive),
            2 => Ok(MessageKind::Abort),
            _ => Err(DecodeError::InvalidKind(value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlMessage {
    /// The sender finished round `round` of barrier `epoch`.
    Arrive { tag: GroupTag, epoch: u64, round: u32 },
    /// The sender saw `failed` die during barrier `epoch`.
    Abort {
        tag: GroupTag,
        epoch: u64,
        failed: Rank,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum DecodeError {
    #[error("Invalid message length: expected {MESSAGE_SIZE} bytes, got {0}")]
    InvalidLength(usize),

    #[error("Unsupported schema version: {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid message kind: {0}")]
    InvalidKind(u8),
}

impl ControlMessage {
    pub(crate) fn encode(&self) -> Bytes {
        let (kind, tag, epoch, arg) = match *self {
            ControlMessage::Arrive { tag, epoch, round } => (MessageKind::Arrive, tag, epoch, round),
            ControlMessage::Abort { tag, epoch, failed } => {
                (MessageKind::Abort, tag, epoch, failed.as_u32())
            }
        };

        let mut buf = BytesMut::with_capacity(MESSAGE_SIZE);
        buf.put_u8(CURRENT_SCHEMA_VERSION);
        buf.put_u8(kind as u8);
        buf.put_u64_le(tag.raw());
        buf.put_u64_le(epoch);
        buf.put_u32_le(arg);
        buf.freeze()
    }

    pub(crate) fn decode(mut bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != MESSAGE_SIZE {
            return Err(DecodeError::InvalidLength(bytes.len()));
        }

        let version = bytes.get_u8();
        if version != CURRENT_SCHEMA_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let kind = MessageKind::try_from(bytes.get_u8())?;
        let tag = GroupTag::from_raw(bytes.get_u64_le());
        let epoch = bytes.get_u64_le();
        let arg = bytes.get_u32_le();

        Ok(match kind {
            MessageKind::Arrive => ControlMessage::Arrive {
                tag,
                epoch,
                round: arg,
            },
            MessageKind::Abort => ControlMessage::Abort {
                tag,
                epoch,
                failed: Rank::new(arg),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arrive_layout() {
        let msg = ControlMessage::Arrive {
            tag: GroupTag::from_raw(0x0102_0304_0506_0708),
            epoch: 9,
            round: 2,
        };
        let bytes = msg.encode();
        assert_eq!(bytes.len(), MESSAGE_SIZE);
        assert_eq!(bytes[0], CURRENT_SCHEMA_VERSION);
        assert_eq!(bytes[1], 1);
        assert_eq!(&bytes[2..10], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&bytes[10..18], &9u64.to_le_bytes());
        assert_eq!(&bytes[18..22], &2u32.to_le_bytes());
        assert_eq!(ControlMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_abort_carries_failed_rank() {
        let msg = ControlMessage::Abort {
            tag: GroupTag::from_raw(77),
            epoch: 1,
            failed: Rank::new(5),
        };
        let bytes = msg.encode();
        assert_eq!(bytes[1], 2);
        assert_eq!(&bytes[18..22], &5u32.to_le_bytes());
        assert_eq!(ControlMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_reject_malformed() {
        let good = ControlMessage::Arrive {
            tag: GroupTag::from_raw(1),
            epoch: 1,
            round: 0,
        }
        .encode();

        assert_eq!(
            ControlMessage::decode(&good[..MESSAGE_SIZE - 1]),
            Err(DecodeError::InvalidLength(MESSAGE_SIZE - 1))
        );
        assert_eq!(
            ControlMessage::decode(&[]),
            Err(DecodeError::InvalidLength(0))
        );

        let mut bad_version = good.to_vec();
        bad_version[0] = 2;
        assert_eq!(
            ControlMessage::decode(&bad_version),
            Err(DecodeError::UnsupportedVersion(2))
        );

        let mut bad_kind = good.to_vec();
        bad_kind[1] = 0;
        assert_eq!(
            ControlMessage::decode(&bad_kind),
            Err(DecodeError::InvalidKind(0))
        );

        let mut long = good.to_vec();
        long.push(0);
        assert!(ControlMessage::decode(&long).is_err());
    }
}
