// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Immutable rank to address table, built once from the transport.

use std::sync::Arc;

use dynamo_collective_transport::{PeerAddress, Rank, Transport, TransportError};

use crate::error::{CollectiveError, Result};

/// Maps every rank in `[0, nprocs)` to its advertised address.
///
/// Cheap to clone; the table is shared.
#[derive(Clone, Debug)]
pub struct RankDirectory {
    local_rank: Rank,
    addresses: Arc<[PeerAddress]>,
}

impl RankDirectory {
    /// Snapshot the world described by `transport`.
    ///
    /// Fails with [`TransportError::UnknownPeer`] if the transport cannot name
    /// an address for some rank, including its own.
    pub fn from_transport(transport: &dyn Transport) -> Result<Self, TransportError> {
        let local_rank = transport.local_rank();
        let nprocs = transport.rank_count();
        if local_rank.as_u32() >= nprocs {
            return Err(TransportError::UnknownPeer(local_rank));
        }

        let addresses = (0..nprocs)
            .map(|raw| {
                let rank = Rank::new(raw);
                transport
                    .peer_address(rank)
                    .ok_or(TransportError::UnknownPeer(rank))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            local_rank,
            addresses: addresses.into(),
        })
    }

    /// Address of `rank`.
    pub fn resolve(&self, rank: Rank) -> Result<&PeerAddress> {
        self.addresses
            .get(rank.as_usize())
            .ok_or(CollectiveError::UnknownRank {
                rank,
                nprocs: self.nprocs(),
            })
    }

    pub fn nprocs(&self) -> u32 {
        self.addresses.len() as u32
    }

    pub fn local_rank(&self) -> Rank {
        self.local_rank
    }

    pub fn contains(&self, rank: Rank) -> bool {
        rank.as_usize() < self.addresses.len()
    }

    /// All `(rank, address)` pairs in rank order.
    pub fn iter(&self) -> impl Iterator<Item = (Rank, &PeerAddress)> + '_ {
        self.addresses
            .iter()
            .enumerate()
            .map(|(i, addr)| (Rank::new(i as u32), addr))
    }
}
