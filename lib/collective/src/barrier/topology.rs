// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dissemination barrier schedule.
//!
//! In round `k` the member at position `i` signals `(i + 2^k) mod n` and waits
//! for `(i - 2^k) mod n`. After `ceil(log2 n)` rounds every member has
//! transitively heard from every other.

#[derive(Debug, Clone, Copy)]
pub(crate) struct Dissemination {
    size: usize,
    position: usize,
    rounds: u32,
}

impl Dissemination {
    pub(crate) fn new(size: usize, position: usize) -> Self {
        debug_assert!(position < size);
        let rounds = if size <= 1 {
            0
        } else {
            usize::BITS - (size - 1).leading_zeros()
        };
        Self {
            size,
            position,
            rounds,
        }
    }

    pub(crate) fn rounds(&self) -> u32 {
        self.rounds
    }

    fn distance(&self, round: u32) -> usize {
        (1usize << round) % self.size
    }

    /// Position signalled in `round`.
    pub(crate) fn send_to(&self, round: u32) -> usize {
        (self.position + self.distance(round)) % self.size
    }

    /// Position awaited in `round`.
    pub(crate) fn recv_from(&self, round: u32) -> usize {
        (self.position + self.size - self.distance(round)) % self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashSet;

    #[rstest]
    #[case(1, 0)]
    #[case(2, 1)]
    #[case(3, 2)]
    #[case(4, 2)]
    #[case(5, 3)]
    #[case(8, 3)]
    #[case(9, 4)]
    fn test_round_count(#[case] size: usize, #[case] rounds: u32) {
        assert_eq!(Dissemination::new(size, 0).rounds(), rounds);
    }

    #[test]
    fn test_send_and_recv_are_mirrors() {
        for size in 2..=9 {
            for position in 0..size {
                let me = Dissemination::new(size, position);
                for round in 0..me.rounds() {
                    let to = me.send_to(round);
                    let peer = Dissemination::new(size, to);
                    assert_eq!(peer.recv_from(round), position);
                    assert_ne!(to, position);
                }
            }
        }
    }

    #[rstest]
    #[case(3)]
    #[case(5)]
    #[case(6)]
    #[case(8)]
    fn test_every_member_hears_from_everyone(#[case] size: usize) {
        // knowledge[i] = members whose arrival i has (transitively) observed
        let mut knowledge: Vec<HashSet<usize>> = (0..size).map(|i| HashSet::from([i])).collect();
        let rounds = Dissemination::new(size, 0).rounds();
        for round in 0..rounds {
            let snapshot = knowledge.clone();
            for (i, known) in knowledge.iter_mut().enumerate() {
                let from = Dissemination::new(size, i).recv_from(round);
                known.extend(snapshot[from].iter().copied());
            }
        }
        assert!(knowledge.iter().all(|known| known.len() == size));
    }
}
