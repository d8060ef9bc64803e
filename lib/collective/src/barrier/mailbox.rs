// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Inbound side of the barrier.
//!
//! A dispatcher task drains the transport's [`InboundStream`] into the
//! [`Mailbox`]. Signals are buffered by `(tag, epoch, round, src)` so they can
//! arrive before the local process reaches the barrier, or even before it has
//! committed the group.

use std::collections::{HashMap, HashSet};

use dynamo_collective_transport::{InboundEvent, InboundStream, Rank};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::messages::ControlMessage;
use crate::group::GroupTag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SignalKey {
    pub tag: GroupTag,
    pub epoch: u64,
    pub round: u32,
    pub src: Rank,
}

/// What the mailbox knows about an awaited signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// The signal is here.
    Ready,
    /// Some member aborted the group because `failed` died.
    Aborted { failed: Rank },
    /// The awaited sender departed without delivering the signal.
    Departed,
    /// The inbound stream ended; nothing more will arrive.
    Closed,
    Pending,
}

#[derive(Default)]
struct MailboxState {
    signals: HashSet<SignalKey>,
    aborts: HashMap<GroupTag, Rank>,
    departed: HashSet<Rank>,
    closed: bool,
}

#[derive(Default)]
pub(crate) struct Mailbox {
    state: Mutex<MailboxState>,
    changed: Notify,
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn changed(&self) -> &Notify {
        &self.changed
    }

    pub(crate) fn record(&self, src: Rank, message: ControlMessage) {
        {
            let mut state = self.state.lock();
            match message {
                ControlMessage::Arrive { tag, epoch, round } => {
                    trace!(%src, %tag, epoch, round, "arrive signal");
                    state.signals.insert(SignalKey {
                        tag,
                        epoch,
                        round,
                        src,
                    });
                }
                ControlMessage::Abort { tag, epoch, failed } => {
                    debug!(%src, %tag, epoch, %failed, "abort received");
                    state.aborts.entry(tag).or_insert(failed);
                }
            }
        }
        self.changed.notify_waiters();
    }

    pub(crate) fn record_departed(&self, rank: Rank) {
        self.state.lock().departed.insert(rank);
        debug!(%rank, "peer departed");
        self.changed.notify_waiters();
    }

    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.changed.notify_waiters();
    }

    /// Check, in order: the signal, an abort for its group, departure of its
    /// sender, end of stream.
    pub(crate) fn poll(&self, key: &SignalKey) -> Delivery {
        let state = self.state.lock();
        if state.signals.contains(key) {
            Delivery::Ready
        } else if let Some(&failed) = state.aborts.get(&key.tag) {
            Delivery::Aborted { failed }
        } else if state.departed.contains(&key.src) {
            Delivery::Departed
        } else if state.closed {
            Delivery::Closed
        } else {
            Delivery::Pending
        }
    }

    pub(crate) fn abort_for(&self, tag: GroupTag) -> Option<Rank> {
        self.state.lock().aborts.get(&tag).copied()
    }

    #[cfg(test)]
    pub(crate) fn is_departed(&self, rank: Rank) -> bool {
        self.state.lock().departed.contains(&rank)
    }

    /// Drop signals for `tag` up to and including `epoch`.
    pub(crate) fn purge(&self, tag: GroupTag, epoch: u64) {
        self.state
            .lock()
            .signals
            .retain(|key| key.tag != tag || key.epoch > epoch);
    }

    /// Drop everything held for `tag`.
    pub(crate) fn forget(&self, tag: GroupTag) {
        let mut state = self.state.lock();
        state.signals.retain(|key| key.tag != tag);
        state.aborts.remove(&tag);
    }

    #[cfg(test)]
    pub(crate) fn pending_signals(&self) -> usize {
        self.state.lock().signals.len()
    }
}

/// Drain `inbound` into `mailbox` until the stream ends or `cancel_token` fires.
pub(crate) async fn run_dispatcher(
    inbound: InboundStream,
    mailbox: std::sync::Arc<Mailbox>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            event = inbound.recv() => {
                match event {
                    Some(InboundEvent::Frame { src, payload }) => {
                        match ControlMessage::decode(&payload) {
                            Ok(message) => mailbox.record(src, message),
                            Err(e) => warn!(%src, "Dropping malformed control message: {}", e),
                        }
                    }
                    Some(InboundEvent::Departed { rank }) => mailbox.record_departed(rank),
                    None => break,
                }
            }
            _ = cancel_token.cancelled() => break,
        }
    }

    debug!("inbound dispatcher stopped");
    mailbox.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use dynamo_collective_transport::inbound_channel;
    use std::sync::Arc;
    use std::time::Duration;

    fn key(epoch: u64, round: u32, src: u32) -> SignalKey {
        SignalKey {
            tag: GroupTag::from_raw(1),
            epoch,
            round,
            src: Rank::new(src),
        }
    }

    fn arrive(epoch: u64, round: u32) -> ControlMessage {
        ControlMessage::Arrive {
            tag: GroupTag::from_raw(1),
            epoch,
            round,
        }
    }

    #[test]
    fn test_signal_wins_over_departure() {
        let mailbox = Mailbox::new();
        mailbox.record(Rank::new(2), arrive(1, 0));
        mailbox.record_departed(Rank::new(2));

        assert_eq!(mailbox.poll(&key(1, 0, 2)), Delivery::Ready);
        assert_eq!(mailbox.poll(&key(1, 1, 2)), Delivery::Departed);
        assert_eq!(mailbox.poll(&key(1, 1, 3)), Delivery::Pending);
    }

    #[test]
    fn test_abort_applies_to_the_whole_group() {
        let mailbox = Mailbox::new();
        mailbox.record(
            Rank::new(0),
            ControlMessage::Abort {
                tag: GroupTag::from_raw(1),
                epoch: 4,
                failed: Rank::new(3),
            },
        );
        assert_eq!(
            mailbox.poll(&key(9, 0, 1)),
            Delivery::Aborted {
                failed: Rank::new(3)
            }
        );
        assert_eq!(mailbox.abort_for(GroupTag::from_raw(1)), Some(Rank::new(3)));
        assert_eq!(mailbox.abort_for(GroupTag::from_raw(2)), None);

        mailbox.forget(GroupTag::from_raw(1));
        assert_eq!(mailbox.poll(&key(9, 0, 1)), Delivery::Pending);
    }

    #[test]
    fn test_purge_keeps_future_epochs() {
        let mailbox = Mailbox::new();
        mailbox.record(Rank::new(1), arrive(1, 0));
        mailbox.record(Rank::new(1), arrive(1, 1));
        mailbox.record(Rank::new(1), arrive(2, 0));
        // duplicates are idempotent
        mailbox.record(Rank::new(1), arrive(2, 0));
        assert_eq!(mailbox.pending_signals(), 3);

        mailbox.purge(GroupTag::from_raw(1), 1);
        assert_eq!(mailbox.pending_signals(), 1);
        assert_eq!(mailbox.poll(&key(2, 0, 1)), Delivery::Ready);
    }

    #[tokio::test]
    async fn test_dispatcher_routes_events_and_closes() {
        let (tx, rx) = inbound_channel();
        let mailbox = Arc::new(Mailbox::new());
        let task = tokio::spawn(run_dispatcher(
            rx,
            mailbox.clone(),
            CancellationToken::new(),
        ));

        tx.deliver(Rank::new(1), arrive(1, 0).encode());
        tx.deliver(Rank::new(1), Bytes::from_static(b"garbage"));
        tx.departed(Rank::new(1));
        drop(tx);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(mailbox.poll(&key(1, 0, 1)), Delivery::Ready);
        assert!(mailbox.is_departed(Rank::new(1)));
        assert_eq!(mailbox.poll(&key(1, 0, 5)), Delivery::Closed);
    }
}
