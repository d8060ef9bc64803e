// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dissemination barrier over a committed group.
//!
//! Each invocation walks `Idle -> Entered -> Waiting { round } -> Released`.
//! A timed out call leaves the group in `Waiting` and the next call resumes the
//! same epoch, re-sending the current round's signal. Receivers treat signals
//! as a set, so duplicates are harmless.
//!
//! A peer that cannot be reached, departs, or fails repeated liveness probes
//! while awaited is reported as [`CollectiveError::CollectiveFailure`]. The
//! member that detects it sends an abort to the rest of the group so blocked
//! members fail too, and the group stays failed from then on.

mod mailbox;
mod messages;
mod topology;

pub(crate) use mailbox::{Mailbox, run_dispatcher};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dynamo_collective_transport::{Rank, Transport, TransportError};
use tokio::sync::OwnedMutexGuard;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::config::BarrierConfig;
use crate::error::{CollectiveError, Result};
use crate::group::{CommittedGroup, GroupTag};
use mailbox::{Delivery, SignalKey};
use messages::ControlMessage;
use topology::Dissemination;

/// Fatal probes in a row before an awaited peer is declared failed.
const PROBE_STRIKES: u32 = 2;

/// How long a barrier call may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Wait until the barrier completes or fails.
    #[default]
    Block,
    /// Make progress that needs no waiting, then return.
    Test,
    /// Wait at most this long.
    After(Duration),
}

impl Timeout {
    fn deadline(&self) -> Option<Instant> {
        match self {
            Timeout::Block => None,
            Timeout::Test => Some(Instant::now()),
            Timeout::After(d) => Some(Instant::now() + *d),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::After(d)
    }
}

/// Where a group's barrier currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BarrierPhase {
    #[default]
    Idle,
    Entered,
    Waiting {
        round: u32,
    },
    Released,
}

impl fmt::Display for BarrierPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BarrierPhase::Idle => write!(f, "idle"),
            BarrierPhase::Entered => write!(f, "entered"),
            BarrierPhase::Waiting { round } => write!(f, "waiting(round={round})"),
            BarrierPhase::Released => write!(f, "released"),
        }
    }
}

/// Per-group barrier bookkeeping, guarded by the group's progress lock.
#[derive(Debug, Default)]
pub(crate) struct BarrierProgress {
    pub(crate) epoch: u64,
    /// Highest round whose signal was sent in the current epoch.
    pub(crate) sent_round: Option<u32>,
    /// Set once a member is known dead; the group is unusable afterwards.
    pub(crate) failure: Option<Rank>,
}

pub(crate) struct BarrierCoordinator {
    transport: Arc<dyn Transport>,
    mailbox: Arc<Mailbox>,
    local_rank: Rank,
    liveness_interval: Duration,
    health_check_timeout: Duration,
}

impl BarrierCoordinator {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        mailbox: Arc<Mailbox>,
        config: &BarrierConfig,
    ) -> Self {
        Self {
            local_rank: transport.local_rank(),
            transport,
            mailbox,
            liveness_interval: config.liveness_interval(),
            health_check_timeout: config.health_check_timeout(),
        }
    }

    /// Drop buffered state for a released group.
    pub(crate) fn forget(&self, tag: GroupTag) {
        self.mailbox.forget(tag);
    }

    /// Run one barrier call on `group`. `progress` comes from
    /// [`CommittedGroup::try_enter`] on the same group.
    pub(crate) async fn barrier(
        &self,
        group: &CommittedGroup,
        mut progress: OwnedMutexGuard<BarrierProgress>,
        timeout: Timeout,
    ) -> Result<()> {
        let handle = group.handle();
        let deadline = timeout.deadline();

        let Some(position) = group.position() else {
            return Err(CollectiveError::InvalidOperation {
                handle,
                reason: "local rank is not a member of the group",
            });
        };

        if let Some(rank) = progress.failure {
            return Err(CollectiveError::CollectiveFailure { handle, rank });
        }
        if let Some(rank) = self.mailbox.abort_for(group.tag()) {
            progress.failure = Some(rank);
            warn!(%handle, failed = %rank, "group was aborted by a peer");
            return Err(CollectiveError::CollectiveFailure { handle, rank });
        }

        let start_round = match group.phase() {
            BarrierPhase::Waiting { round } => {
                debug!(%handle, epoch = progress.epoch, round, "resuming barrier");
                round
            }
            BarrierPhase::Entered => 0,
            BarrierPhase::Idle | BarrierPhase::Released => {
                progress.epoch += 1;
                progress.sent_round = None;
                group.set_phase(BarrierPhase::Entered);
                debug!(%handle, epoch = progress.epoch, size = group.size(), "entered barrier");
                0
            }
        };

        let epoch = progress.epoch;
        let topology = Dissemination::new(group.size(), position);

        for round in start_round..topology.rounds() {
            group.set_phase(BarrierPhase::Waiting { round });

            let to = group.members()[topology.send_to(round)];
            let from = group.members()[topology.recv_from(round)];

            self.signal(group, &mut progress, epoch, round, to).await?;
            self.await_signal(
                group,
                &mut progress,
                SignalKey {
                    tag: group.tag(),
                    epoch,
                    round,
                    src: from,
                },
                deadline,
            )
            .await?;
        }

        group.set_phase(BarrierPhase::Released);
        self.mailbox.purge(group.tag(), epoch);
        debug!(%handle, epoch, "barrier released");
        Ok(())
    }

    async fn signal(
        &self,
        group: &CommittedGroup,
        progress: &mut BarrierProgress,
        epoch: u64,
        round: u32,
        to: Rank,
    ) -> Result<()> {
        let message = ControlMessage::Arrive {
            tag: group.tag(),
            epoch,
            round,
        };
        trace!(handle = %group.handle(), epoch, round, %to, "sending arrive");

        match self.transport.send(to, message.encode()).await {
            Ok(()) => {
                progress.sent_round = Some(progress.sent_round.map_or(round, |r| r.max(round)));
                Ok(())
            }
            // the first send went out; a failed resend changes nothing
            Err(e) if progress.sent_round.is_some_and(|sent| sent >= round) => {
                debug!(handle = %group.handle(), %to, "resend failed: {}", e);
                Ok(())
            }
            Err(TransportError::PeerUnreachable(rank)) => {
                Err(self.fail(group, progress, epoch, rank).await)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn await_signal(
        &self,
        group: &CommittedGroup,
        progress: &mut BarrierProgress,
        key: SignalKey,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let handle = group.handle();
        let mut liveness = tokio::time::interval_at(
            Instant::now() + self.liveness_interval,
            self.liveness_interval,
        );
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut strikes = 0;

        loop {
            let notified = self.mailbox.changed().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.mailbox.poll(&key) {
                Delivery::Ready => {
                    trace!(%handle, epoch = key.epoch, round = key.round, src = %key.src, "signal received");
                    return Ok(());
                }
                Delivery::Aborted { failed } => {
                    progress.failure = Some(failed);
                    warn!(%handle, %failed, "barrier aborted by a peer");
                    return Err(CollectiveError::CollectiveFailure {
                        handle,
                        rank: failed,
                    });
                }
                Delivery::Departed => {
                    return Err(self.fail(group, progress, key.epoch, key.src).await);
                }
                Delivery::Closed => return Err(TransportError::NotStarted.into()),
                Delivery::Pending => {}
            }

            if strikes >= PROBE_STRIKES {
                return Err(self.fail(group, progress, key.epoch, key.src).await);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(CollectiveError::Timeout { handle });
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = liveness.tick() => {
                    match self
                        .transport
                        .check_health(key.src, self.health_check_timeout)
                        .await
                    {
                        Err(e) if e.is_fatal() => {
                            strikes += 1;
                            debug!(%handle, peer = %key.src, strikes, "liveness probe failed: {}", e);
                        }
                        _ => strikes = 0,
                    }
                }
                _ = sleep_until(deadline) => {}
            }
        }
    }

    /// Mark the group failed and tell the other members.
    async fn fail(
        &self,
        group: &CommittedGroup,
        progress: &mut BarrierProgress,
        epoch: u64,
        failed: Rank,
    ) -> CollectiveError {
        let handle = group.handle();
        progress.failure = Some(failed);
        warn!(%handle, %failed, epoch, "peer failed during barrier, aborting group");

        let abort = ControlMessage::Abort {
            tag: group.tag(),
            epoch,
            failed,
        }
        .encode();
        for &member in group.members() {
            if member == self.local_rank || member == failed {
                continue;
            }
            if let Err(e) = self.transport.send(member, abort.clone()).await {
                debug!(%handle, %member, "abort not delivered: {}", e);
            }
        }

        CollectiveError::CollectiveFailure {
            handle,
            rank: failed,
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
