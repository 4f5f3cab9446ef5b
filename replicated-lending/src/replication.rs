//! Primary/secondary coordination with asynchronous replication and one-way
//! failover.
//!
//! The coordinator presents one logical store backed by two
//! [`StorageEngine`]s:
//!
//! - **While the primary is active**, writes are applied synchronously on the
//!   primary and the same logical effect is handed to a single-threaded
//!   replication lane that replays it on the secondary. The caller never waits
//!   for the lane and never sees its errors.
//! - **After failover**, every operation goes straight to the secondary.
//!
//! Failover is irreversible. Anything the primary accepted that the lane had
//! not yet replayed, and that the best-effort resync could not rescue, is
//! lost: replication is eventually consistent, not strongly consistent.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::command::ReplicatedWrite;
use crate::error::StoreError;
use crate::model::Loan;
use crate::store::StorageEngine;

/// Which replica is serving traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplicaState {
    ActivePrimary,
    FailoverInProgress,
    ActiveSecondary,
}

impl ReplicaState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ReplicaState::ActivePrimary,
            1 => ReplicaState::FailoverInProgress,
            _ => ReplicaState::ActiveSecondary,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ReplicaState::ActivePrimary => 0,
            ReplicaState::FailoverInProgress => 1,
            ReplicaState::ActiveSecondary => 2,
        }
    }
}

/// Result of a [`ReplicationCoordinator::trigger_failover`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverOutcome {
    /// False when an earlier call already failed over.
    pub performed: bool,
    pub resynced: bool,
}

/// Counters kept by the replication lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplicationStats {
    pub replayed: u64,
    /// Replays the secondary rejected (already applied, unknown loan...).
    pub skipped: u64,
    pub failed: u64,
    /// Replays discarded because failover happened first.
    pub dropped: u64,
}

#[derive(Default)]
struct LaneCounters {
    replayed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl LaneCounters {
    fn snapshot(&self) -> ReplicationStats {
        ReplicationStats {
            replayed: self.replayed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

enum LaneMessage {
    Replay(ReplicatedWrite),
    /// Answered once every earlier message has been handled.
    Barrier(Sender<()>),
    Shutdown,
}

/// Routes reads and writes to whichever engine is active and keeps the
/// secondary close to the primary.
///
/// Writes are applied synchronously to the primary while it is active and
/// then handed to the replication lane, a dedicated OS thread that replays
/// them on the secondary. After [`trigger_failover`](Self::trigger_failover)
/// every call goes to the secondary, for good.
///
/// # Why a lane thread instead of writing both engines inline?
///
/// - **Callers never wait on the secondary**: a slow or dead secondary cannot
///   hold up a grant
/// - **Replays keep primary order**: one thread drains one channel
/// - **Errors stay local**: a failed replay is logged and counted, never
///   returned to the client whose write already committed
pub struct ReplicationCoordinator {
    primary: Arc<StorageEngine>,
    secondary: Arc<StorageEngine>,
    phase: Arc<AtomicU8>,
    failover_lock: Mutex<()>,
    /// Held by the lane around each replay and by failover while leaving
    /// `ActivePrimary`, so no replay lands after the resync copy.
    lane_gate: Arc<Mutex<()>>,
    lane_tx: Sender<LaneMessage>,
    lane_handle: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<LaneCounters>,
}

impl ReplicationCoordinator {
    /// Wraps two engines and starts the replication lane thread.
    pub fn new(primary: Arc<StorageEngine>, secondary: Arc<StorageEngine>) -> Result<Self> {
        let phase = Arc::new(AtomicU8::new(ReplicaState::ActivePrimary.as_u8()));
        let counters = Arc::new(LaneCounters::default());
        let lane_gate = Arc::new(Mutex::new(()));
        let (lane_tx, lane_rx) = unbounded();

        let lane = ReplicationLane {
            secondary: Arc::clone(&secondary),
            phase: Arc::clone(&phase),
            gate: Arc::clone(&lane_gate),
            counters: Arc::clone(&counters),
            rx: lane_rx,
        };
        let handle = thread::Builder::new()
            .name(format!("replication-lane-{}", secondary.name()))
            .spawn(move || lane.run())
            .context("failed to spawn replication lane")?;

        Ok(Self {
            primary,
            secondary,
            phase,
            failover_lock: Mutex::new(()),
            lane_gate,
            lane_tx,
            lane_handle: Mutex::new(Some(handle)),
            counters,
        })
    }

    /// The engine that takes writes until failover.
    pub fn primary(&self) -> &Arc<StorageEngine> {
        &self.primary
    }

    /// The replay target, and the only engine used after failover.
    pub fn secondary(&self) -> &Arc<StorageEngine> {
        &self.secondary
    }

    /// Current failover phase.
    pub fn state(&self) -> ReplicaState {
        ReplicaState::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Lock-free read used on every fast path. A racing failover can route at
    /// most one extra operation to the old side.
    pub fn primary_active(&self) -> bool {
        self.state() != ReplicaState::ActiveSecondary
    }

    fn active(&self) -> &StorageEngine {
        if self.primary_active() {
            &self.primary
        } else {
            &self.secondary
        }
    }

    /// Counters of the replication lane since start.
    pub fn replication_stats(&self) -> ReplicationStats {
        self.counters.snapshot()
    }

    pub fn check_availability(&self, book_code: &str) -> Result<bool, StoreError> {
        self.active().check_availability(book_code)
    }

    pub fn grant_loan(
        &self,
        user_id: &str,
        book_code: &str,
        start_date: &str,
        end_date: &str,
    ) -> Result<Option<Loan>, StoreError> {
        if !self.primary_active() {
            return self
                .secondary
                .grant_loan(user_id, book_code, start_date, end_date);
        }
        let loan = self
            .primary
            .grant_loan(user_id, book_code, start_date, end_date)?;
        if let Some(loan) = &loan {
            self.replicate(ReplicatedWrite::Grant { loan: loan.clone() });
        }
        Ok(loan)
    }

    pub fn register_return(&self, loan_id: &str) -> Result<bool, StoreError> {
        if !self.primary_active() {
            return self.secondary.register_return(loan_id);
        }
        let returned = self.primary.register_return(loan_id)?;
        if returned {
            self.replicate(ReplicatedWrite::Return {
                loan_id: loan_id.to_string(),
            });
        }
        Ok(returned)
    }

    pub fn register_renewal(&self, loan_id: &str, new_end_date: &str) -> Result<bool, StoreError> {
        if !self.primary_active() {
            return self.secondary.register_renewal(loan_id, new_end_date);
        }
        let renewed = self.primary.register_renewal(loan_id, new_end_date)?;
        if renewed {
            self.replicate(ReplicatedWrite::Renewal {
                loan_id: loan_id.to_string(),
                new_end_date: new_end_date.to_string(),
            });
        }
        Ok(renewed)
    }

    fn replicate(&self, write: ReplicatedWrite) {
        let kind = write.kind();
        if self.lane_tx.send(LaneMessage::Replay(write)).is_err() {
            warn!(kind, "replication lane is gone, write not replicated");
        }
    }

    /// Blocks until every replay submitted so far has been applied or
    /// dropped by the lane.
    pub fn flush_replication(&self) -> Result<()> {
        let (done_tx, done_rx) = bounded(1);
        self.lane_tx
            .send(LaneMessage::Barrier(done_tx))
            .context("failed to send replication barrier")?;
        done_rx.recv().context("replication lane closed before barrier")
    }

    /// Copies the primary's data onto the secondary while the primary is
    /// still the active side. Used at start-up.
    pub fn resync_secondary(&self) -> Result<(), StoreError> {
        let _guard = self
            .failover_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !self.primary_active() {
            debug!("secondary already active, skipping start-up resync");
            return Ok(());
        }
        self.secondary.resync_from(&self.primary)
    }

    /// Switches the active role to the secondary, for good.
    ///
    /// Safe to call from any number of callers that saw the primary fail:
    /// the first one resyncs (best effort) and flips the state, later ones
    /// return with `performed == false`.
    pub fn trigger_failover(&self) -> FailoverOutcome {
        let _guard = self
            .failover_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.state() == ReplicaState::ActiveSecondary {
            return FailoverOutcome {
                performed: false,
                resynced: false,
            };
        }

        warn!(
            primary = %self.primary.name(),
            secondary = %self.secondary.name(),
            "failing over to secondary"
        );
        {
            let _gate = self.lane_gate.lock().unwrap_or_else(PoisonError::into_inner);
            self.phase
                .store(ReplicaState::FailoverInProgress.as_u8(), Ordering::Release);
        }

        let resynced = match self.secondary.resync_from(&self.primary) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "resync before failover failed, proceeding anyway");
                false
            }
        };

        self.phase
            .store(ReplicaState::ActiveSecondary.as_u8(), Ordering::Release);
        info!(resynced, "failover complete, secondary is now active");
        FailoverOutcome {
            performed: true,
            resynced,
        }
    }
}

impl Drop for ReplicationCoordinator {
    fn drop(&mut self) {
        let _ = self.lane_tx.send(LaneMessage::Shutdown);
        let handle = self
            .lane_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("replication lane panicked");
            }
        }
    }
}

/// The single consumer that replays primary writes on the secondary.
struct ReplicationLane {
    secondary: Arc<StorageEngine>,
    phase: Arc<AtomicU8>,
    gate: Arc<Mutex<()>>,
    counters: Arc<LaneCounters>,
    rx: Receiver<LaneMessage>,
}

impl ReplicationLane {
    fn run(self) {
        for message in self.rx.iter() {
            match message {
                LaneMessage::Replay(write) => self.replay(write),
                LaneMessage::Barrier(done) => {
                    let _ = done.send(());
                }
                LaneMessage::Shutdown => break,
            }
        }
        debug!(secondary = %self.secondary.name(), "replication lane stopped");
    }

    fn replay(&self, write: ReplicatedWrite) {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        // Once failover starts the secondary is rebuilt from the primary's
        // files; replaying on top of that would apply writes twice.
        if ReplicaState::from_u8(self.phase.load(Ordering::Acquire)) != ReplicaState::ActivePrimary {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(kind = write.kind(), loan_id = write.loan_id(), "dropping replay after failover");
            return;
        }

        match self.secondary.apply_replicated(&write) {
            Ok(true) => {
                self.counters.replayed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(kind = write.kind(), loan_id = write.loan_id(), "secondary skipped replay");
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    kind = write.kind(),
                    loan_id = write.loan_id(),
                    error = %err,
                    "replication to secondary failed"
                );
            }
        }
    }
}
