// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable, ordered, pausable pending-operation queue.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  enqueue   ┌──────────────────────────┐  lock_for_apply  ┌────────┐
//! │  Producers   │───────────►│ RwLock<PendingList>      │◄─────────────────│ Worker │
//! │ (listeners)  │            │  [op0, op1, ... opN]     │                  └────────┘
//! └──────────────┘            │  mark: Option<usize>     │                       ▲
//!                             └──────────────────────────┘                       │
//!                                        │ request_stop                 watch<QueueState>
//!                                        ▼                                + Notify
//!                                 snapshot file
//! ```
//!
//! One read/write lock guards the list. Readers take the read side, mutators
//! the write side, and the worker holds the write side for a whole apply
//! attempt (peek, apply, pop or retain).
//!
//! Synchronous producers ([`enqueue_sync`](PendingQueue::enqueue_sync)) never
//! wait for that lock. When it is held they append to a small staging FIFO,
//! which every write-side holder moves onto the tail of the list before
//! touching it, so arrival order is kept.
//!
//! # State Machine
//!
//! ```text
//! Running ⇄ Paused      pause() / resume()
//! Running | Paused → Stopped   request_stop() (terminal, writes snapshot)
//! ```
//!
//! After `Stopped`, [`enqueue`](PendingQueue::enqueue),
//! [`pause`](PendingQueue::pause) and [`resume`](PendingQueue::resume) fail
//! with `InvalidState`. Pausing only idles the worker: producers keep
//! enqueuing.
//!
//! # Mark and Rollback
//!
//! [`mark`](PendingQueue::mark) records the current size;
//! [`rollback_to_marked_position`](PendingQueue::rollback_to_marked_position)
//! drops everything queued after it and clears the mark. Operations the
//! worker pops from the head shift the mark down with them, so a rollback
//! only ever removes operations queued after the mark was taken.

use crate::catalog::Catalog;
use crate::entity::EntityRef;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::operation::{Operation, OperationKind};
use crate::snapshot::SnapshotFile;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::futures::Notified;
use tokio::sync::{watch, Notify, RwLock, RwLockWriteGuard};
use tracing::{debug, info};

/// Queue lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Worker applies operations.
    Running,
    /// Worker idles; producers may still enqueue.
    Paused,
    /// Terminal. Snapshot written, nothing accepted.
    Stopped,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Running => "Running",
            QueueState::Paused => "Paused",
            QueueState::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The list behind the lock.
#[derive(Debug, Default)]
pub(crate) struct PendingList {
    ops: VecDeque<Operation>,
    mark: Option<usize>,
}

impl PendingList {
    fn from_operations(ops: Vec<Operation>) -> Self {
        Self {
            ops: ops.into(),
            mark: None,
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn head(&self) -> Option<&Operation> {
        self.ops.front()
    }

    /// Remove the head, shifting the mark with it.
    pub(crate) fn pop_head(&mut self) -> Option<Operation> {
        let popped = self.ops.pop_front()?;
        if let Some(mark) = self.mark.as_mut() {
            *mark = mark.saturating_sub(1);
        }
        Some(popped)
    }

    fn rollback(&mut self) -> usize {
        match self.mark.take() {
            Some(mark) if mark < self.ops.len() => {
                let dropped = self.ops.len() - mark;
                self.ops.truncate(mark);
                dropped
            }
            _ => 0,
        }
    }
}

/// Shared pending-operation queue.
pub struct PendingQueue {
    list: RwLock<PendingList>,
    /// Sync producers' operations waiting for the list lock. Lock order: list, then staged.
    staged: Mutex<VecDeque<Operation>>,
    state_tx: watch::Sender<QueueState>,
    wake: Notify,
    snapshot: Option<SnapshotFile>,
    discard: bool,
}

impl PendingQueue {
    /// Queue without durability. Nothing is written on stop.
    pub fn in_memory() -> Self {
        Self::with_operations(Vec::new(), None)
    }

    /// Queue that accepts every operation and keeps none.
    ///
    /// For deployments that run without a slave: listeners stay wired but
    /// nothing is ever replicated.
    pub fn no_op() -> Self {
        Self {
            discard: true,
            ..Self::in_memory()
        }
    }

    /// Whether this queue discards everything it is given.
    pub fn is_no_op(&self) -> bool {
        self.discard
    }

    /// Queue backed by a snapshot file, restored from it when readable.
    ///
    /// A missing or unreadable snapshot yields an empty queue.
    pub async fn open(snapshot: SnapshotFile, catalog: &dyn Catalog) -> Self {
        let operations = snapshot.load_or_empty(catalog).await;
        Self::with_operations(operations, Some(snapshot))
    }

    /// Queue pre-filled with `operations`, in order.
    pub fn with_operations(operations: Vec<Operation>, snapshot: Option<SnapshotFile>) -> Self {
        let (state_tx, _) = watch::channel(QueueState::Running);
        metrics::set_queue_depth(operations.len());
        metrics::set_queue_state(QueueState::Running.as_str());
        Self {
            list: RwLock::new(PendingList::from_operations(operations)),
            staged: Mutex::new(VecDeque::new()),
            state_tx,
            wake: Notify::new(),
            snapshot,
            discard: false,
        }
    }

    // =========================================================================
    // State
    // =========================================================================

    pub fn state(&self) -> QueueState {
        *self.state_tx.borrow()
    }

    pub fn is_paused(&self) -> bool {
        self.state() == QueueState::Paused
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == QueueState::Stopped
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<QueueState> {
        self.state_tx.subscribe()
    }

    /// Stop the worker from applying operations.
    ///
    /// Returns `Ok(false)` if already paused.
    pub fn pause(&self) -> Result<bool> {
        self.transition("Running or Paused", QueueState::Running, QueueState::Paused)
    }

    /// Let the worker continue.
    ///
    /// Returns `Ok(false)` if not paused.
    pub fn resume(&self) -> Result<bool> {
        self.transition("Running or Paused", QueueState::Paused, QueueState::Running)
    }

    fn transition(&self, expected: &'static str, from: QueueState, to: QueueState) -> Result<bool> {
        let mut outcome = Ok(false);
        self.state_tx.send_if_modified(|state| {
            if *state == QueueState::Stopped {
                outcome = Err(ReplicationError::invalid_state(expected, *state));
                false
            } else if *state == from {
                *state = to;
                outcome = Ok(true);
                true
            } else {
                false
            }
        });
        if let Ok(true) = outcome {
            debug!(state = %to, "Queue state changed");
            metrics::set_queue_state(to.as_str());
        }
        outcome
    }

    /// Stop the queue for good and write the snapshot.
    ///
    /// Waits for an in-flight apply to finish but does not interrupt it.
    /// Returns `true` for the call that performed the stop; later calls are
    /// no-ops returning `false`. A failed snapshot write is logged, not
    /// returned.
    pub async fn request_stop(&self) -> bool {
        let mut first = false;
        self.state_tx.send_if_modified(|state| {
            if *state == QueueState::Stopped {
                false
            } else {
                *state = QueueState::Stopped;
                first = true;
                true
            }
        });
        if !first {
            return false;
        }
        metrics::set_queue_state(QueueState::Stopped.as_str());
        self.wake.notify_one();

        // Stopped is already published, so nothing can be staged after this drain
        let remaining: Vec<Operation> = {
            let mut list = self.list.write().await;
            self.absorb_staged(&mut list);
            list.ops.iter().cloned().collect()
        };
        info!(pending = remaining.len(), "Queue stopped");
        if let Some(snapshot) = &self.snapshot {
            // Logged inside; never fatal
            let _ = snapshot.save(&remaining).await;
        }
        true
    }

    fn ensure_accepting(&self) -> Result<()> {
        match self.state() {
            QueueState::Stopped => Err(ReplicationError::invalid_state(
                "Running or Paused",
                QueueState::Stopped,
            )),
            _ => Ok(()),
        }
    }

    // =========================================================================
    // Producers
    // =========================================================================

    /// Append an operation at the tail.
    pub async fn enqueue(&self, kind: OperationKind, entity: EntityRef) -> Result<()> {
        if self.discard {
            return self.discard_operation(kind, &entity);
        }
        let mut list = self.list.write().await;
        self.absorb_staged(&mut list);
        self.push(&mut list, kind, entity)
    }

    /// Append from synchronous code without waiting.
    ///
    /// Works on any thread, including inside a current-thread runtime. If the
    /// list lock is busy (the worker mid-apply, a reader) the operation is
    /// staged and joins the list, in order, at the next write-side access.
    pub fn enqueue_sync(&self, kind: OperationKind, entity: EntityRef) -> Result<()> {
        if self.discard {
            return self.discard_operation(kind, &entity);
        }
        if let Ok(mut list) = self.list.try_write() {
            self.absorb_staged(&mut list);
            return self.push(&mut list, kind, entity);
        }

        let mut staged = self.staged.lock();
        // Checked under the staging lock; request_stop drains it after publishing Stopped
        self.ensure_accepting()?;
        let operation = Operation::new(kind, entity);
        debug!(kind = %kind, entity = ?operation.entity(), "Operation staged");
        staged.push_back(operation);
        metrics::record_operation_enqueued(kind.as_str());
        drop(staged);
        self.wake.notify_one();
        Ok(())
    }

    fn push(&self, list: &mut PendingList, kind: OperationKind, entity: EntityRef) -> Result<()> {
        // Checked under the write lock so request_stop's snapshot sees every accepted op
        self.ensure_accepting()?;
        let operation = Operation::new(kind, entity);
        debug!(kind = %kind, entity = ?operation.entity(), "Operation enqueued");
        list.ops.push_back(operation);
        metrics::record_operation_enqueued(kind.as_str());
        metrics::set_queue_depth(list.len());
        self.wake.notify_one();
        Ok(())
    }

    fn discard_operation(&self, kind: OperationKind, entity: &EntityRef) -> Result<()> {
        self.ensure_accepting()?;
        debug!(kind = %kind, entity = ?entity, "No-op queue, operation discarded");
        Ok(())
    }

    /// Move staged operations onto the tail. Caller holds the write lock.
    fn absorb_staged(&self, list: &mut PendingList) {
        let mut staged = self.staged.lock();
        if staged.is_empty() {
            return;
        }
        list.ops.extend(staged.drain(..));
        metrics::set_queue_depth(list.len());
    }

    // =========================================================================
    // Readers
    // =========================================================================

    pub async fn size(&self) -> usize {
        let list = self.list.read().await;
        list.len() + self.staged.lock().len()
    }

    pub async fn is_empty(&self) -> bool {
        self.size().await == 0
    }

    /// Oldest pending operation, without removing it.
    pub async fn peek_head(&self) -> Option<Operation> {
        let list = self.list.read().await;
        match list.head() {
            Some(head) => Some(head.clone()),
            None => self.staged.lock().front().cloned(),
        }
    }

    /// Every pending operation, oldest first.
    pub async fn pending(&self) -> Vec<Operation> {
        let list = self.list.read().await;
        let staged = self.staged.lock();
        list.ops.iter().chain(staged.iter()).cloned().collect()
    }

    // =========================================================================
    // Mark / rollback
    // =========================================================================

    /// Record the current size as the rollback point, replacing any previous mark.
    pub async fn mark(&self) -> usize {
        let mut list = self.list.write().await;
        self.absorb_staged(&mut list);
        let position = list.len();
        list.mark = Some(position);
        debug!(position, "Queue marked");
        position
    }

    pub async fn get_mark(&self) -> Option<usize> {
        self.list.read().await.mark
    }

    pub async fn is_marked(&self) -> bool {
        self.list.read().await.mark.is_some()
    }

    pub async fn unmark(&self) {
        self.list.write().await.mark = None;
    }

    /// Drop everything queued after the mark, then clear it.
    ///
    /// Returns the number of operations dropped; 0 when unmarked.
    pub async fn rollback_to_marked_position(&self) -> usize {
        let mut list = self.list.write().await;
        self.absorb_staged(&mut list);
        let dropped = list.rollback();
        if dropped > 0 {
            info!(dropped, remaining = list.len(), "Rolled back to marked position");
            metrics::record_operations_rolled_back(dropped);
            metrics::set_queue_depth(list.len());
        }
        dropped
    }

    // =========================================================================
    // Worker access
    // =========================================================================

    /// Exclusive access for one apply attempt.
    pub(crate) async fn lock_for_apply(&self) -> RwLockWriteGuard<'_, PendingList> {
        let mut list = self.list.write().await;
        self.absorb_staged(&mut list);
        list
    }

    /// Fires after an enqueue or stop.
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.wake.notified()
    }
}

impl fmt::Debug for PendingQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingQueue")
            .field("state", &self.state())
            .field("snapshot", &self.snapshot.as_ref().map(|s| s.path().to_path_buf()))
            .field("no_op", &self.discard)
            .finish_non_exhaustive()
    }
}
