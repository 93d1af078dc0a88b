//! Single-flight coordination of concurrent transfers.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
};

use tokio::sync::watch;

use crate::{Descriptor, Digest, KociError, KociResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The direction of a coordinated transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    /// Bytes moving from a registry into the local store.
    Download,

    /// Bytes moving from the local store to a registry.
    Upload,
}

/// Deduplicates concurrent transfers of the same content.
///
/// The first caller for a `(digest, direction)` key claims it and runs the
/// transfer; everyone else waits on its completion. Waiters behind a success
/// return without re-running the transfer and see none of its progress;
/// waiters behind a failure observe [`KociError::TransferFailed`]. Failed
/// transfers are not restarted here; retry is the caller's responsibility.
///
/// Cloning is cheap; clones share the tracked transfers.
#[derive(Debug, Clone, Default)]
pub struct TransferCoordinator {
    entries: Arc<Mutex<HashMap<TransferKey, TransferEntry>>>,
}

/// The outcome of claiming a key: either this caller performs the transfer,
/// or it waits on whoever got there first.
pub enum TransferClaim {
    /// This caller owns the transfer and must record its outcome.
    Performer(ClaimHandle),

    /// Another caller owns the transfer; wait for its completion.
    Waiter(WaitHandle),
}

/// The performer's handle on a claimed key. Dropping it without calling
/// [`ClaimHandle::succeed`] records a failure, so waiters are never stranded
/// behind a cancelled transfer.
pub struct ClaimHandle {
    coordinator: TransferCoordinator,
    key: TransferKey,
    finished: bool,
}

/// A waiter's handle on a claimed key.
pub struct WaitHandle {
    coordinator: TransferCoordinator,
    key: TransferKey,
    descriptor: Descriptor,
    state: Option<watch::Receiver<TransferState>>,
}

type TransferKey = (Digest, TransferDirection);

#[derive(Debug)]
struct TransferEntry {
    state: watch::Sender<TransferState>,
    refs: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferState {
    Pending,
    Succeeded,
    Failed,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TransferCoordinator {
    /// Creates a coordinator with no tracked transfers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `descriptor` in the given direction, or registers as a waiter
    /// when another caller already holds the key.
    pub fn claim(&self, descriptor: &Descriptor, direction: TransferDirection) -> TransferClaim {
        let key = (descriptor.digest().clone(), direction);
        let mut entries = self.entries.lock().expect("transfer map poisoned");
        match entries.get_mut(&key) {
            Some(entry) => {
                entry.refs += 1;
                TransferClaim::Waiter(WaitHandle {
                    coordinator: self.clone(),
                    key,
                    descriptor: descriptor.clone(),
                    state: Some(entry.state.subscribe()),
                })
            }
            None => {
                let (state, _) = watch::channel(TransferState::Pending);
                entries.insert(key.clone(), TransferEntry { state, refs: 1 });
                TransferClaim::Performer(ClaimHandle {
                    coordinator: self.clone(),
                    key,
                    finished: false,
                })
            }
        }
    }

    /// Runs `transfer` under single-flight coordination for `descriptor` in
    /// the given direction. Returns `true` when this caller performed the
    /// transfer and `false` when it piggybacked on another caller's success.
    pub async fn execute<F, Fut>(
        &self,
        descriptor: &Descriptor,
        direction: TransferDirection,
        transfer: F,
    ) -> KociResult<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = KociResult<()>>,
    {
        match self.claim(descriptor, direction) {
            TransferClaim::Performer(handle) => {
                let result = transfer().await;
                match &result {
                    Ok(()) => handle.succeed(),
                    Err(_) => handle.fail(),
                }
                result.map(|()| true)
            }
            TransferClaim::Waiter(handle) => handle.wait().await.map(|()| false),
        }
    }

    /// Returns true when no transfers are tracked.
    pub fn is_idle(&self) -> bool {
        self.entries
            .lock()
            .expect("transfer map poisoned")
            .is_empty()
    }

    fn record(&self, key: &TransferKey, state: TransferState) {
        let entries = self.entries.lock().expect("transfer map poisoned");
        if let Some(entry) = entries.get(key) {
            entry.state.send_replace(state);
        }
    }

    fn release(&self, key: &TransferKey) {
        let mut entries = self.entries.lock().expect("transfer map poisoned");
        if let Some(entry) = entries.get_mut(key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(key);
            }
        }
    }
}

impl ClaimHandle {
    /// Records a successful transfer and wakes all waiters.
    pub fn succeed(mut self) {
        self.finished = true;
        self.coordinator.record(&self.key, TransferState::Succeeded);
    }

    /// Records a failed transfer and wakes all waiters.
    pub fn fail(mut self) {
        self.finished = true;
        self.coordinator.record(&self.key, TransferState::Failed);
    }
}

impl WaitHandle {
    /// Waits for the performer's outcome.
    pub async fn wait(mut self) -> KociResult<()> {
        let mut state = self.state.take().expect("wait handle reused");
        let outcome = *state.borrow();
        let outcome = if outcome == TransferState::Pending {
            match state.wait_for(|s| *s != TransferState::Pending).await {
                Ok(outcome) => *outcome,
                // The performer vanished without recording an outcome.
                Err(_) => TransferState::Failed,
            }
        } else {
            outcome
        };

        match outcome {
            TransferState::Succeeded => Ok(()),
            _ => Err(KociError::TransferFailed(self.descriptor.clone())),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for ClaimHandle {
    fn drop(&mut self) {
        if !self.finished {
            self.coordinator.record(&self.key, TransferState::Failed);
        }
        self.coordinator.release(&self.key);
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        self.coordinator.release(&self.key);
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
