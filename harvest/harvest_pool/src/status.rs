//! Pool statistics and check-in outcomes.

use crate::error::FactoryError;
use crate::label::Label;
use crate::lease::LeaseId;

/// Lifetime counters for a pool
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolCounters {
    /// Handles created by the factory
    pub created: u64,

    /// Handles closed by the pool (drain, eviction, failed validation)
    pub closed: u64,

    /// Handles disposed of as broken
    pub disposed: u64,

    /// Successful checkouts
    pub acquisitions: u64,

    /// Handles returned to the pool
    pub releases: u64,

    /// Acquire calls that ended in `PoolExhausted`
    pub timeouts: u64,

    /// Factory failures observed by the pool
    pub factory_failures: u64,
}

/// Point-in-time snapshot of a pool
#[derive(Debug, Clone)]
pub struct PoolStatus {
    /// Pool name
    pub name: String,

    /// Configured maximum
    pub max_size: usize,

    /// Idle handles available for checkout
    pub resident: usize,

    /// Handles currently owned by callers
    pub checked_out: usize,

    /// Handle creations in flight
    pub pending: usize,

    /// Callers blocked in acquire
    pub waiting: usize,

    /// Whether the pool has been drained
    pub shut_down: bool,

    /// Idle handles per label, sorted by label
    pub resident_by_label: Vec<(Label, usize)>,

    /// Lifetime counters
    pub counters: PoolCounters,
}

impl PoolStatus {
    /// Live handles resident, checked out or being created
    pub fn issued(&self) -> usize {
        self.resident + self.checked_out + self.pending
    }
}

/// What happened to a handle passed to `release`
#[derive(Debug)]
pub enum Checkin {
    /// The handle is resident again and available for checkout
    Pooled,

    /// The factory reported the handle invalid, so it was disposed of instead
    Discarded(InvalidHandleDiscarded),

    /// The pool was already drained, so the handle was closed
    Closed,
}

/// Whether a discarded handle was replaced
#[derive(Debug)]
pub enum Replacement {
    /// A fresh handle with the same label is resident
    Replaced,

    /// Creating the replacement failed; a later acquire will create it on demand
    Deferred(FactoryError),

    /// The pool is shut down or replenishment is disabled
    NotReplaced,
}

/// Outcome of disposing of a broken handle
#[derive(Debug)]
pub struct InvalidHandleDiscarded {
    /// The lease that was disposed of
    pub lease: LeaseId,

    /// Its label
    pub label: Label,

    /// Whether the pool compensated with a new handle
    pub replacement: Replacement,
}

impl InvalidHandleDiscarded {
    /// Whether a replacement handle is already resident
    pub fn replaced(&self) -> bool {
        matches!(self.replacement, Replacement::Replaced)
    }
}
