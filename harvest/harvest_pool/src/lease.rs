//! Checked-out handles.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use log::warn;
use uuid::Uuid;

use crate::label::Label;

/// Identifier of one checkout, unique within its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeaseId(pub(crate) u64);

impl LeaseId {
    /// Raw numeric value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A handle checked out of a [`ResourcePool`](crate::ResourcePool).
///
/// The lease owns the handle exclusively until it is given back with
/// `release` or `dispose`. It cannot be cloned, so the same checkout can
/// only be returned once; the pool additionally rejects leases it did not
/// issue or no longer considers outstanding.
///
/// Dropping a lease without giving it back leaks its slot: the pool keeps
/// counting it as checked out and the handle is dropped without
/// [`Factory::close`](crate::Factory::close). A warning is logged when that
/// happens. Use [`checkout`](crate::ResourcePool::checkout) for a guard that
/// returns the handle on every exit path.
pub struct Lease<H> {
    /// `None` only once the pool has taken the handle back
    handle: Option<H>,
    pub(crate) label: Label,
    pub(crate) id: LeaseId,
    pub(crate) pool: Uuid,
    pub(crate) created_at: Instant,
    pub(crate) acquired_at: Instant,
}

impl<H> Lease<H> {
    pub(crate) fn new(
        handle: H,
        label: Label,
        id: LeaseId,
        pool: Uuid,
        created_at: Instant,
    ) -> Self {
        Self {
            handle: Some(handle),
            label,
            id,
            pool,
            created_at,
            acquired_at: Instant::now(),
        }
    }

    /// Give the handle back to the pool, disarming the leak warning
    pub(crate) fn into_handle(mut self) -> H {
        self.handle.take().expect("Lease missing")
    }

    /// Get a reference to the handle
    pub fn handle(&self) -> &H {
        self.handle.as_ref().expect("Lease missing")
    }

    /// Get a mutable reference to the handle
    pub fn handle_mut(&mut self) -> &mut H {
        self.handle.as_mut().expect("Lease missing")
    }

    /// The label the handle was checked out for
    pub fn label(&self) -> &Label {
        &self.label
    }

    /// The checkout identifier
    pub fn id(&self) -> LeaseId {
        self.id
    }

    /// Time since the handle was checked out
    pub fn held_duration(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Time since the handle was created by the factory
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl<H> Deref for Lease<H> {
    type Target = H;

    fn deref(&self) -> &H {
        self.handle()
    }
}

impl<H> DerefMut for Lease<H> {
    fn deref_mut(&mut self) -> &mut H {
        self.handle_mut()
    }
}

impl<H> Drop for Lease<H> {
    fn drop(&mut self) {
        if self.handle.take().is_some() {
            warn!(
                "Lease {} for {} dropped without release or dispose; its pool slot stays checked out",
                self.id, self.label
            );
        }
    }
}

impl<H: fmt::Debug> fmt::Debug for Lease<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
