//! Scoped acquisition: a guard that gives its handle back on every exit path.

use log::error;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use crate::error::PoolError;
use crate::factory::Factory;
use crate::label::Label;
use crate::lease::{Lease, LeaseId};
use crate::pool::ResourcePool;
use crate::status::{Checkin, InvalidHandleDiscarded};

impl<F: Factory> ResourcePool<F> {
    /// Check out a handle wrapped in a guard that releases it when dropped
    pub fn checkout(self: &Arc<Self>, label: impl Into<Label>) -> Result<PooledHandle<F>, PoolError> {
        self.checkout_timeout(label, self.config().acquire_timeout)
    }

    /// Like [`checkout`](Self::checkout) with an explicit timeout
    pub fn checkout_timeout(
        self: &Arc<Self>,
        label: impl Into<Label>,
        timeout: Duration,
    ) -> Result<PooledHandle<F>, PoolError> {
        let lease = self.acquire_timeout(label, timeout)?;
        Ok(PooledHandle {
            lease: Some(lease),
            pool: Arc::clone(self),
        })
    }
}

/// A checked-out handle that returns itself to its pool.
///
/// Dropping the guard releases the handle. If the thread is panicking the
/// handle is disposed of instead, since the unit of work may have left it in
/// an unknown state. Call [`dispose`](Self::dispose) explicitly when the
/// handle is known to be broken.
pub struct PooledHandle<F: Factory> {
    /// The lease itself; `None` only after it was handed back
    lease: Option<Lease<F::Handle>>,

    /// The pool the lease came from
    pool: Arc<ResourcePool<F>>,
}

impl<F: Factory> PooledHandle<F> {
    fn lease(&self) -> &Lease<F::Handle> {
        self.lease.as_ref().expect("Lease missing")
    }

    fn take(&mut self) -> Lease<F::Handle> {
        self.lease.take().expect("Lease missing")
    }

    /// The label the handle was checked out for
    pub fn label(&self) -> &Label {
        self.lease().label()
    }

    /// The checkout identifier
    pub fn id(&self) -> LeaseId {
        self.lease().id()
    }

    /// Time since the handle was checked out
    pub fn held_duration(&self) -> Duration {
        self.lease().held_duration()
    }

    /// The pool this handle belongs to
    pub fn pool(&self) -> &Arc<ResourcePool<F>> {
        &self.pool
    }

    /// Return the handle now and report what happened to it
    pub fn release(mut self) -> Result<Checkin, PoolError> {
        let lease = self.take();
        self.pool.release(lease)
    }

    /// Return the handle tagged with a different label
    pub fn release_as(mut self, label: impl Into<Label>) -> Result<Checkin, PoolError> {
        let lease = self.take();
        self.pool.release_as(lease, label)
    }

    /// Discard the handle as broken
    pub fn dispose(mut self) -> Result<InvalidHandleDiscarded, PoolError> {
        let lease = self.take();
        self.pool.dispose(lease)
    }

    /// Detach the lease from the guard; the caller must release or dispose it
    pub fn into_lease(mut self) -> Lease<F::Handle> {
        self.take()
    }
}

impl<F: Factory> Deref for PooledHandle<F> {
    type Target = F::Handle;

    fn deref(&self) -> &F::Handle {
        self.lease().handle()
    }
}

impl<F: Factory> DerefMut for PooledHandle<F> {
    fn deref_mut(&mut self) -> &mut F::Handle {
        self.lease.as_mut().expect("Lease missing").handle_mut()
    }
}

impl<F: Factory> Drop for PooledHandle<F> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            let result = if std::thread::panicking() {
                self.pool.dispose(lease).map(|_| ())
            } else {
                self.pool.release(lease).map(|_| ())
            };

            if let Err(e) = result {
                error!(
                    "Failed to return handle to pool '{}': {}",
                    self.pool.name(),
                    e
                );
            }
        }
    }
}

impl<F: Factory> fmt::Debug for PooledHandle<F>
where
    F::Handle: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.lease {
            Some(lease) => write!(f, "PooledHandle({:?})", lease),
            None => write!(f, "PooledHandle(returned)"),
        }
    }
}
