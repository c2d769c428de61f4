//! The capability a pool uses to create, check and close handles.

use std::fmt;
use std::sync::Arc;

use crate::error::FactoryError;
use crate::label::Label;

/// Creates live handles for one backend.
///
/// A factory holds the resolved connection configuration for its backend and
/// knows nothing about pooling. The pool never calls a factory method while
/// holding its internal lock, so implementations may block on the network.
pub trait Factory: Send + Sync + 'static {
    /// The live connection or session type produced by this factory
    type Handle: Send + 'static;

    /// Create a new handle targeting `label`.
    ///
    /// Failure must be reported as an error; there is no "empty" handle.
    fn create(&self, label: &Label) -> Result<Self::Handle, FactoryError>;

    /// Check whether a handle is still usable.
    ///
    /// Called on check-in, and on checkout when the pool validates idle
    /// handles. Implementations may exercise the handle, for example with a
    /// round trip to the server. The default trusts every handle.
    fn is_valid(&self, _handle: &mut Self::Handle) -> bool {
        true
    }

    /// Close a handle gracefully. The default just drops it.
    fn close(&self, handle: Self::Handle) {
        drop(handle);
    }
}

impl<F: Factory> Factory for Arc<F> {
    type Handle = F::Handle;

    fn create(&self, label: &Label) -> Result<Self::Handle, FactoryError> {
        (**self).create(label)
    }

    fn is_valid(&self, handle: &mut Self::Handle) -> bool {
        (**self).is_valid(handle)
    }

    fn close(&self, handle: Self::Handle) {
        (**self).close(handle)
    }
}

/// A factory backed by a closure, for handles that need no close or health logic
pub struct FnFactory<H, C> {
    create: C,
    _handle: std::marker::PhantomData<fn() -> H>,
}

impl<H, C> FnFactory<H, C>
where
    H: Send + 'static,
    C: Fn(&Label) -> Result<H, FactoryError> + Send + Sync + 'static,
{
    /// Wrap a creation closure
    pub fn new(create: C) -> Self {
        Self {
            create,
            _handle: std::marker::PhantomData,
        }
    }
}

impl<H, C> Factory for FnFactory<H, C>
where
    H: Send + 'static,
    C: Fn(&Label) -> Result<H, FactoryError> + Send + Sync + 'static,
{
    type Handle = H;

    fn create(&self, label: &Label) -> Result<H, FactoryError> {
        (self.create)(label)
    }
}

impl<H, C> fmt::Debug for FnFactory<H, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnFactory").finish_non_exhaustive()
    }
}
