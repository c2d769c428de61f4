//! The bounded, label-aware pool engine.
//!
//! Idle handles live in one FIFO queue per label. All bookkeeping sits behind
//! a single mutex that is held only while the queues and counters change; the
//! blocking wait and every factory call happen with the lock released.

use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::error::{FactoryError, PoolError};
use crate::factory::Factory;
use crate::label::Label;
use crate::lease::{Lease, LeaseId};
use crate::status::{Checkin, InvalidHandleDiscarded, PoolCounters, PoolStatus, Replacement};

/// Upper bound for deadlines computed from very large timeouts
const MAX_WAIT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// An idle handle resident in the pool
struct Slot<H> {
    handle: H,
    created_at: Instant,
}

impl<H> Slot<H> {
    fn new(handle: H) -> Self {
        Self {
            handle,
            created_at: Instant::now(),
        }
    }
}

/// Shared bookkeeping, guarded by the pool mutex
struct PoolState<H> {
    /// Idle handles by label
    idle: HashMap<Label, VecDeque<Slot<H>>>,

    /// Number of idle handles across all labels
    resident: usize,

    /// Leases currently owned by callers
    outstanding: HashSet<LeaseId>,

    /// Creation slots reserved while the factory runs
    pending: usize,

    /// Blocked callers by label
    waiting: HashMap<Label, usize>,

    /// Wake-up signal per label
    signals: HashMap<Label, Arc<Condvar>>,

    /// Last issued lease number
    next_lease: u64,

    /// Set by `drain`
    shut_down: bool,

    counters: PoolCounters,
}

impl<H> PoolState<H> {
    fn new() -> Self {
        Self {
            idle: HashMap::new(),
            resident: 0,
            outstanding: HashSet::new(),
            pending: 0,
            waiting: HashMap::new(),
            signals: HashMap::new(),
            next_lease: 0,
            shut_down: false,
            counters: PoolCounters::default(),
        }
    }

    fn issued(&self) -> usize {
        self.resident + self.outstanding.len() + self.pending
    }

    fn pop_idle(&mut self, label: &Label) -> Option<Slot<H>> {
        let queue = self.idle.get_mut(label)?;
        let slot = queue.pop_front()?;
        if queue.is_empty() {
            self.idle.remove(label);
        }
        self.resident -= 1;
        Some(slot)
    }

    /// Remove the oldest idle handle of any label
    fn pop_oldest_idle(&mut self) -> Option<(Label, Slot<H>)> {
        let label = self
            .idle
            .iter()
            .filter_map(|(label, queue)| queue.front().map(|slot| (label, slot.created_at)))
            .min_by_key(|(_, created_at)| *created_at)
            .map(|(label, _)| label.clone())?;
        let slot = self.pop_idle(&label)?;
        Some((label, slot))
    }

    fn push_idle(&mut self, label: Label, slot: Slot<H>) {
        self.idle.entry(label).or_default().push_back(slot);
        self.resident += 1;
    }

    fn issue_lease(&mut self) -> LeaseId {
        self.next_lease += 1;
        let id = LeaseId(self.next_lease);
        self.outstanding.insert(id);
        id
    }

    fn signal(&mut self, label: &Label) -> Arc<Condvar> {
        Arc::clone(
            self.signals
                .entry(label.clone())
                .or_insert_with(|| Arc::new(Condvar::new())),
        )
    }

    /// Withdraw one waiter; the label's signal goes away with its last waiter
    fn stop_waiting(&mut self, label: &Label) {
        if let Some(count) = self.waiting.get_mut(label) {
            *count -= 1;
            if *count == 0 {
                self.waiting.remove(label);
                self.signals.remove(label);
            }
        }
    }

    /// Wake one caller waiting for `label`; returns whether anyone was waiting
    fn notify_label(&self, label: &Label) -> bool {
        if self.waiting.get(label).copied().unwrap_or(0) == 0 {
            return false;
        }
        match self.signals.get(label) {
            Some(signal) => {
                signal.notify_one();
                true
            }
            None => false,
        }
    }

    /// Wake one caller waiting for any label, used when capacity frees up
    fn notify_any(&self) {
        let label = self
            .waiting
            .iter()
            .find(|(_, count)| **count > 0)
            .map(|(label, _)| label);
        if let Some(signal) = label.and_then(|label| self.signals.get(label)) {
            signal.notify_one();
        }
    }

    fn notify_all(&self) {
        for signal in self.signals.values() {
            signal.notify_all();
        }
    }
}

/// What `acquire` decided while holding the lock
enum Step<H> {
    /// Hand out an idle handle under the given lease
    Idle { slot: Slot<H>, lease: LeaseId },

    /// A creation slot was reserved; optionally close an evicted idle handle first
    Create { evicted: Option<(Label, Slot<H>)> },
}

/// A bounded pool of handles produced by a [`Factory`].
///
/// Callers check handles out by label, use them exclusively, and give them
/// back with [`release`](Self::release) when healthy or
/// [`dispose`](Self::dispose) when broken. The number of live handles
/// (resident, checked out, or being created) never exceeds `max_size`.
pub struct ResourcePool<F: Factory> {
    /// Identity used to reject leases from other pools
    id: Uuid,

    /// Creates, checks and closes handles
    factory: F,

    /// Configuration for this pool
    config: PoolConfig,

    /// Bookkeeping shared by all callers
    state: Mutex<PoolState<F::Handle>>,
}

impl<F: Factory> ResourcePool<F> {
    /// Create an empty pool bound to `factory` holding at most `max_size` handles.
    ///
    /// No handle is created here; call [`warm`](Self::warm) to pre-fill.
    pub fn new(factory: F, max_size: usize) -> Result<Self, PoolError> {
        let config = PoolConfig {
            max_size,
            ..PoolConfig::default()
        };
        Self::with_config(factory, config)
    }

    /// Create an empty pool with full configuration
    pub fn with_config(factory: F, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        debug!(
            "Created resource pool '{}' (max_size={}, acquire_timeout={:?})",
            config.name, config.max_size, config.acquire_timeout
        );

        Ok(Self {
            id: Uuid::new_v4(),
            factory,
            config,
            state: Mutex::new(PoolState::new()),
        })
    }

    /// Pool name from the configuration
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Configured maximum number of live handles
    pub fn max_size(&self) -> usize {
        self.config.max_size
    }

    /// The configuration this pool was built with
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The factory this pool creates handles with
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Number of idle handles resident in the pool
    pub fn size(&self) -> usize {
        self.state.lock().resident
    }

    /// Number of live handles: resident, checked out, or being created
    pub fn issued(&self) -> usize {
        self.state.lock().issued()
    }

    /// Whether [`drain`](Self::drain) has been called
    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    /// Pre-fill the pool until it holds `max_size` handles, cycling through `labels`.
    ///
    /// An empty label sequence fills the pool with unlabeled handles.
    /// Transient factory failures are retried according to the retry policy;
    /// fatal ones abort immediately. Handles created before a failure stay
    /// resident. Returns the number of handles created.
    pub fn warm<I, L>(&self, labels: I) -> Result<usize, PoolError>
    where
        I: IntoIterator<Item = L>,
        L: Into<Label>,
    {
        let mut labels: Vec<Label> = labels.into_iter().map(Into::into).collect();
        if labels.is_empty() {
            labels.push(Label::unlabeled());
        }

        info!(
            "Warming pool '{}' to {} handles across {} label(s)",
            self.config.name,
            self.config.max_size,
            labels.len()
        );

        let mut created = 0;
        for label in labels.iter().cycle() {
            {
                let mut state = self.state.lock();
                if state.shut_down {
                    return Err(PoolError::PoolShutdown);
                }
                if state.issued() >= self.config.max_size {
                    break;
                }
                state.pending += 1;
            }

            match self.create_with_retry(label) {
                Ok(handle) => {
                    if let Some(handle) = self.admit(label, handle) {
                        self.factory.close(handle);
                        return Err(PoolError::PoolShutdown);
                    }
                    created += 1;
                }
                Err(e) => {
                    self.abandon_creation();
                    warn!(
                        "Warming pool '{}' failed after {} handle(s): {}",
                        self.config.name, created, e
                    );
                    return Err(PoolError::Factory(e));
                }
            }
        }

        info!(
            "Pool '{}' warmed: created {} handle(s)",
            self.config.name, created
        );
        Ok(created)
    }

    /// Acquire a handle for `label`, waiting up to the configured timeout
    pub fn acquire(&self, label: impl Into<Label>) -> Result<Lease<F::Handle>, PoolError> {
        self.acquire_timeout(label, self.config.acquire_timeout)
    }

    /// Acquire a handle for `label` without waiting
    pub fn try_acquire(&self, label: impl Into<Label>) -> Result<Lease<F::Handle>, PoolError> {
        self.acquire_timeout(label, Duration::ZERO)
    }

    /// Acquire a handle for `label`, waiting at most `timeout`.
    ///
    /// An idle handle with a matching label is preferred. Otherwise a new one
    /// is created while the pool is below `max_size`; creation failure is
    /// returned to the caller. A caller whose wait times out never receives a
    /// handle afterwards.
    pub fn acquire_timeout(
        &self,
        label: impl Into<Label>,
        timeout: Duration,
    ) -> Result<Lease<F::Handle>, PoolError> {
        let label = label.into();
        let started = Instant::now();
        let deadline = started
            .checked_add(timeout.min(MAX_WAIT))
            .unwrap_or(started);

        loop {
            let step = {
                let mut state = self.state.lock();
                self.next_step(&mut state, &label, started, deadline)
            };

            match step {
                Ok(Step::Idle { mut slot, lease }) => {
                    if self.config.validate_on_acquire && !self.factory.is_valid(&mut slot.handle) {
                        debug!(
                            "Pool '{}': idle handle for {} failed validation, closing it",
                            self.config.name, label
                        );
                        self.factory.close(slot.handle);
                        let mut state = self.state.lock();
                        state.outstanding.remove(&lease);
                        state.counters.closed += 1;
                        continue;
                    }

                    self.state.lock().counters.acquisitions += 1;
                    trace!(
                        "Pool '{}': checked out lease {} for {}",
                        self.config.name,
                        lease,
                        label
                    );
                    return Ok(Lease::new(slot.handle, label, lease, self.id, slot.created_at));
                }
                Ok(Step::Create { evicted }) => {
                    if let Some((evicted_label, slot)) = evicted {
                        debug!(
                            "Pool '{}': closing idle handle for {} to serve {}",
                            self.config.name, evicted_label, label
                        );
                        self.factory.close(slot.handle);
                    }
                    return self.create_for_caller(label);
                }
                Err(e) => {
                    if let PoolError::PoolExhausted { waited, .. } = &e {
                        warn!(
                            "Pool '{}': no handle for {} after {:?}",
                            self.config.name, label, waited
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Return a healthy handle to the pool under its original label
    pub fn release(&self, lease: Lease<F::Handle>) -> Result<Checkin, PoolError> {
        let label = lease.label.clone();
        self.release_as(lease, label)
    }

    /// Return a healthy handle to the pool tagged with `label`.
    ///
    /// A handle the factory considers invalid is disposed of instead. After
    /// [`drain`](Self::drain) the handle is closed rather than pooled.
    pub fn release_as(
        &self,
        mut lease: Lease<F::Handle>,
        label: impl Into<Label>,
    ) -> Result<Checkin, PoolError> {
        let label = label.into();
        self.ensure_outstanding(&lease)?;

        if !self.factory.is_valid(lease.handle_mut()) {
            debug!(
                "Pool '{}': lease {} returned an invalid handle",
                self.config.name, lease.id
            );
            return self.dispose(lease).map(Checkin::Discarded);
        }

        let id = lease.id;
        let created_at = lease.created_at;
        let handle = lease.into_handle();

        let mut state = self.state.lock();
        if !state.outstanding.remove(&id) {
            drop(state);
            return Err(self.double_release(id));
        }

        if state.shut_down {
            state.counters.closed += 1;
            drop(state);
            debug!(
                "Pool '{}' is shut down, closing handle from lease {}",
                self.config.name, id
            );
            self.factory.close(handle);
            return Ok(Checkin::Closed);
        }

        state.counters.releases += 1;
        state.push_idle(label.clone(), Slot { handle, created_at });
        if !state.notify_label(&label) && self.config.rebalance_idle {
            state.notify_any();
        }
        drop(state);

        trace!(
            "Pool '{}': lease {} released as {}",
            self.config.name,
            id,
            label
        );
        Ok(Checkin::Pooled)
    }

    /// Discard a broken handle instead of returning it.
    ///
    /// The handle is closed and never handed out again. When
    /// `replenish_on_dispose` is set the pool creates a replacement for the
    /// same label right away; if that fails, the freed slot is filled by a
    /// later acquire.
    pub fn dispose(&self, lease: Lease<F::Handle>) -> Result<InvalidHandleDiscarded, PoolError> {
        if lease.pool != self.id {
            return Err(self.double_release(lease.id));
        }

        let id = lease.id;
        let label = lease.label.clone();
        let handle = lease.into_handle();

        let replenish = {
            let mut state = self.state.lock();
            if !state.outstanding.remove(&id) {
                drop(state);
                return Err(self.double_release(id));
            }
            state.counters.disposed += 1;

            let replenish = self.config.replenish_on_dispose && !state.shut_down;
            if replenish {
                state.pending += 1;
            } else {
                state.notify_any();
            }
            replenish
        };

        self.factory.close(handle);
        warn!(
            "Pool '{}': discarded invalid handle from lease {} ({})",
            self.config.name, id, label
        );

        let replacement = if !replenish {
            Replacement::NotReplaced
        } else {
            match self.factory.create(&label) {
                Ok(handle) => match self.admit(&label, handle) {
                    None => Replacement::Replaced,
                    Some(handle) => {
                        self.factory.close(handle);
                        Replacement::NotReplaced
                    }
                },
                Err(e) => {
                    self.abandon_creation();
                    warn!(
                        "Pool '{}': replacement for {} deferred: {}",
                        self.config.name, label, e
                    );
                    Replacement::Deferred(e)
                }
            }
        };

        Ok(InvalidHandleDiscarded {
            lease: id,
            label,
            replacement,
        })
    }

    /// Close every resident handle and shut the pool down.
    ///
    /// Blocked callers wake up with `PoolShutdown`. Checked-out handles are
    /// not touched; releasing them later closes them. Returns the number of
    /// handles closed, so a second call returns 0.
    pub fn drain(&self) -> usize {
        let (slots, was_shut_down, checked_out) = {
            let mut state = self.state.lock();
            let was_shut_down = state.shut_down;
            state.shut_down = true;

            let idle = std::mem::take(&mut state.idle);
            state.resident = 0;
            let slots: Vec<Slot<F::Handle>> = idle.into_values().flatten().collect();
            state.counters.closed += slots.len() as u64;
            state.notify_all();
            (slots, was_shut_down, state.outstanding.len())
        };

        let closed = slots.len();
        for slot in slots {
            self.factory.close(slot.handle);
        }

        if !was_shut_down {
            info!(
                "Pool '{}' drained: closed {} handle(s), {} still checked out",
                self.config.name, closed, checked_out
            );
            if checked_out > 0 {
                warn!(
                    "Pool '{}' drained with {} handle(s) still checked out",
                    self.config.name, checked_out
                );
            }
        }

        closed
    }

    /// Take a snapshot of the pool state
    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        let mut resident_by_label: Vec<(Label, usize)> = state
            .idle
            .iter()
            .map(|(label, queue)| (label.clone(), queue.len()))
            .collect();
        resident_by_label.sort();

        PoolStatus {
            name: self.config.name.clone(),
            max_size: self.config.max_size,
            resident: state.resident,
            checked_out: state.outstanding.len(),
            pending: state.pending,
            waiting: state.waiting.values().sum(),
            shut_down: state.shut_down,
            resident_by_label,
            counters: state.counters.clone(),
        }
    }

    /// Decide how to serve `label`, blocking on the label's signal if needed
    fn next_step(
        &self,
        state: &mut MutexGuard<'_, PoolState<F::Handle>>,
        label: &Label,
        started: Instant,
        deadline: Instant,
    ) -> Result<Step<F::Handle>, PoolError> {
        loop {
            if state.shut_down {
                return Err(PoolError::PoolShutdown);
            }

            if let Some(slot) = state.pop_idle(label) {
                let lease = state.issue_lease();
                return Ok(Step::Idle { slot, lease });
            }

            if state.issued() < self.config.max_size {
                state.pending += 1;
                return Ok(Step::Create { evicted: None });
            }

            if self.config.rebalance_idle {
                if let Some(evicted) = state.pop_oldest_idle() {
                    state.pending += 1;
                    state.counters.closed += 1;
                    return Ok(Step::Create {
                        evicted: Some(evicted),
                    });
                }
            }

            // Checked after the availability tests so a caller woken at its
            // deadline still takes a handle that was just released.
            let now = Instant::now();
            if now >= deadline {
                state.counters.timeouts += 1;
                return Err(PoolError::PoolExhausted {
                    pool: self.config.name.clone(),
                    label: label.clone(),
                    waited: now.saturating_duration_since(started),
                });
            }

            let signal = state.signal(label);
            *state.waiting.entry(label.clone()).or_insert(0) += 1;
            let _ = signal.wait_until(state, deadline);
            state.stop_waiting(label);
        }
    }

    /// Create a handle in a slot reserved by `next_step` and lease it out
    fn create_for_caller(&self, label: Label) -> Result<Lease<F::Handle>, PoolError> {
        match self.factory.create(&label) {
            Ok(handle) => {
                let mut state = self.state.lock();
                state.pending -= 1;
                state.counters.created += 1;

                if state.shut_down {
                    state.counters.closed += 1;
                    drop(state);
                    self.factory.close(handle);
                    return Err(PoolError::PoolShutdown);
                }

                let id = state.issue_lease();
                state.counters.acquisitions += 1;
                drop(state);

                debug!(
                    "Pool '{}': created handle for {} on demand (lease {})",
                    self.config.name, label, id
                );
                Ok(Lease::new(handle, label, id, self.id, Instant::now()))
            }
            Err(e) => {
                self.abandon_creation();
                warn!(
                    "Pool '{}': failed to create handle for {}: {}",
                    self.config.name, label, e
                );
                Err(PoolError::Factory(e))
            }
        }
    }

    /// Run the factory under the retry policy
    fn create_with_retry(&self, label: &Label) -> Result<F::Handle, FactoryError> {
        let policy = &self.config.retry;
        let mut attempt = 1;

        loop {
            match self.factory.create(label) {
                Ok(handle) => {
                    debug!(
                        "Pool '{}': created handle for {} (attempt {})",
                        self.config.name, label, attempt
                    );
                    return Ok(handle);
                }
                Err(e) if e.is_fatal() || attempt >= policy.max_attempts => return Err(e),
                Err(e) => {
                    let delay = policy.backoff_after(attempt);
                    self.state.lock().counters.factory_failures += 1;
                    warn!(
                        "Pool '{}': attempt {}/{} to create handle for {} failed: {}; retrying in {:?}",
                        self.config.name, attempt, policy.max_attempts, label, e, delay
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }

    /// Put a freshly created handle into a reserved slot.
    ///
    /// Returns the handle back if the pool was drained in the meantime.
    fn admit(&self, label: &Label, handle: F::Handle) -> Option<F::Handle> {
        let mut state = self.state.lock();
        state.pending -= 1;
        state.counters.created += 1;

        if state.shut_down {
            state.counters.closed += 1;
            return Some(handle);
        }

        state.push_idle(label.clone(), Slot::new(handle));
        if !state.notify_label(label) && self.config.rebalance_idle {
            state.notify_any();
        }
        None
    }

    /// Give back a reserved creation slot after the factory failed
    fn abandon_creation(&self) {
        let mut state = self.state.lock();
        state.pending -= 1;
        state.counters.factory_failures += 1;
        state.notify_any();
    }

    fn ensure_outstanding(&self, lease: &Lease<F::Handle>) -> Result<(), PoolError> {
        if lease.pool == self.id && self.state.lock().outstanding.contains(&lease.id) {
            Ok(())
        } else {
            Err(self.double_release(lease.id))
        }
    }

    fn double_release(&self, lease: LeaseId) -> PoolError {
        error!(
            "Pool '{}': lease {} returned but not checked out from this pool",
            self.config.name, lease
        );
        PoolError::DoubleRelease {
            pool: self.config.name.clone(),
            lease,
        }
    }
}

impl<F: Factory> Drop for ResourcePool<F> {
    fn drop(&mut self) {
        self.drain();
    }
}

impl<F: Factory> fmt::Debug for ResourcePool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.config.name)
            .field("max_size", &self.config.max_size)
            .finish_non_exhaustive()
    }
}

/// Object-safe view of a pool, for draining heterogeneous pools at shutdown
pub trait ManagedPool: Send + Sync {
    /// Pool name
    fn name(&self) -> &str;

    /// Snapshot of the pool state
    fn status(&self) -> PoolStatus;

    /// Close every resident handle; see [`ResourcePool::drain`]
    fn drain(&self) -> usize;
}

impl<F: Factory> ManagedPool for ResourcePool<F> {
    fn name(&self) -> &str {
        ResourcePool::name(self)
    }

    fn status(&self) -> PoolStatus {
        ResourcePool::status(self)
    }

    fn drain(&self) -> usize {
        ResourcePool::drain(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug)]
    struct TestHandle {
        id: usize,
        label: Label,
        broken: bool,
    }

    /// Counts calls and can be told to fail
    #[derive(Default)]
    struct TestFactory {
        created: AtomicUsize,
        closed: AtomicUsize,
        fail: AtomicBool,
    }

    impl Factory for TestFactory {
        type Handle = TestHandle;

        fn create(&self, label: &Label) -> Result<TestHandle, FactoryError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(FactoryError::Unavailable("connection refused".into()));
            }
            let id = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TestHandle {
                id,
                label: label.clone(),
                broken: false,
            })
        }

        fn is_valid(&self, handle: &mut TestHandle) -> bool {
            !handle.broken
        }

        fn close(&self, _handle: TestHandle) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_pool(max_size: usize) -> (Arc<TestFactory>, ResourcePool<Arc<TestFactory>>) {
        let factory = Arc::new(TestFactory::default());
        let config = PoolConfig {
            name: "test".to_string(),
            max_size,
            acquire_timeout: Duration::from_millis(200),
            retry: crate::RetryPolicy::no_retry(),
            ..PoolConfig::default()
        };
        let pool = ResourcePool::with_config(Arc::clone(&factory), config).unwrap();
        (factory, pool)
    }

    #[test]
    fn test_new_creates_nothing() {
        let (factory, pool) = test_pool(3);
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.issued(), 0);
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_new_rejects_zero_size() {
        let result = ResourcePool::new(TestFactory::default(), 0);
        assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
    }

    #[test]
    fn test_warm_fills_to_max_cycling_labels() {
        let (_factory, pool) = test_pool(5);
        let created = pool.warm(["a", "b"]).unwrap();
        assert_eq!(created, 5);
        assert_eq!(pool.size(), 5);

        let status = pool.status();
        assert_eq!(
            status.resident_by_label,
            vec![(Label::from("a"), 3), (Label::from("b"), 2)]
        );

        // Already full
        assert_eq!(pool.warm(["a"]).unwrap(), 0);
    }

    #[test]
    fn test_warm_without_labels_is_unlabeled() {
        let (_factory, pool) = test_pool(2);
        pool.warm(Vec::<Label>::new()).unwrap();
        let lease = pool.try_acquire(Label::unlabeled()).unwrap();
        assert!(lease.label().is_unlabeled());
        pool.release(lease).unwrap();
    }

    #[test]
    fn test_acquire_prefers_matching_label() {
        let (_factory, pool) = test_pool(2);
        pool.warm(["a", "b"]).unwrap();

        let lease = pool.acquire("b").unwrap();
        assert_eq!(lease.handle().label, Label::from("b"));
        assert_eq!(pool.size(), 1);
        pool.release(lease).unwrap();
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn test_acquire_creates_on_demand_below_max() {
        let (factory, pool) = test_pool(2);
        let lease = pool.acquire("x").unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.issued(), 1);
        pool.release(lease).unwrap();
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_acquire_reports_factory_error() {
        let (factory, pool) = test_pool(2);
        factory.fail.store(true, Ordering::SeqCst);
        let result = pool.acquire("x");
        assert!(matches!(
            result,
            Err(PoolError::Factory(FactoryError::Unavailable(_)))
        ));
        // The reserved slot was given back
        assert_eq!(pool.issued(), 0);
        assert_eq!(pool.status().counters.factory_failures, 1);
    }

    #[test]
    fn test_try_acquire_exhausted() {
        let (_factory, pool) = test_pool(1);
        let lease = pool.acquire("a").unwrap();
        let result = pool.try_acquire("a");
        assert!(matches!(result, Err(PoolError::PoolExhausted { .. })));
        assert_eq!(pool.status().counters.timeouts, 1);
        pool.release(lease).unwrap();
    }

    #[test]
    fn test_rebalance_evicts_other_label() {
        let (factory, pool) = test_pool(1);
        pool.warm(["a"]).unwrap();

        let lease = pool.try_acquire("b").unwrap();
        assert_eq!(lease.label(), &Label::from("b"));
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.issued(), 1);
        pool.release(lease).unwrap();
    }

    #[test]
    fn test_no_rebalance_blocks_other_label() {
        let factory = TestFactory::default();
        let config = PoolConfig {
            max_size: 1,
            rebalance_idle: false,
            ..PoolConfig::default()
        };
        let pool = ResourcePool::with_config(factory, config).unwrap();
        pool.warm(["a"]).unwrap();

        assert!(matches!(
            pool.try_acquire("b"),
            Err(PoolError::PoolExhausted { .. })
        ));
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_release_as_retags() {
        let (_factory, pool) = test_pool(1);
        let lease = pool.acquire("a").unwrap();
        pool.release_as(lease, "b").unwrap();
        assert_eq!(pool.status().resident_by_label, vec![(Label::from("b"), 1)]);
    }

    #[test]
    fn test_release_of_broken_handle_disposes() {
        let (factory, pool) = test_pool(1);
        let mut lease = pool.acquire("a").unwrap();
        let broken_id = lease.id;
        lease.handle_mut().broken = true;

        let checkin = pool.release(lease).unwrap();
        match checkin {
            Checkin::Discarded(discarded) => {
                assert_eq!(discarded.lease, broken_id);
                assert!(discarded.replaced());
            }
            other => panic!("unexpected checkin {:?}", other),
        }
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.status().counters.disposed, 1);
    }

    #[test]
    fn test_dispose_with_failing_factory_defers_replacement() {
        let (factory, pool) = test_pool(1);
        let lease = pool.acquire("a").unwrap();
        factory.fail.store(true, Ordering::SeqCst);

        let discarded = pool.dispose(lease).unwrap();
        assert!(matches!(discarded.replacement, Replacement::Deferred(_)));
        assert_eq!(pool.issued(), 0);

        // Capacity was freed, so a later acquire creates the handle itself
        factory.fail.store(false, Ordering::SeqCst);
        let lease = pool.try_acquire("a").unwrap();
        assert_eq!(lease.handle().id, 2);
        pool.release(lease).unwrap();
    }

    #[test]
    fn test_foreign_lease_rejected() {
        let (_fa, pool_a) = test_pool(1);
        let (_fb, pool_b) = test_pool(1);
        let lease = pool_a.acquire("a").unwrap();
        let id = lease.id();

        match pool_b.release(lease) {
            Err(PoolError::DoubleRelease { lease, .. }) => assert_eq!(lease, id),
            other => panic!("unexpected result {:?}", other),
        }
        // pool_a still counts the lease as checked out
        assert_eq!(pool_a.status().checked_out, 1);
    }

    #[test]
    fn test_drain_closes_resident_once() {
        let (factory, pool) = test_pool(3);
        pool.warm(["a"]).unwrap();
        let lease = pool.acquire("a").unwrap();

        assert_eq!(pool.drain(), 2);
        assert_eq!(pool.size(), 0);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.drain(), 0);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 2);

        assert!(matches!(pool.acquire("a"), Err(PoolError::PoolShutdown)));
        assert!(matches!(pool.warm(["a"]), Err(PoolError::PoolShutdown)));

        // A late release closes instead of pooling
        assert!(matches!(pool.release(lease).unwrap(), Checkin::Closed));
        assert_eq!(factory.closed.load(Ordering::SeqCst), 3);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn test_drop_drains() {
        let (factory, pool) = test_pool(2);
        pool.warm(["a"]).unwrap();
        drop(pool);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_validate_on_acquire_skips_invalid_idle() {
        struct Flaky;
        impl Factory for Flaky {
            type Handle = usize;
            fn create(&self, _label: &Label) -> Result<usize, FactoryError> {
                Ok(1)
            }
            fn is_valid(&self, handle: &mut usize) -> bool {
                *handle != 1
            }
        }

        let config = PoolConfig {
            max_size: 1,
            validate_on_acquire: true,
            ..PoolConfig::default()
        };
        let pool = ResourcePool::with_config(Flaky, config).unwrap();
        pool.warm(["a"]).unwrap();

        // The idle handle fails validation, is closed, and a fresh one is created
        let lease = pool.try_acquire("a").unwrap();
        assert_eq!(pool.status().counters.closed, 1);
        assert_eq!(pool.status().counters.created, 2);
        drop(lease);
    }

    #[test]
    fn test_drain_wakes_waiters() {
        let (_factory, pool) = test_pool(1);
        let pool = Arc::new(pool);
        let lease = pool.acquire("a").unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire_timeout("a", Duration::from_secs(5)))
        };

        while pool.status().waiting == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        pool.drain();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(PoolError::PoolShutdown)));
        drop(lease);
    }

    #[test]
    fn test_timed_out_waiter_drops_label_signal() {
        let (_factory, pool) = test_pool(1);
        let lease = pool.acquire("a").unwrap();

        for label in ["x", "y", "z"] {
            let result = pool.acquire_timeout(label, Duration::from_millis(10));
            assert!(matches!(result, Err(PoolError::PoolExhausted { .. })));
        }

        let state = pool.state.lock();
        assert!(state.waiting.is_empty());
        assert!(state.signals.is_empty());
        drop(state);
        pool.release(lease).unwrap();
    }

    #[test]
    fn test_signal_kept_while_label_has_waiters() {
        let (_factory, pool) = test_pool(1);
        let pool = Arc::new(pool);
        let lease = pool.acquire("a").unwrap();

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || pool.acquire_timeout("a", Duration::from_secs(5)))
            })
            .collect();
        while pool.status().waiting < 2 {
            thread::sleep(Duration::from_millis(1));
        }

        pool.release(lease).unwrap();
        // One waiter is served; the other keeps waiting on the same signal
        let mut served = None;
        while served.is_none() {
            let state = pool.state.lock();
            if state.waiting.get(&Label::from("a")).copied() == Some(1) {
                assert!(state.signals.contains_key(&Label::from("a")));
                served = Some(());
            }
            drop(state);
            thread::sleep(Duration::from_millis(1));
        }

        pool.drain();
        let results: Vec<_> = waiters.into_iter().map(|w| w.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(pool.state.lock().signals.is_empty());
    }

    #[test]
    fn test_dropped_lease_stays_checked_out() {
        let (factory, pool) = test_pool(2);
        let lease = pool.acquire("a").unwrap();
        drop(lease);

        // The slot leaks and the handle is never closed by the factory
        assert_eq!(pool.status().checked_out, 1);
        assert_eq!(pool.issued(), 1);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 0);
        assert_eq!(pool.drain(), 0);
    }
}
