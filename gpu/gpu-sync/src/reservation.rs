//! Per-object synchronization slot: a sleeping lock plus the fences of every
//! operation that still touches the object.

use crate::{AcquireContext, Fence, FenceArray, FenceError};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT_RESERVATION_ID: AtomicU64 = AtomicU64::new(1);

/// How a fence relates to the object it is attached to.
///
/// Ordered: asking for the fences of a usage returns every fence whose usage
/// is at most that strong, so `Bookkeep` sees everything.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum FenceUsage {
    /// Memory management work (page-table updates, moves).
    Kernel,
    /// Implicit-sync writers.
    Write,
    /// Implicit-sync readers.
    Read,
    /// Tracked but never waited on implicitly (preemption fences).
    Bookkeep,
}

/// Owner ticket of a [`Reservation`] lock.
pub(crate) struct RawResvLock {
    owner: Mutex<Option<u64>>,
    released: Condvar,
}

impl RawResvLock {
    const fn new() -> Self {
        Self {
            owner: Mutex::new(None),
            released: Condvar::new(),
        }
    }

    pub(crate) fn raw_lock(&self, ticket: u64) {
        let mut owner = self.owner.lock();
        while owner.is_some() {
            self.released.wait(&mut owner);
        }
        *owner = Some(ticket);
    }

    pub(crate) fn raw_unlock(&self, ticket: u64) {
        let mut owner = self.owner.lock();
        debug_assert_eq!(*owner, Some(ticket), "unlock by non-owner");
        *owner = None;
        drop(owner);
        self.released.notify_one();
    }

    fn owner(&self) -> Option<u64> {
        *self.owner.lock()
    }
}

/// The synchronization object of a VM or a backing-memory object.
///
/// The lock is only taken through an [`AcquireContext`], which orders
/// multi-object acquisition by [`id`](Self::id). Fences may only be added
/// while the caller's context holds the lock, so a later locker always sees
/// every fence published by earlier holders.
pub struct Reservation {
    id: u64,
    name: &'static str,
    pub(crate) lock: RawResvLock,
    fences: Mutex<Vec<(Fence, FenceUsage)>>,
}

impl Reservation {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            id: NEXT_RESERVATION_ID.fetch_add(1, Ordering::Relaxed),
            name,
            lock: RawResvLock::new(),
            fences: Mutex::new(Vec::new()),
        }
    }

    /// Global acquisition order key.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock.owner().is_some()
    }

    /// Publishes `fence` on this object. Completed fences are pruned.
    ///
    /// # Panics
    /// In debug builds, if `ctx` does not hold this reservation.
    pub fn add_fence(&self, ctx: &AcquireContext, fence: Fence, usage: FenceUsage) {
        debug_assert!(ctx.holds(self), "fence added to unlocked reservation {}", self.name);
        let mut fences = self.fences.lock();
        fences.retain(|(f, _)| !f.is_signaled());
        if !fence.is_signaled() {
            fences.push((fence, usage));
        }
    }

    /// Drops `fence` from the slot, whatever its usage.
    pub fn remove_fence(&self, ctx: &AcquireContext, fence: &Fence) {
        debug_assert!(ctx.holds(self), "fence removed from unlocked reservation {}", self.name);
        self.fences.lock().retain(|(f, _)| !f.same(fence));
    }

    /// Snapshot of the unsignalled fences up to `usage`.
    #[must_use]
    pub fn fences(&self, usage: FenceUsage) -> FenceArray {
        self.fences
            .lock()
            .iter()
            .filter(|(_, u)| *u <= usage)
            .map(|(f, _)| f.clone())
            .collect()
    }

    /// Arms every fence up to `usage` without waiting.
    pub fn enable_signaling(&self, usage: FenceUsage) {
        self.fences(usage).enable_signaling();
    }

    /// `true` once every fence up to `usage` has completed.
    #[must_use]
    pub fn test_signaled(&self, usage: FenceUsage) -> bool {
        self.fences(usage).is_signaled()
    }

    /// Unbounded wait on every fence up to `usage`; arms them first.
    ///
    /// # Errors
    /// The first fence error.
    pub fn wait(&self, usage: FenceUsage) -> Result<(), FenceError> {
        self.fences(usage).wait()
    }

    /// Bounded variant of [`wait`](Self::wait).
    ///
    /// # Errors
    /// [`FenceError::Timeout`] or the first fence error.
    pub fn wait_timeout(&self, usage: FenceUsage, timeout: Duration) -> Result<(), FenceError> {
        self.fences(usage).wait_timeout(timeout)
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("locked", &self.is_locked())
            .field("fences", &self.fences.lock().len())
            .finish()
    }
}
