use crate::Reservation;
use log::trace;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    /// Taking the lock would break the global ordering. Release everything
    /// and reacquire with [`AcquireContext::lock_all`].
    #[error("lock order violation, back off and retry")]
    Backoff,
}

/// Deadlock-free acquisition of several [`Reservation`]s.
///
/// Every context takes locks in ascending reservation id. A lock that would
/// go against that order fails with [`AcquireError::Backoff`];
/// [`lock_all`](Self::lock_all) performs the backoff itself by dropping what
/// is held and relocking the union in order. All locks are released when the
/// context is dropped.
pub struct AcquireContext {
    ticket: u64,
    held: Vec<Arc<Reservation>>,
}

impl AcquireContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ticket: NEXT_TICKET.fetch_add(1, Ordering::Relaxed),
            held: Vec::new(),
        }
    }

    #[must_use]
    pub fn holds(&self, resv: &Reservation) -> bool {
        self.held.iter().any(|r| r.id() == resv.id())
    }

    #[must_use]
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Locks one more reservation. Already-held reservations are a no-op.
    ///
    /// # Errors
    /// [`AcquireError::Backoff`] if `resv` orders before a held lock.
    pub fn lock(&mut self, resv: &Arc<Reservation>) -> Result<(), AcquireError> {
        if self.holds(resv) {
            return Ok(());
        }
        if self.held.last().is_some_and(|last| last.id() > resv.id()) {
            return Err(AcquireError::Backoff);
        }
        resv.lock.raw_lock(self.ticket);
        self.held.push(Arc::clone(resv));
        Ok(())
    }

    /// Locks every reservation in `resvs` in addition to the held set.
    ///
    /// If the new set cannot be appended in order, everything is released and
    /// the union is reacquired from scratch.
    pub fn lock_all<'a>(&mut self, resvs: impl IntoIterator<Item = &'a Arc<Reservation>>) {
        let mut wanted: Vec<Arc<Reservation>> = resvs.into_iter().cloned().collect();
        wanted.sort_by_key(|r| r.id());
        wanted.dedup_by_key(|r| r.id());
        wanted.retain(|r| !self.holds(r));

        let in_order = match (self.held.last(), wanted.first()) {
            (Some(last), Some(first)) => last.id() < first.id(),
            _ => true,
        };
        if !in_order {
            trace!("acquire ticket {} backing off with {} held", self.ticket, self.held.len());
            wanted.append(&mut self.held_released());
            wanted.sort_by_key(|r| r.id());
        }
        for r in wanted {
            r.lock.raw_lock(self.ticket);
            self.held.push(r);
        }
    }

    /// Releases every held lock; the context can be reused afterwards.
    pub fn unlock_all(&mut self) {
        drop(self.held_released());
    }

    fn held_released(&mut self) -> Vec<Arc<Reservation>> {
        let held = std::mem::take(&mut self.held);
        for r in held.iter().rev() {
            r.lock.raw_unlock(self.ticket);
        }
        held
    }
}

impl Default for AcquireContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AcquireContext {
    fn drop(&mut self) {
        self.unlock_all();
    }
}
