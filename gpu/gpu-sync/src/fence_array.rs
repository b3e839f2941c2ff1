use crate::{Fence, FenceError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// "Wait for all of these" combinator.
///
/// Outcome is `Ok` once every member succeeded, otherwise the first error
/// observed in member order.
#[derive(Debug, Clone, Default)]
pub struct FenceArray {
    fences: Vec<Fence>,
}

impl FenceArray {
    #[must_use]
    pub const fn new() -> Self {
        Self { fences: Vec::new() }
    }

    /// Adds a member, skipping fences that already succeeded.
    pub fn push(&mut self, fence: Fence) {
        if fence.status() != Some(Ok(())) {
            self.fences.push(fence);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fences.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fence> {
        self.fences.iter()
    }

    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.fences.iter().all(Fence::is_signaled)
    }

    /// Arms every member.
    pub fn enable_signaling(&self) {
        for f in &self.fences {
            f.enable_signaling();
        }
    }

    /// Waits for every member, unbounded.
    ///
    /// # Errors
    /// The first member error.
    pub fn wait(&self) -> Result<(), FenceError> {
        self.enable_signaling();
        let mut first = Ok(());
        for f in &self.fences {
            if let Err(e) = f.wait() {
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    }

    /// Waits for every member with one shared deadline.
    ///
    /// # Errors
    /// [`FenceError::Timeout`] if the deadline passes, otherwise the first
    /// member error.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), FenceError> {
        self.enable_signaling();
        let deadline = Instant::now() + timeout;
        let mut first = Ok(());
        for f in &self.fences {
            let left = deadline.saturating_duration_since(Instant::now());
            match f.wait_timeout(left) {
                Ok(()) => {}
                Err(FenceError::Timeout) => return Err(FenceError::Timeout),
                Err(e) => {
                    if first.is_ok() {
                        first = Err(e);
                    }
                }
            }
        }
        first
    }

    /// Collapses the array into a single fence.
    ///
    /// Arming the returned fence arms every member. An empty array yields an
    /// already signalled fence; a single member is returned as-is.
    #[must_use]
    pub fn into_fence(mut self) -> Fence {
        match self.fences.len() {
            0 => return Fence::signaled(),
            1 => return self.fences.remove(0),
            _ => {}
        }

        let members = self.fences;
        let armed = members.clone();
        let out = Fence::with_enable_signaling(move |_| {
            for f in &armed {
                f.enable_signaling();
            }
        });

        let remaining = Arc::new(AtomicUsize::new(members.len()));
        let errors: Arc<Mutex<Vec<Option<FenceError>>>> =
            Arc::new(Mutex::new(vec![None; members.len()]));
        for (i, f) in members.iter().enumerate() {
            let out = out.clone();
            let remaining = Arc::clone(&remaining);
            let errors = Arc::clone(&errors);
            f.add_callback(move |outcome| {
                if let Err(e) = outcome {
                    errors.lock()[i] = Some(e);
                }
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let first = errors.lock().iter_mut().find_map(Option::take);
                    out.complete(first.map_or(Ok(()), Err));
                }
            });
        }
        out
    }
}

impl FromIterator<Fence> for FenceArray {
    fn from_iter<I: IntoIterator<Item = Fence>>(iter: I) -> Self {
        let mut arr = Self::new();
        for f in iter {
            arr.push(f);
        }
        arr
    }
}

impl Extend<Fence> for FenceArray {
    fn extend<I: IntoIterator<Item = Fence>>(&mut self, iter: I) {
        for f in iter {
            self.push(f);
        }
    }
}
