use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static NEXT_FENCE_ID: AtomicU64 = AtomicU64::new(1);

/// Error carried by a completed fence, or returned by a bounded wait.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FenceError {
    #[error("wait timed out")]
    Timeout,
    #[error("fence was canceled before completion")]
    Canceled,
    #[error("operation failed: {0}")]
    Failed(String),
}

/// Callback run exactly once with the fence outcome.
pub type FenceCallback = Box<dyn FnOnce(Result<(), FenceError>) + Send>;

/// Hook run the first time anyone needs the fence to make progress.
pub type EnableSignaling = Box<dyn FnOnce(&Fence) + Send>;

enum Status {
    Pending,
    Signaled,
    Failed(FenceError),
}

struct State {
    status: Status,
    callbacks: Vec<FenceCallback>,
    enable_signaling: Option<EnableSignaling>,
}

struct Inner {
    id: u64,
    state: Mutex<State>,
    done: Condvar,
}

/// A one-shot completion signal.
///
/// The producer (a command submitter, a worker thread) calls
/// [`signal`](Self::signal) or [`signal_error`](Self::signal_error) exactly
/// once; consumers [`wait`](Self::wait), poll with
/// [`status`](Self::status) or chain work through
/// [`add_callback`](Self::add_callback). Clones share the same signal.
///
/// A fence may carry an *enable-signaling* hook. It runs once, the first time
/// a consumer waits on the fence or arms it explicitly with
/// [`enable_signaling`](Self::enable_signaling). Preemption fences use it to
/// ask a running context to yield only when somebody actually needs it gone.
#[derive(Clone)]
pub struct Fence(Arc<Inner>);

impl Fence {
    /// A new pending fence.
    #[must_use]
    pub fn new() -> Self {
        Self::build(Status::Pending, None)
    }

    /// A pending fence whose hook runs on first wait or explicit arming.
    #[must_use]
    pub fn with_enable_signaling(hook: impl FnOnce(&Self) + Send + 'static) -> Self {
        Self::build(Status::Pending, Some(Box::new(hook)))
    }

    /// An already completed fence.
    #[must_use]
    pub fn signaled() -> Self {
        Self::build(Status::Signaled, None)
    }

    /// An already failed fence.
    #[must_use]
    pub fn failed(err: FenceError) -> Self {
        Self::build(Status::Failed(err), None)
    }

    fn build(status: Status, enable_signaling: Option<EnableSignaling>) -> Self {
        Self(Arc::new(Inner {
            id: NEXT_FENCE_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(State {
                status,
                callbacks: Vec::new(),
                enable_signaling,
            }),
            done: Condvar::new(),
        }))
    }

    /// Process-unique identifier, stable across clones.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Both handles refer to the same signal.
    #[inline]
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Completes the fence successfully. Returns `false` if it already was.
    pub fn signal(&self) -> bool {
        self.complete(Ok(()))
    }

    /// Completes the fence with an error. Returns `false` if it already was.
    pub fn signal_error(&self, err: FenceError) -> bool {
        self.complete(Err(err))
    }

    /// Completes the fence with the given outcome.
    pub fn complete(&self, outcome: Result<(), FenceError>) -> bool {
        let callbacks = {
            let mut st = self.0.state.lock();
            if !matches!(st.status, Status::Pending) {
                return false;
            }
            st.status = match &outcome {
                Ok(()) => Status::Signaled,
                Err(e) => Status::Failed(e.clone()),
            };
            st.enable_signaling = None;
            std::mem::take(&mut st.callbacks)
        };
        self.0.done.notify_all();
        for cb in callbacks {
            cb(outcome.clone());
        }
        true
    }

    /// Non-arming poll.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        !matches!(self.0.state.lock().status, Status::Pending)
    }

    /// `None` while pending, the outcome once complete.
    #[must_use]
    pub fn status(&self) -> Option<Result<(), FenceError>> {
        match &self.0.state.lock().status {
            Status::Pending => None,
            Status::Signaled => Some(Ok(())),
            Status::Failed(e) => Some(Err(e.clone())),
        }
    }

    /// Runs the enable-signaling hook if it has not run yet.
    pub fn enable_signaling(&self) {
        let hook = self.0.state.lock().enable_signaling.take();
        if let Some(hook) = hook {
            hook(self);
        }
    }

    /// Arms the fence and blocks until it completes.
    ///
    /// # Errors
    /// The error the producer completed the fence with.
    pub fn wait(&self) -> Result<(), FenceError> {
        self.enable_signaling();
        let mut st = self.0.state.lock();
        loop {
            match &st.status {
                Status::Pending => {}
                Status::Signaled => return Ok(()),
                Status::Failed(e) => return Err(e.clone()),
            }
            self.0.done.wait(&mut st);
        }
    }

    /// Arms the fence and blocks for at most `timeout`.
    ///
    /// # Errors
    /// [`FenceError::Timeout`] if the fence is still pending when the time is
    /// up, otherwise the error the producer completed the fence with.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), FenceError> {
        self.enable_signaling();
        let deadline = Instant::now() + timeout;
        let mut st = self.0.state.lock();
        loop {
            match &st.status {
                Status::Pending => {}
                Status::Signaled => return Ok(()),
                Status::Failed(e) => return Err(e.clone()),
            }
            if self.0.done.wait_until(&mut st, deadline).timed_out()
                && matches!(st.status, Status::Pending)
            {
                return Err(FenceError::Timeout);
            }
        }
    }

    /// Registers `cb` to run on completion; runs it inline if already done.
    pub fn add_callback(&self, cb: impl FnOnce(Result<(), FenceError>) + Send + 'static) {
        let outcome = {
            let mut st = self.0.state.lock();
            let outcome = match &st.status {
                Status::Pending => None,
                Status::Signaled => Some(Ok(())),
                Status::Failed(e) => Some(Err(e.clone())),
            };
            if outcome.is_none() {
                st.callbacks.push(Box::new(cb));
                return;
            }
            outcome
        };
        if let Some(outcome) = outcome {
            cb(outcome);
        }
    }

    /// Completes `self` with whatever outcome `source` ends up with.
    pub fn follow(&self, source: &Self) {
        let this = self.clone();
        source.add_callback(move |outcome| {
            this.complete(outcome);
        });
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.status() {
            None => "pending",
            Some(Ok(())) => "signaled",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("Fence")
            .field("id", &self.0.id)
            .field("status", &status)
            .finish()
    }
}
