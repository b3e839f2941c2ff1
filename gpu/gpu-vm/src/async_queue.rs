//! Per-address-space FIFO of queued bind operations.
//!
//! One worker thread drains the queue in order. The first failure latches:
//! the failing operation's signal fences carry the error, the optional
//! [`ErrorSink`] hears about it, and every later operation stays queued until
//! [`Vm::restart`] clears the latch.
//!
//! Operations submitted together form a batch. A failing member fails the
//! batch's signal fences and drops the members that have not run yet.

use crate::bind::{BindOpKind, BindRequest, BindSyncs, signal_failure, signal_outputs};
use crate::vm::Vm;
use crate::{VmError, VmFlags, VmResult};
use gpu_sync::{Fence, FenceError};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// A queued operation with its resolved tile mask.
pub(crate) struct AsyncOp {
    pub(crate) req: BindRequest,
    pub(crate) tiles: u8,
    pub(crate) syncs: BindSyncs,
    /// Signal fences of the batch, shared by all of its members.
    batch: Option<Arc<[Fence]>>,
}

impl AsyncOp {
    pub(crate) const fn new(req: BindRequest, tiles: u8, syncs: BindSyncs) -> Self {
        Self {
            req,
            tiles,
            syncs,
            batch: None,
        }
    }

    /// Links `reqs` into one batch: the first member waits on `wait`, the
    /// last one signals `signal`.
    pub(crate) fn batch(reqs: Vec<(BindRequest, u8)>, wait: Vec<Fence>, signal: Vec<Fence>) -> Vec<Self> {
        let shared: Option<Arc<[Fence]>> = (reqs.len() > 1).then(|| signal.clone().into());
        let last = reqs.len().saturating_sub(1);
        let mut wait = Some(wait);
        let mut signal = Some(signal);
        reqs.into_iter()
            .enumerate()
            .map(|(i, (req, tiles))| Self {
                req,
                tiles,
                syncs: BindSyncs {
                    wait: wait.take().unwrap_or_default(),
                    signal: if i == last { signal.take().unwrap_or_default() } else { Vec::new() },
                },
                batch: shared.clone(),
            })
            .collect()
    }

    /// Every fence that hears about this operation's outcome.
    fn outputs(&self) -> &[Fence] {
        self.batch.as_deref().unwrap_or(&self.syncs.signal)
    }

    fn same_batch(&self, batch: &Arc<[Fence]>) -> bool {
        self.batch.as_ref().is_some_and(|b| Arc::ptr_eq(b, batch))
    }
}

/// Details of a latched asynchronous failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncErrorReport {
    pub error: VmError,
    pub op: BindOpKind,
    pub addr: u64,
    pub range: u64,
}

/// Receives asynchronous failures as they latch.
pub trait ErrorSink: Send + Sync {
    fn report(&self, report: &AsyncErrorReport);
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<AsyncOp>,
    error: Option<AsyncErrorReport>,
    running: bool,
    shutdown: bool,
}

#[derive(Default)]
pub(crate) struct AsyncQueue {
    state: Mutex<QueueState>,
    work: Condvar,
    idle: Condvar,
    sink: Mutex<Option<Arc<dyn ErrorSink>>>,
}

impl AsyncQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, op: AsyncOp) -> VmResult<()> {
        self.push_batch(vec![op])
    }

    /// Queues all of `ops` or none of them.
    pub(crate) fn push_batch(&self, ops: Vec<AsyncOp>) -> VmResult<()> {
        let mut st = self.state.lock();
        if st.shutdown {
            return Err(VmError::Closed);
        }
        st.pending.extend(ops);
        drop(st);
        self.work.notify_one();
        Ok(())
    }

    /// Blocks until an operation may run; `None` once shut down.
    fn next(&self) -> Option<AsyncOp> {
        let mut st = self.state.lock();
        loop {
            if st.shutdown {
                return None;
            }
            if st.error.is_none()
                && let Some(op) = st.pending.pop_front()
            {
                st.running = true;
                return Some(op);
            }
            self.work.wait(&mut st);
        }
    }

    /// The sink hears about a failure before the latch becomes visible.
    /// The rest of a failed batch leaves the queue together with it.
    fn finish(&self, failure: Option<AsyncErrorReport>, batch: Option<&Arc<[Fence]>>) {
        let sink = self.sink.lock().clone();
        if let Some(report) = &failure
            && let Some(sink) = sink
        {
            sink.report(report);
        }
        let mut st = self.state.lock();
        if failure.is_some()
            && let Some(batch) = batch
        {
            let before = st.pending.len();
            st.pending.retain(|op| !op.same_batch(batch));
            let dropped = before - st.pending.len();
            if dropped > 0 {
                warn!("dropped {dropped} operations of a failed batch");
            }
        }
        st.running = false;
        st.error = failure;
        drop(st);
        self.idle.notify_all();
    }

    /// Clears the latch; returns whether one was set.
    fn restart(&self) -> bool {
        let mut st = self.state.lock();
        let was_latched = st.error.take().is_some();
        drop(st);
        self.work.notify_one();
        was_latched
    }

    fn error(&self) -> Option<AsyncErrorReport> {
        self.state.lock().error.clone()
    }

    fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Waits until the queue drained or latched.
    fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        loop {
            if st.error.is_some() || st.shutdown || (st.pending.is_empty() && !st.running) {
                return true;
            }
            if self.idle.wait_until(&mut st, deadline).timed_out() {
                return false;
            }
        }
    }

    fn set_sink(&self, sink: Option<Arc<dyn ErrorSink>>) {
        *self.sink.lock() = sink;
    }

    /// Stops the worker and cancels everything still queued; returns how
    /// many operations were canceled.
    pub(crate) fn shutdown(&self) -> usize {
        let mut st = self.state.lock();
        st.shutdown = true;
        let canceled: Vec<_> = st.pending.drain(..).collect();
        drop(st);
        self.work.notify_all();
        self.idle.notify_all();
        for op in &canceled {
            for fence in op.outputs() {
                fence.signal_error(FenceError::Canceled);
            }
        }
        canceled.len()
    }
}

pub(crate) fn spawn_worker(vm: &Arc<Vm>) -> VmResult<()> {
    let weak = Arc::downgrade(vm);
    let queue = Arc::clone(&vm.async_ops);
    std::thread::Builder::new()
        .name(format!("vm{}-bind", vm.id()))
        .spawn(move || worker(&weak, &queue))
        .map(drop)
        .map_err(|e| VmError::Spawn(e.to_string()))
}

fn worker(vm: &Weak<Vm>, queue: &AsyncQueue) {
    while let Some(op) = queue.next() {
        let Some(vm) = vm.upgrade() else {
            for fence in op.outputs() {
                fence.signal_error(FenceError::Canceled);
            }
            queue.finish(None, None);
            break;
        };
        let batch = op.batch.clone();
        let failure = vm.run_async(op);
        queue.finish(failure, batch.as_ref());
    }
    debug!("async bind worker exiting");
}

impl Vm {
    fn run_async(&self, op: AsyncOp) -> Option<AsyncErrorReport> {
        let req = &op.req;
        match self.execute(req, op.tiles, &op.syncs.wait) {
            Ok(fence) => {
                signal_outputs(&fence, &op.syncs.signal);
                None
            }
            Err(error) => {
                error!("vm{}: queued {:?} failed, queue latched: {error}", self.id(), req.op);
                signal_failure(op.outputs(), &error);
                Some(AsyncErrorReport {
                    error,
                    op: req.op.kind(),
                    addr: req.op.addr(),
                    range: req.op.range(),
                })
            }
        }
    }

    fn require_async(&self) -> VmResult<()> {
        if self.flags().contains(VmFlags::ASYNC_BIND_OPS) {
            Ok(())
        } else {
            Err(VmError::InvalidArgument("address space has no async bind queue"))
        }
    }

    /// Clears the async error latch so queued operations run again.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] without an async queue.
    pub fn restart(&self) -> VmResult<()> {
        self.require_async()?;
        self.check_open()?;
        if self.async_ops.restart() {
            info!("vm{}: async queue restarted, {} operations pending", self.id(), self.pending_async_ops());
        }
        Ok(())
    }

    /// The latched failure, if any.
    #[must_use]
    pub fn async_error(&self) -> Option<AsyncErrorReport> {
        self.async_ops.error()
    }

    /// Operations queued but not yet started.
    #[must_use]
    pub fn pending_async_ops(&self) -> usize {
        self.async_ops.pending()
    }

    /// Waits until every queued operation ran or the queue latched.
    ///
    /// # Errors
    /// [`VmError::AsyncLatched`] when it latched, [`VmError::Timeout`] when
    /// `timeout` passed first.
    pub fn wait_async_idle(&self, timeout: Duration) -> VmResult<()> {
        self.require_async()?;
        if !self.async_ops.wait_idle(timeout) {
            warn!("vm{}: async queue still busy after {timeout:?}", self.id());
            return Err(VmError::Timeout(timeout));
        }
        if self.async_ops.error().is_some() {
            return Err(VmError::AsyncLatched);
        }
        Ok(())
    }

    pub fn set_error_sink(&self, sink: Option<Arc<dyn ErrorSink>>) {
        self.async_ops.set_sink(sink);
    }
}
