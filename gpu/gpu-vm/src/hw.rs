//! Command-submission collaborators: page-table write jobs and TLB
//! invalidations.

use gpu_addresses::VaRange;
use gpu_pgtable::PtWrite;
use gpu_sync::Fence;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct SubmitError(pub String);

/// Queues page-table writes as GPU work.
pub trait PtSubmitter: Send + Sync {
    /// Enqueues `writes` on `tile`; the returned fence signals once the
    /// entries are visible to the GPU walker.
    ///
    /// # Errors
    /// [`SubmitError`] when the job could not be queued at all.
    fn submit(&self, tile: u8, writes: Vec<PtWrite>) -> Result<Fence, SubmitError>;
}

/// Invalidates cached translations.
pub trait TlbInvalidator: Send + Sync {
    /// Starts an invalidation of `range` on `tile`; the fence signals on the
    /// hardware acknowledgement.
    fn invalidate(&self, tile: u8, range: VaRange) -> Fence;
}
