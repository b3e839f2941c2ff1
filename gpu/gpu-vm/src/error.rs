use crate::backing::ResidencyError;
use crate::hw::SubmitError;
use crate::userptr::PinError;
use gpu_addresses::VaRange;
use gpu_pgtable::PtError;
use gpu_sync::FenceError;
use std::time::Duration;

pub type VmResult<T> = Result<T, VmError>;

/// Coarse classification of a [`VmError`], for callers that only need to
/// decide between retrying, restarting and giving up.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// The request itself is malformed or conflicts with existing mappings.
    Structural,
    /// Memory or threads ran out.
    Resource,
    /// Backing memory could not be made resident.
    Residency,
    /// A bounded hardware wait expired.
    Timeout,
    /// The asynchronous queue is stopped on an earlier failure.
    AsyncLatched,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("range {addr:#x}+{len:#x} is not page aligned")]
    Unaligned { addr: u64, len: u64 },
    #[error("range {addr:#x}+{len:#x} does not fit the address space")]
    OutOfBounds { addr: u64, len: u64 },
    #[error("range {addr:#x}+{len:#x} overlaps an existing mapping")]
    Overlap { addr: u64, len: u64 },
    #[error("out of memory building page tables")]
    OutOfMemory,
    #[error("failed to start a worker thread: {0}")]
    Spawn(String),
    #[error("failed to pin host pages: {0}")]
    Pin(#[from] PinError),
    #[error("backing memory could not be made resident: {0}")]
    Residency(#[from] ResidencyError),
    #[error("hardware did not respond within {0:?}")]
    Timeout(Duration),
    #[error("an earlier queued bind failed; restart the address space")]
    AsyncLatched,
    #[error("address space is closed")]
    Closed,
    #[error("address space was killed after a failed rebind")]
    Killed,
    #[error("no address space with handle {0}")]
    NotFound(u32),
    #[error("userptr pages were invalidated; repin and retry")]
    Again,
    #[error("page-table update submission failed: {0}")]
    Submit(String),
    #[error(transparent)]
    Fence(#[from] FenceError),
}

impl VmError {
    pub(crate) const fn unaligned(range: VaRange) -> Self {
        Self::Unaligned {
            addr: range.start().as_u64(),
            len: range.len(),
        }
    }

    pub(crate) const fn overlap(range: VaRange) -> Self {
        Self::Overlap {
            addr: range.start().as_u64(),
            len: range.len(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_)
            | Self::Unaligned { .. }
            | Self::OutOfBounds { .. }
            | Self::Overlap { .. }
            | Self::NotFound(_) => ErrorKind::Structural,
            Self::OutOfMemory | Self::Spawn(_) | Self::Pin(_) => ErrorKind::Resource,
            Self::Residency(_) => ErrorKind::Residency,
            Self::Timeout(_) | Self::Fence(FenceError::Timeout) => ErrorKind::Timeout,
            Self::AsyncLatched => ErrorKind::AsyncLatched,
            _ => ErrorKind::Other,
        }
    }
}

impl From<PtError> for VmError {
    fn from(e: PtError) -> Self {
        match e {
            PtError::OutOfMemory { .. } => Self::OutOfMemory,
            PtError::Unaligned(r) => Self::unaligned(r),
            PtError::OutOfRange(r) => Self::OutOfBounds {
                addr: r.start().as_u64(),
                len: r.len(),
            },
            PtError::Stale => Self::InvalidArgument("page-table update raced with another change"),
        }
    }
}

impl From<SubmitError> for VmError {
    fn from(e: SubmitError) -> Self {
        Self::Submit(e.0)
    }
}

/// Failure carried on the out-fences of a failed operation.
impl From<VmError> for FenceError {
    fn from(e: VmError) -> Self {
        match e {
            VmError::Fence(inner) => inner,
            VmError::Timeout(_) => Self::Timeout,
            other => Self::Failed(other.to_string()),
        }
    }
}
