use crate::{GpuAddress, PageSize, is_aligned};
use core::fmt;

/// A non-empty half-open range `[start, end)` of GPU virtual addresses.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VaRange {
    start: GpuAddress,
    end: GpuAddress,
}

impl VaRange {
    /// Returns `None` for empty or inverted ranges.
    #[inline]
    #[must_use]
    pub const fn new(start: GpuAddress, end: GpuAddress) -> Option<Self> {
        if start.as_u64() < end.as_u64() {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// Returns `None` if `len` is zero or `start + len` overflows.
    #[inline]
    #[must_use]
    pub const fn from_len(start: GpuAddress, len: u64) -> Option<Self> {
        match start.checked_add(len) {
            Some(end) => Self::new(start, end),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> GpuAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> GpuAddress {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    /// Always `false`; present for API symmetry with collections.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    #[inline]
    #[must_use]
    pub const fn contains_addr(&self, addr: GpuAddress) -> bool {
        self.start.as_u64() <= addr.as_u64() && addr.as_u64() < self.end.as_u64()
    }

    /// `other` lies entirely within `self`.
    #[inline]
    #[must_use]
    pub const fn contains(&self, other: &Self) -> bool {
        self.start.as_u64() <= other.start.as_u64() && other.end.as_u64() <= self.end.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start.as_u64() < other.end.as_u64() && other.start.as_u64() < self.end.as_u64()
    }

    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        Self::new(self.start.max(other.start), self.end.min(other.end))
    }

    /// Both ends are multiples of `S::SIZE`.
    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(&self) -> bool {
        is_aligned(self.start.as_u64(), S::SIZE) && is_aligned(self.end.as_u64(), S::SIZE)
    }

    /// Number of `S`-sized pages; only meaningful for aligned ranges.
    #[inline]
    #[must_use]
    pub const fn page_count<S: PageSize>(&self) -> u64 {
        self.len() >> S::SHIFT
    }
}

impl fmt::Debug for VaRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[0x{:X}, 0x{:X})", self.start.as_u64(), self.end.as_u64())
    }
}

impl fmt::Display for VaRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
