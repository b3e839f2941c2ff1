//! Ordered directory of mapping entries, keyed by start address.
//!
//! Entries never overlap, so ordering by start also orders by end and an
//! overlap query only has to look backwards from the query's end.

use crate::vma::Vma;
use crate::{VmError, VmResult};
use gpu_addresses::{GpuAddress, VaRange};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Default)]
pub struct VmaTree {
    map: BTreeMap<u64, Arc<Vma>>,
}

/// Outcome of carving a range out of the tree.
#[derive(Debug, Default)]
pub struct UnmapResolution {
    /// Entries that intersected the range, now out of the tree and marked
    /// destroyed, in address order.
    pub removed: Vec<Arc<Vma>>,
    /// Unbound entries inserted for the parts of the first and last removed
    /// entries that lie outside the range.
    pub remainders: Vec<Arc<Vma>>,
}

impl VmaTree {
    #[must_use]
    pub const fn new() -> Self {
        Self { map: BTreeMap::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Inserts `vma` unless it overlaps an existing entry.
    ///
    /// # Errors
    /// [`VmError::Overlap`].
    pub fn insert(&mut self, vma: Arc<Vma>) -> VmResult<()> {
        if self.find_overlap(vma.range()).is_some() {
            return Err(VmError::overlap(vma.range()));
        }
        self.map.insert(vma.start().as_u64(), vma);
        Ok(())
    }

    /// Removes exactly `vma`; another entry at the same start is left alone.
    pub fn remove(&mut self, vma: &Vma) -> Option<Arc<Vma>> {
        let key = vma.start().as_u64();
        if self.map.get(&key).is_some_and(|v| std::ptr::eq(Arc::as_ptr(v), vma)) {
            self.map.remove(&key)
        } else {
            None
        }
    }

    /// Some entry intersecting `range`.
    #[must_use]
    pub fn find_overlap(&self, range: VaRange) -> Option<&Arc<Vma>> {
        self.map
            .range(..range.end().as_u64())
            .next_back()
            .map(|(_, v)| v)
            .filter(|v| v.end() > range.start())
    }

    /// Every entry intersecting `range`, in address order.
    #[must_use]
    pub fn overlapping(&self, range: VaRange) -> Vec<Arc<Vma>> {
        let mut hits: Vec<_> = self
            .map
            .range(..range.end().as_u64())
            .rev()
            .map(|(_, v)| v)
            .take_while(|v| v.end() > range.start())
            .cloned()
            .collect();
        hits.reverse();
        hits
    }

    /// The entry containing `addr`.
    #[must_use]
    pub fn lookup(&self, addr: GpuAddress) -> Option<&Arc<Vma>> {
        self.map
            .range(..=addr.as_u64())
            .next_back()
            .map(|(_, v)| v)
            .filter(|v| v.range().contains_addr(addr))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Vma>> {
        self.map.values()
    }

    /// Empties the tree, handing out every entry.
    pub fn drain(&mut self) -> impl Iterator<Item = Arc<Vma>> {
        std::mem::take(&mut self.map).into_values()
    }

    /// Removes everything intersecting `range`, keeping what lies outside.
    ///
    /// `split` builds the entry for a surviving sub-range of an entry being
    /// removed. Afterwards nothing in the tree overlaps `range`.
    pub fn resolve_unmap(
        &mut self,
        range: VaRange,
        mut split: impl FnMut(&Vma, VaRange) -> Arc<Vma>,
    ) -> UnmapResolution {
        let removed = self.overlapping(range);
        for vma in &removed {
            self.map.remove(&vma.start().as_u64());
            vma.mark_destroyed();
        }

        let mut remainders = Vec::new();
        if let Some(first) = removed.first()
            && first.start() < range.start()
            && let Some(prefix) = VaRange::new(first.start(), range.start())
        {
            remainders.push(split(first, prefix));
        }
        if let Some(last) = removed.last()
            && last.end() > range.end()
            && let Some(suffix) = VaRange::new(range.end(), last.end())
        {
            remainders.push(split(last, suffix));
        }
        for rem in &remainders {
            self.map.insert(rem.start().as_u64(), Arc::clone(rem));
        }
        UnmapResolution { removed, remainders }
    }
}
