use crate::entry::{CacheLevel, encode_pde};
use crate::walk::ENTRIES;
use crate::{PtError, TableAllocator};
use gpu_addresses::DmaAddress;
use std::fmt;
use std::sync::Arc;

const LIVE_WORDS: usize = ENTRIES / 64;

/// One hardware table: a backing page of 512 entries plus bookkeeping.
///
/// Directories (level > 0) own their children; a slot is *live* when it
/// holds a child table or a leaf. Leaves count live translations. The
/// backing page goes back to the allocator when the node is dropped.
pub struct PtNode {
    level: u32,
    page: DmaAddress,
    entries: Box<[u64; ENTRIES]>,
    /// Value written into a slot when it is cleared.
    empty: u64,
    live: [u64; LIVE_WORDS],
    num_live: u32,
    children: Vec<Option<Box<PtNode>>>,
    alloc: Arc<dyn TableAllocator>,
}

impl PtNode {
    pub(crate) fn new(alloc: &Arc<dyn TableAllocator>, level: u32, empty: u64) -> Result<Self, PtError> {
        let page = alloc.alloc_table(level).ok_or(PtError::OutOfMemory { level })?;
        let children = if level == 0 {
            Vec::new()
        } else {
            std::iter::repeat_with(|| None).take(ENTRIES).collect()
        };
        Ok(Self {
            level,
            page,
            entries: Box::new([empty; ENTRIES]),
            empty,
            live: [0; LIVE_WORDS],
            num_live: 0,
            children,
            alloc: Arc::clone(alloc),
        })
    }

    #[inline]
    #[must_use]
    pub const fn level(&self) -> u32 {
        self.level
    }

    /// DMA address of the backing page.
    #[inline]
    #[must_use]
    pub const fn page(&self) -> DmaAddress {
        self.page
    }

    #[inline]
    #[must_use]
    pub const fn num_live(&self) -> u32 {
        self.num_live
    }

    #[inline]
    #[must_use]
    pub const fn entry(&self, idx: usize) -> u64 {
        self.entries[idx]
    }

    #[must_use]
    pub fn entries(&self) -> &[u64; ENTRIES] {
        &self.entries
    }

    #[inline]
    #[must_use]
    pub const fn is_live(&self, idx: usize) -> bool {
        self.live[idx / 64] & (1 << (idx % 64)) != 0
    }

    #[must_use]
    pub fn child(&self, idx: usize) -> Option<&Self> {
        self.children.get(idx).and_then(Option::as_deref)
    }

    pub(crate) fn child_mut(&mut self, idx: usize) -> Option<&mut Self> {
        self.children.get_mut(idx).and_then(Option::as_deref_mut)
    }

    /// Live child tables, in slot order.
    pub fn children(&self) -> impl Iterator<Item = &Self> {
        self.children.iter().filter_map(Option::as_deref)
    }

    fn mark_live(&mut self, idx: usize) {
        if !self.is_live(idx) {
            self.live[idx / 64] |= 1 << (idx % 64);
            self.num_live += 1;
        }
    }

    fn unmark_live(&mut self, idx: usize) {
        if self.is_live(idx) {
            self.live[idx / 64] &= !(1 << (idx % 64));
            self.num_live -= 1;
        }
    }

    /// Writes a leaf, dropping a child table that may have occupied the slot.
    pub(crate) fn set_leaf(&mut self, idx: usize, value: u64) {
        if let Some(slot) = self.children.get_mut(idx) {
            *slot = None;
        }
        self.entries[idx] = value;
        self.mark_live(idx);
    }

    /// Links `child` into `idx`, replacing whatever lived there.
    pub(crate) fn set_child(&mut self, idx: usize, child: Box<Self>, cache: CacheLevel) {
        debug_assert_eq!(child.level + 1, self.level);
        self.entries[idx] = encode_pde(child.page, cache);
        self.children[idx] = Some(child);
        self.mark_live(idx);
    }

    /// Empties a slot; a child table in it is destroyed.
    pub(crate) fn clear(&mut self, idx: usize) {
        if let Some(slot) = self.children.get_mut(idx) {
            *slot = None;
        }
        self.entries[idx] = self.empty;
        self.unmark_live(idx);
    }

    /// Live translations in this subtree; a huge leaf counts once.
    #[must_use]
    pub fn count_leaves(&self) -> usize {
        (0..ENTRIES)
            .filter(|&i| self.is_live(i))
            .map(|i| self.child(i).map_or(1, Self::count_leaves))
            .sum()
    }

    /// Tables in this subtree, including `self`.
    #[must_use]
    pub fn count_tables(&self) -> usize {
        1 + self.children().map(Self::count_tables).sum::<usize>()
    }
}

impl Drop for PtNode {
    fn drop(&mut self) {
        self.alloc.free_table(self.page);
    }
}

impl fmt::Debug for PtNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtNode")
            .field("level", &self.level)
            .field("page", &self.page)
            .field("num_live", &self.num_live)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BumpTableAllocator;

    fn alloc() -> (Arc<BumpTableAllocator>, Arc<dyn TableAllocator>) {
        let a = Arc::new(BumpTableAllocator::new(DmaAddress::new(0x100_0000), DmaAddress::new(0x200_0000)));
        let dyn_a: Arc<dyn TableAllocator> = a.clone();
        (a, dyn_a)
    }

    #[test]
    fn live_counter_tracks_slots() {
        let (_, a) = alloc();
        let mut n = PtNode::new(&a, 0, 0).unwrap();
        n.set_leaf(3, 0x1003);
        n.set_leaf(3, 0x2003);
        n.set_leaf(511, 0x3003);
        assert_eq!(n.num_live(), 2);
        n.clear(3);
        assert_eq!(n.num_live(), 1);
        assert_eq!(n.entry(3), 0);
        assert!(n.is_live(511));
    }

    #[test]
    fn dropping_a_directory_frees_its_subtree() {
        let (bump, a) = alloc();
        let mut dir = PtNode::new(&a, 1, 0).unwrap();
        let leaf = PtNode::new(&a, 0, 0).unwrap();
        dir.set_child(7, Box::new(leaf), CacheLevel::WriteBack);
        assert_eq!(bump.live_tables(), 2);
        assert_eq!(dir.count_tables(), 2);
        dir.clear(7);
        assert_eq!(bump.live_tables(), 1);
        drop(dir);
        assert_eq!(bump.live_tables(), 0);
    }
}
