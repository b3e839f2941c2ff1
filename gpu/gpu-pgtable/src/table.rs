//! # Page table engine
//!
//! [`PageTable`] owns the node tree of one tile and turns *bind range to
//! backing* / *unbind range* requests into node mutations.
//!
//! ## Two-phase bind
//!
//! ```text
//!   prepare_bind(&self)                 commit(&mut self)
//!  ┌──────────────────────────┐        ┌──────────────────────────────┐
//!  │ walk live tree read-only │        │ check tree generation        │
//!  │ allocate + fill new      │ ─────▶ │ splice staged leaves/tables  │
//!  │ tables off to the side   │        │ update live counters         │
//!  │ record PendingUpdates    │        │ emit PtWrites                │
//!  └──────────────────────────┘        └──────────────────────────────┘
//! ```
//!
//! Everything that can fail (allocation) happens in `prepare_bind`; dropping
//! a [`PreparedBind`] releases its staged tables and leaves the live tree
//! untouched. `commit` cannot fail except on a stale update.
//!
//! ## Huge leaves
//!
//! At levels 1 (2 MiB) and 2 (1 GiB) a slot fully covered by the request is
//! written as a single huge leaf if the backing DMA address is aligned to the
//! slot span and the source is contiguous across it. A huge leaf that is only
//! partially rewritten or partially unbound is first split into a child table
//! that replicates it one level down.

use crate::entry::{CacheLevel, EntryView, PteAttrs, encode_huge, encode_leaf, encode_pte};
use crate::node::PtNode;
use crate::walk::{MAX_HUGE_LEVEL, Slots, covers_slot, entry_span, level_shift, root_level_for, slot_index};
use crate::{PtError, TableAllocator};
use gpu_addresses::{DmaAddress, GpuAddress, Size4K, VaRange};
use log::{debug, trace};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Source of DMA addresses for the pages being bound.
///
/// `offset` is a byte offset into the backing (object offset, or offset
/// into a pinned host buffer), always 4 KiB aligned.
pub trait DmaSource {
    fn dma_address(&self, offset: u64) -> DmaAddress;

    /// Whether `[offset, offset + len)` is physically contiguous.
    fn is_contiguous(&self, offset: u64, len: u64) -> bool {
        let base = self.dma_address(offset).as_u64();
        (0..len)
            .step_by(4096)
            .all(|o| self.dma_address(offset + o).as_u64() == base + o)
    }
}

/// Pinned pages, one DMA address per 4 KiB page.
impl DmaSource for [DmaAddress] {
    fn dma_address(&self, offset: u64) -> DmaAddress {
        self[usize::try_from(offset >> 12).unwrap_or(usize::MAX)] + (offset & 0xFFF)
    }
}

/// A single physically contiguous allocation starting at the wrapped address.
#[derive(Debug, Copy, Clone)]
pub struct Contiguous(pub DmaAddress);

impl DmaSource for Contiguous {
    fn dma_address(&self, offset: u64) -> DmaAddress {
        self.0 + offset
    }

    fn is_contiguous(&self, _offset: u64, _len: u64) -> bool {
        true
    }
}

/// Layout knobs of one tree.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PtConfig {
    /// Width of the translated address space.
    pub va_bits: u32,
    /// Empty leaf slots point here (read-only) instead of being zero.
    pub scratch_page: Option<DmaAddress>,
    /// Collapse eligible ranges into 2 MiB / 1 GiB leaves.
    pub huge_pages: bool,
    /// Cache class of directory entries.
    pub dir_cache: CacheLevel,
}

impl Default for PtConfig {
    fn default() -> Self {
        Self {
            va_bits: 48,
            scratch_page: None,
            huge_pages: true,
            dir_cache: CacheLevel::WriteBack,
        }
    }
}

/// A hardware write the GPU-side update job must perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtWrite {
    /// Backing page of the table being written.
    pub table: DmaAddress,
    /// First slot written.
    pub first: usize,
    pub values: Vec<u64>,
}

/// One resolved translation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Translation {
    pub addr: DmaAddress,
    /// Level of the leaf that produced the translation.
    pub level: u32,
    pub page_size: u64,
    pub attrs: PteAttrs,
}

/// Outcome of [`PageTable::unbind`].
#[derive(Debug, Default)]
pub struct UnbindResult {
    pub writes: Vec<PtWrite>,
    /// Leaf entries cleared; a huge leaf counts once.
    pub cleared: usize,
}

enum Staged {
    Leaf(u64),
    Table(Box<PtNode>),
}

/// Writes destined for consecutive slots of one live node.
pub struct PendingUpdate {
    path: Vec<usize>,
    first: usize,
    entries: Vec<Staged>,
}

impl PendingUpdate {
    /// Slot indices leading from the root to the target node.
    #[must_use]
    pub fn path(&self) -> &[usize] {
        &self.path
    }

    #[must_use]
    pub const fn first(&self) -> usize {
        self.first
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newly built child tables carried by this update.
    #[must_use]
    pub fn new_tables(&self) -> usize {
        self.entries
            .iter()
            .map(|e| match e {
                Staged::Leaf(_) => 0,
                Staged::Table(t) => t.count_tables(),
            })
            .sum()
    }
}

/// The staged half of a bind. Dropping it aborts the bind.
pub struct PreparedBind {
    table_id: u64,
    generation: u64,
    range: VaRange,
    updates: Vec<PendingUpdate>,
}

impl PreparedBind {
    #[must_use]
    pub const fn range(&self) -> VaRange {
        self.range
    }

    #[must_use]
    pub fn updates(&self) -> &[PendingUpdate] {
        &self.updates
    }

    #[must_use]
    pub fn new_tables(&self) -> usize {
        self.updates.iter().map(PendingUpdate::new_tables).sum()
    }
}

struct BindCtx<'a> {
    base: u64,
    offset: u64,
    src: &'a dyn DmaSource,
    attrs: PteAttrs,
    huge_pages: bool,
    alloc: &'a Arc<dyn TableAllocator>,
    empty_leaf: u64,
    dir_cache: CacheLevel,
}

impl BindCtx<'_> {
    fn source_offset(&self, va: u64) -> u64 {
        self.offset + (va - self.base)
    }

    fn pte(&self, va: u64) -> u64 {
        encode_pte(self.src.dma_address(self.source_offset(va)), self.attrs)
    }

    fn huge(&self, level: u32, start: u64, end: u64) -> Option<u64> {
        if !self.huge_pages || level == 0 || level > MAX_HUGE_LEVEL || !covers_slot(start, end, level) {
            return None;
        }
        let span = entry_span(level);
        let off = self.source_offset(start);
        let dma = self.src.dma_address(off);
        if dma.as_u64() % span != 0 || !self.src.is_contiguous(off, span) {
            return None;
        }
        Some(encode_huge(dma, self.attrs))
    }

    fn empty_for(&self, level: u32) -> u64 {
        if level == 0 { self.empty_leaf } else { 0 }
    }
}

#[derive(Default)]
struct WriteLog {
    writes: Vec<PtWrite>,
}

impl WriteLog {
    fn push(&mut self, table: DmaAddress, idx: usize, value: u64) {
        if let Some(last) = self.writes.last_mut() {
            if last.table == table && last.first + last.values.len() == idx {
                last.values.push(value);
                return;
            }
        }
        self.writes.push(PtWrite {
            table,
            first: idx,
            values: vec![value],
        });
    }

    /// Whole-table writes for a new subtree, children before parents.
    fn table(&mut self, node: &PtNode) {
        for child in node.children() {
            self.table(child);
        }
        self.writes.push(PtWrite {
            table: node.page(),
            first: 0,
            values: node.entries().to_vec(),
        });
    }
}

/// The translation tree of one tile.
pub struct PageTable {
    id: u64,
    root: Box<PtNode>,
    alloc: Arc<dyn TableAllocator>,
    config: PtConfig,
    limit: u64,
    empty_leaf: u64,
    generation: u64,
}

impl PageTable {
    /// Creates the tree with an empty root directory.
    ///
    /// # Errors
    /// [`PtError::OutOfMemory`] if the root page cannot be allocated.
    pub fn new(alloc: Arc<dyn TableAllocator>, config: PtConfig) -> Result<Self, PtError> {
        let root_level = root_level_for(config.va_bits);
        let root = Box::new(PtNode::new(&alloc, root_level, 0)?);
        let empty_leaf = config.scratch_page.map_or(0, |scratch| {
            encode_pte(scratch, PteAttrs::read_write().with_writable(false))
        });
        let id = NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed);
        debug!("pt{id}: root level {root_level} at {:?}", root.page());
        Ok(Self {
            id,
            root,
            alloc,
            config,
            limit: 1 << config.va_bits,
            empty_leaf,
            generation: 0,
        })
    }

    /// Address programmed into the hardware translation-root register.
    #[must_use]
    pub fn root_address(&self) -> DmaAddress {
        self.root.page()
    }

    #[must_use]
    pub fn root(&self) -> &PtNode {
        &self.root
    }

    #[must_use]
    pub const fn config(&self) -> &PtConfig {
        &self.config
    }

    /// Bumped on every committed mutation.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    fn check_range(&self, range: VaRange) -> Result<(), PtError> {
        if !range.is_aligned::<Size4K>() {
            return Err(PtError::Unaligned(range));
        }
        if range.end().as_u64() > self.limit {
            return Err(PtError::OutOfRange(range));
        }
        Ok(())
    }

    /// Stages a bind of `range` to `src` starting at byte `offset`.
    ///
    /// # Errors
    /// [`PtError::Unaligned`] / [`PtError::OutOfRange`] for bad ranges,
    /// [`PtError::OutOfMemory`] if a table allocation fails. On error every
    /// table allocated so far has been released again.
    pub fn prepare_bind(
        &self,
        range: VaRange,
        offset: u64,
        src: &dyn DmaSource,
        attrs: PteAttrs,
    ) -> Result<PreparedBind, PtError> {
        self.check_range(range)?;
        let ctx = BindCtx {
            base: range.start().as_u64(),
            offset,
            src,
            attrs,
            huge_pages: self.config.huge_pages,
            alloc: &self.alloc,
            empty_leaf: self.empty_leaf,
            dir_cache: self.config.dir_cache,
        };
        let mut updates = Vec::new();
        stage(&self.root, &mut Vec::new(), range.start().as_u64(), range.end().as_u64(), &ctx, &mut updates)?;
        let prepared = PreparedBind {
            table_id: self.id,
            generation: self.generation,
            range,
            updates,
        };
        trace!(
            "pt{}: prepared {range} with {} updates, {} new tables",
            self.id,
            prepared.updates.len(),
            prepared.new_tables()
        );
        Ok(prepared)
    }

    /// Splices a prepared bind into the live tree.
    ///
    /// # Errors
    /// [`PtError::Stale`] if `prepared` was built against another tree or
    /// the tree changed since; nothing is modified in that case.
    pub fn commit(&mut self, prepared: PreparedBind) -> Result<Vec<PtWrite>, PtError> {
        if prepared.table_id != self.id || prepared.generation != self.generation {
            return Err(PtError::Stale);
        }
        let mut log = WriteLog::default();
        let cache = self.config.dir_cache;
        for update in prepared.updates {
            let node = node_at_mut(&mut self.root, &update.path).ok_or(PtError::Stale)?;
            for (i, staged) in update.entries.into_iter().enumerate() {
                let idx = update.first + i;
                match staged {
                    Staged::Leaf(value) => node.set_leaf(idx, value),
                    Staged::Table(child) => {
                        log.table(&child);
                        node.set_child(idx, child, cache);
                    }
                }
                log.push(node.page(), idx, node.entry(idx));
            }
        }
        self.generation += 1;
        debug!("pt{}: committed {}, {} writes", self.id, prepared.range, log.writes.len());
        Ok(log.writes)
    }

    /// `prepare_bind` followed by `commit`.
    ///
    /// # Errors
    /// As [`prepare_bind`](Self::prepare_bind).
    pub fn bind(
        &mut self,
        range: VaRange,
        offset: u64,
        src: &dyn DmaSource,
        attrs: PteAttrs,
    ) -> Result<Vec<PtWrite>, PtError> {
        let prepared = self.prepare_bind(range, offset, src, attrs)?;
        self.commit(prepared)
    }

    /// Clears every translation in `range`.
    ///
    /// Fully covered child tables are destroyed, as is any child left
    /// without live entries. The root is never destroyed.
    ///
    /// # Errors
    /// Range errors, or [`PtError::OutOfMemory`] if a huge leaf straddling
    /// the range boundary cannot be split; the tree is unchanged then.
    pub fn unbind(&mut self, range: VaRange) -> Result<UnbindResult, PtError> {
        self.check_range(range)?;
        let (start, end) = (range.start().as_u64(), range.end().as_u64());

        let mut splits = HashMap::new();
        plan_splits(&self.root, start, end, &self.alloc, self.empty_leaf, &mut splits)?;

        let mut log = WriteLog::default();
        let cleared = clear(&mut self.root, start, end, &mut splits, self.config.dir_cache, &mut log)?;
        self.generation += 1;
        debug!("pt{}: unbound {range}, {cleared} entries cleared", self.id);
        Ok(UnbindResult {
            writes: log.writes,
            cleared,
        })
    }

    /// Effective translation of `va`, if mapped.
    #[must_use]
    pub fn translate(&self, va: GpuAddress) -> Option<Translation> {
        let va = va.as_u64();
        if va >= self.limit {
            return None;
        }
        let mut node = &*self.root;
        loop {
            let idx = slot_index(va, node.level());
            if !node.is_live(idx) {
                return None;
            }
            if let Some(child) = node.child(idx) {
                node = child;
                continue;
            }
            return match EntryView::decode(node.level(), node.entry(idx)) {
                EntryView::Page { addr, attrs } | EntryView::Huge { addr, attrs } => {
                    let span = entry_span(node.level());
                    Some(Translation {
                        addr: addr + (va & (span - 1)),
                        level: node.level(),
                        page_size: span,
                        attrs,
                    })
                }
                EntryView::Empty | EntryView::Table(_) => None,
            };
        }
    }

    /// Live leaf entries intersecting `range`; a huge leaf counts once.
    #[must_use]
    pub fn live_entries(&self, range: VaRange) -> usize {
        count_live(&self.root, range.start().as_u64(), range.end().as_u64().min(self.limit))
    }

    /// Tables currently in the tree, root included.
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.root.count_tables()
    }
}

fn node_at_mut<'a>(root: &'a mut PtNode, path: &[usize]) -> Option<&'a mut PtNode> {
    let mut node = root;
    for &idx in path {
        node = node.child_mut(idx)?;
    }
    Some(node)
}

fn push_staged(out: &mut Vec<PendingUpdate>, path: &[usize], idx: usize, staged: Staged) {
    if let Some(last) = out.last_mut() {
        if last.path == path && last.first + last.entries.len() == idx {
            last.entries.push(staged);
            return;
        }
    }
    out.push(PendingUpdate {
        path: path.to_vec(),
        first: idx,
        entries: vec![staged],
    });
}

/// Replicates a huge leaf one level down.
fn split_huge(
    alloc: &Arc<dyn TableAllocator>,
    parent_level: u32,
    addr: DmaAddress,
    attrs: PteAttrs,
    empty: u64,
) -> Result<PtNode, PtError> {
    let level = parent_level - 1;
    let mut node = PtNode::new(alloc, level, empty)?;
    let span = entry_span(level);
    let mut leaf = addr;
    for i in 0..crate::walk::ENTRIES {
        node.set_leaf(i, encode_leaf(level, leaf, attrs));
        leaf = leaf + span;
    }
    Ok(node)
}

/// A fresh child for a slot that holds no table: empty, or a split huge leaf.
fn new_child(node: &PtNode, idx: usize, ctx: &BindCtx<'_>) -> Result<PtNode, PtError> {
    let level = node.level();
    if node.is_live(idx) {
        if let EntryView::Huge { addr, attrs } = EntryView::decode(level, node.entry(idx)) {
            return split_huge(ctx.alloc, level, addr, attrs, ctx.empty_for(level - 1));
        }
    }
    PtNode::new(ctx.alloc, level - 1, ctx.empty_for(level - 1))
}

/// Read-only walk over live nodes; collects the writes into `out`.
fn stage(
    node: &PtNode,
    path: &mut Vec<usize>,
    start: u64,
    end: u64,
    ctx: &BindCtx<'_>,
    out: &mut Vec<PendingUpdate>,
) -> Result<(), PtError> {
    let level = node.level();
    for slot in Slots::new(start, end, level) {
        if level == 0 {
            push_staged(out, path, slot.index, Staged::Leaf(ctx.pte(slot.start)));
            continue;
        }
        if let Some(huge) = ctx.huge(level, slot.start, slot.end) {
            push_staged(out, path, slot.index, Staged::Leaf(huge));
            continue;
        }
        if let Some(child) = node.child(slot.index) {
            path.push(slot.index);
            stage(child, path, slot.start, slot.end, ctx, out)?;
            path.pop();
            continue;
        }
        let mut child = new_child(node, slot.index, ctx)?;
        fill(&mut child, slot.start, slot.end, ctx)?;
        push_staged(out, path, slot.index, Staged::Table(Box::new(child)));
    }
    Ok(())
}

/// Populates a node that is not yet part of the live tree.
fn fill(node: &mut PtNode, start: u64, end: u64, ctx: &BindCtx<'_>) -> Result<(), PtError> {
    let level = node.level();
    for slot in Slots::new(start, end, level) {
        if level == 0 {
            node.set_leaf(slot.index, ctx.pte(slot.start));
            continue;
        }
        if let Some(huge) = ctx.huge(level, slot.start, slot.end) {
            node.set_leaf(slot.index, huge);
            continue;
        }
        if let Some(child) = node.child_mut(slot.index) {
            fill(child, slot.start, slot.end, ctx)?;
            continue;
        }
        let mut child = new_child(node, slot.index, ctx)?;
        fill(&mut child, slot.start, slot.end, ctx)?;
        node.set_child(slot.index, Box::new(child), ctx.dir_cache);
    }
    Ok(())
}

/// Key of a huge leaf that an unbind must split: its level and base address.
type SplitKey = (u32, u64);

/// Pre-allocates the split tables an unbind will need so that the mutating
/// pass cannot fail halfway.
fn plan_splits(
    node: &PtNode,
    start: u64,
    end: u64,
    alloc: &Arc<dyn TableAllocator>,
    empty_leaf: u64,
    splits: &mut HashMap<SplitKey, PtNode>,
) -> Result<(), PtError> {
    let level = node.level();
    if level == 0 {
        return Ok(());
    }
    for slot in Slots::new(start, end, level) {
        if !node.is_live(slot.index) || covers_slot(slot.start, slot.end, level) {
            continue;
        }
        if let Some(child) = node.child(slot.index) {
            plan_splits(child, slot.start, slot.end, alloc, empty_leaf, splits)?;
        } else if let EntryView::Huge { addr, attrs } = EntryView::decode(level, node.entry(slot.index)) {
            let empty = if level == 1 { empty_leaf } else { 0 };
            let child = split_huge(alloc, level, addr, attrs, empty)?;
            // A 1 GiB split can leave a straddling 2 MiB leaf that needs its own split.
            plan_splits(&child, slot.start, slot.end, alloc, empty_leaf, splits)?;
            let base = slot.start & !(entry_span(level) - 1);
            splits.insert((level, base), child);
        }
    }
    Ok(())
}

fn clear(
    node: &mut PtNode,
    start: u64,
    end: u64,
    splits: &mut HashMap<SplitKey, PtNode>,
    dir_cache: CacheLevel,
    log: &mut WriteLog,
) -> Result<usize, PtError> {
    let level = node.level();
    let mut cleared = 0;
    for slot in Slots::new(start, end, level) {
        let idx = slot.index;
        if !node.is_live(idx) {
            continue;
        }
        if level == 0 {
            node.clear(idx);
            log.push(node.page(), idx, node.entry(idx));
            cleared += 1;
            continue;
        }
        let full = covers_slot(slot.start, slot.end, level);
        if let Some(child) = node.child_mut(idx) {
            if full {
                cleared += child.count_leaves();
            } else {
                cleared += clear(child, slot.start, slot.end, splits, dir_cache, log)?;
                if child.num_live() > 0 {
                    continue;
                }
            }
            node.clear(idx);
            log.push(node.page(), idx, node.entry(idx));
            continue;
        }
        if full {
            node.clear(idx);
            log.push(node.page(), idx, node.entry(idx));
            cleared += 1;
            continue;
        }
        let base = slot.start & !(entry_span(level) - 1);
        let mut child = splits.remove(&(level, base)).ok_or(PtError::Stale)?;
        cleared += clear(&mut child, slot.start, slot.end, splits, dir_cache, log)?;
        log.table(&child);
        node.set_child(idx, Box::new(child), dir_cache);
        log.push(node.page(), idx, node.entry(idx));
    }
    Ok(cleared)
}

fn count_live(node: &PtNode, start: u64, end: u64) -> usize {
    if start >= end {
        return 0;
    }
    let level = node.level();
    let table_span = 1u64.checked_shl(level_shift(level) + 9).unwrap_or(u64::MAX);
    let table_base = start & !(table_span - 1);
    let mut total = 0;
    // Clamp to the part of the range this table translates.
    let end = end.min(table_base.saturating_add(table_span));
    for slot in Slots::new(start, end, level) {
        if !node.is_live(slot.index) {
            continue;
        }
        total += node
            .child(slot.index)
            .map_or(1, |child| count_live(child, slot.start, slot.end));
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BumpTableAllocator;

    fn table() -> (Arc<BumpTableAllocator>, PageTable) {
        let bump = Arc::new(BumpTableAllocator::new(
            DmaAddress::new(0x1_0000_0000),
            DmaAddress::new(0x1_1000_0000),
        ));
        let pt = PageTable::new(bump.clone(), PtConfig::default()).unwrap();
        (bump, pt)
    }

    fn range(start: u64, len: u64) -> VaRange {
        VaRange::from_len(GpuAddress::new(start), len).unwrap()
    }

    #[test]
    fn bind_then_translate_4k() {
        let (_, mut pt) = table();
        let src = Contiguous(DmaAddress::new(0x8000_0000));
        pt.bind(range(0x10000, 0x3000), 0, &src, PteAttrs::read_write()).unwrap();
        let t = pt.translate(GpuAddress::new(0x11234)).unwrap();
        assert_eq!(t.addr, DmaAddress::new(0x8000_1234));
        assert_eq!(t.level, 0);
        assert!(pt.translate(GpuAddress::new(0x13000)).is_none());
        assert_eq!(pt.live_entries(range(0, 1 << 30)), 3);
        // root + L2 + L1 + L0
        assert_eq!(pt.table_count(), 4);
    }

    #[test]
    fn stale_prepare_is_rejected() {
        let (bump, mut pt) = table();
        let src = Contiguous(DmaAddress::new(0x8000_0000));
        let a = pt.prepare_bind(range(0, 0x1000), 0, &src, PteAttrs::read_write()).unwrap();
        let b = pt.prepare_bind(range(0x1000, 0x1000), 0x1000, &src, PteAttrs::read_write()).unwrap();
        pt.commit(a).unwrap();
        assert_eq!(pt.commit(b), Err(PtError::Stale));
        // b's staged tables went back to the allocator.
        assert_eq!(bump.live_tables(), pt.table_count());
    }

    #[test]
    fn scratch_page_backs_cleared_leaves() {
        let bump: Arc<dyn TableAllocator> =
            Arc::new(BumpTableAllocator::new(DmaAddress::new(0x1000_0000), DmaAddress::new(0x2000_0000)));
        let scratch = DmaAddress::new(0xF000);
        let cfg = PtConfig {
            scratch_page: Some(scratch),
            ..PtConfig::default()
        };
        let mut pt = PageTable::new(bump, cfg).unwrap();
        let src = Contiguous(DmaAddress::new(0x8000_0000));
        pt.bind(range(0, 0x2000), 0, &src, PteAttrs::read_write()).unwrap();
        pt.unbind(range(0, 0x1000)).unwrap();

        let leaf = pt.root().child(0).and_then(|d| d.child(0)).and_then(|d| d.child(0)).unwrap();
        assert!(matches!(EntryView::decode(0, leaf.entry(0)), EntryView::Page { addr, attrs } if addr == scratch && !attrs.writable));
        assert!(pt.translate(GpuAddress::new(0)).is_none());
        assert!(pt.translate(GpuAddress::new(0x1000)).is_some());
    }
}
