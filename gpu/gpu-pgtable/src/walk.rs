//! Address arithmetic for walking a range through one table level.
//!
//! ```text
//!  level 3        level 2        level 1        level 0        offset
//! [47:39] 9 bit  [38:30] 9 bit  [29:21] 9 bit  [20:12] 9 bit  [11:0] 12 bit
//! ```
//!
//! An entry at level `L` spans `1 << (12 + 9 * L)` bytes.

/// Entries per table.
pub const ENTRIES: usize = 512;

/// Shift of the 4 KiB base page.
pub const PAGE_SHIFT: u32 = 12;

/// Index bits contributed by each level.
pub const LEVEL_BITS: u32 = 9;

/// Highest level the layout supports (48-bit address spaces).
pub const MAX_ROOT_LEVEL: u32 = 3;

/// Highest level that may hold a huge leaf (1 GiB).
pub const MAX_HUGE_LEVEL: u32 = 2;

/// log2 of the span of one entry at `level`.
#[inline]
#[must_use]
pub const fn level_shift(level: u32) -> u32 {
    PAGE_SHIFT + LEVEL_BITS * level
}

/// Bytes mapped by one entry at `level`.
#[inline]
#[must_use]
pub const fn entry_span(level: u32) -> u64 {
    1 << level_shift(level)
}

/// Slot of `addr` within the table at `level`.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn slot_index(addr: u64, level: u32) -> usize {
    // masked to nine bits before narrowing
    ((addr >> level_shift(level)) & (ENTRIES as u64 - 1)) as usize
}

/// End of the piece of `[addr, end)` that falls in `addr`'s slot at `level`.
#[inline]
#[must_use]
pub const fn slot_end(addr: u64, end: u64, level: u32) -> u64 {
    let span = entry_span(level);
    let boundary = (addr & !(span - 1)).saturating_add(span);
    if boundary < end { boundary } else { end }
}

/// Whether `[start, end)` covers the whole slot it starts in at `level`.
#[inline]
#[must_use]
pub const fn covers_slot(start: u64, end: u64, level: u32) -> bool {
    let span = entry_span(level);
    start & (span - 1) == 0 && end - start == span
}

/// Root level needed to translate `va_bits` of address space.
///
/// # Panics
/// If `va_bits` exceeds what [`MAX_ROOT_LEVEL`] tables can translate or is
/// smaller than a single 4 KiB page table.
#[must_use]
pub const fn root_level_for(va_bits: u32) -> u32 {
    assert!(va_bits > PAGE_SHIFT + LEVEL_BITS - 1 && va_bits <= level_shift(MAX_ROOT_LEVEL + 1));
    (va_bits - PAGE_SHIFT).div_ceil(LEVEL_BITS) - 1
}

/// One slot's share of a range.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SlotRange {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

/// Iterates the slots a range touches within one table at `level`.
///
/// The range must not leave the table that contains `start`.
pub struct Slots {
    addr: u64,
    end: u64,
    level: u32,
}

impl Slots {
    #[must_use]
    pub const fn new(start: u64, end: u64, level: u32) -> Self {
        Self { addr: start, end, level }
    }
}

impl Iterator for Slots {
    type Item = SlotRange;

    fn next(&mut self) -> Option<SlotRange> {
        if self.addr >= self.end {
            return None;
        }
        let start = self.addr;
        let end = slot_end(start, self.end, self.level);
        self.addr = end;
        Some(SlotRange {
            index: slot_index(start, self.level),
            start,
            end,
        })
    }
}
