//! # Hardware entry formats
//!
//! Every table is one 4 KiB page of 512 little-endian `u64` entries. Three
//! entry shapes exist:
//!
//! | Shape | Where | Bit 7 | Address bits |
//! |-------|-------|-------|--------------|
//! | [`PteBits`] | level 0 | PAT (write-back selector) | `[51:12]` of a 4 KiB page |
//! | [`PdeBits`] | levels 1..=3 | PS = 0 | `[51:12]` of the child table |
//! | [`HugePteBits`] | levels 1, 2 | PS = 1 | `[51:21]` of a 2 MiB / 1 GiB page |
//!
//! ### Cache classes
//!
//! | [`CacheLevel`] | 4 KiB leaf | huge leaf | directory |
//! |----------------|------------|-----------|-----------|
//! | `None` | PWT + PCD | PWT + PCD | PWT + PCD |
//! | `WriteThrough` | PCD | PCD | (write-back) |
//! | `WriteBack` | PAT (bit 7) | PAT (bit 12) | nothing |
//!
//! Bit 11 marks device-local memory on leaves. An all-zero entry is empty.

use bitfield_struct::bitfield;
use gpu_addresses::DmaAddress;

/// Cacheability class of a mapping.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum CacheLevel {
    None,
    WriteThrough,
    #[default]
    WriteBack,
}

/// Per-mapping leaf attributes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PteAttrs {
    pub writable: bool,
    pub cache: CacheLevel,
    /// Backing memory lives in device-local memory (VRAM).
    pub local_memory: bool,
}

impl PteAttrs {
    #[inline]
    #[must_use]
    pub const fn read_write() -> Self {
        Self {
            writable: true,
            cache: CacheLevel::WriteBack,
            local_memory: false,
        }
    }

    #[inline]
    #[must_use]
    pub const fn with_writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    #[inline]
    #[must_use]
    pub const fn with_local_memory(mut self, local: bool) -> Self {
        self.local_memory = local;
        self
    }

    #[inline]
    #[must_use]
    pub const fn with_cache(mut self, cache: CacheLevel) -> Self {
        self.cache = cache;
        self
    }
}

impl Default for PteAttrs {
    fn default() -> Self {
        Self::read_write()
    }
}

/// 4 KiB leaf entry (level 0).
#[bitfield(u64)]
pub struct PteBits {
    /// Present (bit 0).
    pub present: bool,
    /// Writable (bit 1); clear for read-only mappings.
    pub writable: bool,
    #[bits(1)]
    __res2: u8,
    /// Page write-through (bit 3).
    pub pwt: bool,
    /// Page cache disable (bit 4).
    pub pcd: bool,
    #[bits(2)]
    __res5_6: u8,
    /// PAT (bit 7): selects the write-back entry.
    pub pat: bool,
    #[bits(3)]
    __res8_10: u8,
    /// Device-local memory (bit 11).
    pub local_memory: bool,
    /// Page address bits `[51:12]`.
    #[bits(40)]
    addr_51_12: u64,
    #[bits(12)]
    __res52_63: u16,
}

/// Directory entry pointing at a child table (levels 1..=3, PS = 0).
#[bitfield(u64)]
pub struct PdeBits {
    pub present: bool,
    pub writable: bool,
    #[bits(1)]
    __res2: u8,
    pub pwt: bool,
    pub pcd: bool,
    #[bits(2)]
    __res5_6: u8,
    /// Page size (bit 7): always clear for a table pointer.
    pub page_size: bool,
    #[bits(4)]
    __res8_11: u8,
    /// Child table address bits `[51:12]`.
    #[bits(40)]
    addr_51_12: u64,
    #[bits(12)]
    __res52_63: u16,
}

/// Huge leaf entry (2 MiB at level 1, 1 GiB at level 2, PS = 1).
#[bitfield(u64)]
pub struct HugePteBits {
    pub present: bool,
    pub writable: bool,
    #[bits(1)]
    __res2: u8,
    pub pwt: bool,
    pub pcd: bool,
    #[bits(2)]
    __res5_6: u8,
    /// Page size (bit 7): always set.
    pub page_size: bool,
    #[bits(3)]
    __res8_10: u8,
    pub local_memory: bool,
    /// PAT for large pages (bit 12).
    pub pat: bool,
    #[bits(8)]
    __res13_20: u8,
    /// Page address bits `[51:21]`.
    #[bits(31)]
    addr_51_21: u64,
    #[bits(12)]
    __res52_63: u16,
}

impl PteBits {
    #[inline]
    #[must_use]
    pub const fn address(&self) -> DmaAddress {
        DmaAddress::new(self.addr_51_12() << 12)
    }
}

impl PdeBits {
    #[inline]
    #[must_use]
    pub const fn address(&self) -> DmaAddress {
        DmaAddress::new(self.addr_51_12() << 12)
    }
}

impl HugePteBits {
    #[inline]
    #[must_use]
    pub const fn address(&self) -> DmaAddress {
        DmaAddress::new(self.addr_51_21() << 21)
    }
}

const PAGE_SIZE_BIT: u64 = 1 << 7;

/// Encodes a 4 KiB leaf entry.
#[must_use]
pub const fn encode_pte(addr: DmaAddress, attrs: PteAttrs) -> u64 {
    debug_assert!(addr.as_u64() & 0xFFF == 0);
    let e = PteBits::new()
        .with_present(true)
        .with_writable(attrs.writable)
        .with_local_memory(attrs.local_memory)
        .with_addr_51_12(addr.as_u64() >> 12);
    let e = match attrs.cache {
        CacheLevel::None => e.with_pwt(true).with_pcd(true),
        CacheLevel::WriteThrough => e.with_pcd(true),
        CacheLevel::WriteBack => e.with_pat(true),
    };
    e.into_bits()
}

/// Encodes a directory entry for a child table.
#[must_use]
pub const fn encode_pde(table: DmaAddress, cache: CacheLevel) -> u64 {
    debug_assert!(table.as_u64() & 0xFFF == 0);
    let e = PdeBits::new()
        .with_present(true)
        .with_writable(true)
        .with_addr_51_12(table.as_u64() >> 12);
    let e = match cache {
        CacheLevel::None => e.with_pwt(true).with_pcd(true),
        CacheLevel::WriteThrough | CacheLevel::WriteBack => e,
    };
    e.into_bits()
}

/// Encodes a huge leaf. `addr` must be aligned to the level's span.
#[must_use]
pub const fn encode_huge(addr: DmaAddress, attrs: PteAttrs) -> u64 {
    debug_assert!(addr.as_u64() & ((1 << 21) - 1) == 0);
    let e = HugePteBits::new()
        .with_present(true)
        .with_writable(attrs.writable)
        .with_page_size(true)
        .with_local_memory(attrs.local_memory)
        .with_addr_51_21(addr.as_u64() >> 21);
    let e = match attrs.cache {
        CacheLevel::None => e.with_pwt(true).with_pcd(true),
        CacheLevel::WriteThrough => e.with_pcd(true),
        CacheLevel::WriteBack => e.with_pat(true),
    };
    e.into_bits()
}

/// Encodes a leaf at `level`: a 4 KiB entry at level 0, a huge one above.
#[must_use]
pub const fn encode_leaf(level: u32, addr: DmaAddress, attrs: PteAttrs) -> u64 {
    if level == 0 {
        encode_pte(addr, attrs)
    } else {
        encode_huge(addr, attrs)
    }
}

/// Typed view of a raw entry, as interpreted at a given level.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EntryView {
    Empty,
    Table(DmaAddress),
    Page { addr: DmaAddress, attrs: PteAttrs },
    Huge { addr: DmaAddress, attrs: PteAttrs },
}

impl EntryView {
    #[must_use]
    pub const fn decode(level: u32, raw: u64) -> Self {
        if raw & 1 == 0 {
            return Self::Empty;
        }
        if level == 0 {
            let e = PteBits::from_bits(raw);
            return Self::Page {
                addr: e.address(),
                attrs: PteAttrs {
                    writable: e.writable(),
                    cache: cache_of(e.pwt(), e.pcd()),
                    local_memory: e.local_memory(),
                },
            };
        }
        if raw & PAGE_SIZE_BIT == 0 {
            return Self::Table(PdeBits::from_bits(raw).address());
        }
        let e = HugePteBits::from_bits(raw);
        Self::Huge {
            addr: e.address(),
            attrs: PteAttrs {
                writable: e.writable(),
                cache: cache_of(e.pwt(), e.pcd()),
                local_memory: e.local_memory(),
            },
        }
    }
}

const fn cache_of(pwt: bool, pcd: bool) -> CacheLevel {
    match (pwt, pcd) {
        (true, true) => CacheLevel::None,
        (false, true) => CacheLevel::WriteThrough,
        _ => CacheLevel::WriteBack,
    }
}
