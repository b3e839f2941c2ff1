//! # GPU page-table construction
//!
//! Builds and tears down the four-level translation tree a GPU walks for one
//! tile of a virtual address space.
//!
//! ## Layout
//!
//! | Level | VA bits | Entry span | Leaf allowed |
//! |-------|---------|------------|--------------|
//! | 3 (root for 48-bit) | `[47:39]` | 512 GiB | no |
//! | 2 | `[38:30]` | 1 GiB | yes (huge) |
//! | 1 | `[29:21]` | 2 MiB | yes (huge) |
//! | 0 | `[20:12]` | 4 KiB | yes |
//!
//! Smaller address spaces start the walk at a lower root level, see
//! [`walk::root_level_for`].
//!
//! ## Modules
//!
//! - [`entry`]: bit layouts of table entries ([`PteBits`], [`PdeBits`],
//!   [`HugePteBits`]) and their encoders.
//! - [`walk`]: level arithmetic and per-table slot iteration.
//! - [`PtNode`]: one table with its backing page and live bookkeeping.
//! - [`PageTable`]: the engine: two-phase bind, unbind, translation.
//! - [`TableAllocator`]: where backing pages come from.
//!
//! ## Example
//!
//! ```rust
//! # use std::sync::Arc;
//! # use gpu_addresses::*;
//! # use gpu_pgtable::*;
//! let alloc = Arc::new(BumpTableAllocator::new(DmaAddress::new(0x100_0000), DmaAddress::new(0x200_0000)));
//! let mut pt = PageTable::new(alloc, PtConfig::default()).unwrap();
//!
//! // 2 MiB, aligned on both sides: collapses into one level-1 leaf.
//! let range = VaRange::from_len(GpuAddress::new(0x20_0000), Size2M::SIZE).unwrap();
//! pt.bind(range, 0, &Contiguous(DmaAddress::new(0x4000_0000)), PteAttrs::read_write()).unwrap();
//! let t = pt.translate(GpuAddress::new(0x20_1234)).unwrap();
//! assert_eq!(t.level, 1);
//! assert_eq!(t.addr, DmaAddress::new(0x4000_1234));
//! ```

mod alloc;
pub mod entry;
mod error;
mod node;
mod table;
pub mod walk;

pub use alloc::{BumpTableAllocator, TableAllocator};
pub use entry::{CacheLevel, EntryView, HugePteBits, PdeBits, PteAttrs, PteBits};
pub use error::PtError;
pub use node::PtNode;
pub use table::{
    Contiguous, DmaSource, PageTable, PendingUpdate, PreparedBind, PtConfig, PtWrite, Translation, UnbindResult,
};
