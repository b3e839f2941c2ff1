//! Backing pages for page-table nodes.

use gpu_addresses::DmaAddress;
use parking_lot::Mutex;

/// Provider of GPU-addressable 4 KiB pages that hold page tables.
///
/// Allocation may fail; the engine unwinds the current operation when it
/// does. Freed pages may be handed out again.
pub trait TableAllocator: Send + Sync {
    /// Allocate one zeroed, 4 KiB-aligned page for a table at `level`.
    fn alloc_table(&self, level: u32) -> Option<DmaAddress>;

    /// Return a page obtained from [`alloc_table`](Self::alloc_table).
    fn free_table(&self, addr: DmaAddress);
}

struct BumpState {
    next: u64,
    end: u64,
    free: Vec<DmaAddress>,
    live: usize,
    budget: Option<usize>,
}

/// Bump allocator over a fixed window of device memory with a free list.
///
/// An optional *budget* caps how many more pages may be handed out, which
/// is how allocation failure is provoked deterministically.
pub struct BumpTableAllocator {
    state: Mutex<BumpState>,
}

const PAGE: u64 = 4096;

impl BumpTableAllocator {
    /// Pages are carved from `[start, end)`; both must be 4 KiB aligned.
    #[must_use]
    pub const fn new(start: DmaAddress, end: DmaAddress) -> Self {
        debug_assert!(start.as_u64() % PAGE == 0 && end.as_u64() % PAGE == 0);
        Self {
            state: Mutex::new(BumpState {
                next: start.as_u64(),
                end: end.as_u64(),
                free: Vec::new(),
                live: 0,
                budget: None,
            }),
        }
    }

    /// Pages currently handed out.
    #[must_use]
    pub fn live_tables(&self) -> usize {
        self.state.lock().live
    }

    /// Allow at most `pages` further allocations; `None` lifts the cap.
    pub fn set_budget(&self, pages: Option<usize>) {
        self.state.lock().budget = pages;
    }
}

impl TableAllocator for BumpTableAllocator {
    fn alloc_table(&self, _level: u32) -> Option<DmaAddress> {
        let mut st = self.state.lock();
        if let Some(budget) = st.budget.as_mut() {
            if *budget == 0 {
                return None;
            }
            *budget -= 1;
        }
        let addr = if let Some(addr) = st.free.pop() {
            addr
        } else {
            if st.next + PAGE > st.end {
                return None;
            }
            let addr = DmaAddress::new(st.next);
            st.next += PAGE;
            addr
        };
        st.live += 1;
        Some(addr)
    }

    fn free_table(&self, addr: DmaAddress) {
        let mut st = self.state.lock();
        debug_assert!(st.live > 0, "free without matching alloc");
        st.live -= 1;
        st.free.push(addr);
    }
}
