use core::fmt;
use core::hash::Hash;

mod sealed {
    pub trait Sealed {}
}

/// Marker trait for the translation granules the page-table layout supports.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + Ord + Hash + fmt::Display + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE).
    const SHIFT: u32;
    /// Page-table level whose single entry maps one page of this size.
    const LEVEL: u32;

    fn as_str() -> &'static str;
}

macro_rules! page_size {
    ($(#[$meta:meta])* $name:ident, $shift:expr, $level:expr, $label:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;
            const LEVEL: u32 = $level;

            fn as_str() -> &'static str {
                $label
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Self::as_str())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(self, f)
            }
        }
    };
}

page_size!(
    /// 4 KiB leaf page (level 0).
    Size4K, 12, 0, "4K"
);
page_size!(
    /// 2 MiB huge page (level 1 leaf).
    Size2M, 21, 1, "2M"
);
page_size!(
    /// 1 GiB huge page (level 2 leaf).
    Size1G, 30, 2, "1G"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_follow_level_shift() {
        // Every level adds nine bits of index on top of the 4 KiB offset.
        assert_eq!(Size4K::SHIFT, 12 + 9 * Size4K::LEVEL);
        assert_eq!(Size2M::SHIFT, 12 + 9 * Size2M::LEVEL);
        assert_eq!(Size1G::SHIFT, 12 + 9 * Size1G::LEVEL);
        assert_eq!(Size2M::SIZE, 512 * Size4K::SIZE);
    }
}
