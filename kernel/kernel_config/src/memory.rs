//! Memory layout constants.

/// The lower 12 bits of an address correspond to the page offset.
pub const PAGE_SHIFT: usize = 12;
/// Page size is 4096 bytes, 4KiB pages.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
