use crate::mem::PAGE_FRAME_SIZE;

pub const KB: usize = 1024;
pub const SECTOR_SIZE: u32 = 512;

/// Number of consecutive sectors backing one swap slot.
pub const SECTORS_PER_PAGE: u32 = PAGE_FRAME_SIZE as u32 / SECTOR_SIZE;
