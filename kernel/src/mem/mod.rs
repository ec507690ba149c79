//! Physical memory: the page allocator and physical memory contracts, their
//! host implementations, and the frame table that hands user pages out.

pub mod frame_table;
pub mod ram;
pub mod user_pool;

use bitbybit::bitfield;
use kidneyos_vm_shared::mem::{PhysAddr, PAGE_FRAME_SIZE};

/// Contents of one physical frame.
pub type PageBuf = [u8; PAGE_FRAME_SIZE];

/// Flags for [`PageAllocator::alloc_page`].
#[bitfield(u8, default = 0)]
pub struct PallocFlags {
    /// Zero the page before returning it.
    #[bit(1, rw)]
    zero: bool,
    /// Take the page from the user pool.
    #[bit(2, rw)]
    user: bool,
}

impl PallocFlags {
    pub fn user_page() -> Self {
        Self::default().with_user(true)
    }
}

/// The raw physical page allocator.
pub trait PageAllocator: Send + Sync {
    /// Returns a free page, or `None` if the pool is exhausted.
    fn alloc_page(&self, flags: PallocFlags) -> Option<PhysAddr>;

    /// Returns `frame` to the pool. Freeing a page that is not allocated is a
    /// defect.
    fn free_page(&self, frame: PhysAddr);
}

/// Access to the contents of physical frames.
pub trait PhysicalMemory: Send + Sync {
    fn read_page(&self, frame: PhysAddr, buf: &mut PageBuf);

    fn write_page(&self, frame: PhysAddr, buf: &PageBuf);

    fn zero_page(&self, frame: PhysAddr) {
        self.write_page(frame, &[0; PAGE_FRAME_SIZE]);
    }
}
