//! Simulated machines for tests.

use crate::block::block_core::{block_init, BlockManager};
use crate::mem::ram::Ram;
use crate::mem::user_pool::UserPool;
use crate::paging::{PageMapper, SoftPageDirectory};
use crate::sync::mutex::Mutex;
use crate::vm::file::{FileRef, MemFile};
use alloc::{boxed::Box, sync::Arc};
use core::sync::atomic::{AtomicBool, Ordering};
use kidneyos_vm_shared::mem::{PhysAddr, VirtAddr, PAGE_FRAME_SIZE};
use kidneyos_vm_shared::sizes::SECTORS_PER_PAGE;

pub const RAM_BASE: PhysAddr = PhysAddr::new(0x0040_0000);

/// `frames` pages of user memory and a swap disk of `swap_slots` slots (none
/// if zero).
pub struct Machine {
    pub ram: Arc<Ram>,
    pub pool: Arc<UserPool>,
    pub blocks: BlockManager,
}

impl Machine {
    pub fn new(frames: usize, swap_slots: usize) -> Self {
        let ram = Arc::new(Ram::new(RAM_BASE, frames));
        let pool = Arc::new(UserPool::new(RAM_BASE, frames, ram.clone()));
        let sectors = u32::try_from(swap_slots).expect("slot count") * SECTORS_PER_PAGE;
        Self {
            ram,
            pool,
            blocks: block_init(sectors),
        }
    }

    /// Physical address of frame `i` of the machine.
    pub fn frame(&self, i: usize) -> PhysAddr {
        RAM_BASE + i * PAGE_FRAME_SIZE
    }

    pub fn read_frame(&self, frame: PhysAddr) -> [u8; PAGE_FRAME_SIZE] {
        use crate::mem::PhysicalMemory;
        let mut buf = [0; PAGE_FRAME_SIZE];
        self.ram.read_page(frame, &mut buf);
        buf
    }
}

pub fn file_with(data: &[u8]) -> FileRef {
    MemFile::new(data.to_vec()).into_ref()
}

/// A page directory the test keeps a handle to after giving a copy to an
/// address space. Installs can be made to fail.
#[derive(Clone, Default)]
pub struct TestMapper {
    pd: Arc<Mutex<SoftPageDirectory>>,
    refuse: Arc<AtomicBool>,
}

impl TestMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn boxed(&self) -> Box<dyn PageMapper + Send> {
        Box::new(self.clone())
    }

    /// Makes every later `set_mapping` fail while `refuse` is set.
    pub fn refuse_installs(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::Relaxed);
    }

    pub fn touch(&self, page: VirtAddr, write: bool) -> bool {
        self.pd.lock().touch(page, write)
    }

    pub fn set_accessed(&self, page: VirtAddr, accessed: bool) {
        self.pd.lock().set_accessed(page, accessed);
    }

    pub fn get(&self, page: VirtAddr) -> Option<PhysAddr> {
        self.pd.lock().get_mapping(page)
    }

    pub fn is_writable(&self, page: VirtAddr) -> Option<bool> {
        self.pd.lock().is_writable(page)
    }

    pub fn mapped_count(&self) -> usize {
        self.pd.lock().mapped_count()
    }
}

impl PageMapper for TestMapper {
    fn get_mapping(&self, page: VirtAddr) -> Option<PhysAddr> {
        self.pd.lock().get_mapping(page)
    }

    fn set_mapping(&mut self, page: VirtAddr, frame: PhysAddr, writable: bool) -> bool {
        if self.refuse.load(Ordering::Relaxed) {
            return false;
        }
        self.pd.lock().set_mapping(page, frame, writable)
    }

    fn clear_mapping(&mut self, page: VirtAddr) {
        self.pd.lock().clear_mapping(page);
    }

    fn is_accessed(&self, page: VirtAddr) -> bool {
        self.pd.lock().is_accessed(page)
    }

    fn is_dirty(&self, page: VirtAddr) -> bool {
        self.pd.lock().is_dirty(page)
    }
}
