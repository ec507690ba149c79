//! The user page pool: a core map over a contiguous run of physical frames.

use super::{PageAllocator, PallocFlags, PhysicalMemory};
use crate::sync::mutex::Mutex;
use alloc::{boxed::Box, sync::Arc, vec};
use bitbybit::bitfield;
use kidneyos_vm_shared::mem::{PhysAddr, PAGE_FRAME_SIZE};

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    #[bit(1, rw)]
    user: bool,
}

struct CoreMap {
    entries: Box<[CoreMapEntry]>,
    /// The next frame number to start searching for free frames.
    position: usize,
    frames_allocated: usize,
}

impl CoreMap {
    fn next_fit(&mut self) -> Option<usize> {
        let total_frames = self.entries.len();
        let index = (0..total_frames)
            .map(|i| (self.position + i) % total_frames)
            .find(|&i| !self.entries[i].allocated())?;
        self.position = (index + 1) % total_frames;
        Some(index)
    }
}

/// Hands out the single frames of `[base, base + frames * PAGE_FRAME_SIZE)`.
pub struct UserPool {
    base: PhysAddr,
    core_map: Mutex<CoreMap>,
    memory: Arc<dyn PhysicalMemory>,
}

impl UserPool {
    /// `memory` must cover every frame of the pool; it is used to honour
    /// [`PallocFlags::zero`].
    pub fn new(base: PhysAddr, frames: usize, memory: Arc<dyn PhysicalMemory>) -> Self {
        assert!(base.is_page_aligned(), "unaligned pool base {base}");
        Self {
            base,
            core_map: Mutex::new(CoreMap {
                entries: vec![CoreMapEntry::default(); frames].into_boxed_slice(),
                position: 0,
                frames_allocated: 0,
            }),
            memory,
        }
    }

    pub fn capacity(&self) -> usize {
        self.core_map.lock().entries.len()
    }

    pub fn allocated(&self) -> usize {
        self.core_map.lock().frames_allocated
    }

    pub fn available(&self) -> usize {
        let core_map = self.core_map.lock();
        core_map.entries.len() - core_map.frames_allocated
    }

    fn index_of(&self, frame: PhysAddr) -> Option<usize> {
        frame
            .as_usize()
            .checked_sub(self.base.as_usize())
            .filter(|_| frame.is_page_aligned())
            .map(|ofs| ofs / PAGE_FRAME_SIZE)
    }
}

impl PageAllocator for UserPool {
    fn alloc_page(&self, flags: PallocFlags) -> Option<PhysAddr> {
        let frame = {
            let mut core_map = self.core_map.lock();
            let index = core_map.next_fit()?;
            core_map.entries[index] = CoreMapEntry::default()
                .with_allocated(true)
                .with_user(flags.user());
            core_map.frames_allocated += 1;
            self.base + index * PAGE_FRAME_SIZE
        };

        if flags.zero() {
            self.memory.zero_page(frame);
        }
        Some(frame)
    }

    fn free_page(&self, frame: PhysAddr) {
        let index = self
            .index_of(frame)
            .unwrap_or_else(|| panic!("frame {frame} not in user pool"));
        let mut core_map = self.core_map.lock();
        let entry = core_map
            .entries
            .get_mut(index)
            .unwrap_or_else(|| panic!("frame {frame} not in user pool"));
        assert!(entry.allocated(), "double free of frame {frame}");
        *entry = CoreMapEntry::default();
        core_map.frames_allocated -= 1;
    }
}
