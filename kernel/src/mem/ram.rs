use super::{PageBuf, PhysicalMemory};
use crate::sync::mutex::Mutex;
use alloc::{boxed::Box, vec::Vec};
use kidneyos_vm_shared::mem::{PhysAddr, PAGE_FRAME_SIZE};

/// Physical memory simulated with one heap buffer per frame.
///
/// Covers `frames` pages starting at `base`. Touching a frame outside that
/// range panics.
pub struct Ram {
    base: PhysAddr,
    frames: Vec<Mutex<Box<PageBuf>>>,
}

impl Ram {
    pub fn new(base: PhysAddr, frames: usize) -> Self {
        assert!(base.is_page_aligned(), "unaligned RAM base {base}");
        Self {
            base,
            frames: (0..frames)
                .map(|_| Mutex::new(Box::new([0; PAGE_FRAME_SIZE])))
                .collect(),
        }
    }

    fn frame(&self, frame: PhysAddr) -> &Mutex<Box<PageBuf>> {
        assert!(frame.is_page_aligned(), "unaligned frame {frame}");
        frame
            .as_usize()
            .checked_sub(self.base.as_usize())
            .and_then(|ofs| self.frames.get(ofs / PAGE_FRAME_SIZE))
            .unwrap_or_else(|| panic!("frame {frame} outside physical memory"))
    }
}

impl PhysicalMemory for Ram {
    fn read_page(&self, frame: PhysAddr, buf: &mut PageBuf) {
        buf.copy_from_slice(&**self.frame(frame).lock());
    }

    fn write_page(&self, frame: PhysAddr, buf: &PageBuf) {
        self.frame(frame).lock().copy_from_slice(buf);
    }
}
