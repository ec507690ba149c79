use super::page::SupplementalPageTable;
use crate::paging::PageMapper;
use crate::swapping::SwapTable;
use crate::sync::mutex::Mutex;
use alloc::{boxed::Box, sync::Arc};
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use log::warn;

pub type SpaceId = usize;

static NEXT_SPACE_ID: AtomicUsize = AtomicUsize::new(1);

/// The user half of one process's memory: its page table and its hardware
/// mappings.
///
/// Lock `pages` before `mapper` when both are needed.
///
/// Dropping a space that was never torn down gives its swap slots back; its
/// frames are reclaimed by the frame table as they come up for eviction.
pub struct AddressSpace {
    id: SpaceId,
    pages: Mutex<SupplementalPageTable>,
    mapper: Mutex<Box<dyn PageMapper + Send>>,
    swap: Arc<SwapTable>,
}

impl AddressSpace {
    pub fn new(mapper: Box<dyn PageMapper + Send>, swap: Arc<SwapTable>) -> Self {
        Self {
            id: NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed),
            pages: Mutex::new(SupplementalPageTable::new()),
            mapper: Mutex::new(mapper),
            swap,
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn pages(&self) -> &Mutex<SupplementalPageTable> {
        &self.pages
    }

    pub fn mapper(&self) -> &Mutex<Box<dyn PageMapper + Send>> {
        &self.mapper
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace").field("id", &self.id).finish()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let released = self.pages.get_mut().release_swapped(&self.swap);
        if released > 0 {
            warn!(
                "space {} dropped without teardown, {} swap slots released",
                self.id, released
            );
        }
    }
}
