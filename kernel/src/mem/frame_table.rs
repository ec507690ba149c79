//! The frame table: every physical page currently lent to a user address
//! space, keyed by physical address, with a weak link back to the page it
//! holds.
//!
//! One lock covers the whole table and is held across each
//! allocate/evict/free. Locks of the owning address spaces are taken while
//! it is held, never the other way round.

use super::{PageAllocator, PallocFlags, PhysicalMemory};
use crate::swapping::page_replacement::{Candidate, NotRecentlyUsed, PageReplacementPolicy};
use crate::swapping::SwapTable;
use crate::sync::mutex::Mutex;
use crate::vm::address_space::{AddressSpace, SpaceId};
use crate::vm::page::PageState;
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, sync::Weak, vec::Vec};
use core::fmt;
use kidneyos_vm_shared::mem::{PhysAddr, VirtAddr};
use log::{debug, warn};

/// The page a frame holds. Never keeps the address space alive.
#[derive(Clone)]
pub struct FrameOwner {
    space: Weak<AddressSpace>,
    space_id: SpaceId,
    page: VirtAddr,
}

impl FrameOwner {
    pub fn new(space: &Arc<AddressSpace>, page: VirtAddr) -> Self {
        Self {
            space: Arc::downgrade(space),
            space_id: space.id(),
            page: page.page_base(),
        }
    }

    pub fn space_id(&self) -> SpaceId {
        self.space_id
    }

    pub fn page(&self) -> VirtAddr {
        self.page
    }
}

struct FrameEntry {
    owner: FrameOwner,
    /// Set while a fault populates the frame. Pinned frames are never evicted.
    pinned: bool,
}

/// A snapshot of one frame table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame: PhysAddr,
    pub space_id: SpaceId,
    pub page: VirtAddr,
    pub pinned: bool,
}

#[derive(Default)]
struct FrameTableInner {
    frames: BTreeMap<PhysAddr, FrameEntry>,
    evictions: usize,
}

pub struct FrameTable {
    inner: Mutex<FrameTableInner>,
    allocator: Arc<dyn PageAllocator>,
    memory: Arc<dyn PhysicalMemory>,
    policy: Box<dyn PageReplacementPolicy>,
}

impl FrameTable {
    pub fn new(allocator: Arc<dyn PageAllocator>, memory: Arc<dyn PhysicalMemory>) -> Self {
        Self::with_policy(allocator, memory, Box::new(NotRecentlyUsed))
    }

    pub fn with_policy(
        allocator: Arc<dyn PageAllocator>,
        memory: Arc<dyn PhysicalMemory>,
        policy: Box<dyn PageReplacementPolicy>,
    ) -> Self {
        Self {
            inner: Mutex::new(FrameTableInner::default()),
            allocator,
            memory,
            policy,
        }
    }

    /// Returns a frame for `owner`, pinned until [`FrameTable::unpin`].
    ///
    /// Takes a free page if the allocator has one, otherwise evicts a victim
    /// to `swap` and hands its frame over. Never fails: while every frame is
    /// pinned by a fault in progress it spins until one is unpinned. With no
    /// free page and an empty table the kernel panics.
    pub fn allocate(&self, flags: PallocFlags, owner: FrameOwner, swap: &SwapTable) -> PhysAddr {
        assert!(flags.user(), "frame table only holds user pages");
        loop {
            let mut inner = self.inner.lock();

            if let Some(frame) = self.allocator.alloc_page(flags) {
                let previous = inner.frames.insert(
                    frame,
                    FrameEntry {
                        owner,
                        pinned: true,
                    },
                );
                assert!(previous.is_none(), "allocator returned busy frame {frame}");
                return frame;
            }

            let Some(victim) = self.select_victim(&inner) else {
                assert!(
                    !inner.frames.is_empty(),
                    "out of frames: no free page and nothing to evict"
                );
                drop(inner);
                core::hint::spin_loop();
                continue;
            };
            let Some(entry) = inner.frames.get_mut(&victim) else {
                unreachable!("victim {victim} is not in the frame table");
            };
            Self::evict(victim, &entry.owner, swap);
            entry.owner = owner;
            entry.pinned = true;
            inner.evictions += 1;

            if flags.zero() {
                self.memory.zero_page(victim);
            }
            return victim;
        }
    }

    fn select_victim(&self, inner: &FrameTableInner) -> Option<PhysAddr> {
        let mut candidates = inner
            .frames
            .iter()
            .filter(|(_, entry)| !entry.pinned)
            .map(|(&frame, entry)| Candidate {
                frame,
                score: Self::sample(&entry.owner),
            });
        self.policy.select_victim(&mut candidates)
    }

    /// Activity of the owner's page; an orphaned frame is idle.
    fn sample(owner: &FrameOwner) -> arbitrary_int::u2 {
        match owner.space.upgrade() {
            Some(space) => {
                let mapper = space.mapper().lock();
                Candidate::score_of(mapper.is_accessed(owner.page), mapper.is_dirty(owner.page))
            }
            None => Candidate::score_of(false, false),
        }
    }

    /// Empties `frame`: its owner's page moves to swap and loses its mapping.
    fn evict(frame: PhysAddr, owner: &FrameOwner, swap: &SwapTable) {
        let Some(space) = owner.space.upgrade() else {
            warn!(
                "frames: reclaiming {} orphaned by space {} ({})",
                frame, owner.space_id, owner.page
            );
            return;
        };

        let mut pages = space.pages().lock();
        let entry = pages
            .lookup_mut(owner.page)
            .unwrap_or_else(|| panic!("frame {frame} owned by unregistered page {}", owner.page));
        assert_eq!(
            entry.state(),
            PageState::Resident(frame),
            "frame table and page table disagree on {}",
            owner.page
        );
        let mut mapper = space.mapper().lock();
        let slot = swap.swap_out(entry, &mut **mapper);
        debug!(
            "frames: evicted {} of space {} from {} to {}",
            owner.page, owner.space_id, frame, slot
        );
    }

    /// Makes `frame` evictable again once its page is installed.
    pub fn unpin(&self, frame: PhysAddr) {
        let mut inner = self.inner.lock();
        let entry = inner
            .frames
            .get_mut(&frame)
            .unwrap_or_else(|| panic!("unpin of unknown frame {frame}"));
        entry.pinned = false;
    }

    /// Removes `frame` from the table and returns it to the allocator.
    ///
    /// Panics if `frame` is not in the table.
    pub fn free(&self, frame: PhysAddr) {
        let mut inner = self.inner.lock();
        if inner.frames.remove(&frame).is_none() {
            panic!("free of unknown frame {frame}");
        }
        self.allocator.free_page(frame);
    }

    pub fn lookup(&self, frame: PhysAddr) -> Option<FrameInfo> {
        self.inner.lock().frames.get(&frame).map(|entry| FrameInfo {
            frame,
            space_id: entry.owner.space_id,
            page: entry.owner.page,
            pinned: entry.pinned,
        })
    }

    /// Frees every frame held by `space`, unmapping its pages and returning
    /// them to [`PageState::Unloaded`]. Returns the number of frames freed.
    pub fn free_all_for(&self, space: &AddressSpace) -> usize {
        let mut inner = self.inner.lock();
        let owned: Vec<(PhysAddr, VirtAddr)> = inner
            .frames
            .iter()
            .filter(|(_, entry)| entry.owner.space_id == space.id())
            .map(|(&frame, entry)| (frame, entry.owner.page))
            .collect();

        let mut pages = space.pages().lock();
        let mut mapper = space.mapper().lock();
        for &(frame, page) in owned.iter() {
            mapper.clear_mapping(page);
            if let Some(entry) = pages.lookup_mut(page) {
                if entry.state() == PageState::Resident(frame) {
                    entry.set_state(PageState::Unloaded);
                }
            }
            inner.frames.remove(&frame);
            self.allocator.free_page(frame);
        }
        owned.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().frames.is_empty()
    }

    /// Number of frames handed over by eviction so far.
    pub fn evictions(&self) -> usize {
        self.inner.lock().evictions
    }
}

impl fmt::Display for FrameTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        writeln!(
            f,
            "Frames: {} in use, {} evictions",
            inner.frames.len(),
            inner.evictions
        )?;
        for (frame, entry) in inner.frames.iter() {
            writeln!(
                f,
                "    {} | space {:04} page {}{}",
                frame,
                entry.owner.space_id,
                entry.owner.page,
                if entry.pinned { " (pinned)" } else { "" }
            )?;
        }
        Ok(())
    }
}
