//! Swap space: page-sized slots on the block device registered as
//! [`BlockType::Swap`].
//!
//! Slot `i` occupies sectors `i * SECTORS_PER_PAGE .. (i + 1) * SECTORS_PER_PAGE`.
//! Slot accounting lives in a bitmap under its own lock; device I/O is
//! serialized by the swap [`Block`](crate::block::block_core::Block)'s lock.
//! The two are never held together.

pub mod page_replacement;

use crate::block::block_core::{BlockManager, BlockRef, BlockSector, BlockType, BLOCK_SECTOR_SIZE};
use crate::mem::{PageBuf, PhysicalMemory};
use crate::paging::PageMapper;
use crate::sync::mutex::Mutex;
use crate::vm::page::{PageEntry, PageState};
use alloc::sync::Arc;
use core::fmt;
use kidneyos_vm_shared::bit_array::BitMap;
use kidneyos_vm_shared::mem::{PhysAddr, PAGE_FRAME_SIZE};
use kidneyos_vm_shared::sizes::SECTORS_PER_PAGE;
use log::{debug, info, warn};

/// Index of a page-sized slot on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }

    fn first_sector(self) -> BlockSector {
        BlockSector::try_from(self.0)
            .ok()
            .and_then(|index| index.checked_mul(SECTORS_PER_PAGE))
            .unwrap_or_else(|| panic!("swap slot {} beyond sector range", self.0))
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

pub struct SwapTable {
    device: Option<BlockRef>,
    /// Bit `i` is set while slot `i` holds an evicted page.
    slots: Mutex<BitMap>,
    memory: Arc<dyn PhysicalMemory>,
}

impl SwapTable {
    /// Finds the swap device among `blocks`. Without one, swap is disabled and
    /// any eviction that needs it panics.
    pub fn init(blocks: &BlockManager, memory: Arc<dyn PhysicalMemory>) -> Self {
        let device = blocks.by_role(BlockType::Swap);
        let slot_count = match &device {
            Some(block) => {
                let block = block.lock();
                let slots = (block.get_size() / SECTORS_PER_PAGE) as usize;
                info!(
                    "swap: using \"{}\" ({} sectors, {} slots)",
                    block.get_name(),
                    block.get_size(),
                    slots
                );
                slots
            }
            None => {
                warn!("swap: no swap device registered, swapping disabled");
                0
            }
        };

        Self {
            device,
            slots: Mutex::new(BitMap::new(slot_count)),
            memory,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.device.is_some()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn used_slots(&self) -> usize {
        self.slots.lock().count(true)
    }

    pub fn free_slots(&self) -> usize {
        self.slots.lock().count(false)
    }

    fn device(&self) -> &BlockRef {
        self.device
            .as_ref()
            .unwrap_or_else(|| panic!("swap: eviction requires a swap device"))
    }

    /// Writes the resident page of `entry` to a free slot, marks the entry
    /// swapped and removes its hardware mapping. The frame is left
    /// content-less for the caller to reuse.
    ///
    /// Panics if the entry is not resident or the swap space is exhausted.
    pub fn swap_out(&self, entry: &mut PageEntry, mapper: &mut dyn PageMapper) -> SwapSlot {
        let PageState::Resident(frame) = entry.state() else {
            panic!("swap_out of non-resident page {}", entry.page());
        };
        let device = self.device();

        let slot = self
            .slots
            .lock()
            .scan_and_flip(0, false)
            .map(SwapSlot)
            .unwrap_or_else(|| panic!("swap space exhausted"));

        let mut page = [0; PAGE_FRAME_SIZE];
        self.memory.read_page(frame, &mut page);
        write_slot(device, slot, &page);

        entry.set_state(PageState::Swapped(slot));
        mapper.clear_mapping(entry.page());
        debug!("swap: {} of frame {} -> {}", entry.page(), frame, slot);
        slot
    }

    /// Reads the slot of the swapped `entry` into `frame` and frees the slot.
    /// `entry` itself is left untouched; its slot is stale from here on.
    ///
    /// The slot stays allocated until the read completes so no eviction can
    /// reuse it mid-read. Panics if the entry is not swapped or its slot is
    /// not in use.
    pub fn swap_in(&self, entry: &PageEntry, frame: PhysAddr) {
        let PageState::Swapped(slot) = entry.state() else {
            panic!("swap_in of page {} which is not swapped", entry.page());
        };
        self.assert_in_use(slot, "swap_in");

        let mut page = [0; PAGE_FRAME_SIZE];
        read_slot(self.device(), slot, &mut page);
        self.memory.write_page(frame, &page);

        self.slots.lock().set(slot.index(), false);
        debug!("swap: {} -> frame {} for {}", slot, frame, entry.page());
    }

    /// Frees `slot` without reading it back, for pages whose owner is going
    /// away.
    pub fn release(&self, slot: SwapSlot) {
        self.assert_in_use(slot, "release");
        self.slots.lock().set(slot.index(), false);
    }

    fn assert_in_use(&self, slot: SwapSlot, op: &str) {
        let slots = self.slots.lock();
        assert!(
            slot.index() < slots.len() && slots.test(slot.index()),
            "{} of free {}",
            op,
            slot
        );
    }
}

fn sectors(slot: SwapSlot) -> impl Iterator<Item = (BlockSector, core::ops::Range<usize>)> {
    let first = slot.first_sector();
    (0..SECTORS_PER_PAGE).map(move |i| {
        let start = i as usize * BLOCK_SECTOR_SIZE;
        (first + i, start..start + BLOCK_SECTOR_SIZE)
    })
}

fn write_slot(device: &BlockRef, slot: SwapSlot, page: &PageBuf) {
    let mut block = device.lock();
    for (sector, bytes) in sectors(slot) {
        if let Err(err) = block.write(sector, &page[bytes]) {
            panic!("swap: writing {} (sector {}): {}", slot, sector, err);
        }
    }
}

fn read_slot(device: &BlockRef, slot: SwapSlot, page: &mut PageBuf) {
    let mut block = device.lock();
    for (sector, bytes) in sectors(slot) {
        if let Err(err) = block.read(sector, &mut page[bytes]) {
            panic!("swap: reading {} (sector {}): {}", slot, sector, err);
        }
    }
}

impl fmt::Display for SwapTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (used, total) = {
            let slots = self.slots.lock();
            (slots.count(true), slots.len())
        };
        match &self.device {
            Some(device) => writeln!(
                f,
                "Swap: \"{}\", {}/{} slots in use",
                device.lock().get_name(),
                used,
                total
            ),
            None => writeln!(f, "Swap: disabled"),
        }
    }
}
