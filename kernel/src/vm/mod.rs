//! Demand paging for user address spaces.
//!
//! Pages are registered with an address space up front and loaded on first
//! fault. Under memory pressure the frame table evicts resident pages to swap,
//! and a later fault swaps them back in.

pub mod address_space;
pub mod error;
pub mod fault;
pub mod file;
pub mod page;

#[cfg(test)]
mod tests;

use crate::block::block_core::BlockManager;
use crate::mem::frame_table::FrameTable;
use crate::mem::{PageAllocator, PhysicalMemory};
use crate::paging::PageMapper;
use crate::swapping::page_replacement::{NotRecentlyUsed, PageReplacementPolicy};
use crate::swapping::SwapTable;
use address_space::AddressSpace;
use alloc::{boxed::Box, sync::Arc};
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use kidneyos_vm_shared::mem::VirtAddr;
use log::info;
use page::SupplementalPageTable;

/// Counters describing the subsystem at one point in time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VmStats {
    pub resident_frames: usize,
    pub evictions: usize,
    pub swap_used: usize,
    pub swap_total: usize,
    pub faults_handled: usize,
    pub faults_rejected: usize,
}

impl fmt::Display for VmStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frames resident, {} evictions, swap {}/{}, faults {} handled / {} rejected",
            self.resident_frames,
            self.evictions,
            self.swap_used,
            self.swap_total,
            self.faults_handled,
            self.faults_rejected
        )
    }
}

pub struct Vm {
    memory: Arc<dyn PhysicalMemory>,
    frames: FrameTable,
    swap: Arc<SwapTable>,
    faults_handled: AtomicUsize,
    faults_rejected: AtomicUsize,
}

impl Vm {
    /// Builds the subsystem over the user page pool `allocator`, with swap on
    /// the [`Swap`](crate::block::block_core::BlockType::Swap) device of
    /// `blocks` if there is one.
    pub fn new(
        allocator: Arc<dyn PageAllocator>,
        memory: Arc<dyn PhysicalMemory>,
        blocks: &BlockManager,
    ) -> Self {
        Self::with_policy(allocator, memory, blocks, Box::new(NotRecentlyUsed))
    }

    pub fn with_policy(
        allocator: Arc<dyn PageAllocator>,
        memory: Arc<dyn PhysicalMemory>,
        blocks: &BlockManager,
        policy: Box<dyn PageReplacementPolicy>,
    ) -> Self {
        let swap = Arc::new(SwapTable::init(blocks, memory.clone()));
        let frames = FrameTable::with_policy(allocator, memory.clone(), policy);
        info!("vm: initialized, {} swap slots", swap.slot_count());
        Self {
            memory,
            frames,
            swap,
            faults_handled: AtomicUsize::new(0),
            faults_rejected: AtomicUsize::new(0),
        }
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    /// An empty address space using `mapper` for its hardware mappings.
    pub fn create_space(&self, mapper: Box<dyn PageMapper + Send>) -> Arc<AddressSpace> {
        Arc::new(AddressSpace::new(mapper, self.swap.clone()))
    }

    /// A new address space with the same registered pages as `source`, none
    /// of them loaded.
    pub fn duplicate_space(
        &self,
        source: &AddressSpace,
        mapper: Box<dyn PageMapper + Send>,
    ) -> Arc<AddressSpace> {
        let space = self.create_space(mapper);
        self.duplicate_into(source, &space);
        space
    }

    /// Replaces the pages of `destination` with unloaded copies of
    /// `source`'s, releasing whatever `destination` held first.
    pub fn duplicate_into(&self, source: &AddressSpace, destination: &AddressSpace) {
        if source.id() == destination.id() {
            return;
        }
        self.teardown(destination);

        let mut copy = SupplementalPageTable::new();
        copy.duplicate_from(&source.pages().lock());
        destination.pages().lock().duplicate_from(&copy);
    }

    /// Releases every frame and swap slot of `space` and forgets its pages.
    pub fn teardown(&self, space: &AddressSpace) {
        let freed = self.frames.free_all_for(space);
        space.pages().lock().teardown(&self.swap);
        info!("vm: space {} torn down, {} frames freed", space.id(), freed);
    }

    /// Whether user code may access `len` bytes at `start`: every page must be
    /// registered in `space`, and writable if `write`.
    pub fn check_user_range(
        &self,
        space: &AddressSpace,
        start: VirtAddr,
        len: usize,
        write: bool,
    ) -> bool {
        if !start.is_user() {
            return false;
        }
        if len == 0 {
            return true;
        }
        let Some(last) = start.as_usize().checked_add(len - 1) else {
            return false;
        };
        let last = VirtAddr::new(last);
        if !last.is_user() {
            return false;
        }

        let pages = space.pages().lock();
        (start.page_number()..=last.page_number()).all(|n| {
            pages
                .lookup(VirtAddr::from_page_number(n))
                .is_some_and(|entry| !(write && entry.read_only()))
        })
    }

    pub fn stats(&self) -> VmStats {
        VmStats {
            resident_frames: self.frames.len(),
            evictions: self.frames.evictions(),
            swap_used: self.swap.used_slots(),
            swap_total: self.swap.slot_count(),
            faults_handled: self.faults_handled.load(Ordering::Relaxed),
            faults_rejected: self.faults_rejected.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "VM: {}", self.stats())?;
        write!(f, "{}{}", self.frames, self.swap)
    }
}
