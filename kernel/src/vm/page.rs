//! The supplemental page table: every user page an address space may touch,
//! whether or not it is currently mapped.

use super::error::{PageError, Result};
use super::file::FileRef;
use crate::swapping::{SwapSlot, SwapTable};
use alloc::collections::{btree_map, BTreeMap};
use core::fmt;
use kidneyos_vm_shared::mem::{PhysAddr, VirtAddr, PAGE_FRAME_SIZE};

/// Where the content of a page currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Never loaded. The content comes from the file, or is all zeroes.
    Unloaded,
    /// Mapped to a frame.
    Resident(PhysAddr),
    /// Evicted to a swap slot.
    Swapped(SwapSlot),
}

impl PageState {
    /// Whether the page has been loaded at least once since registration.
    pub fn is_loaded(self) -> bool {
        !matches!(self, PageState::Unloaded)
    }
}

pub struct PageEntry {
    page: VirtAddr,
    file: Option<FileRef>,
    offset: usize,
    read_bytes: usize,
    zero_bytes: usize,
    read_only: bool,
    state: PageState,
}

impl PageEntry {
    /// A fresh, unloaded entry. `page` must be page-aligned.
    pub fn new(
        page: VirtAddr,
        file: Option<FileRef>,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
        read_only: bool,
    ) -> Self {
        debug_assert!(page.is_page_aligned());
        Self {
            page,
            file,
            offset,
            read_bytes,
            zero_bytes,
            read_only,
            state: PageState::Unloaded,
        }
    }

    pub fn page(&self) -> VirtAddr {
        self.page
    }
    pub fn file(&self) -> Option<&FileRef> {
        self.file.as_ref()
    }
    pub fn offset(&self) -> usize {
        self.offset
    }
    pub fn read_bytes(&self) -> usize {
        self.read_bytes
    }
    pub fn zero_bytes(&self) -> usize {
        self.zero_bytes
    }
    pub fn read_only(&self) -> bool {
        self.read_only
    }
    pub fn state(&self) -> PageState {
        self.state
    }

    pub fn set_state(&mut self, state: PageState) {
        self.state = state;
    }

    /// An unloaded entry with the same backing and permissions.
    fn fresh_copy(&self) -> Self {
        Self::new(
            self.page,
            self.file.clone(),
            self.offset,
            self.read_bytes,
            self.zero_bytes,
            self.read_only,
        )
    }
}

impl fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageEntry")
            .field("page", &self.page)
            .field("file", &self.file.is_some())
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .field("read_only", &self.read_only)
            .field("state", &self.state)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct SupplementalPageTable {
    entries: BTreeMap<VirtAddr, PageEntry>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the page containing `upage`, to be loaded on first fault
    /// from `read_bytes` bytes of `file` at `offset`, followed by zeroes.
    pub fn register(
        &mut self,
        file: Option<FileRef>,
        offset: usize,
        upage: VirtAddr,
        read_bytes: usize,
        zero_bytes: usize,
        read_only: bool,
    ) -> Result<()> {
        let page = upage.page_base();
        if !page.is_user() {
            return Err(PageError::KernelAddress);
        }
        if read_bytes > PAGE_FRAME_SIZE {
            return Err(PageError::BadSegment);
        }
        match self.entries.entry(page) {
            btree_map::Entry::Occupied(_) => Err(PageError::AlreadyRegistered),
            btree_map::Entry::Vacant(slot) => {
                slot.insert(PageEntry::new(
                    page, file, offset, read_bytes, zero_bytes, read_only,
                ));
                Ok(())
            }
        }
    }

    /// Registers an executable segment page by page: each page reads as much
    /// of the remaining `read_bytes` as fits and zero-fills the rest.
    ///
    /// `upage` must be page-aligned and the segment must span whole pages.
    /// Nothing is registered if any page is rejected.
    pub fn register_segment(
        &mut self,
        file: &FileRef,
        offset: usize,
        upage: VirtAddr,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<()> {
        let total = read_bytes
            .checked_add(zero_bytes)
            .filter(|total| total % PAGE_FRAME_SIZE == 0)
            .ok_or(PageError::BadSegment)?;
        if !upage.is_page_aligned() || offset.checked_add(total).is_none() {
            return Err(PageError::BadSegment);
        }
        let pages = total / PAGE_FRAME_SIZE;
        let end = upage
            .as_usize()
            .checked_add(total)
            .ok_or(PageError::KernelAddress)?;
        if !VirtAddr::new(end.saturating_sub(1)).is_user() {
            return Err(PageError::KernelAddress);
        }
        if self
            .entries
            .range(upage..VirtAddr::new(end))
            .next()
            .is_some()
        {
            return Err(PageError::AlreadyRegistered);
        }

        let mut remaining = read_bytes;
        for i in 0..pages {
            let page_read_bytes = remaining.min(PAGE_FRAME_SIZE);
            self.register(
                (page_read_bytes > 0).then(|| file.clone()),
                offset + i * PAGE_FRAME_SIZE,
                upage + i * PAGE_FRAME_SIZE,
                page_read_bytes,
                PAGE_FRAME_SIZE - page_read_bytes,
                !writable,
            )?;
            remaining -= page_read_bytes;
        }
        Ok(())
    }

    /// Registers an anonymous page that reads as zeroes, such as a stack page.
    pub fn register_zeroed(&mut self, upage: VirtAddr, writable: bool) -> Result<()> {
        self.register(None, 0, upage, 0, PAGE_FRAME_SIZE, !writable)
    }

    pub fn lookup(&self, addr: VirtAddr) -> Option<&PageEntry> {
        self.entries.get(&addr.page_base())
    }

    pub fn lookup_mut(&mut self, addr: VirtAddr) -> Option<&mut PageEntry> {
        self.entries.get_mut(&addr.page_base())
    }

    /// Replaces this table's entries with unloaded copies of `source`'s.
    ///
    /// Residency and swap slots are never copied. Panics if this table still
    /// has resident or swapped pages; release them first.
    pub fn duplicate_from(&mut self, source: &SupplementalPageTable) {
        assert!(
            self.entries.values().all(|e| e.state == PageState::Unloaded),
            "duplicating into a table with loaded pages"
        );
        self.entries = source
            .entries
            .iter()
            .map(|(&page, entry)| (page, entry.fresh_copy()))
            .collect();
    }

    /// Drops every entry, releasing the swap slots of swapped pages.
    ///
    /// Resident frames must have been freed through the frame table first;
    /// a resident entry here panics.
    pub fn teardown(&mut self, swap: &SwapTable) {
        for (page, entry) in core::mem::take(&mut self.entries) {
            match entry.state {
                PageState::Unloaded => {}
                PageState::Swapped(slot) => swap.release(slot),
                PageState::Resident(frame) => {
                    panic!("teardown of page {page} still resident in frame {frame}")
                }
            }
        }
    }

    /// Frees the swap slot of every swapped page, leaving it
    /// [`PageState::Unloaded`]. Returns the number of slots released.
    pub fn release_swapped(&mut self, swap: &SwapTable) -> usize {
        let mut released = 0;
        for entry in self.entries.values_mut() {
            if let PageState::Swapped(slot) = entry.state {
                swap.release(slot);
                entry.state = PageState::Unloaded;
                released += 1;
            }
        }
        released
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageEntry> {
        self.entries.values()
    }

    pub fn resident_count(&self) -> usize {
        self.iter()
            .filter(|e| matches!(e.state, PageState::Resident(_)))
            .count()
    }

    pub fn swapped_count(&self) -> usize {
        self.iter()
            .filter(|e| matches!(e.state, PageState::Swapped(_)))
            .count()
    }
}

impl fmt::Display for SupplementalPageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pages:")?;
        for entry in self.iter() {
            let state = match entry.state {
                PageState::Unloaded => alloc::format!("unloaded"),
                PageState::Resident(frame) => alloc::format!("frame {frame}"),
                PageState::Swapped(slot) => alloc::format!("{slot}"),
            };
            writeln!(
                f,
                "    {} {} {:>4}+{:<4} {}",
                entry.page,
                if entry.read_only { "r-" } else { "rw" },
                entry.read_bytes,
                entry.zero_bytes,
                state
            )?;
        }
        Ok(())
    }
}
