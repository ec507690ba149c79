//! Hardware page mappings of a user address space.

use alloc::{boxed::Box, vec::Vec};
use kidneyos_vm_shared::mem::{PhysAddr, VirtAddr};
use kidneyos_vm_shared::paging::{PageTable, PageTableEntry, VirtualAddress, PAGE_TABLE_LEN};

/// The virtual-to-physical mapping of one address space, with the accessed
/// and dirty bits the MMU maintains for each mapped page.
///
/// All addresses are page-aligned user addresses.
pub trait PageMapper {
    fn get_mapping(&self, page: VirtAddr) -> Option<PhysAddr>;

    /// Maps `page` to `frame`. Returns `false` if the mapping could not be
    /// installed, e.g. because `page` is already mapped.
    fn set_mapping(&mut self, page: VirtAddr, frame: PhysAddr, writable: bool) -> bool;

    /// Unmaps `page`. Later accesses fault.
    fn clear_mapping(&mut self, page: VirtAddr);

    fn is_accessed(&self, page: VirtAddr) -> bool;

    fn is_dirty(&self, page: VirtAddr) -> bool;
}

/// A two-level x86 page directory kept in kernel memory rather than loaded
/// into CR3, so the MMU bits are driven by [`SoftPageDirectory::touch`].
pub struct SoftPageDirectory {
    tables: Vec<Option<Box<PageTable>>>,
}

impl Default for SoftPageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftPageDirectory {
    pub fn new() -> Self {
        Self {
            tables: (0..PAGE_TABLE_LEN).map(|_| None).collect(),
        }
    }

    fn indices(page: VirtAddr) -> (usize, usize) {
        let addr = VirtualAddress::from_usize(page.as_usize());
        (
            usize::from(addr.page_directory_index().value()),
            usize::from(addr.page_table_index().value()),
        )
    }

    fn entry(&self, page: VirtAddr) -> Option<&PageTableEntry> {
        let (pd, pt) = Self::indices(page);
        self.tables[pd]
            .as_ref()
            .map(|table| &table[pt])
            .filter(|entry| entry.present())
    }

    fn entry_mut(&mut self, page: VirtAddr) -> Option<&mut PageTableEntry> {
        let (pd, pt) = Self::indices(page);
        self.tables[pd]
            .as_mut()
            .map(|table| &mut table[pt])
            .filter(|entry| entry.present())
    }

    /// Simulates an access to `page` by the process, as the MMU would record it.
    /// Returns `false` if the access would fault.
    pub fn touch(&mut self, page: VirtAddr, write: bool) -> bool {
        let Some(entry) = self.entry_mut(page.page_base()) else {
            return false;
        };
        if write && !entry.read_write() {
            return false;
        }
        *entry = entry.with_accessed(true).with_dirty(entry.dirty() || write);
        true
    }

    pub fn set_accessed(&mut self, page: VirtAddr, accessed: bool) {
        if let Some(entry) = self.entry_mut(page) {
            *entry = entry.with_accessed(accessed);
        }
    }

    pub fn set_dirty(&mut self, page: VirtAddr, dirty: bool) {
        if let Some(entry) = self.entry_mut(page) {
            *entry = entry.with_dirty(dirty);
        }
    }

    /// `None` if `page` is not mapped.
    pub fn is_writable(&self, page: VirtAddr) -> Option<bool> {
        self.entry(page).map(|entry| entry.read_write())
    }

    pub fn mapped_count(&self) -> usize {
        self.tables
            .iter()
            .flatten()
            .map(|table| table.present_count())
            .sum()
    }
}

impl PageMapper for SoftPageDirectory {
    fn get_mapping(&self, page: VirtAddr) -> Option<PhysAddr> {
        self.entry(page).map(PageTableEntry::frame)
    }

    fn set_mapping(&mut self, page: VirtAddr, frame: PhysAddr, writable: bool) -> bool {
        if !page.is_user() || !page.is_page_aligned() || !frame.is_page_aligned() {
            return false;
        }
        // The frame number must fit the 20-bit address field.
        if frame.page_number() >= 1 << 20 {
            return false;
        }
        let (pd, pt) = Self::indices(page);
        let table = self.tables[pd].get_or_insert_with(Box::default);
        if table[pt].present() {
            return false;
        }
        table[pt] = PageTableEntry::user_mapping(frame, writable);
        true
    }

    fn clear_mapping(&mut self, page: VirtAddr) {
        let (pd, pt) = Self::indices(page);
        if let Some(table) = self.tables[pd].as_mut() {
            table[pt] = PageTableEntry::default();
        }
    }

    fn is_accessed(&self, page: VirtAddr) -> bool {
        self.entry(page).is_some_and(|entry| entry.accessed())
    }

    fn is_dirty(&self, page: VirtAddr) -> bool {
        self.entry(page).is_some_and(|entry| entry.dirty())
    }
}
