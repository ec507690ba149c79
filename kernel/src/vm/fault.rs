//! Page fault resolution.
//!
//! A fault takes the page table lock only for short lookups and never while
//! asking the frame table for a frame, since eviction locks the page table of
//! whichever space owns the victim.

use super::address_space::AddressSpace;
use super::error::FaultError;
use super::page::{PageEntry, PageState};
use super::Vm;
use crate::mem::frame_table::FrameOwner;
use crate::mem::{PageBuf, PallocFlags};
use alloc::sync::Arc;
use core::sync::atomic::Ordering;
use kidneyos_vm_shared::mem::{PhysAddr, VirtAddr, PAGE_FRAME_SIZE};
use log::{debug, error, warn};

struct Populated {
    writable: bool,
    from_swap: bool,
}

impl Vm {
    /// Resolves a fault at `fault_addr` in `space`, loading the page and
    /// mapping it. `write` is whether the faulting access was a write.
    ///
    /// On error nothing is left allocated and the faulting process should be
    /// terminated.
    pub fn handle_page_fault(
        &self,
        space: &Arc<AddressSpace>,
        fault_addr: VirtAddr,
        write: bool,
    ) -> Result<(), FaultError> {
        match self.resolve(space, fault_addr, write) {
            Ok(frame) => {
                self.faults_handled.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "fault: {} {} in space {} -> frame {}",
                    if write { "write" } else { "read" },
                    fault_addr,
                    space.id(),
                    frame
                );
                Ok(())
            }
            Err(err) => {
                self.faults_rejected.fetch_add(1, Ordering::Relaxed);
                warn!("fault: {} in space {}: {}", fault_addr, space.id(), err);
                Err(err)
            }
        }
    }

    fn resolve(
        &self,
        space: &Arc<AddressSpace>,
        fault_addr: VirtAddr,
        write: bool,
    ) -> Result<PhysAddr, FaultError> {
        let page = fault_addr.page_base();
        if !page.is_user() {
            return Err(FaultError::KernelAddress);
        }

        {
            let pages = space.pages().lock();
            let entry = pages.lookup(page).ok_or(FaultError::NotPresent)?;
            if write && entry.read_only() {
                return Err(FaultError::WriteToReadOnly);
            }
            if let PageState::Resident(_) = entry.state() {
                return Err(FaultError::AlreadyResident);
            }
        }

        let frame = self.frames.allocate(
            PallocFlags::user_page(),
            FrameOwner::new(space, page),
            &self.swap,
        );

        let populated = match self.populate(space, page, frame) {
            Ok(populated) => populated,
            Err(err) => {
                self.frames.free(frame);
                return Err(err);
            }
        };

        let installed = {
            let mut mapper = space.mapper().lock();
            mapper.get_mapping(page).is_none()
                && mapper.set_mapping(page, frame, populated.writable)
        };
        if !installed {
            self.frames.free(frame);
            if populated.from_swap {
                if let Some(entry) = space.pages().lock().lookup_mut(page) {
                    entry.set_state(PageState::Unloaded);
                }
                error!(
                    "fault: swapped content of {} in space {} lost, mapping failed",
                    page,
                    space.id()
                );
            }
            return Err(FaultError::MappingFailed);
        }

        if let Some(entry) = space.pages().lock().lookup_mut(page) {
            entry.set_state(PageState::Resident(frame));
        }
        self.frames.unpin(frame);
        Ok(frame)
    }

    /// Fills `frame` with the content of `page`, from swap if it was evicted,
    /// otherwise from its file followed by zeroes.
    fn populate(
        &self,
        space: &AddressSpace,
        page: VirtAddr,
        frame: PhysAddr,
    ) -> Result<Populated, FaultError> {
        let pages = space.pages().lock();
        let entry = pages.lookup(page).ok_or(FaultError::NotPresent)?;
        let writable = !entry.read_only();

        match entry.state() {
            PageState::Swapped(_) => {
                self.swap.swap_in(entry, frame);
                Ok(Populated {
                    writable,
                    from_swap: true,
                })
            }
            PageState::Unloaded => {
                let mut buf: PageBuf = [0; PAGE_FRAME_SIZE];
                load_from_file(entry, &mut buf)?;
                self.memory.write_page(frame, &buf);
                Ok(Populated {
                    writable,
                    from_swap: false,
                })
            }
            PageState::Resident(_) => Err(FaultError::AlreadyResident),
        }
    }
}

/// Reads the file-backed prefix of `entry` into `buf`. The rest of `buf` is
/// left as is.
fn load_from_file(entry: &PageEntry, buf: &mut PageBuf) -> Result<(), FaultError> {
    let Some(file) = entry.file() else {
        return Ok(());
    };
    let expected = entry.read_bytes();
    let mut file = file.lock();
    file.seek(entry.offset());
    let read = file.read(&mut buf[..expected]);
    if read != expected {
        return Err(FaultError::ShortRead { expected, read });
    }
    Ok(())
}
