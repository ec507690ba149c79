//! The VM instance shared with the trap layer.
//!
//! The kernel builds one [`Vm`] at boot and installs it here; the page fault
//! trap handler has no other way to reach it. Everything else should be handed
//! a `&Vm` explicitly.

use crate::vm::address_space::AddressSpace;
use crate::vm::Vm;
use alloc::{boxed::Box, sync::Arc};
use kidneyos_vm_shared::mem::VirtAddr;
use log::warn;
use once_cell::race::OnceBox;

static VM: OnceBox<Vm> = OnceBox::new();

/// Access to the address space of the running process.
pub trait CurrentSpace {
    /// `None` when no user process is running, e.g. on a kernel thread.
    fn current_space(&self) -> Option<Arc<AddressSpace>>;
}

/// Installs `vm` as the system instance.
///
/// Returns `vm` back if one is already installed.
pub fn init(vm: Vm) -> Result<(), Box<Vm>> {
    VM.set(Box::new(vm))
}

/// The system instance.
///
/// Panics if [`init`] has not been called.
pub fn vm() -> &'static Vm {
    VM.get().unwrap_or_else(|| panic!("VM not initialized."))
}

pub fn try_vm() -> Option<&'static Vm> {
    VM.get()
}

/// Entry point for user page faults. Returns `true` if the faulting
/// instruction can be restarted, `false` if the process must be killed.
pub fn page_fault(current: &dyn CurrentSpace, fault_addr: VirtAddr, write: bool) -> bool {
    let Some(space) = current.current_space() else {
        warn!("page fault at {} with no user process running", fault_addr);
        return false;
    };
    vm().handle_page_fault(&space, fault_addr, write).is_ok()
}
