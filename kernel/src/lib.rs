#![cfg_attr(target_os = "none", no_std)]

//! Demand-paged virtual memory for user address spaces.
//!
//! The subsystem is rooted at [`vm::Vm`]. A trap handler forwards user page
//! faults to [`system::page_fault`], which resolves them against the faulting
//! process's supplemental page table, allocating frames from the
//! [`mem::frame_table::FrameTable`] and evicting to the
//! [`swapping::SwapTable`] under memory pressure.

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod mem;
pub mod paging;
pub mod swapping;
pub mod sync;
pub mod system;
pub mod vm;

#[cfg(test)]
mod fixtures;
