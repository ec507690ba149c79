//! Strongly typed addresses.
//!
//! Both types are plain `usize` wrappers ordered by value, so they can key a
//! `BTreeMap` directly. Neither type enforces alignment on construction; use
//! [`VirtAddr::page_base`] / [`PhysAddr::page_base`] to get the page key.

use super::{pg_ofs, pg_round_down, OFFSET, PAGE_FRAME_SIZE};
use core::fmt;
use core::ops::Add;

/// A virtual address in some address space.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

/// A physical address.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

macro_rules! impl_addr {
    ($t: ident, $prefix: literal) => {
        impl $t {
            #[inline]
            pub const fn new(addr: usize) -> Self {
                Self(addr)
            }

            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// The address of the first byte of the page containing `self`.
            #[inline]
            pub const fn page_base(self) -> Self {
                Self(pg_round_down(self.0))
            }

            #[inline]
            pub const fn page_offset(self) -> usize {
                pg_ofs(self.0)
            }

            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                pg_ofs(self.0) == 0
            }

            /// Page number, i.e. the address divided by the page size.
            #[inline]
            pub const fn page_number(self) -> usize {
                self.0 / PAGE_FRAME_SIZE
            }

            #[inline]
            pub const fn from_page_number(number: usize) -> Self {
                Self(number * PAGE_FRAME_SIZE)
            }
        }

        impl Add<usize> for $t {
            type Output = Self;

            fn add(self, rhs: usize) -> Self {
                Self(self.0 + rhs)
            }
        }

        impl fmt::Debug for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "({:#010x})"), self.0)
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#010x}", self.0)
            }
        }
    };
}

impl_addr!(VirtAddr, "VirtAddr");
impl_addr!(PhysAddr, "PhysAddr");

impl VirtAddr {
    /// Whether this address lies below the kernel split.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < OFFSET
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_base_rounds_down() {
        let addr = VirtAddr::new(0x0804_8123);
        assert_eq!(addr.page_base(), VirtAddr::new(0x0804_8000));
        assert_eq!(addr.page_offset(), 0x123);
        assert!(!addr.is_page_aligned());
        assert!(addr.page_base().is_page_aligned());
    }

    #[test]
    fn user_split() {
        assert!(VirtAddr::new(OFFSET - 1).is_user());
        assert!(!VirtAddr::new(OFFSET).is_user());
    }

    #[test]
    fn page_numbers() {
        let frame = PhysAddr::from_page_number(5);
        assert_eq!(frame, PhysAddr::new(5 * PAGE_FRAME_SIZE));
        assert_eq!(frame.page_number(), 5);
        assert_eq!(frame + PAGE_FRAME_SIZE, PhysAddr::from_page_number(6));
    }
}
