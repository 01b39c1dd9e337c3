// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Two-level 32-bit virtual memory layout shared by kernel and userland
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VirtAddr, PhysAddr, PGSIZE, PTSIZE, UTOP, UXSTACKTOP, USTACKTOP, PFTEMP
//! INVARIANTS: UTOP is region aligned; the exception stack is the page directly below UTOP

use core::fmt;

use static_assertions::const_assert;

/// Bytes mapped by a single page table entry.
pub const PGSIZE: u32 = 4096;
/// log2(PGSIZE).
pub const PGSHIFT: u32 = 12;
/// Entries in the top-level page directory.
pub const NPDENTRIES: usize = 1024;
/// Entries in one page table.
pub const NPTENTRIES: usize = 1024;
/// Bytes covered by one page directory entry (one region).
pub const PTSIZE: u32 = PGSIZE * NPTENTRIES as u32;
/// Shift of the page-directory index inside a virtual address.
pub const PDXSHIFT: u32 = 22;

/// Top of user-accessible virtual memory.
pub const UTOP: VirtAddr = VirtAddr(0xEEC0_0000);
/// Top of the one-page user exception stack.
pub const UXSTACKTOP: VirtAddr = UTOP;
/// Top of the ordinary user stack; one empty page separates it from the exception stack.
pub const USTACKTOP: VirtAddr = VirtAddr(UTOP.0 - 2 * PGSIZE);
/// Scratch region for temporary user mappings.
pub const UTEMP: VirtAddr = VirtAddr(PTSIZE);
/// Temporary slot used while servicing a copy-on-write fault.
pub const PFTEMP: VirtAddr = VirtAddr(UTEMP.0 + PTSIZE - PGSIZE);
/// Start of user program text.
pub const UTEXT: VirtAddr = VirtAddr(2 * PTSIZE);

const_assert!(UTOP.0 % PTSIZE == 0);
const_assert!(PFTEMP.0 % PGSIZE == 0);
const_assert!(PFTEMP.0 < UTEXT.0);

/// A 32-bit user or kernel virtual address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtAddr(u32);

impl VirtAddr {
    /// Wraps a raw address.
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Address of the first byte of page number `pgnum`.
    #[inline]
    pub const fn from_pgnum(pgnum: usize) -> Self {
        Self((pgnum as u32) << PGSHIFT)
    }

    /// Returns the raw address.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Rounds down to the containing page.
    #[inline]
    pub const fn round_down(self) -> Self {
        Self(self.0 & !(PGSIZE - 1))
    }

    /// True on a page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PGSIZE == 0
    }

    /// Page-directory index.
    #[inline]
    pub const fn pdx(self) -> usize {
        (self.0 >> PDXSHIFT) as usize
    }

    /// Page-table index within the region.
    #[inline]
    pub const fn ptx(self) -> usize {
        ((self.0 >> PGSHIFT) as usize) & (NPTENTRIES - 1)
    }

    /// Linear page number (index into the flattened page-table view).
    #[inline]
    pub const fn pgnum(self) -> usize {
        (self.0 >> PGSHIFT) as usize
    }

    /// Byte offset within the page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        (self.0 & (PGSIZE - 1)) as usize
    }

    /// Adds `bytes`, or `None` past the top of the address space.
    #[inline]
    pub fn checked_add(self, bytes: u32) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Subtracts `bytes`, or `None` below zero.
    #[inline]
    pub fn checked_sub(self, bytes: u32) -> Option<Self> {
        self.0.checked_sub(bytes).map(Self)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Physical address of a page frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysAddr(u32);

impl PhysAddr {
    /// Wraps a raw physical address.
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Address of frame number `frame`.
    #[inline]
    pub const fn from_frame(frame: usize) -> Self {
        Self((frame as u32) << PGSHIFT)
    }

    /// Returns the raw address.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Frame number backing this address.
    #[inline]
    pub const fn frame(self) -> usize {
        (self.0 >> PGSHIFT) as usize
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}
