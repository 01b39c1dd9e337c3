// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page table entry layout and the permission word passed to mapping primitives.
//!
//! The bit positions are the x86 ones. `COW` lives in one of the three
//! software-available bits and is opaque to the kernel. Accessed and Dirty are
//! hardware status: they are never part of a [`Perm`], so copying a live entry
//! into a new mapping cannot carry them across.

use core::fmt;

use bitflags::bitflags;

use crate::layout::{PhysAddr, PGSIZE};

bitflags! {
    /// Flags stored in the low 12 bits of a PTE or PDE.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PteFlags: u32 {
        /// Mapping is valid.
        const PRESENT = 1 << 0;
        /// Writes are allowed.
        const WRITABLE = 1 << 1;
        /// Reachable from user mode.
        const USER = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled.
        const CACHE_DISABLE = 1 << 4;
        /// Set by the MMU on any access.
        const ACCESSED = 1 << 5;
        /// Set by the MMU on a write.
        const DIRTY = 1 << 6;
        /// Large page (directory entries only).
        const PAGE_SIZE = 1 << 7;
        /// Global translation.
        const GLOBAL = 1 << 8;
        /// Bits left to software by the MMU.
        const AVAIL = 0b111 << 9;
        /// Application-defined copy-on-write marker.
        const COW = 1 << 11;
    }
}

/// Bits a caller may hand to `page_alloc` / `page_map`.
pub const PTE_SYSCALL: PteFlags = PteFlags::PRESENT
    .union(PteFlags::WRITABLE)
    .union(PteFlags::USER)
    .union(PteFlags::AVAIL);

/// Hardware-maintained status bits.
pub const PTE_STATUS: PteFlags = PteFlags::ACCESSED.union(PteFlags::DIRTY);

/// The three low permission bits (User, Writable, Present).
pub const PTE_LOW: PteFlags = PteFlags::PRESENT.union(PteFlags::WRITABLE).union(PteFlags::USER);

const FLAG_MASK: u32 = PGSIZE - 1;

/// A page table entry: frame address in the high 20 bits, flags in the low 12.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Pte(u32);

/// Directory entries share the PTE layout; the frame is the page table.
pub type Pde = Pte;

impl Pte {
    /// An entry with nothing mapped.
    pub const EMPTY: Pte = Pte(0);

    /// Entry mapping `frame` with `flags`; the frame's offset bits are dropped.
    pub const fn new(frame: PhysAddr, flags: PteFlags) -> Self {
        Self((frame.raw() & !FLAG_MASK) | (flags.bits() & FLAG_MASK))
    }

    /// Wraps a raw entry word.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw entry word.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Physical frame this entry refers to.
    pub const fn frame(self) -> PhysAddr {
        PhysAddr::new(self.0 & !FLAG_MASK)
    }

    /// Every flag bit, unknown ones included.
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_retain(self.0 & FLAG_MASK)
    }

    /// Present bit.
    pub const fn is_present(self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    /// Writable bit.
    pub const fn is_writable(self) -> bool {
        self.0 & PteFlags::WRITABLE.bits() != 0
    }

    /// Copy-on-write marker.
    pub const fn is_cow(self) -> bool {
        self.0 & PteFlags::COW.bits() != 0
    }

    /// Replaces the low User/Writable/Present bits, keeping frame and every other bit.
    pub const fn with_low_perms(self, low: PteFlags) -> Self {
        Self((self.0 & !PTE_LOW.bits()) | (low.bits() & PTE_LOW.bits()))
    }

    /// Returns the entry with `flags` additionally set.
    pub const fn with_flags(self, flags: PteFlags) -> Self {
        Self(self.0 | (flags.bits() & FLAG_MASK))
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pte").field("frame", &self.frame()).field("flags", &self.flags()).finish()
    }
}

/// Permission word accepted by the mapping primitives.
///
/// Wire form is the raw `u32` with the exact PTE bit positions. Only bits in
/// [`PTE_SYSCALL`] are representable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Perm(PteFlags);

impl Perm {
    /// Present | User.
    pub const USER_RO: Perm = Perm(PteFlags::PRESENT.union(PteFlags::USER));
    /// Present | User | Writable.
    pub const USER_RW: Perm = Perm(PTE_LOW);
    /// Present | User | COW.
    pub const USER_COW: Perm =
        Perm(PteFlags::PRESENT.union(PteFlags::USER).union(PteFlags::COW));

    /// Builds a permission word, rejecting bits outside [`PTE_SYSCALL`].
    pub fn new(flags: PteFlags) -> Option<Self> {
        if PTE_SYSCALL.contains(flags) {
            Some(Self(flags))
        } else {
            None
        }
    }

    /// Permission carried by a live entry, minus status and hardware-only bits.
    pub const fn from_pte(pte: Pte) -> Self {
        Self(pte.flags().intersection(PTE_SYSCALL))
    }

    /// Only the User/Writable/Present bits of a live entry.
    pub const fn low_bits_of(pte: Pte) -> Self {
        Self(pte.flags().intersection(PTE_LOW))
    }

    /// Flags carried by this permission.
    pub const fn flags(self) -> PteFlags {
        self.0
    }

    /// Raw word passed to the kernel.
    pub const fn to_wire(self) -> u32 {
        self.0.bits()
    }

    /// Decodes a raw word; `None` if it names bits outside [`PTE_SYSCALL`].
    pub fn from_wire(raw: u32) -> Option<Self> {
        PteFlags::from_bits(raw).and_then(Self::new)
    }

    /// True if every bit of `flags` is set.
    pub const fn contains(self, flags: PteFlags) -> bool {
        self.0.contains(flags)
    }
}
