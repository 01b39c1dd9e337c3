// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Two-level page directory with lazy allocation of page-table pages.

use exo_abi::{Pde, PhysAddr, Pte, PteFlags, VirtAddr, NPDENTRIES, NPTENTRIES};

use super::FrameTable;

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// Virtual or physical address was not page aligned.
    #[error("address not page aligned")]
    Unaligned,
    /// No frame left for an intermediate page table.
    #[error("out of frames for page table")]
    NoMem,
    /// Flags do not describe a present entry.
    #[error("flags do not describe a present mapping")]
    InvalidFlags,
}

struct PageTablePage {
    entries: [Pte; NPTENTRIES],
}

impl PageTablePage {
    fn new() -> Box<Self> {
        Box::new(Self { entries: [Pte::EMPTY; NPTENTRIES] })
    }
}

/// Directory entry flags; page-level entries carry the effective permission.
const PDE_FLAGS: PteFlags = PteFlags::PRESENT.union(PteFlags::WRITABLE).union(PteFlags::USER);

/// A page directory and the page tables it owns.
///
/// Each page table occupies a frame from the [`FrameTable`] so table growth
/// competes with user pages for memory, and its frame address is what the
/// directory entry reports.
pub struct PageDirectory {
    pdes: Vec<Pde>,
    tables: Vec<Option<Box<PageTablePage>>>,
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDirectory {
    /// An empty directory with no page tables.
    pub fn new() -> Self {
        let mut tables = Vec::with_capacity(NPDENTRIES);
        tables.resize_with(NPDENTRIES, || None);
        Self { pdes: vec![Pde::EMPTY; NPDENTRIES], tables }
    }

    /// Directory entry `pdx`.
    pub fn pde(&self, pdx: usize) -> Pde {
        self.pdes.get(pdx).copied().unwrap_or(Pde::EMPTY)
    }

    /// Entry for `va`; `None` when its page table does not exist.
    pub fn lookup(&self, va: VirtAddr) -> Option<Pte> {
        let table = self.tables.get(va.pdx())?.as_ref()?;
        Some(table.entries[va.ptx()])
    }

    /// Entry for `va` if the page is present.
    pub fn lookup_present(&self, va: VirtAddr) -> Option<Pte> {
        self.lookup(va).filter(|pte| pte.is_present())
    }

    /// Mutable entry for `va` without creating a page table.
    pub fn walk_mut(&mut self, va: VirtAddr) -> Option<&mut Pte> {
        let table = self.tables.get_mut(va.pdx())?.as_mut()?;
        Some(&mut table.entries[va.ptx()])
    }

    fn walk_create(&mut self, va: VirtAddr, frames: &mut FrameTable) -> Result<&mut Pte, MapError> {
        let pdx = va.pdx();
        if self.tables[pdx].is_none() {
            let pa = frames.alloc().ok_or(MapError::NoMem)?;
            frames.incref(pa);
            self.tables[pdx] = Some(PageTablePage::new());
            self.pdes[pdx] = Pde::new(pa, PDE_FLAGS);
        }
        let table = self.tables[pdx].as_mut().ok_or(MapError::NoMem)?;
        Ok(&mut table.entries[va.ptx()])
    }

    /// Maps `pa` at `va`, replacing whatever was mapped there.
    ///
    /// The new reference is taken before the old one is dropped so that
    /// re-inserting the frame already mapped at `va` only changes its flags.
    pub fn insert(
        &mut self,
        frames: &mut FrameTable,
        pa: PhysAddr,
        va: VirtAddr,
        flags: PteFlags,
    ) -> Result<(), MapError> {
        if !va.is_page_aligned() || pa.raw() % exo_abi::PGSIZE != 0 {
            return Err(MapError::Unaligned);
        }
        if !flags.contains(PteFlags::PRESENT) {
            return Err(MapError::InvalidFlags);
        }
        let entry = self.walk_create(va, frames)?;
        let old = *entry;
        *entry = Pte::new(pa, flags);
        frames.incref(pa);
        if old.is_present() {
            frames.decref(old.frame());
        }
        Ok(())
    }

    /// Unmaps `va`, returning the frame that was mapped there.
    pub fn remove(&mut self, frames: &mut FrameTable, va: VirtAddr) -> Option<PhysAddr> {
        let entry = self.walk_mut(va)?;
        if !entry.is_present() {
            return None;
        }
        let pa = entry.frame();
        *entry = Pte::EMPTY;
        frames.decref(pa);
        Some(pa)
    }

    /// Drops every page mapping and page table.
    pub fn release(&mut self, frames: &mut FrameTable) {
        for pdx in 0..NPDENTRIES {
            if let Some(table) = self.tables[pdx].take() {
                for pte in table.entries.iter().filter(|pte| pte.is_present()) {
                    frames.decref(pte.frame());
                }
                frames.decref(self.pdes[pdx].frame());
            }
            self.pdes[pdx] = Pde::EMPTY;
        }
    }

    /// Present mappings in ascending address order.
    pub fn present_pages(&self) -> impl Iterator<Item = (VirtAddr, Pte)> + '_ {
        self.tables.iter().enumerate().flat_map(|(pdx, table)| {
            table.iter().flat_map(move |table| {
                table.entries.iter().enumerate().filter(|(_, pte)| pte.is_present()).map(
                    move |(ptx, pte)| (VirtAddr::from_pgnum(pdx * NPTENTRIES + ptx), *pte),
                )
            })
        })
    }
}
