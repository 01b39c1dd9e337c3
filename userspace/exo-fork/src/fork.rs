// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Address-space duplication: `duppage`, `fork` and `sfork`.
//!
//! The walk covers `[0, limit)` in region strides, skipping regions whose
//! directory entry is absent. `fork` stops one page below `UTOP` so the
//! exception stack is never duplicated; `sfork` stops three pages below so
//! the top user stack page gets its own copy-on-write treatment.

use exo_abi::{
    AddressSpaceView, EnvId, EnvStatus, Perm, Pte, PteFlags, Syscalls, UserEnv, VirtAddr, PGSIZE,
    PTSIZE, USTACKTOP, UTOP,
};
use log::{debug, info, warn};

use crate::{pgfault, ForkError, PrimitiveOp, Process, PGFAULT_UPCALL, UXSTACK_PAGE};

/// Maps the caller's page at `va` into `child` at the same address.
///
/// Writable and COW pages become COW on both sides, the child first. Pages
/// that are neither are shared read-only and never marked COW.
pub fn duppage<S: Syscalls + AddressSpaceView>(
    sys: &S,
    child: EnvId,
    va: VirtAddr,
) -> Result<(), ForkError> {
    let pte = sys.pte_at(va);
    let map = |dst: EnvId, perm: Perm| {
        sys.page_map(EnvId::CURRENT, va, dst, va, perm)
            .map_err(ForkError::at(PrimitiveOp::PageMap, va))
    };
    if pte.flags().intersects(PteFlags::WRITABLE | PteFlags::COW) {
        map(child, Perm::USER_COW)?;
        map(EnvId::CURRENT, Perm::USER_COW)?;
    } else {
        map(child, Perm::USER_RO)?;
    }
    Ok(())
}

/// Calls `f` for every present page below `limit`.
fn for_each_present_page<S: AddressSpaceView>(
    sys: &S,
    limit: VirtAddr,
    mut f: impl FnMut(VirtAddr, Pte) -> Result<(), ForkError>,
) -> Result<(), ForkError> {
    let limit = limit.raw();
    let mut addr = 0u32;
    while addr < limit {
        if !sys.uvpd(VirtAddr::new(addr).pdx()).is_present() {
            addr += PTSIZE;
            continue;
        }
        let region_top = (addr + PTSIZE).min(limit);
        while addr < region_top {
            let va = VirtAddr::new(addr);
            let pte = sys.uvpt(va.pgnum());
            if pte.is_present() {
                f(va, pte)?;
            }
            addr += PGSIZE;
        }
    }
    Ok(())
}

/// Private exception stack, upcall entry, then runnable.
fn start_child<S: Syscalls>(sys: &S, child: EnvId) -> Result<(), ForkError> {
    sys.page_alloc(child, UXSTACK_PAGE, Perm::USER_RW)
        .map_err(ForkError::at(PrimitiveOp::PageAlloc, UXSTACK_PAGE))?;
    sys.env_set_pgfault_upcall(child, PGFAULT_UPCALL)
        .map_err(ForkError::at(PrimitiveOp::SetPgfaultUpcall, PGFAULT_UPCALL.0))?;
    sys.env_set_status(child, EnvStatus::Runnable)
        .map_err(ForkError::at(PrimitiveOp::SetStatus, VirtAddr::new(0)))?;
    Ok(())
}

impl<S: UserEnv> Process<S> {
    /// Page duplicator bound to this process.
    pub fn duppage(&self, child: EnvId, va: VirtAddr) -> Result<(), ForkError> {
        duppage(&self.sys, child, va)
    }

    /// Copy-on-write fork.
    ///
    /// Returns the child's id in the parent and [`EnvId::CURRENT`] in the child.
    ///
    /// # Panics
    /// On any primitive failure; the half-built child is destroyed first.
    pub fn fork(&mut self) -> EnvId {
        match self.try_fork() {
            Ok(id) => id,
            Err(err) => panic!("[{}] fork: {err}", self.this_env),
        }
    }

    /// Fork sharing all memory except the top stack page and the exception stack.
    ///
    /// # Panics
    /// On any primitive failure; the half-built child is destroyed first.
    pub fn sfork(&mut self) -> EnvId {
        match self.try_sfork() {
            Ok(id) => id,
            Err(err) => panic!("[{}] sfork: {err}", self.this_env),
        }
    }

    /// [`Process::fork`] reporting failure as a value.
    ///
    /// The half-built child is destroyed before the error is returned.
    pub fn try_fork(&mut self) -> Result<EnvId, ForkError> {
        let Some(child) = self.begin_child()? else {
            return Ok(EnvId::CURRENT);
        };
        let limit = VirtAddr::new(UTOP.raw() - PGSIZE);
        let sys = &self.sys;
        let built = for_each_present_page(sys, limit, |va, _| duppage(sys, child, va))
            .and_then(|()| start_child(sys, child));
        self.finish_child(child, built, "fork")
    }

    /// [`Process::sfork`] reporting failure as a value.
    ///
    /// The half-built child is destroyed before the error is returned.
    pub fn try_sfork(&mut self) -> Result<EnvId, ForkError> {
        let Some(child) = self.begin_child()? else {
            return Ok(EnvId::CURRENT);
        };
        let limit = VirtAddr::new(UTOP.raw() - 3 * PGSIZE);
        let stack = VirtAddr::new(USTACKTOP.raw() - PGSIZE);
        let sys = &self.sys;
        let share = |va: VirtAddr, pte: Pte| {
            let perm = Perm::low_bits_of(pte);
            if pte.is_cow() {
                warn!(
                    target: "exo_fork::sfork",
                    "sharing COW-marked page {va} as perm {:#x}: child keeps this frame after the parent privatizes it",
                    perm.to_wire()
                );
            }
            sys.page_map(EnvId::CURRENT, va, child, va, perm)
                .map_err(ForkError::at(PrimitiveOp::PageMap, va))
        };
        let built = for_each_present_page(sys, limit, share)
            .and_then(|()| {
                if sys.pte_at(stack).is_present() {
                    duppage(sys, child, stack)
                } else {
                    Ok(())
                }
            })
            .and_then(|()| start_child(sys, child));
        self.finish_child(child, built, "sfork")
    }

    /// Registers the COW handler and creates the child.
    ///
    /// `None` means this is the child resuming: identity is re-resolved.
    fn begin_child(&mut self) -> Result<Option<EnvId>, ForkError> {
        self.set_pgfault_handler(pgfault::<S>);
        let child = self
            .sys
            .exofork()
            .map_err(ForkError::at(PrimitiveOp::Exofork, VirtAddr::new(0)))?;
        if child.is_current() {
            self.this_env = self.sys.getenvid();
            return Ok(None);
        }
        Ok(Some(child))
    }

    fn finish_child(
        &self,
        child: EnvId,
        built: Result<(), ForkError>,
        what: &str,
    ) -> Result<EnvId, ForkError> {
        match built {
            Ok(()) => {
                info!(target: "exo_fork", "[{}] {what} -> {child}", self.this_env);
                Ok(child)
            }
            Err(err) => {
                debug!(target: "exo_fork", "[{}] {what} of {child} abandoned: {err}", self.this_env);
                if let Err(destroy) = self.sys.env_destroy(child) {
                    warn!(target: "exo_fork", "[{}] could not destroy {child}: {destroy}", self.this_env);
                }
                Err(err)
            }
        }
    }
}
