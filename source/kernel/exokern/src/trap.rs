// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! User memory access and page-fault delivery.
//!
//! Accesses are checked page by page against the caller's page table. A
//! violation is reflected to the environment's registered upcall on the user
//! exception stack, or kills the environment when no upcall can run.

use exo_abi::{
    EnvId, EnvStatus, FaultCode, KillReason, PhysAddr, PteFlags, Trap, UTrapframe, VirtAddr,
    PGSIZE, UTF_SIZE, UTOP, UXSTACKTOP,
};
use log::{debug, warn};

use crate::mm::FRAME_BYTES;
use crate::Kernel;

impl Kernel {
    /// Reads `buf.len()` bytes at `va` as environment `caller`.
    pub fn user_load(&mut self, caller: EnvId, va: VirtAddr, buf: &mut [u8]) -> Result<(), Trap> {
        let mut done = 0;
        while done < buf.len() {
            let at = chunk_start(va, done)?;
            let len = chunk_len(at, buf.len() - done);
            let pa = self.translate(caller, at, false)?;
            let frame = self.frames.bytes(pa).ok_or(Trap::Killed(KillReason::Destroyed))?;
            let offset = at.page_offset();
            buf[done..done + len].copy_from_slice(&frame[offset..offset + len]);
            done += len;
        }
        Ok(())
    }

    /// Writes `bytes` at `va` as environment `caller`.
    pub fn user_store(&mut self, caller: EnvId, va: VirtAddr, bytes: &[u8]) -> Result<(), Trap> {
        let mut done = 0;
        while done < bytes.len() {
            let at = chunk_start(va, done)?;
            let len = chunk_len(at, bytes.len() - done);
            let pa = self.translate(caller, at, true)?;
            let frame = self.frames.bytes_mut(pa).ok_or(Trap::Killed(KillReason::Destroyed))?;
            let offset = at.page_offset();
            frame[offset..offset + len].copy_from_slice(&bytes[done..done + len]);
            done += len;
        }
        Ok(())
    }

    /// Performs the MMU check for one page, updating accessed/dirty bits.
    fn translate(&mut self, caller: EnvId, va: VirtAddr, write: bool) -> Result<PhysAddr, Trap> {
        let env = self.envs.get_mut(caller).ok_or(Trap::Killed(KillReason::Destroyed))?;
        if env.status != EnvStatus::Runnable {
            return Err(Trap::Killed(KillReason::NotRunnable));
        }
        let entry = if va < UTOP { env.pgdir.walk_mut(va.round_down()) } else { None };
        let present = match entry {
            Some(pte) if pte.is_present() => {
                let user = pte.flags().contains(PteFlags::USER);
                if user && (!write || pte.is_writable()) {
                    let mut touched = PteFlags::ACCESSED;
                    if write {
                        touched |= PteFlags::DIRTY;
                    }
                    *pte = pte.with_flags(pte.flags() | touched);
                    return Ok(pte.frame());
                }
                true
            }
            _ => false,
        };
        let mut err = FaultCode::USER;
        if present {
            err |= FaultCode::PROTECTION;
        }
        if write {
            err |= FaultCode::WRITE;
        }
        Err(self.page_fault(UTrapframe { fault_va: va, err, env: caller }))
    }

    /// Reflects a fault to the user handler or destroys the environment.
    fn page_fault(&mut self, utf: UTrapframe) -> Trap {
        let id = utf.env;
        let Some(env) = self.envs.get(id) else {
            return Trap::Killed(KillReason::Destroyed);
        };
        if env.upcall.is_none() {
            warn!(target: "exokern::trap", "[{id}] user fault va {} err {:#x}: no upcall", utf.fault_va, utf.err.bits());
            self.destroy(id);
            return Trap::Killed(KillReason::NoUpcall);
        }
        let xstack = VirtAddr::new(UXSTACKTOP.raw() - PGSIZE);
        let writable = PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER;
        let frame = env
            .pgdir
            .lookup_present(xstack)
            .filter(|pte| pte.flags().contains(writable))
            .map(|pte| pte.frame());
        let Some(frame) = frame else {
            warn!(target: "exokern::trap", "[{id}] user fault va {}: exception stack unmapped", utf.fault_va);
            self.destroy(id);
            return Trap::Killed(KillReason::ExceptionStackUnmapped);
        };
        if let Some(bytes) = self.frames.bytes_mut(frame) {
            bytes[FRAME_BYTES - UTF_SIZE..].copy_from_slice(&utf.to_le_bytes());
        }
        debug!(target: "exokern::trap", "[{id}] page fault upcall va {} err {:#x}", utf.fault_va, utf.err.bits());
        Trap::Upcall(utf)
    }
}

fn chunk_start(va: VirtAddr, done: usize) -> Result<VirtAddr, Trap> {
    // An access running off the top of the address space cannot be user memory.
    va.checked_add(done as u32).ok_or(Trap::Killed(KillReason::Destroyed))
}

fn chunk_len(at: VirtAddr, remaining: usize) -> usize {
    remaining.min(FRAME_BYTES - at.page_offset())
}
