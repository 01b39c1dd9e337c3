// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel state and the page-mapping primitives exposed to environments.
//!
//! Validation follows the reference exokernel: addresses must be page aligned
//! and below `UTOP`, permissions must include User|Present, a writable
//! mapping can only be made from a writable source, and an environment may
//! only act on itself or its immediate children.

use exo_abi::{
    EnvId, EnvStatus, Perm, PteFlags, SysError, SysResult, UpcallEntry, VirtAddr, PGSIZE,
    USTACKTOP, UTOP,
};
use log::{debug, info};

use crate::env::{Env, EnvTable};
use crate::mm::page_table::MapError;
use crate::mm::FrameTable;
use crate::{KernelError, MachineConfig};

/// Kernel primitives that can be made to fail on demand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Primitive {
    /// `sys_exofork`.
    Exofork,
    /// `sys_page_alloc`.
    PageAlloc,
    /// `sys_page_map`.
    PageMap,
    /// `sys_page_unmap`.
    PageUnmap,
    /// `sys_env_set_pgfault_upcall`.
    SetUpcall,
    /// `sys_env_set_status`.
    SetStatus,
}

#[cfg(feature = "failpoints")]
#[derive(Default)]
struct Failpoints {
    armed: Vec<(Primitive, usize, SysError)>,
}

#[cfg(feature = "failpoints")]
impl Failpoints {
    fn check(&mut self, op: Primitive) -> SysResult<()> {
        let Some(index) = self.armed.iter().position(|(armed, _, _)| *armed == op) else {
            return Ok(());
        };
        let (_, remaining, err) = &mut self.armed[index];
        if *remaining > 0 {
            *remaining -= 1;
            return Ok(());
        }
        let err = *err;
        self.armed.remove(index);
        Err(err)
    }
}

/// All kernel state: physical frames and the environment table.
pub struct Kernel {
    pub(crate) frames: FrameTable,
    pub(crate) envs: EnvTable,
    #[cfg(feature = "failpoints")]
    failpoints: Failpoints,
}

impl Kernel {
    /// Fresh kernel with every frame free and no environments.
    pub fn new(config: MachineConfig) -> Self {
        Self {
            frames: FrameTable::new(config.frames),
            envs: EnvTable::new(config.max_envs),
            #[cfg(feature = "failpoints")]
            failpoints: Failpoints::default(),
        }
    }

    /// Live environment `id`.
    pub fn env(&self, id: EnvId) -> Option<&Env> {
        self.envs.get(id)
    }

    /// Live environment `id`, mutably.
    pub fn env_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        self.envs.get_mut(id)
    }

    /// Every live environment in slot order.
    pub fn envs(&self) -> impl Iterator<Item = &Env> {
        self.envs.live()
    }

    /// The physical frame table.
    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    /// Makes the `successes + 1`-th call of `op` fail with `err`.
    #[cfg(feature = "failpoints")]
    pub fn fail_after(&mut self, op: Primitive, successes: usize, err: SysError) {
        self.failpoints.armed.push((op, successes, err));
    }

    #[cfg(feature = "failpoints")]
    fn failpoint(&mut self, op: Primitive) -> SysResult<()> {
        self.failpoints.check(op)
    }

    #[cfg(not(feature = "failpoints"))]
    fn failpoint(&mut self, _op: Primitive) -> SysResult<()> {
        Ok(())
    }

    /// Creates a runnable environment with no parent and one stack page.
    pub fn create_root(&mut self) -> Result<EnvId, KernelError> {
        let id = self.envs.alloc(EnvId::CURRENT)?;
        let stack = VirtAddr::new(USTACKTOP.raw() - PGSIZE);
        let pa = match self.frames.alloc() {
            Some(pa) => pa,
            None => {
                self.destroy(id);
                return Err(SysError::NoMem.into());
            }
        };
        let env = self.envs.get_mut(id).ok_or(KernelError::NoSuchEnv(id))?;
        if let Err(err) = env.pgdir.insert(&mut self.frames, pa, stack, Perm::USER_RW.flags()) {
            self.frames.free_unreferenced(pa);
            self.destroy(id);
            return Err(map_err(err).into());
        }
        env.status = EnvStatus::Runnable;
        info!(target: "exokern::env", "[{id}] root environment created");
        Ok(id)
    }

    pub(crate) fn destroy(&mut self, id: EnvId) {
        if let Some(mut env) = self.envs.take(id) {
            env.pgdir.release(&mut self.frames);
            info!(target: "exokern::env", "[{id}] free env");
        }
    }

    fn running(&self, caller: EnvId) -> SysResult<()> {
        match self.envs.get(caller) {
            Some(env) if env.status == EnvStatus::Runnable => Ok(()),
            _ => Err(SysError::BadEnv),
        }
    }

    /// Returns the caller's own id.
    pub fn sys_getenvid(&self, caller: EnvId) -> EnvId {
        caller
    }

    /// Creates a not-runnable child with an empty address space.
    ///
    /// The child's first `sys_exofork` returns [`EnvId::CURRENT`] instead of
    /// creating a grandchild, standing in for the child half of the call.
    pub fn sys_exofork(&mut self, caller: EnvId) -> SysResult<EnvId> {
        self.running(caller)?;
        let env = self.envs.get_mut(caller).ok_or(SysError::BadEnv)?;
        if env.resume_exofork {
            env.resume_exofork = false;
            return Ok(EnvId::CURRENT);
        }
        self.failpoint(Primitive::Exofork)?;
        let child = self.envs.alloc(caller)?;
        if let Some(env) = self.envs.get_mut(child) {
            env.resume_exofork = true;
        }
        info!(target: "exokern::env", "[{caller}] new env {child}");
        Ok(child)
    }

    /// Maps a fresh zeroed frame at `va` in `envid`, replacing any old mapping.
    pub fn sys_page_alloc(
        &mut self,
        caller: EnvId,
        envid: EnvId,
        va: VirtAddr,
        perm: Perm,
    ) -> SysResult<()> {
        self.running(caller)?;
        let target = self.envs.resolve(caller, envid, true)?;
        check_user_va(va)?;
        check_perm(perm)?;
        self.failpoint(Primitive::PageAlloc)?;
        let pa = self.frames.alloc().ok_or(SysError::NoMem)?;
        let env = self.envs.get_mut(target).ok_or(SysError::BadEnv)?;
        if let Err(err) = env.pgdir.insert(&mut self.frames, pa, va, perm.flags()) {
            self.frames.free_unreferenced(pa);
            return Err(map_err(err));
        }
        debug!(target: "exokern::syscall", "[{caller}] page_alloc {target} {va} -> {pa} perm={:#x}", perm.to_wire());
        Ok(())
    }

    /// Maps the frame behind `src_va` in `src_envid` at `dst_va` in `dst_envid`.
    ///
    /// The source page must be present, and a writable mapping needs a
    /// writable source.
    pub fn sys_page_map(
        &mut self,
        caller: EnvId,
        src_envid: EnvId,
        src_va: VirtAddr,
        dst_envid: EnvId,
        dst_va: VirtAddr,
        perm: Perm,
    ) -> SysResult<()> {
        self.running(caller)?;
        let src = self.envs.resolve(caller, src_envid, true)?;
        let dst = self.envs.resolve(caller, dst_envid, true)?;
        check_user_va(src_va)?;
        check_user_va(dst_va)?;
        check_perm(perm)?;
        let pte = self
            .envs
            .get(src)
            .and_then(|env| env.pgdir.lookup_present(src_va))
            .ok_or(SysError::Invalid)?;
        if perm.contains(PteFlags::WRITABLE) && !pte.is_writable() {
            return Err(SysError::Invalid);
        }
        self.failpoint(Primitive::PageMap)?;
        let env = self.envs.get_mut(dst).ok_or(SysError::BadEnv)?;
        env.pgdir.insert(&mut self.frames, pte.frame(), dst_va, perm.flags()).map_err(map_err)?;
        debug!(
            target: "exokern::syscall",
            "[{caller}] page_map {src}:{src_va} -> {dst}:{dst_va} frame={} perm={:#x}",
            pte.frame(),
            perm.to_wire()
        );
        Ok(())
    }

    /// Unmaps `va` in `envid`; an absent page is not an error.
    pub fn sys_page_unmap(&mut self, caller: EnvId, envid: EnvId, va: VirtAddr) -> SysResult<()> {
        self.running(caller)?;
        let target = self.envs.resolve(caller, envid, true)?;
        check_user_va(va)?;
        self.failpoint(Primitive::PageUnmap)?;
        let env = self.envs.get_mut(target).ok_or(SysError::BadEnv)?;
        let old = env.pgdir.remove(&mut self.frames, va);
        debug!(target: "exokern::syscall", "[{caller}] page_unmap {target} {va} (was {old:?})");
        Ok(())
    }

    /// Records the page-fault upcall entry of `envid`.
    pub fn sys_env_set_pgfault_upcall(
        &mut self,
        caller: EnvId,
        envid: EnvId,
        entry: UpcallEntry,
    ) -> SysResult<()> {
        self.running(caller)?;
        let target = self.envs.resolve(caller, envid, true)?;
        self.failpoint(Primitive::SetUpcall)?;
        let env = self.envs.get_mut(target).ok_or(SysError::BadEnv)?;
        env.upcall = Some(entry);
        debug!(target: "exokern::syscall", "[{caller}] set_pgfault_upcall {target} {}", entry.0);
        Ok(())
    }

    /// Sets `envid` runnable or not runnable; other statuses are `Invalid`.
    pub fn sys_env_set_status(
        &mut self,
        caller: EnvId,
        envid: EnvId,
        status: EnvStatus,
    ) -> SysResult<()> {
        self.running(caller)?;
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(SysError::Invalid);
        }
        let target = self.envs.resolve(caller, envid, true)?;
        self.failpoint(Primitive::SetStatus)?;
        let env = self.envs.get_mut(target).ok_or(SysError::BadEnv)?;
        env.status = status;
        info!(target: "exokern::env", "[{caller}] env {target} -> {status:?}");
        Ok(())
    }

    /// Destroys `envid` and releases its frames.
    pub fn sys_env_destroy(&mut self, caller: EnvId, envid: EnvId) -> SysResult<()> {
        self.running(caller)?;
        let target = self.envs.resolve(caller, envid, true)?;
        if target == caller {
            info!(target: "exokern::env", "[{caller}] exiting gracefully");
        } else {
            info!(target: "exokern::env", "[{caller}] destroying {target}");
        }
        self.destroy(target);
        Ok(())
    }
}

fn check_user_va(va: VirtAddr) -> SysResult<()> {
    if va >= UTOP || !va.is_page_aligned() {
        return Err(SysError::Invalid);
    }
    Ok(())
}

fn check_perm(perm: Perm) -> SysResult<()> {
    if !perm.contains(PteFlags::USER | PteFlags::PRESENT) {
        return Err(SysError::Invalid);
    }
    Ok(())
}

fn map_err(err: MapError) -> SysError {
    match err {
        MapError::NoMem => SysError::NoMem,
        MapError::Unaligned | MapError::InvalidFlags => SysError::Invalid,
    }
}
