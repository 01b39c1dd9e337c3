// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared machine handle and per-environment views.

use std::sync::Arc;

use exo_abi::{
    AddressSpaceView, EnvId, EnvStatus, Pde, Perm, PhysAddr, Pte, SysResult, Syscalls,
    Trap, UpcallEntry, UserMemory, VirtAddr, NPTENTRIES,
};
use parking_lot::Mutex;

use crate::mm::FRAME_BYTES;
use crate::{monitor, Kernel, KernelError, MachineConfig};

/// A host machine: one kernel shared by every environment handle.
#[derive(Clone)]
pub struct Machine {
    kernel: Arc<Mutex<Kernel>>,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new(MachineConfig::default())
    }
}

impl Machine {
    /// Boots a kernel with the given limits and no environments.
    pub fn new(config: MachineConfig) -> Self {
        Self { kernel: Arc::new(Mutex::new(Kernel::new(config))) }
    }

    /// Creates a runnable root environment with a mapped user stack page.
    pub fn spawn(&self) -> Result<EnvHandle, KernelError> {
        let env = self.kernel.lock().create_root()?;
        Ok(self.handle(env))
    }

    /// View of `env`; nothing is checked until the handle is used.
    pub fn handle(&self, env: EnvId) -> EnvHandle {
        EnvHandle { machine: self.clone(), env }
    }

    /// Runs `f` with the kernel locked.
    pub fn with_kernel<R>(&self, f: impl FnOnce(&mut Kernel) -> R) -> R {
        f(&mut self.kernel.lock())
    }

    /// Page entry for `va` in `env`; `None` when the environment or its page table is absent.
    pub fn pte(&self, env: EnvId, va: VirtAddr) -> Option<Pte> {
        self.kernel.lock().env(env)?.pgdir.lookup(va.round_down())
    }

    /// Copy of the frame at `pa`, if allocated.
    pub fn frame(&self, pa: PhysAddr) -> Option<Box<[u8; FRAME_BYTES]>> {
        self.kernel.lock().frames().bytes(pa).map(|bytes| Box::new(*bytes))
    }

    /// Mappings referencing `pa` across all environments.
    pub fn frame_refs(&self, pa: PhysAddr) -> u32 {
        self.kernel.lock().frames().refcount(pa)
    }

    /// Frames still available for allocation.
    pub fn free_frames(&self) -> usize {
        self.kernel.lock().frames().free_count()
    }

    /// Status of `env`, or `None` once it is gone.
    pub fn env_status(&self, env: EnvId) -> Option<EnvStatus> {
        self.kernel.lock().env(env).map(|env| env.status)
    }

    /// Parent recorded when `env` was created.
    pub fn env_parent(&self, env: EnvId) -> Option<EnvId> {
        self.kernel.lock().env(env).map(|env| env.parent)
    }

    /// Registered page-fault upcall of `env`.
    pub fn upcall(&self, env: EnvId) -> Option<UpcallEntry> {
        self.kernel.lock().env(env)?.upcall
    }

    /// Ids of every live environment.
    pub fn live_envs(&self) -> Vec<EnvId> {
        self.kernel.lock().envs().map(|env| env.id).collect()
    }

    /// Runs one monitor command line against `env`'s page directory.
    pub fn monitor(&self, env: EnvId, line: &str) -> Result<String, KernelError> {
        let mut kernel = self.kernel.lock();
        let target = kernel.env_mut(env).ok_or(KernelError::NoSuchEnv(env))?;
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = monitor::runcmd(line, &mut target.pgdir, &mut out);
        Ok(out)
    }

    /// Makes the `successes + 1`-th call of `op` fail with `err`.
    #[cfg(feature = "failpoints")]
    pub fn fail_after(&self, op: crate::Primitive, successes: usize, err: exo_abi::SysError) {
        self.kernel.lock().fail_after(op, successes, err);
    }
}

/// The kernel as seen from inside one environment.
#[derive(Clone)]
pub struct EnvHandle {
    machine: Machine,
    env: EnvId,
}

impl EnvHandle {
    /// Environment this handle acts as.
    pub fn id(&self) -> EnvId {
        self.env
    }

    /// Machine the environment lives on.
    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// The same machine seen from `env`.
    pub fn as_env(&self, env: EnvId) -> EnvHandle {
        self.machine.handle(env)
    }

    fn kernel(&self) -> parking_lot::MutexGuard<'_, Kernel> {
        self.machine.kernel.lock()
    }
}

impl Syscalls for EnvHandle {
    fn getenvid(&self) -> EnvId {
        self.kernel().sys_getenvid(self.env)
    }

    fn exofork(&self) -> SysResult<EnvId> {
        self.kernel().sys_exofork(self.env)
    }

    fn page_alloc(&self, env: EnvId, va: VirtAddr, perm: Perm) -> SysResult<()> {
        self.kernel().sys_page_alloc(self.env, env, va, perm)
    }

    fn page_map(
        &self,
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: Perm,
    ) -> SysResult<()> {
        self.kernel().sys_page_map(self.env, src_env, src_va, dst_env, dst_va, perm)
    }

    fn page_unmap(&self, env: EnvId, va: VirtAddr) -> SysResult<()> {
        self.kernel().sys_page_unmap(self.env, env, va)
    }

    fn env_set_pgfault_upcall(&self, env: EnvId, entry: UpcallEntry) -> SysResult<()> {
        self.kernel().sys_env_set_pgfault_upcall(self.env, env, entry)
    }

    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> SysResult<()> {
        self.kernel().sys_env_set_status(self.env, env, status)
    }

    fn env_destroy(&self, env: EnvId) -> SysResult<()> {
        self.kernel().sys_env_destroy(self.env, env)
    }
}

impl AddressSpaceView for EnvHandle {
    fn uvpd(&self, pdx: usize) -> Pde {
        self.kernel().env(self.env).map_or(Pde::EMPTY, |env| env.pgdir.pde(pdx))
    }

    fn uvpt(&self, pgnum: usize) -> Pte {
        if pgnum >= NPTENTRIES * NPTENTRIES {
            return Pte::EMPTY;
        }
        let va = VirtAddr::from_pgnum(pgnum);
        self.kernel().env(self.env).and_then(|env| env.pgdir.lookup(va)).unwrap_or(Pte::EMPTY)
    }
}

impl UserMemory for EnvHandle {
    fn load(&self, va: VirtAddr, buf: &mut [u8]) -> Result<(), Trap> {
        self.kernel().user_load(self.env, va, buf)
    }

    fn store(&self, va: VirtAddr, bytes: &[u8]) -> Result<(), Trap> {
        self.kernel().user_store(self.env, va, bytes)
    }
}
