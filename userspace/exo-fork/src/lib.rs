// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User-level process duplication over exokernel page-mapping primitives
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//!
//! PUBLIC API:
//!   - Process: per-process library context (identity, fault handler, trampoline)
//!   - Process::fork / Process::sfork (+ try_ variants)
//!   - duppage: per-page COW/shared mapping policy
//!   - pgfault: copy-on-write page-fault handler
//!
//! INVARIANTS:
//!   - The exception stack page is always private and never COW
//!   - After duppage both sides map the same frame with the same classification
//!   - A COW fault only ever changes the faulting process's own mapping
//!   - The page-fault handler is not reentrant
//!
//! DEPENDENCIES:
//!   - exo-abi: kernel primitives, address-space view, user memory
//!   - log: diagnostics
//!   - thiserror: ForkError

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

mod fork;
mod pgfault;

use exo_abi::{
    EnvId, Perm, SysError, Trap, UTrapframe, UpcallEntry, UserEnv, VirtAddr, PGSIZE, UTEXT,
    UTF_SIZE, UXSTACKTOP,
};

pub use fork::duppage;
pub use pgfault::pgfault;

/// Entry point of the assembly upcall trampoline that switches to the
/// exception stack, calls the registered handler and resumes the faulting
/// instruction.
pub const PGFAULT_UPCALL: UpcallEntry = UpcallEntry(UTEXT);

/// Base of the exception stack page.
pub const UXSTACK_PAGE: VirtAddr = VirtAddr::new(UXSTACKTOP.raw() - PGSIZE);

/// User-level page-fault handler.
pub type PgfaultHandler<S> = fn(&mut Process<S>, &UTrapframe);

/// Kernel primitive named in a [`ForkError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimitiveOp {
    /// Child creation.
    Exofork,
    /// Fresh page mapping.
    PageAlloc,
    /// Shared or COW mapping.
    PageMap,
    /// Scratch unmapping.
    PageUnmap,
    /// Upcall registration.
    SetPgfaultUpcall,
    /// Child activation.
    SetStatus,
}

impl core::fmt::Display for PrimitiveOp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Exofork => "sys_exofork",
            Self::PageAlloc => "sys_page_alloc",
            Self::PageMap => "sys_page_map",
            Self::PageUnmap => "sys_page_unmap",
            Self::SetPgfaultUpcall => "sys_env_set_pgfault_upcall",
            Self::SetStatus => "sys_env_set_status",
        };
        f.write_str(name)
    }
}

/// A kernel primitive failed while duplicating or servicing a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{op} failed at {va}: {source}")]
pub struct ForkError {
    /// Primitive that failed.
    pub op: PrimitiveOp,
    /// Page being processed, or 0 when none applies.
    pub va: VirtAddr,
    /// Kernel error.
    #[source]
    pub source: SysError,
}

impl ForkError {
    pub(crate) fn at(op: PrimitiveOp, va: VirtAddr) -> impl FnOnce(SysError) -> Self {
        move |source| Self { op, va, source }
    }
}

/// Library state of one user environment.
///
/// Holds what a C runtime would keep in globals: the identity of the
/// running environment and the registered page-fault handler.
pub struct Process<S: UserEnv> {
    sys: S,
    this_env: EnvId,
    pgfault_handler: Option<PgfaultHandler<S>>,
    in_upcall: bool,
}

impl<S: UserEnv> Process<S> {
    /// Library state for the environment behind `sys`, with no fault handler.
    pub fn new(sys: S) -> Self {
        let this_env = sys.getenvid();
        Self { sys, this_env, pgfault_handler: None, in_upcall: false }
    }

    /// The library state a freshly forked child starts with: a byte-for-byte
    /// copy of this process's, running on `sys`. Its identity stays stale
    /// until the child resumes from `fork`.
    pub fn inherited(&self, sys: S) -> Self {
        Self { sys, this_env: self.this_env, pgfault_handler: self.pgfault_handler, in_upcall: false }
    }

    /// Kernel interface of the running environment.
    pub fn sys(&self) -> &S {
        &self.sys
    }

    /// Identity recorded by the library (`thisenv`).
    pub fn this_env(&self) -> EnvId {
        self.this_env
    }

    /// Registers `handler` for page faults.
    ///
    /// The first registration maps the exception stack and installs the
    /// upcall entry; later calls only replace the handler.
    ///
    /// # Panics
    /// If the kernel refuses either setup primitive.
    pub fn set_pgfault_handler(&mut self, handler: PgfaultHandler<S>) {
        if self.pgfault_handler.is_none() {
            let setup = self
                .sys
                .page_alloc(EnvId::CURRENT, UXSTACK_PAGE, Perm::USER_RW)
                .map_err(ForkError::at(PrimitiveOp::PageAlloc, UXSTACK_PAGE))
                .and_then(|()| {
                    self.sys
                        .env_set_pgfault_upcall(EnvId::CURRENT, PGFAULT_UPCALL)
                        .map_err(ForkError::at(PrimitiveOp::SetPgfaultUpcall, PGFAULT_UPCALL.0))
                });
            if let Err(err) = setup {
                panic!("[{}] set_pgfault_handler: {err}", self.this_env);
            }
        }
        self.pgfault_handler = Some(handler);
    }

    /// Reads `buf.len()` bytes at `va`, servicing page faults on the way.
    ///
    /// # Panics
    /// If the environment is killed or a fault cannot be resolved.
    pub fn load(&mut self, va: VirtAddr, buf: &mut [u8]) {
        self.access(va, |sys| sys.load(va, buf));
    }

    /// Writes `bytes` at `va`, servicing page faults on the way.
    ///
    /// # Panics
    /// If the environment is killed or a fault cannot be resolved.
    pub fn store(&mut self, va: VirtAddr, bytes: &[u8]) {
        self.access(va, |sys| sys.store(va, bytes));
    }

    /// Re-executes `op` after every delivered fault until it completes.
    fn access(&mut self, va: VirtAddr, mut op: impl FnMut(&S) -> Result<(), Trap>) {
        let mut last: Option<UTrapframe> = None;
        loop {
            let utf = match op(&self.sys) {
                Ok(()) => return,
                Err(Trap::Killed(reason)) => {
                    panic!("[{}] killed accessing {va}: {reason}", self.this_env)
                }
                Err(Trap::Upcall(utf)) => utf,
            };
            if self.in_upcall {
                panic!(
                    "[{}] page fault at {} while on the exception stack",
                    self.this_env, utf.fault_va
                );
            }
            if last == Some(utf) {
                panic!(
                    "[{}] unresolved page fault at {} err {:#x}",
                    self.this_env,
                    utf.fault_va,
                    utf.err.bits()
                );
            }
            self.upcall(&utf);
            last = Some(utf);
        }
    }

    /// Runs the registered handler on the frame the kernel pushed.
    fn upcall(&mut self, delivered: &UTrapframe) {
        let Some(handler) = self.pgfault_handler else {
            panic!("[{}] page fault upcall with no handler registered", self.this_env);
        };
        let mut raw = [0u8; UTF_SIZE];
        let top = VirtAddr::new(UXSTACKTOP.raw() - UTF_SIZE as u32);
        if let Err(trap) = self.sys.load(top, &mut raw) {
            panic!("[{}] exception stack unreadable: {trap:?}", self.this_env);
        }
        let utf = UTrapframe::from_le_bytes(raw);
        debug_assert_eq!(utf, *delivered);
        self.in_upcall = true;
        handler(self, &utf);
        self.in_upcall = false;
    }
}
