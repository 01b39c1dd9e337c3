// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Shared exokernel ABI exposed to userland libraries and the kernel model
//! OWNERS: @runtime
//! PUBLIC API: EnvId, EnvStatus, SysError, Perm, Pte, UTrapframe; traits Syscalls, AddressSpaceView, UserMemory
//! DEPENDS_ON: no_std (OS), bitflags, static_assertions
//! INVARIANTS: Syscall status is non-negative on success, negative error code on failure;
//!             permission words never carry Accessed/Dirty

pub mod layout;
pub mod pte;
pub mod trap;

use core::fmt;

pub use layout::{
    PhysAddr, VirtAddr, NPDENTRIES, NPTENTRIES, PFTEMP, PGSIZE, PTSIZE, USTACKTOP, UTEMP, UTEXT,
    UTOP, UXSTACKTOP,
};
pub use pte::{Pde, Perm, Pte, PteFlags, PTE_LOW, PTE_STATUS, PTE_SYSCALL};
pub use trap::{FaultCode, KillReason, Trap, UTrapframe, UpcallEntry, UTF_SIZE};

/// Result returned by kernel primitives.
pub type SysResult<T> = core::result::Result<T, SysError>;

/// Errors surfaced by kernel primitives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SysError {
    /// Unspecified or unknown failure.
    Unspecified,
    /// Environment does not exist or the caller may not touch it.
    BadEnv,
    /// Invalid parameter (alignment, range, permission bits).
    Invalid,
    /// Out of physical frames.
    NoMem,
    /// Environment table is full.
    NoFreeEnv,
    /// Memory fault while servicing the request.
    Fault,
}

impl SysError {
    /// Negative status value on the wire.
    pub const fn to_raw(self) -> i32 {
        match self {
            Self::Unspecified => -1,
            Self::BadEnv => -2,
            Self::Invalid => -3,
            Self::NoMem => -4,
            Self::NoFreeEnv => -5,
            Self::Fault => -6,
        }
    }

    /// Decodes a negative status; non-negative values are not errors.
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            r if r >= 0 => None,
            -2 => Some(Self::BadEnv),
            -3 => Some(Self::Invalid),
            -4 => Some(Self::NoMem),
            -5 => Some(Self::NoFreeEnv),
            -6 => Some(Self::Fault),
            _ => Some(Self::Unspecified),
        }
    }
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Unspecified => "unspecified error",
            Self::BadEnv => "bad environment",
            Self::Invalid => "invalid parameter",
            Self::NoMem => "out of memory",
            Self::NoFreeEnv => "out of environments",
            Self::Fault => "segmentation fault",
        };
        f.write_str(msg)
    }
}

#[cfg(any(test, feature = "std"))]
impl std::error::Error for SysError {}

/// Splits a raw syscall return into value or error.
pub fn decode_status(raw: i32) -> SysResult<u32> {
    match SysError::from_raw(raw) {
        Some(err) => Err(err),
        None => Ok(raw as u32),
    }
}

/// log2 of the environment table size.
pub const LOG2NENV: u32 = 10;
/// Size of the environment table.
pub const NENV: usize = 1 << LOG2NENV;
/// Generation stamp increment applied each time a slot is reused.
pub const ENV_GEN_STEP: i32 = 1 << 12;

/// Environment identifier. `0` names the calling environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EnvId(i32);

impl EnvId {
    /// The calling environment; also exofork's return value inside the child.
    pub const CURRENT: EnvId = EnvId(0);

    /// Wraps a raw identifier as returned by the kernel.
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Raw identifier: generation stamp in the high bits, slot in the low bits.
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// True for the `0` alias of the caller.
    pub const fn is_current(self) -> bool {
        self.0 == 0
    }

    /// Index into the environment table.
    pub const fn slot(self) -> usize {
        (self.0 as usize) & (NENV - 1)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Scheduling status of an environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvStatus {
    /// Slot is unused.
    Free,
    /// Eligible to run.
    Runnable,
    /// Exists but may not run; fresh children start here.
    NotRunnable,
    /// Being torn down.
    Dying,
}

/// Kernel primitives consumed by the userland memory layer.
///
/// Every call is atomic and synchronous. `EnvId::CURRENT` names the caller.
pub trait Syscalls {
    /// Identity of the calling environment.
    fn getenvid(&self) -> EnvId;

    /// Creates a not-yet-runnable child with an empty address space.
    ///
    /// Returns the child's id to the parent and [`EnvId::CURRENT`] inside the child.
    fn exofork(&self) -> SysResult<EnvId>;

    /// Maps a fresh zeroed frame at `va` in `env`, replacing any existing mapping.
    fn page_alloc(&self, env: EnvId, va: VirtAddr, perm: Perm) -> SysResult<()>;

    /// Maps the frame at `src_va` in `src_env` at `dst_va` in `dst_env`.
    fn page_map(
        &self,
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: Perm,
    ) -> SysResult<()>;

    /// Removes the mapping at `va` in `env`; unmapping nothing succeeds.
    fn page_unmap(&self, env: EnvId, va: VirtAddr) -> SysResult<()>;

    /// Registers the page-fault upcall entry point for `env`.
    fn env_set_pgfault_upcall(&self, env: EnvId, entry: UpcallEntry) -> SysResult<()>;

    /// Sets `env` runnable or not runnable.
    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> SysResult<()>;

    /// Destroys `env` and releases its mappings.
    fn env_destroy(&self, env: EnvId) -> SysResult<()>;
}

/// Read-only view of the caller's own page directory and page tables.
pub trait AddressSpaceView {
    /// Directory entry `pdx`.
    fn uvpd(&self, pdx: usize) -> Pde;

    /// Page entry for linear page number `pgnum`; empty when its region is absent.
    fn uvpt(&self, pgnum: usize) -> Pte;

    /// Entry mapping `va`, checking the directory first.
    fn pte_at(&self, va: VirtAddr) -> Pte {
        if self.uvpd(va.pdx()).is_present() {
            self.uvpt(va.pgnum())
        } else {
            Pte::EMPTY
        }
    }
}

/// Loads and stores issued by user code, checked by the MMU.
pub trait UserMemory {
    /// Reads `buf.len()` bytes starting at `va`.
    fn load(&self, va: VirtAddr, buf: &mut [u8]) -> Result<(), Trap>;

    /// Writes `bytes` starting at `va`.
    fn store(&self, va: VirtAddr, bytes: &[u8]) -> Result<(), Trap>;
}

/// Everything a user environment can reach.
pub trait UserEnv: Syscalls + AddressSpaceView + UserMemory {}

impl<T: Syscalls + AddressSpaceView + UserMemory + ?Sized> UserEnv for T {}
