// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host model of the exokernel consumed by the userland fork library
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//!
//! PUBLIC API:
//!   - Machine: shared kernel instance, spawns root environments
//!   - EnvHandle: per-environment view implementing the exo-abi traits
//!   - Kernel: primitives (sys_*), user memory access, fault delivery
//!   - monitor: `help`, `showmappings`, `chperm`
//!
//! INVARIANTS:
//!   - Every primitive is atomic with respect to every other (single kernel lock)
//!   - A frame is recycled only when no page table references it
//!   - Only runnable environments issue primitives or touch memory
//!   - Faults are delivered only with an upcall and a writable exception stack;
//!     otherwise the environment is destroyed
//!
//! DEPENDENCIES:
//!   - exo-abi: shared layout, permission and error types
//!   - parking_lot::Mutex: kernel lock
//!   - log: diagnostics

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

pub mod env;
mod machine;
pub mod mm;
pub mod monitor;
mod syscall;
mod trap;

use exo_abi::{EnvId, SysError};

pub use machine::{EnvHandle, Machine};
pub use mm::page_table::{MapError, PageDirectory};
pub use syscall::{Kernel, Primitive};

/// Errors raised by host-side kernel operations (outside the syscall ABI).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KernelError {
    /// No live environment carries this id.
    #[error("no environment {0}")]
    NoSuchEnv(EnvId),
    /// A primitive rejected the request.
    #[error("kernel primitive failed: {0}")]
    Sys(#[from] SysError),
}

/// Resource limits of a host machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MachineConfig {
    /// Physical frames, including the reserved frame 0.
    pub frames: usize,
    /// Environment table capacity.
    pub max_envs: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self { frames: 1024, max_envs: exo_abi::NENV }
    }
}
