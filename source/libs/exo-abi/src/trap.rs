// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page-fault frames delivered to user-level handlers.

use core::fmt;

use bitflags::bitflags;

use crate::layout::VirtAddr;
use crate::EnvId;

bitflags! {
    /// Page-fault error code pushed by the MMU.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct FaultCode: u32 {
        /// Fault hit a present page (protection violation) rather than a missing one.
        const PROTECTION = 1 << 0;
        /// Faulting access was a write.
        const WRITE = 1 << 1;
        /// Fault occurred in user mode.
        const USER = 1 << 2;
    }
}

/// Fault context handed to the user-level page-fault handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UTrapframe {
    /// Faulting virtual address.
    pub fault_va: VirtAddr,
    /// Error code describing the access.
    pub err: FaultCode,
    /// Environment the fault was delivered to.
    pub env: EnvId,
}

/// Bytes the kernel pushes onto the exception stack for one fault.
pub const UTF_SIZE: usize = 12;

impl UTrapframe {
    /// True if the faulting access was a write.
    pub const fn is_write(&self) -> bool {
        self.err.contains(FaultCode::WRITE)
    }

    /// Little-endian frame as laid out on the exception stack.
    pub fn to_le_bytes(&self) -> [u8; UTF_SIZE] {
        let mut out = [0u8; UTF_SIZE];
        out[0..4].copy_from_slice(&self.fault_va.raw().to_le_bytes());
        out[4..8].copy_from_slice(&self.err.bits().to_le_bytes());
        out[8..12].copy_from_slice(&self.env.raw().to_le_bytes());
        out
    }

    /// Inverse of [`UTrapframe::to_le_bytes`]; unknown error bits are dropped.
    pub fn from_le_bytes(bytes: [u8; UTF_SIZE]) -> Self {
        let word = |i: usize| [bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]];
        Self {
            fault_va: VirtAddr::new(u32::from_le_bytes(word(0))),
            err: FaultCode::from_bits_truncate(u32::from_le_bytes(word(4))),
            env: EnvId::from_raw(i32::from_le_bytes(word(8))),
        }
    }
}

/// Entry point the kernel jumps to when delivering a page-fault upcall.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UpcallEntry(pub VirtAddr);

/// Reason the kernel tore an environment down instead of delivering a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KillReason {
    /// No page-fault upcall is registered.
    NoUpcall,
    /// The user exception stack is missing or not writable.
    ExceptionStackUnmapped,
    /// The environment is not runnable and cannot execute.
    NotRunnable,
    /// The environment no longer exists.
    Destroyed,
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoUpcall => write!(f, "page fault with no upcall registered"),
            Self::ExceptionStackUnmapped => write!(f, "user exception stack not mapped writable"),
            Self::NotRunnable => write!(f, "environment is not runnable"),
            Self::Destroyed => write!(f, "environment destroyed"),
        }
    }
}

/// Outcome of a user memory access that did not complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trap {
    /// Synchronous page-fault upcall; the access must be re-executed after the handler runs.
    Upcall(UTrapframe),
    /// The environment was destroyed.
    Killed(KillReason),
}
