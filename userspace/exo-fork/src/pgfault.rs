// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Copy-on-write page-fault handler.

use exo_abi::{AddressSpaceView, EnvId, Perm, Syscalls, UTrapframe, UserEnv, VirtAddr, PFTEMP, PGSIZE};
use log::debug;

use crate::{ForkError, PrimitiveOp, Process};

/// Gives the faulting process a private writable copy of a COW page.
///
/// # Panics
/// If the fault is not a write to a COW page, or if any primitive fails.
pub fn pgfault<S: UserEnv>(process: &mut Process<S>, utf: &UTrapframe) {
    let va = utf.fault_va;
    let pte = process.sys().pte_at(va);
    if !utf.is_write() || !pte.is_cow() {
        panic!(
            "[{}] faulting access at {va} (err {:#x}, pte {pte:?}) is not a write to a COW page",
            process.this_env(),
            utf.err.bits()
        );
    }
    if let Err(err) = privatize(process, va.round_down()) {
        panic!("[{}] pgfault at {va}: {err}", process.this_env());
    }
}

fn privatize<S: UserEnv>(process: &mut Process<S>, page: VirtAddr) -> Result<(), ForkError> {
    let cur = EnvId::CURRENT;
    process
        .sys()
        .page_alloc(cur, PFTEMP, Perm::USER_RW)
        .map_err(ForkError::at(PrimitiveOp::PageAlloc, PFTEMP))?;
    let mut bytes = vec![0u8; PGSIZE as usize];
    process.load(page, &mut bytes);
    process.store(PFTEMP, &bytes);
    process
        .sys()
        .page_map(cur, PFTEMP, cur, page, Perm::USER_RW)
        .map_err(ForkError::at(PrimitiveOp::PageMap, page))?;
    process
        .sys()
        .page_unmap(cur, PFTEMP)
        .map_err(ForkError::at(PrimitiveOp::PageUnmap, PFTEMP))?;
    debug!(target: "exo_fork::pgfault", "[{}] privatized {page}", process.this_env());
    Ok(())
}
