// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use exo_abi::{AddressSpaceView, EnvId, Perm, Pte, Syscalls, VirtAddr, PGSIZE, UTEXT};
use exo_fork::Process;
use exokern::{EnvHandle, Machine, MachineConfig};

pub type UserProcess = Process<EnvHandle>;

/// Boots a machine with `frames` frames and one runnable root process.
pub fn boot(frames: usize) -> (Machine, UserProcess) {
    let machine = Machine::new(MachineConfig { frames, max_envs: 16 });
    let root = machine.spawn().expect("spawn root");
    (machine, Process::new(root))
}

/// Page `n` above `UTEXT`.
pub fn page(n: u32) -> VirtAddr {
    VirtAddr::new(UTEXT.raw() + n * PGSIZE)
}

/// Maps a fresh page at `va` with `perm` and fills it with `fill`.
pub fn map_filled(process: &mut UserProcess, va: VirtAddr, perm: Perm, fill: u8) {
    process.sys().page_alloc(EnvId::CURRENT, va, Perm::USER_RW).expect("page_alloc");
    process.store(va, &vec![fill; PGSIZE as usize]);
    if perm != Perm::USER_RW {
        process.sys().page_map(EnvId::CURRENT, va, EnvId::CURRENT, va, perm).expect("downgrade");
    }
}

/// The child's side of a fork: inherits `parent`'s library state and
/// resumes from the same call, which must return zero.
pub fn resume(
    parent: &UserProcess,
    child: EnvId,
    call: fn(&mut UserProcess) -> EnvId,
) -> UserProcess {
    let mut process = parent.inherited(parent.sys().as_env(child));
    assert_eq!(call(&mut process), EnvId::CURRENT, "child must observe a zero return");
    assert_eq!(process.this_env(), child, "child identity re-resolved");
    process
}

/// Full page contents at `va` as seen by `process`.
pub fn read_page(process: &mut UserProcess, va: VirtAddr) -> Vec<u8> {
    let mut bytes = vec![0u8; PGSIZE as usize];
    process.load(va.round_down(), &mut bytes);
    bytes
}

pub fn pte(process: &UserProcess, va: VirtAddr) -> Pte {
    process.sys().pte_at(va)
}
