// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page-table inspector and permission mutator on forked address spaces
//! TEST_SCOPE: showmappings row states, chperm success/failure, COW bypass

use exo_abi::{Perm, PteFlags, VirtAddr, UTEXT};
use exo_fork::Process;
use exokern::monitor::{inspect_range, MappingRow};
use fork_e2e::{boot, map_filled, page, pte, read_page, resume};

#[test]
fn showmappings_reports_all_three_states() {
    let (machine, mut parent) = boot(64);
    map_filled(&mut parent, UTEXT, Perm::USER_RW, 0);
    map_filled(&mut parent, page(2), Perm::USER_RO, 0);
    let child = parent.fork();
    let frame = pte(&parent, UTEXT).frame();

    let out = machine.monitor(child, "showmappings 0x7ff000 0x802000").expect("child exists");
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(
        lines,
        vec![
            "  VADDR       PADDR       PTE_U   PTE_W   PTE_P".to_string(),
            "  0x007ff000  -           -       -       -".to_string(),
            format!("  0x00800000  {frame}  1       0       1"),
            "  0x00801000  -           -       -       0".to_string(),
            format!("  0x00802000  {}  1       0       1", pte(&parent, page(2)).frame()),
        ]
    );
}

#[test]
fn inspect_range_agrees_with_the_view() {
    let (machine, mut parent) = boot(64);
    map_filled(&mut parent, UTEXT, Perm::USER_RW, 0);
    let rows = machine.with_kernel(|kernel| {
        let env = kernel.env(parent.this_env()).expect("live");
        inspect_range(&env.pgdir, VirtAddr::new(0x0080_0fff), VirtAddr::new(0x0080_1000))
    });
    assert_eq!(
        rows,
        vec![
            MappingRow::Present { va: UTEXT, pte: pte(&parent, UTEXT) },
            MappingRow::NotPresent(page(1)),
        ]
    );
}

#[test]
fn chperm_on_absent_page_changes_nothing() {
    let (machine, mut parent) = boot(64);
    map_filled(&mut parent, UTEXT, Perm::USER_RW, 0);
    let before = pte(&parent, UTEXT);
    let env = parent.this_env();
    assert_eq!(machine.monitor(env, "chperm 0x801000 6").expect("env"), "ERROR: page not present!\n");
    assert_eq!(machine.monitor(env, "chperm 0x40000000 6").expect("env"), "ERROR: page not present!\n");
    assert_eq!(pte(&parent, UTEXT), before);
    assert!(!pte(&parent, page(1)).is_present());
}

#[test]
fn chperm_rewrites_low_bits_only() {
    let (machine, mut parent) = boot(64);
    map_filled(&mut parent, UTEXT, Perm::USER_RW, 0);
    let _child = parent.fork();
    let before = pte(&parent, UTEXT);
    let refs = machine.frame_refs(before.frame());

    assert_eq!(machine.monitor(parent.this_env(), "chperm 0x800000 4").expect("env"), "");

    let after = pte(&parent, UTEXT);
    assert_eq!(after.frame(), before.frame());
    assert_eq!(after.flags(), PteFlags::PRESENT | PteFlags::USER | PteFlags::COW);
    assert_eq!(machine.frame_refs(after.frame()), refs);
}

#[test]
fn chperm_can_break_cow_sharing() {
    let (machine, mut parent) = boot(64);
    map_filled(&mut parent, UTEXT, Perm::USER_RW, 0x10);
    let child_id = parent.fork();
    let mut child = resume(&parent, child_id, Process::fork);

    machine.monitor(parent.this_env(), "chperm 0x800000 6").expect("env");
    parent.store(UTEXT, &[0x99]);

    // No fault was taken: the write landed in the frame the child still maps.
    assert_eq!(read_page(&mut child, UTEXT)[0], 0x99);
    assert_eq!(pte(&parent, UTEXT).frame(), pte(&child, UTEXT).frame());
}
