// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Copy-on-write fork end to end over the host exokernel
//! TEST_SCOPE: mapping classification, COW privatization, exception stacks,
//!             repeated fork, sfork sharing

use exo_abi::{EnvStatus, Perm, PteFlags, Syscalls, VirtAddr, PGSIZE, USTACKTOP, UTEXT};
use exo_fork::{Process, PGFAULT_UPCALL, UXSTACK_PAGE};
use fork_e2e::{boot, map_filled, page, pte, read_page, resume};
use proptest::prelude::*;

#[test]
fn scenario_at_utext() {
    let (machine, mut parent) = boot(64);
    map_filled(&mut parent, UTEXT, Perm::USER_RW, 0x5A);
    let f = pte(&parent, UTEXT).frame();

    let child_id = parent.fork();
    assert_eq!(machine.env_status(child_id), Some(EnvStatus::Runnable));
    for side in [pte(&parent, UTEXT), machine.pte(child_id, UTEXT).expect("child table")] {
        assert_eq!(Perm::from_pte(side), Perm::USER_COW);
        assert_eq!(side.frame(), f);
    }

    let mut child = resume(&parent, child_id, Process::fork);
    child.store(UTEXT, &[0xA5]);

    let mine = pte(&child, UTEXT);
    assert_eq!(Perm::from_pte(mine), Perm::USER_RW);
    assert_ne!(mine.frame(), f);
    let copy = read_page(&mut child, UTEXT);
    assert_eq!(copy[0], 0xA5);
    assert!(copy[1..].iter().all(|b| *b == 0x5A));

    assert_eq!(Perm::from_pte(pte(&parent, UTEXT)), Perm::USER_COW);
    assert_eq!(pte(&parent, UTEXT).frame(), f);
    assert!(read_page(&mut parent, UTEXT).iter().all(|b| *b == 0x5A));
}

#[test]
fn read_only_pages_are_shared_without_cow() {
    let (machine, mut parent) = boot(64);
    map_filled(&mut parent, UTEXT, Perm::USER_RO, 1);
    let child = parent.fork();
    let theirs = machine.pte(child, UTEXT).expect("child table");
    assert_eq!(Perm::from_pte(theirs), Perm::USER_RO);
    assert!(!theirs.is_cow());
    assert_eq!(theirs.frame(), pte(&parent, UTEXT).frame());
    assert_eq!(Perm::from_pte(pte(&parent, UTEXT)), Perm::USER_RO);
}

#[test]
fn status_bits_never_reach_the_child() {
    let (machine, mut parent) = boot(64);
    map_filled(&mut parent, UTEXT, Perm::USER_RW, 3);
    assert!(pte(&parent, UTEXT).flags().contains(PteFlags::ACCESSED | PteFlags::DIRTY));
    let child = parent.fork();
    let theirs = machine.pte(child, UTEXT).expect("child table");
    assert!(!theirs.flags().intersects(PteFlags::ACCESSED | PteFlags::DIRTY));
}

#[test]
fn parent_write_leaves_child_untouched() {
    let (machine, mut parent) = boot(64);
    map_filled(&mut parent, page(0), Perm::USER_RW, 7);
    let child_id = parent.fork();
    let shared = pte(&parent, page(0)).frame();

    parent.store(VirtAddr::new(page(0).raw() + 100), &[8]);

    assert_ne!(pte(&parent, page(0)).frame(), shared);
    let theirs = machine.pte(child_id, page(0)).expect("child table");
    assert_eq!(theirs.frame(), shared);
    assert!(theirs.is_cow());
    let mut child = resume(&parent, child_id, Process::fork);
    assert!(read_page(&mut child, page(0)).iter().all(|b| *b == 7));
}

#[test]
fn exception_stacks_are_private() {
    let (machine, mut parent) = boot(64);
    let child_id = parent.fork();
    let mine = pte(&parent, UXSTACK_PAGE);
    let theirs = machine.pte(child_id, UXSTACK_PAGE).expect("child xstack");
    for side in [mine, theirs] {
        assert_eq!(Perm::from_pte(side), Perm::USER_RW);
        assert!(!side.is_cow());
    }
    assert_ne!(mine.frame(), theirs.frame());
    assert_eq!(machine.frame_refs(theirs.frame()), 1);
    assert_eq!(machine.upcall(child_id), Some(PGFAULT_UPCALL));
}

#[test]
fn user_stack_becomes_cow() {
    let (machine, mut parent) = boot(64);
    let stack = VirtAddr::new(USTACKTOP.raw() - PGSIZE);
    let child = parent.fork();
    assert!(pte(&parent, stack).is_cow());
    assert!(machine.pte(child, stack).is_some_and(|p| p.is_cow()));
}

#[test]
fn second_fork_keeps_everything_cow() {
    let (machine, mut parent) = boot(96);
    map_filled(&mut parent, UTEXT, Perm::USER_RW, 9);
    let f = pte(&parent, UTEXT).frame();

    let first = parent.fork();
    let second = parent.fork();

    assert_eq!(Perm::from_pte(pte(&parent, UTEXT)), Perm::USER_COW);
    for child in [first, second] {
        let theirs = machine.pte(child, UTEXT).expect("child table");
        assert_eq!(Perm::from_pte(theirs), Perm::USER_COW);
        assert_eq!(theirs.frame(), f);
    }
    assert_eq!(machine.frame_refs(f), 3);

    let mut second_child = resume(&parent, second, Process::fork);
    second_child.store(UTEXT, &[1]);
    assert_eq!(machine.frame_refs(f), 2);
    assert!(machine.pte(first, UTEXT).is_some_and(|p| p.is_cow() && p.frame() == f));
}

#[test]
fn child_can_fork_again() {
    let (machine, mut parent) = boot(96);
    map_filled(&mut parent, UTEXT, Perm::USER_RW, 4);
    let child_id = parent.fork();
    let mut child = resume(&parent, child_id, Process::fork);

    let grandchild_id = child.fork();
    assert_eq!(machine.env_parent(grandchild_id), Some(child_id));
    let mut grandchild = resume(&child, grandchild_id, Process::fork);
    grandchild.store(UTEXT, &[44]);

    assert_eq!(read_page(&mut grandchild, UTEXT)[0], 44);
    assert_eq!(read_page(&mut child, UTEXT)[0], 4);
    assert_eq!(read_page(&mut parent, UTEXT)[0], 4);
}

#[test]
fn destroyed_children_return_their_frames() {
    let (machine, mut parent) = boot(64);
    map_filled(&mut parent, UTEXT, Perm::USER_RW, 2);
    parent.set_pgfault_handler(exo_fork::pgfault);
    let baseline = machine.free_frames();

    let child_id = parent.fork();
    let mut child = resume(&parent, child_id, Process::fork);
    child.store(UTEXT, &[0]);
    assert!(machine.free_frames() < baseline);

    parent.sys().env_destroy(child_id).expect("destroy child");
    assert_eq!(machine.env_status(child_id), None);
    assert_eq!(machine.free_frames(), baseline);

    // Still COW-marked although no longer shared: the next write copies anyway.
    parent.store(UTEXT, &[1]);
    assert_eq!(Perm::from_pte(pte(&parent, UTEXT)), Perm::USER_RW);
}

#[test]
fn sfork_shares_memory_but_not_the_stack() {
    let (machine, mut parent) = boot(64);
    map_filled(&mut parent, UTEXT, Perm::USER_RW, 0);
    let stack = VirtAddr::new(USTACKTOP.raw() - PGSIZE);

    let child_id = parent.sfork();
    let mut child = resume(&parent, child_id, Process::sfork);

    child.store(UTEXT, &[0xEE]);
    assert_eq!(read_page(&mut parent, UTEXT)[0], 0xEE);

    child.store(stack, &[0x11]);
    parent.store(stack, &[0x22]);
    assert_eq!(read_page(&mut child, stack)[0], 0x11);
    assert_eq!(read_page(&mut parent, stack)[0], 0x22);
    assert_ne!(pte(&parent, stack).frame(), pte(&child, stack).frame());
    assert_ne!(
        machine.pte(child_id, UXSTACK_PAGE).map(|p| p.frame()),
        Some(pte(&parent, UXSTACK_PAGE).frame())
    );
}

#[test]
fn sfork_of_cow_page_shares_the_frame_read_only() {
    let (machine, mut parent) = boot(96);
    map_filled(&mut parent, UTEXT, Perm::USER_RW, 5);
    let _earlier = parent.fork();
    let shared = pte(&parent, UTEXT).frame();

    let child_id = parent.sfork();
    let theirs = machine.pte(child_id, UTEXT).expect("child table");
    assert_eq!(Perm::from_pte(theirs), Perm::USER_RO);
    assert_eq!(theirs.frame(), shared);

    parent.store(UTEXT, &[6]);
    // The parent privatized; the sfork child still sees the old frame.
    assert_ne!(pte(&parent, UTEXT).frame(), shared);
    assert_eq!(machine.pte(child_id, UTEXT).map(|p| p.frame()), Some(shared));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn writes_stay_private_after_fork(
        layout in proptest::collection::vec(any::<bool>(), 1..6),
        writer_is_child in any::<bool>(),
        target in 0usize..6,
    ) {
        let (machine, mut parent) = boot(128);
        for (n, writable) in layout.iter().enumerate() {
            let perm = if *writable { Perm::USER_RW } else { Perm::USER_RO };
            map_filled(&mut parent, page(n as u32), perm, n as u8);
        }
        let child_id = parent.fork();
        let mut child = resume(&parent, child_id, Process::fork);
        let target = target % layout.len();
        let va = page(target as u32);
        if layout[target] {
            let (writer, other) = if writer_is_child { (&mut child, &mut parent) } else { (&mut parent, &mut child) };
            writer.store(va, &[0xFF]);
            prop_assert_eq!(read_page(writer, va)[0], 0xFF);
            prop_assert_eq!(read_page(other, va)[0], target as u8);
            prop_assert!(pte(other, va).is_cow());
            prop_assert_ne!(pte(writer, va).frame(), pte(other, va).frame());
        }
        for n in 0..layout.len() {
            let va = page(n as u32);
            if !layout[n] {
                prop_assert_eq!(pte(&parent, va).frame(), pte(&child, va).frame());
                prop_assert!(!pte(&child, va).is_cow());
            }
        }
        prop_assert_eq!(machine.env_status(child_id), Some(EnvStatus::Runnable));
    }
}
