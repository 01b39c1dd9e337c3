// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Parent and child privatizing shared COW frames at the same time
//! TEST_SCOPE: unilateral COW breaking without coordination between sharers

use std::thread;

use exo_abi::Perm;
use exo_fork::Process;
use fork_e2e::{boot, map_filled, page, pte, read_page, resume, UserProcess};

const PAGES: u32 = 8;

fn scribble(mut process: UserProcess, tag: u8) -> UserProcess {
    for round in 0..4u8 {
        for n in 0..PAGES {
            process.store(page(n), &[tag, round]);
        }
    }
    process
}

#[test]
fn concurrent_writers_each_get_private_copies() {
    let (machine, mut parent) = boot(256);
    for n in 0..PAGES {
        map_filled(&mut parent, page(n), Perm::USER_RW, 0xC0);
    }
    let child_id = parent.fork();
    let child = resume(&parent, child_id, Process::fork);
    let originals: Vec<_> = (0..PAGES).map(|n| pte(&parent, page(n)).frame()).collect();

    let parent_thread = thread::spawn(move || scribble(parent, 0xAA));
    let child_thread = thread::spawn(move || scribble(child, 0xBB));
    let mut parent = parent_thread.join().expect("parent thread");
    let mut child = child_thread.join().expect("child thread");

    for n in 0..PAGES {
        let va = page(n);
        let mine = read_page(&mut parent, va);
        let theirs = read_page(&mut child, va);
        assert_eq!(&mine[..2], &[0xAA, 3]);
        assert_eq!(&theirs[..2], &[0xBB, 3]);
        assert!(mine[2..].iter().all(|b| *b == 0xC0));
        assert!(theirs[2..].iter().all(|b| *b == 0xC0));
        assert_ne!(pte(&parent, va).frame(), pte(&child, va).frame());
        assert_eq!(Perm::from_pte(pte(&parent, va)), Perm::USER_RW);
        assert_eq!(Perm::from_pte(pte(&child, va)), Perm::USER_RW);
    }
    // Whoever faulted second copied a frame nobody else maps any more.
    for frame in originals {
        assert!(machine.frame_refs(frame) <= 1);
    }
}
