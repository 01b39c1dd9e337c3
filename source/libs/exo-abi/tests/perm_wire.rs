// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property tests for the permission wire word
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 3 property tests
//!
//! TEST_SCOPE:
//!   - Status bits never survive the PTE -> permission conversion
//!   - Wire form keeps exact bit positions
//!   - Low-permission rewrite never touches the frame

use exo_abi::{Perm, PhysAddr, Pte, PteFlags, PTE_LOW, PTE_STATUS, PTE_SYSCALL};
use proptest::prelude::*;

fn arb_pte() -> impl Strategy<Value = Pte> {
    (any::<u32>(), any::<u32>()).prop_map(|(frame, bits)| {
        Pte::new(PhysAddr::new(frame & !0xfff), PteFlags::from_bits_retain(bits & 0xfff))
    })
}

proptest! {
    #[test]
    fn perm_from_live_entry_never_carries_status(pte in arb_pte()) {
        let perm = Perm::from_pte(pte);
        prop_assert!(!perm.flags().intersects(PTE_STATUS));
        prop_assert!(PTE_SYSCALL.contains(perm.flags()));
        prop_assert_eq!(Perm::from_wire(perm.to_wire()), Some(perm));
    }

    #[test]
    fn wire_bits_match_entry_bits(pte in arb_pte()) {
        let perm = Perm::from_pte(pte);
        prop_assert_eq!(perm.to_wire(), pte.raw() & PTE_SYSCALL.bits());
    }

    #[test]
    fn low_perm_rewrite_keeps_frame(pte in arb_pte(), code in 0u32..8) {
        let changed = pte.with_low_perms(PteFlags::from_bits_retain(code));
        prop_assert_eq!(changed.frame(), pte.frame());
        prop_assert_eq!(changed.raw() & !PTE_LOW.bits(), pte.raw() & !PTE_LOW.bits());
        prop_assert_eq!(changed.raw() & PTE_LOW.bits(), code);
    }
}
