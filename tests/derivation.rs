//! Property tests for monotonic capability derivation.

use caprock::{CapPerms, Machine};
use proptest::prelude::*;

/// Arena big enough for every offset the strategies produce.
const ARENA_PAGES: usize = 64;

proptest! {
    /// Any derived capability's range is a subset of its parent's and
    /// its permission set never grows.
    #[test]
    fn derivation_is_monotonic(
        off in 0usize..0x8000,
        len in 1usize..0x1000,
        mask in any::<u32>(),
        inner_off in 0usize..0x1000,
        inner_len in 0usize..0x1000,
    ) {
        let m = Machine::with_arena(ARENA_PAGES).unwrap();
        let root = m.rw_root();

        let parent = root.with_address(root.base() + off).set_bounds_exact(len);
        prop_assert!(parent.tag());
        prop_assert!(parent.base() >= root.base());
        prop_assert!(parent.limit() <= root.limit());

        let masked = parent.perms_and(CapPerms::from_bits_truncate(mask));
        prop_assert!(masked.perms().is_subset_of(parent.perms()));
        prop_assert_eq!(masked.base(), parent.base());
        prop_assert_eq!(masked.length(), parent.length());

        let child = masked
            .with_address(masked.base() + inner_off)
            .set_bounds_exact(inner_len);
        if child.tag() {
            prop_assert!(child.base() >= parent.base());
            prop_assert!(child.limit() <= parent.limit());
            prop_assert!(child.perms().is_subset_of(parent.perms()));
        } else {
            // The requested range escaped the parent: the tag is gone
            // and the result is never dereferenceable.
            prop_assert!(!child.is_valid());
            prop_assert_eq!(child.tail(), 0);
        }
    }

    /// `tail` equals `limit - address` exactly when the capability is
    /// in bounds, and 0 otherwise.
    #[test]
    fn tail_matches_remaining_range(
        len in 1usize..0x1000,
        probe in 0usize..0x3000,
    ) {
        let m = Machine::with_arena(ARENA_PAGES).unwrap();
        let root = m.rw_root();
        let cap = root.set_bounds_exact(len);
        let probed = cap.with_address(cap.base() + probe);
        if probed.in_bounds() {
            prop_assert_eq!(probed.tail(), probed.limit() - probed.address());
        } else {
            prop_assert_eq!(probed.tail(), 0);
        }
    }

    /// Sealing makes the bounds and permissions opaque no matter what
    /// they were.
    #[test]
    fn sealed_capabilities_are_opaque(
        off in 0usize..0x8000,
        len in 1usize..0x1000,
        mask in any::<u32>(),
    ) {
        let m = Machine::with_arena(ARENA_PAGES).unwrap();
        let cap = m
            .rw_root()
            .with_address(m.rw_root().base() + off)
            .set_bounds_exact(len)
            .perms_and(CapPerms::from_bits_truncate(mask));
        let sealed = cap.seal_entry();
        prop_assert_eq!(sealed.length(), 0);
        prop_assert_eq!(sealed.limit(), 0);
        prop_assert_eq!(sealed.tail(), 0);
        prop_assert!(sealed.perms().is_empty());
        prop_assert!(!sealed.in_bounds());
        prop_assert_eq!(sealed.address(), cap.address());
    }
}
