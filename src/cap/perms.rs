//! Capability Permission Bits
//!
//! The Morello permission set as a typed bitmask. Permissions control
//! what operations a capability authorizes. When deriving a capability,
//! permissions can only be cleared, never added.
//!
//! # Layout
//! - Bit 0: Global (capability may be shared across compartments)
//! - Bits 1-3: Load, LoadCap, MutableLoad
//! - Bits 4-6: Store, StoreCap, StoreLocalCap
//! - Bits 7-9: Execute, Executive, System
//! - Bits 10-11: Seal, Unseal
//! - Bit 12: BranchSealedPair (capability invoke)
//! - Bit 13: CompartmentId
//! - Bit 14: Vmem (authority to unmap the backing pages)
//! - Bits 15-17: User1..User3 (reserved)

use core::fmt;

use bitflags::bitflags;

bitflags! {
    /// Permissions granted by a capability.
    ///
    /// Rights are orthogonal: each bit is checked independently at the
    /// point of use. Derivation may only intersect with a mask, so a
    /// derived capability's permission set is always a subset of its
    /// parent's.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
    pub struct CapPerms: u32 {
        /// Capability may be stored through any store-capability
        /// permission; without it, the capability is local.
        const GLOBAL = 1 << 0;

        /// Load data through the capability.
        const LOAD = 1 << 1;
        /// Load capabilities (with tags) through the capability.
        const LOAD_CAP = 1 << 2;
        /// Loaded capabilities keep their store permissions.
        const MUTABLE_LOAD = 1 << 3;

        /// Store data through the capability.
        const STORE = 1 << 4;
        /// Store capabilities (with tags) through the capability.
        const STORE_CAP = 1 << 5;
        /// Store local (non-global) capabilities.
        const STORE_LOCAL_CAP = 1 << 6;

        /// Branch to the capability.
        const EXECUTE = 1 << 7;
        /// Elevated (executive) execution privilege.
        const EXECUTIVE = 1 << 8;
        /// Access to system registers.
        const SYSTEM = 1 << 9;

        /// Use the capability as a sealer.
        const SEAL = 1 << 10;
        /// Use the capability as an unsealer.
        const UNSEAL = 1 << 11;

        /// Branch via a sealed capability pair.
        const BRANCH_SEALED_PAIR = 1 << 12;

        /// Use the capability as a compartment identifier.
        const COMPARTMENT_ID = 1 << 13;

        /// Authority over the backing memory mapping.
        const VMEM = 1 << 14;

        /// Reserved user permission bits.
        const USER_1 = 1 << 15;
        const USER_2 = 1 << 16;
        const USER_3 = 1 << 17;

        /// Load permissions as granted to read-only capability views.
        const READ_CAP_PERMS = Self::LOAD.bits()
            | Self::LOAD_CAP.bits()
            | Self::MUTABLE_LOAD.bits();

        /// Store permissions as granted to writable capability views.
        const WRITE_CAP_PERMS = Self::STORE.bits()
            | Self::STORE_CAP.bits()
            | Self::STORE_LOCAL_CAP.bits();

        /// Execute permissions as held by the initial program counter.
        const EXEC_CAP_PERMS = Self::EXECUTE.bits()
            | Self::EXECUTIVE.bits()
            | Self::SYSTEM.bits();
    }
}

/// Fixed rendering table: one letter per permission bit, in display
/// order. A cleared bit renders as `-`.
const PERM_TABLE: [(CapPerms, char); 18] = [
    (CapPerms::GLOBAL, 'G'),
    (CapPerms::LOAD, 'r'),
    (CapPerms::LOAD_CAP, 'R'),
    (CapPerms::MUTABLE_LOAD, 'M'),
    (CapPerms::STORE, 'w'),
    (CapPerms::STORE_CAP, 'W'),
    (CapPerms::STORE_LOCAL_CAP, 'L'),
    (CapPerms::EXECUTE, 'x'),
    (CapPerms::EXECUTIVE, 'E'),
    (CapPerms::SYSTEM, 'S'),
    (CapPerms::SEAL, 's'),
    (CapPerms::UNSEAL, 'u'),
    (CapPerms::BRANCH_SEALED_PAIR, 'I'),
    (CapPerms::COMPARTMENT_ID, 'C'),
    (CapPerms::VMEM, 'V'),
    (CapPerms::USER_1, '1'),
    (CapPerms::USER_2, '2'),
    (CapPerms::USER_3, '3'),
];

impl CapPerms {
    /// Check if this set includes all of the given permissions.
    #[inline]
    #[must_use]
    pub const fn has(self, required: Self) -> bool {
        self.bits() & required.bits() == required.bits()
    }

    /// Check if this set is a subset of another.
    ///
    /// Used to verify that derivation never escalates permissions.
    #[inline]
    #[must_use]
    pub const fn is_subset_of(self, other: Self) -> bool {
        self.bits() & !other.bits() == 0
    }
}

impl fmt::Display for CapPerms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (bit, letter) in PERM_TABLE {
            let c = if self.has(bit) { letter } else { '-' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}
