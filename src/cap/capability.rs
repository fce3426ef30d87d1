//! Capability Type and Query/Derivation Primitives
//!
//! Defines the core capability value of the runtime.
//!
//! # Capability Structure
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Capability                          │
//! ├──────────────────────────────────────────────────────────┤
//! │  address: usize      - Current cursor within the bounds  │
//! │  base/length: usize  - Accessible range [base, limit)    │
//! │  perms: CapPerms     - Permitted operations              │
//! │  tag: bool           - Validity; cleared by bad derives  │
//! │  seal: SealKind      - Opaque token state                │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Security Properties
//! - Cannot be minted outside the machine; every public operation
//!   derives from an existing capability
//! - Bounds and permissions only narrow, never widen
//! - A cleared tag can never be restored
//! - Query primitives are total: they degrade to 0/false on invalid
//!   or sealed input instead of faulting

use core::fmt;

use super::perms::CapPerms;

/// Seal state of a capability.
///
/// A sealed capability is an opaque token: it cannot be dereferenced
/// or modified until unsealed through the matching mechanism.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Hash)]
pub enum SealKind {
    /// Not sealed; the capability can be dereferenced normally.
    #[default]
    None,
    /// Sealed entry (sentry): callable, nothing else.
    Rb,
    /// Load-pair-branch sentry.
    Lpb,
    /// Load-branch sentry.
    Lb,
    /// Sealed with an object-type sealer; unsealable only by a holder
    /// of a matching unseal capability or by the sealed-pair branch.
    Obj(u16),
}

impl SealKind {
    /// Check if this is any sealed state.
    #[inline]
    #[must_use]
    pub const fn is_sealed(self) -> bool {
        !matches!(self, SealKind::None)
    }
}

impl fmt::Display for SealKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SealKind::None => write!(f, "none"),
            SealKind::Rb => write!(f, "rb"),
            SealKind::Lpb => write!(f, "lpb"),
            SealKind::Lb => write!(f, "lb"),
            SealKind::Obj(otype) => write!(f, "{:04x}", otype),
        }
    }
}

/// A capability: a bounded, tagged, permission-carrying reference.
///
/// All query operations are total functions. An untagged or sealed
/// capability answers 0/false rather than faulting, so callers can use
/// `tail()`-style queries as self-contained bounds checks with no
/// separate check-then-use step.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capability {
    pub(crate) address: usize,
    pub(crate) base: usize,
    pub(crate) length: usize,
    pub(crate) perms: CapPerms,
    pub(crate) tag: bool,
    pub(crate) seal: SealKind,
}

impl Capability {
    /// The null capability: untagged, zero bounds, no permissions.
    pub const NULL: Self = Self {
        address: 0,
        base: 0,
        length: 0,
        perms: CapPerms::empty(),
        tag: false,
        seal: SealKind::None,
    };

    /// Mint a root capability.
    ///
    /// Only the machine may mint roots; everything else is derived.
    pub(crate) const fn root(base: usize, length: usize, perms: CapPerms) -> Self {
        Self {
            address: base,
            base,
            length,
            perms,
            tag: true,
            seal: SealKind::None,
        }
    }

    /// An untagged capability holding only an address, as produced by
    /// loading a capability-width value whose tag is clear.
    pub(crate) const fn untagged(address: usize) -> Self {
        Self {
            address,
            base: 0,
            length: 0,
            perms: CapPerms::empty(),
            tag: false,
            seal: SealKind::None,
        }
    }

    /// Check if this is the null capability.
    #[inline]
    #[must_use]
    pub const fn is_null(&self) -> bool {
        !self.tag && self.address == 0 && self.length == 0
    }

    /// Current address.
    ///
    /// Observable even on sealed capabilities; the seal hides bounds
    /// and permissions, not the address value.
    #[inline]
    #[must_use]
    pub const fn address(&self) -> usize {
        self.address
    }

    /// Validity tag.
    #[inline]
    #[must_use]
    pub const fn tag(&self) -> bool {
        self.tag
    }

    /// Seal state.
    #[inline]
    #[must_use]
    pub const fn seal_kind(&self) -> SealKind {
        self.seal
    }

    /// Check if the capability is sealed.
    #[inline]
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.seal.is_sealed()
    }

    /// Length of the accessible range: `limit - base`.
    ///
    /// 0 for a null or untagged capability. A sealed capability is an
    /// opaque token and also answers 0.
    #[inline]
    #[must_use]
    pub const fn length(&self) -> usize {
        if !self.tag || self.is_sealed() {
            0
        } else {
            self.length
        }
    }

    /// Upper bound of the accessible range: `base + length`.
    ///
    /// The limit of a null capability is 0; a sealed capability does
    /// not reveal its limit.
    #[inline]
    #[must_use]
    pub const fn limit(&self) -> usize {
        if !self.tag || self.is_sealed() {
            0
        } else {
            self.base + self.length
        }
    }

    /// Base of the accessible range.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> usize {
        if self.is_sealed() {
            0
        } else {
            self.base
        }
    }

    /// Remaining bytes from the current address to the limit:
    /// `limit - address` when in bounds, otherwise 0.
    ///
    /// The pervasive "how many bytes remain" query used before any
    /// read, write or copy.
    #[inline]
    #[must_use]
    pub const fn tail(&self) -> usize {
        if !self.tag || self.is_sealed() || !self.in_bounds() {
            0
        } else {
            self.base + self.length - self.address
        }
    }

    /// Check if `base <= address < limit`.
    ///
    /// A sealed capability is never in bounds for the purpose of
    /// dereferencing.
    #[inline]
    #[must_use]
    pub const fn in_bounds(&self) -> bool {
        if self.is_sealed() {
            return false;
        }
        self.base <= self.address && self.address < self.base + self.length
    }

    /// Check if the capability is dereferenceable: tagged and in
    /// bounds.
    #[inline]
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.tag && self.in_bounds()
    }

    /// Check if the capability is local (lacks the global permission).
    #[inline]
    #[must_use]
    pub const fn is_local(&self) -> bool {
        !self.perms().has(CapPerms::GLOBAL)
    }

    /// Permission set.
    ///
    /// A sealed capability reports no permissions: its rights cannot
    /// be exercised or inspected until it is unsealed.
    #[inline]
    #[must_use]
    pub const fn perms(&self) -> CapPerms {
        if self.is_sealed() {
            CapPerms::empty()
        } else {
            self.perms
        }
    }

    /// Check if the capability carries all of the given permissions.
    #[inline]
    #[must_use]
    pub const fn check_perms(&self, required: CapPerms) -> bool {
        self.perms().has(required)
    }

    /// Derive a capability with a new address and unchanged bounds.
    ///
    /// Moving the address out of bounds keeps the tag (the result is
    /// simply not dereferenceable there); deriving from a sealed
    /// capability clears the tag.
    #[must_use = "derivation returns a new capability"]
    pub fn with_address(&self, address: usize) -> Self {
        let mut c = self.unsealed_or_cleared();
        c.address = address;
        c
    }

    /// Derive a capability with the address moved by `delta` bytes.
    #[must_use = "derivation returns a new capability"]
    pub fn offset(&self, delta: isize) -> Self {
        self.with_address(self.address.wrapping_add_signed(delta))
    }

    /// Derive a capability whose bounds are exactly
    /// `[address, address + len)`.
    ///
    /// The requested range must be a subset of the current range;
    /// escaping it clears the tag (monotonic narrowing).
    #[must_use = "derivation returns a new capability"]
    pub fn set_bounds_exact(&self, len: usize) -> Self {
        let mut c = self.unsealed_or_cleared();
        let in_parent = c.base <= c.address
            && c.address
                .checked_add(len)
                .is_some_and(|end| end <= c.base + c.length);
        if !in_parent {
            c.tag = false;
        }
        c.base = c.address;
        c.length = len;
        c
    }

    /// Derive a capability with the permission set intersected with
    /// `mask`. Permissions can only be cleared this way.
    #[must_use = "derivation returns a new capability"]
    pub fn perms_and(&self, mask: CapPerms) -> Self {
        let mut c = self.unsealed_or_cleared();
        c.perms &= mask;
        c
    }

    /// Seal as an entry capability (sentry): callable, otherwise
    /// opaque. Sealing an already sealed capability clears the tag.
    #[must_use = "sealing returns a new capability"]
    pub fn seal_entry(&self) -> Self {
        self.seal_as(SealKind::Rb)
    }

    /// Seal as a load-pair-branch sentry.
    #[must_use = "sealing returns a new capability"]
    pub fn seal_lpb(&self) -> Self {
        self.seal_as(SealKind::Lpb)
    }

    /// Seal as a load-branch sentry.
    #[must_use = "sealing returns a new capability"]
    pub fn seal_lb(&self) -> Self {
        self.seal_as(SealKind::Lb)
    }

    /// Seal with an object-type sealer.
    ///
    /// The sealer must be valid and carry the seal permission; the
    /// object type is the sealer's current address. On any violation
    /// the result has its tag cleared.
    #[must_use = "sealing returns a new capability"]
    pub fn seal_with(&self, sealer: &Capability) -> Self {
        if !sealer.is_valid() || !sealer.check_perms(CapPerms::SEAL) {
            let mut c = *self;
            c.tag = false;
            return c;
        }
        self.seal_as(SealKind::Obj((sealer.address & 0x7fff) as u16))
    }

    /// Unseal with an object-type unsealer.
    ///
    /// Requires the unseal permission and a matching object type; any
    /// mismatch clears the tag of the result.
    #[must_use = "unsealing returns a new capability"]
    pub fn unseal_with(&self, unsealer: &Capability) -> Self {
        let mut c = *self;
        let matches = unsealer.is_valid()
            && unsealer.check_perms(CapPerms::UNSEAL)
            && self.seal == SealKind::Obj((unsealer.address & 0x7fff) as u16);
        if self.tag && matches {
            c.seal = SealKind::None;
        } else {
            c.tag = false;
        }
        c
    }

    /// Strip a sentry seal. Only the machine may do this, as part of
    /// branching to a sealed entry.
    pub(crate) fn unseal_raw(&self) -> Self {
        let mut c = *self;
        c.seal = SealKind::None;
        c
    }

    fn seal_as(&self, kind: SealKind) -> Self {
        let mut c = *self;
        if !c.tag || c.is_sealed() {
            c.tag = false;
        }
        c.seal = kind;
        c
    }

    /// Copy for derivation: a sealed source yields an untagged result,
    /// so no derivation can bypass a seal.
    fn unsealed_or_cleared(&self) -> Self {
        let mut c = *self;
        if c.is_sealed() {
            c.tag = false;
            c.seal = SealKind::None;
        }
        c
    }
}

impl Default for Capability {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for Capability {
    /// Render in the fixed single-line form
    /// `<addr> [<base>..<limit>) <perms> <seal> <tag>`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#014x} [{:#014x}..{:#014x}) {} {} {}",
            self.address,
            self.base(),
            self.limit(),
            self.perms(),
            self.seal,
            if self.tag { "valid" } else { "invalid" },
        )
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Capability(null)")
        } else {
            write!(f, "Capability({})", self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Capability {
        Capability::root(0x1000, 0x100, CapPerms::GLOBAL | CapPerms::READ_CAP_PERMS)
    }

    #[test]
    fn test_null_queries() {
        let c = Capability::NULL;
        assert!(c.is_null());
        assert_eq!(c.length(), 0);
        assert_eq!(c.limit(), 0);
        assert_eq!(c.tail(), 0);
        assert!(!c.is_valid());
    }

    #[test]
    fn test_tail() {
        let c = sample();
        assert_eq!(c.tail(), 0x100);
        assert_eq!(c.with_address(0x10f0).tail(), 0x10);
        // At or past the limit there is nothing left.
        assert_eq!(c.with_address(0x1100).tail(), 0);
        assert_eq!(c.with_address(0xfff).tail(), 0);
    }

    #[test]
    fn test_tail_matches_limit_minus_address() {
        let c = sample().with_address(0x1040);
        assert!(c.in_bounds());
        assert_eq!(c.tail(), c.limit() - c.address());
    }

    #[test]
    fn test_narrowing_stays_within_parent() {
        let c = sample().with_address(0x1020).set_bounds_exact(0x20);
        assert!(c.is_valid());
        assert_eq!(c.base(), 0x1020);
        assert_eq!(c.length(), 0x20);

        // Escaping the parent range clears the tag.
        let wide = sample().with_address(0x1080).set_bounds_exact(0x100);
        assert!(!wide.tag());
    }

    #[test]
    fn test_perms_only_clear() {
        let c = sample().perms_and(CapPerms::LOAD);
        assert_eq!(c.perms(), CapPerms::LOAD);
        // Masking with bits the parent lacks cannot add them.
        let c = sample().perms_and(CapPerms::STORE);
        assert_eq!(c.perms(), CapPerms::empty());
    }

    #[test]
    fn test_seal_opacity() {
        let sealed = sample().seal_entry();
        assert!(sealed.tag());
        assert!(sealed.is_sealed());
        assert_eq!(sealed.length(), 0);
        assert_eq!(sealed.limit(), 0);
        assert_eq!(sealed.tail(), 0);
        assert_eq!(sealed.perms(), CapPerms::empty());
        assert!(!sealed.in_bounds());
        // The address stays observable.
        assert_eq!(sealed.address(), 0x1000);
    }

    #[test]
    fn test_derive_from_sealed_clears_tag() {
        let sealed = sample().seal_entry();
        assert!(!sealed.with_address(0x1004).tag());
        assert!(!sealed.set_bounds_exact(8).tag());
        assert!(!sealed.perms_and(CapPerms::all()).tag());
    }

    #[test]
    fn test_obj_seal_round_trip() {
        let sealer = Capability::root(7, 1, CapPerms::SEAL | CapPerms::UNSEAL);
        let sealed = sample().seal_with(&sealer);
        assert_eq!(sealed.seal_kind(), SealKind::Obj(7));
        let back = sealed.unseal_with(&sealer);
        assert!(back.is_valid());
        assert_eq!(back.length(), 0x100);

        let wrong = Capability::root(9, 1, CapPerms::SEAL | CapPerms::UNSEAL);
        assert!(!sealed.unseal_with(&wrong).tag());
    }

    #[test]
    fn test_seal_without_permission_fails() {
        let bad_sealer = Capability::root(7, 1, CapPerms::LOAD);
        assert!(!sample().seal_with(&bad_sealer).tag());
    }

    #[test]
    fn test_sentry_kinds() {
        let lb = sample().seal_lb();
        assert_eq!(lb.seal_kind(), SealKind::Lb);
        assert!(lb.tag());
        let lpb = sample().seal_lpb();
        assert_eq!(lpb.seal_kind(), SealKind::Lpb);
        // Sentries of every kind are opaque.
        assert_eq!(lb.length(), 0);
        assert_eq!(lpb.tail(), 0);
    }

    #[test]
    fn test_seal_render() {
        assert_eq!(SealKind::None.to_string(), "none");
        assert_eq!(SealKind::Rb.to_string(), "rb");
        assert_eq!(SealKind::Lpb.to_string(), "lpb");
        assert_eq!(SealKind::Lb.to_string(), "lb");
        assert_eq!(SealKind::Obj(7).to_string(), "0007");
    }

    #[test]
    fn test_is_local() {
        let local = sample().perms_and(CapPerms::READ_CAP_PERMS);
        assert!(local.is_local());
        assert!(!sample().is_local());
    }
}
