//! Protected-Secret Vault
//!
//! Guards one process-wide object by keeping its only reachable
//! pointer sealed. The lifecycle is explicit:
//!
//! ```text
//! Uninitialized ──init──► Unsealed ──protect──► Protected
//! ```
//!
//! After `protect`, the global pointer is sealed in place and only
//! the installed protected-switch gadget can transiently unseal it —
//! via the sealed-pair branch — for the duration of one call to the
//! designated function.
//!
//! # Residual Risk (by design)
//! The calling convention homes the transient unsealed alias into
//! the protected function's stack frame, and frames are not scrubbed
//! on return. An adversary who can read the stack region afterwards
//! can recover the unsealed capability by scanning for a tagged,
//! unsealed value at the global's address — see [`scan_stack`].
//! Sealing bounds *who can invoke* the secret, not stack hygiene;
//! this demonstration deliberately preserves the weakness.

use log::{debug, trace};

use crate::cap::{CapPerms, Capability, SealKind};
use crate::error::{Fault, Result};
use crate::machine::{CallArgs, Machine, RegValue};
use crate::mm::Prot;

/// Initial value of the protected secret word.
pub const INITIAL_SECRET: u32 = 0xcafe_1e55;

/// Record layout inside the partition page.
const SECRET_OFFSET: usize = 0;
const DATA_CAP_OFFSET: usize = 16;
const OWNING_OFFSET: usize = 32;
const SEALER_OFFSET: usize = 48;
const STACK_OFFSET: usize = 64;
const STACK_OWNING_OFFSET: usize = 80;
/// Size of the record; the global pointer is bounded to exactly this.
const RECORD_SIZE: usize = 96;
/// Private data buffer following the record.
const DATA_BUF_OFFSET: usize = RECORD_SIZE;
const DATA_BUF_LEN: usize = 128;

/// Object type used when sealing the global pointer.
const SEALER_OTYPE_OFFSET: isize = 7;

/// Gate page layout: relocated gadget image, then the data block.
const GATE_CODE_SIZE: usize = 64;
const GATE_DATA_OFFSET: usize = GATE_CODE_SIZE;
const GATE_TARGET_OFFSET: usize = 0;
const GATE_PROT_START_OFFSET: usize = 16;
const GATE_PROT_END_OFFSET: usize = 32;
const GATE_SIZE: usize = GATE_DATA_OFFSET + 48;

/// End of the protected region within the gadget image.
const PROT_REGION_END: usize = 56;

/// Protected-switch gadget image; like the compartment trampoline,
/// the simulation executes its semantics natively (AArch64 `nop`
/// placeholder bytes).
const GADGET_TEMPLATE: [u8; GATE_CODE_SIZE] = {
    let mut image = [0u8; GATE_CODE_SIZE];
    let nop: [u8; 4] = [0x1f, 0x20, 0x03, 0xd5];
    let mut i = 0;
    while i < GATE_CODE_SIZE {
        image[i] = nop[i % 4];
        i += 1;
    }
    image
};

/// Lifecycle phase of the vault.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VaultPhase {
    /// `init` has not run; there is no secret.
    Uninitialized,
    /// The secret exists and its global pointer is still unsealed.
    Unsealed,
    /// The global pointer is sealed; only the guarded entry reaches
    /// the secret.
    Protected,
}

/// Current lifecycle phase.
#[must_use]
pub fn phase(m: &Machine) -> VaultPhase {
    match m.vault {
        None => VaultPhase::Uninitialized,
        Some(ptr) if ptr.is_sealed() => VaultPhase::Protected,
        Some(_) => VaultPhase::Unsealed,
    }
}

/// The global pointer in its current state (null before `init`).
///
/// Before `protect` this is an unsealed, dereferenceable capability;
/// afterwards the same global reports itself sealed and any read
/// through it is denied.
#[must_use]
pub fn global(m: &Machine) -> Capability {
    m.vault.unwrap_or(Capability::NULL)
}

/// Allocate the secret partition and private stack.
///
/// The partition holds the record (secret word, data capability,
/// owning and sealer capabilities, stack) followed by a 128-byte
/// private data buffer. The global pointer is left **unsealed** until
/// [`protect`] runs.
pub fn init(m: &mut Machine, stack_pages: usize) -> Result<()> {
    if m.vault.is_some() {
        return Err(Fault::InvalidCapability);
    }

    let part_owning = m.map_pages(1, Prot::RW)?;
    let stack_owning = m.map_pages(stack_pages, Prot::RW)?;
    let base = part_owning.base();

    let rw = CapPerms::GLOBAL | CapPerms::READ_CAP_PERMS | CapPerms::WRITE_CAP_PERMS;
    let rwi = rw | CapPerms::BRANCH_SEALED_PAIR;

    // The global pointer covers exactly the record and carries the
    // invoke permission required by the sealed-pair branch.
    let ptr = part_owning.perms_and(rwi).set_bounds_exact(RECORD_SIZE);

    let data = part_owning
        .with_address(base + DATA_BUF_OFFSET)
        .set_bounds_exact(DATA_BUF_LEN)
        .perms_and(rw);
    let sealer = m
        .seal_root()
        .perms_and(CapPerms::GLOBAL | CapPerms::SEAL)
        .offset(SEALER_OTYPE_OFFSET);
    let stack = stack_owning
        .perms_and(rw)
        .with_address(stack_owning.limit());

    m.mem_mut()
        .store_u32(&ptr.with_address(base + SECRET_OFFSET), INITIAL_SECRET)?;
    m.mem_mut()
        .store_cap(&ptr.with_address(base + DATA_CAP_OFFSET), data)?;
    m.mem_mut()
        .store_cap(&ptr.with_address(base + OWNING_OFFSET), part_owning)?;
    m.mem_mut()
        .store_cap(&ptr.with_address(base + SEALER_OFFSET), sealer)?;
    m.mem_mut()
        .store_cap(&ptr.with_address(base + STACK_OFFSET), stack)?;
    m.mem_mut()
        .store_cap(&ptr.with_address(base + STACK_OWNING_OFFSET), stack_owning)?;

    m.vault = Some(ptr);
    debug!("vault initialized: record at {:#x}", base);
    Ok(())
}

/// Seal the global pointer and install the protected switch.
///
/// 1. The global pointer is sealed in place, so no code path other
///    than the gadget installed next can obtain an unsealed alias
///    from the global
/// 2. The gadget image is relocated into fresh memory together with
///    a data block naming the protected target and the two sealed
///    code capabilities delimiting the protected region
/// 3. The returned capability is the sealed, callable gate entry
pub fn protect(m: &mut Machine, good_fn: &Capability) -> Result<Capability> {
    let ptr = m.vault.ok_or(Fault::InvalidCapability)?;
    if ptr.is_sealed() {
        return Err(Fault::InvalidCapability);
    }
    let base = ptr.base();
    let sealer = m
        .mem()
        .load_cap(&ptr.with_address(base + SEALER_OFFSET))?;

    let target = match good_fn.seal_kind() {
        SealKind::Rb => *good_fn,
        SealKind::None => good_fn.seal_entry(),
        _ => return Err(Fault::InvalidCapability),
    };
    if !target.tag() {
        return Err(Fault::InvalidCapability);
    }

    let gate_owning = m.map_pages(1, Prot::RW)?;
    let gbase = gate_owning.base();
    m.mem_mut().store_bytes(&gate_owning, &GADGET_TEMPLATE)?;

    // From here on, the global only exists sealed.
    m.vault = Some(ptr.seal_with(&sealer));

    // Code capabilities over the gadget, sealed with the same object
    // type as the global: the matched halves of the sealed-pair
    // branch.
    let rxi = CapPerms::GLOBAL
        | CapPerms::READ_CAP_PERMS
        | CapPerms::EXECUTE
        | CapPerms::BRANCH_SEALED_PAIR;
    let region = gate_owning.perms_and(rxi);
    let prot_start = region.seal_with(&sealer);
    // The end-of-region capability is unused for now; it would back a
    // returning branch if the protected call switched stacks.
    let prot_end = region.with_address(gbase + PROT_REGION_END).seal_with(&sealer);

    let slot = |off: usize| gate_owning.with_address(gbase + GATE_DATA_OFFSET + off);
    m.mem_mut().store_cap(&slot(GATE_TARGET_OFFSET), target)?;
    m.mem_mut().store_cap(&slot(GATE_PROT_START_OFFSET), prot_start)?;
    m.mem_mut().store_cap(&slot(GATE_PROT_END_OFFSET), prot_end)?;

    m.protect(&gate_owning, Prot::RX)?;
    m.code.insert(
        gbase,
        crate::machine::CodeEntry::VaultGate {
            gate: gbase + GATE_DATA_OFFSET,
        },
    );

    debug!("vault protected: gate at {:#x}", gbase);
    Ok(gate_owning
        .perms_and(CapPerms::GLOBAL | CapPerms::READ_CAP_PERMS | CapPerms::EXECUTE)
        .set_bounds_exact(GATE_SIZE)
        .seal_entry())
}

/// Invoke the protected switch: the gate entry has been unsealed by
/// the branch, `gate` locates its data block.
///
/// The caller's first argument register must hold the sealed global;
/// the sealed-pair branch unseals it against the gadget's sealed
/// region capability, and the protected function receives the
/// transient alias in its place. The alias lives in the transfer
/// registers (zeroized on return) and in the unscrubbed frame (the
/// documented residual risk).
pub(crate) fn guarded_call(
    m: &mut Machine,
    entry: &Capability,
    gate: usize,
    args: &CallArgs,
) -> Result<RegValue> {
    let target = m
        .mem()
        .load_cap(&entry.with_address(gate + GATE_TARGET_OFFSET))?;
    let prot_start = m
        .mem()
        .load_cap(&entry.with_address(gate + GATE_PROT_START_OFFSET))?;

    let sealed_global = args.cap(0);
    let (_region, unsealed) = m.unseal_pair(&prot_start, &sealed_global)?;
    trace!("vault: protected region entered");

    let mut inner = *args;
    inner.set(0, RegValue::Cap(unsealed));
    let result = m.call(&target, &inner);

    // The register alias dies with the transfer bank; whatever the
    // callee's frame holds is out of the gadget's hands.
    trace!("vault: protected region left");
    result
}

/// Scan the active stack region for a spilled unsealed alias of the
/// capability whose address is `needle`.
///
/// This is the adversary's move, exercised by the demos and tests to
/// show the residual weakness: it needs nothing but a load-capability
/// view of the stack. Returns the granule address and the recovered
/// capability.
#[must_use]
pub fn scan_stack(m: &Machine, needle: usize) -> Option<(usize, Capability)> {
    let csp = m.csp();
    if !csp.tag() || csp.is_sealed() {
        return None;
    }
    let top = csp.address().min(csp.base() + csp.length());
    // Walk below the stack pointer, newest frames first.
    for granule in m.mem().tagged_granules(csp.base(), top).into_iter().rev() {
        let Ok(found) = m.mem().load_cap(&csp.with_address(granule)) else {
            continue;
        };
        if found.tag() && !found.is_sealed() && found.address() == needle {
            return Some((granule, found));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_secret(m: &mut Machine, args: &CallArgs) -> Result<RegValue> {
        let secret = m.mem().load_u32(&args.cap(0))?;
        Ok(RegValue::Int(u64::from(secret)))
    }

    #[test]
    fn test_lifecycle() {
        let mut m = Machine::new();
        assert_eq!(phase(&m), VaultPhase::Uninitialized);
        init(&mut m, 4).unwrap();
        assert_eq!(phase(&m), VaultPhase::Unsealed);

        // Negative control: the unsealed global is directly readable.
        assert_eq!(m.mem().load_u32(&global(&m)).unwrap(), INITIAL_SECRET);

        let f = m.register_function(read_secret).unwrap();
        let gate = protect(&mut m, &f).unwrap();
        assert_eq!(phase(&m), VaultPhase::Protected);
        assert_eq!(gate.seal_kind(), SealKind::Rb);

        // The same global now reports itself sealed and is denied.
        assert!(global(&m).is_sealed());
        assert_eq!(
            m.mem().load_u32(&global(&m)),
            Err(Fault::InvalidCapability)
        );

        // The guarded entry still reaches the secret.
        let args = CallArgs::of(&[RegValue::Cap(global(&m))]);
        assert_eq!(
            m.call(&gate, &args).unwrap(),
            RegValue::Int(u64::from(INITIAL_SECRET))
        );
    }

    #[test]
    fn test_double_init_and_double_protect_refused() {
        let mut m = Machine::new();
        init(&mut m, 2).unwrap();
        assert_eq!(init(&mut m, 2), Err(Fault::InvalidCapability));
        let f = m.register_function(read_secret).unwrap();
        protect(&mut m, &f).unwrap();
        assert_eq!(protect(&mut m, &f), Err(Fault::InvalidCapability));
    }

    #[test]
    fn test_gate_requires_the_sealed_global() {
        let mut m = Machine::new();
        init(&mut m, 2).unwrap();
        let f = m.register_function(read_secret).unwrap();
        let gate = protect(&mut m, &f).unwrap();

        // No data half at all.
        assert_eq!(
            m.call(&gate, &CallArgs::new()),
            Err(Fault::InvalidCapability)
        );
        // A capability sealed with a different object type.
        let other = m.seal_root().with_address(9);
        let decoy = m.map_pages(1, Prot::RW).unwrap().seal_with(&other);
        assert_eq!(
            m.call(&gate, &CallArgs::of(&[RegValue::Cap(decoy)])),
            Err(Fault::InvalidCapability)
        );
    }
}
