//! The Simulated Capability Machine
//!
//! Owns the tagged memory, the root capabilities and the active
//! execution context, and performs every capability-checked branch.
//! One machine models one single-threaded process: calls are
//! synchronous, a callee that never returns simply never returns.
//!
//! # Execution Context
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       ExecState                          │
//! ├──────────────────────────────────────────────────────────┤
//! │  pcc  - program counter capability (executive bit =      │
//! │         privilege level)                                 │
//! │  csp  - stack capability of the active domain            │
//! │  cid  - compartment identifier capability                │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Security Properties
//! - Root capabilities exist only here; everything else is derived
//! - Branching to sealed entries is the only way a seal is stripped
//! - Capability arguments are homed to the callee's stack frame and
//!   the frame is not scrubbed on return; see the vault module for
//!   why this is a documented property, not an accident

pub mod regs;

pub use regs::{CallArgs, RegValue, MAX_ARGS};

use alloc::collections::BTreeMap;

use log::debug;

use crate::cap::{CapPerms, Capability, SealKind};
use crate::cmpt::manager::CmptManager;
use crate::cmpt::switch;
use crate::error::{Fault, Result};
use crate::mm::{Memory, Prot, CAP_SIZE, CODE_BASE, CODE_SLOT_SIZE, DATA_BASE, PAGE_SIZE};
use crate::security::Zeroize;
use crate::vault;

/// Default arena size: 16 MiB of simulated memory.
const DEFAULT_ARENA_PAGES: usize = 4096;

/// Length of the executable region for registered targets.
const CODE_REGION_LEN: usize = 0x1_0000;

/// Root compartment stack, in pages.
const ROOT_STACK_PAGES: usize = 16;

/// Executive boot stack, in pages.
const EXEC_STACK_PAGES: usize = 4;

/// Bytes reserved below the stack pointer for one call frame: one
/// home slot per argument register.
pub(crate) const FRAME_SIZE: usize = MAX_ARGS * CAP_SIZE;

/// Object-type space reserved for the sentry seal kinds; object-type
/// sealers start past it.
const SEALER_BASE: usize = 4;
/// One past the largest object type.
const SEALER_LIMIT: usize = 0x8000;

/// A target function hosted by the simulation.
///
/// The function receives the machine (so it can perform checked
/// memory access and nested calls) and its argument registers, and
/// returns a result register or a fault.
pub type TargetFn = fn(&mut Machine, &CallArgs) -> Result<RegValue>;

/// What lives at an executable address.
#[derive(Clone, Copy)]
pub(crate) enum CodeEntry {
    /// A registered target function.
    Target(TargetFn),
    /// A compartment switch trampoline; `thunk` is the address of
    /// its thunk record.
    CmptSwitch { thunk: usize },
    /// A protected-switch gadget guarding the vault; `gate` is the
    /// address of its data block.
    VaultGate { gate: usize },
}

/// Active execution context.
#[derive(Clone, Copy)]
pub(crate) struct ExecState {
    pub(crate) pcc: Capability,
    pub(crate) csp: Capability,
    pub(crate) cid: Capability,
}

/// The simulated machine.
pub struct Machine {
    pub(crate) mem: Memory,
    pub(crate) code: BTreeMap<usize, CodeEntry>,
    next_code: usize,
    /// Full authority over the data arena, including execute and
    /// mapping rights. Never exposed; mappings derive from it.
    map_root: Capability,
    /// Ambient read/write root, as an auxiliary vector would publish.
    rw_root: Capability,
    /// Ambient read/execute root over the code region.
    rx_root: Capability,
    /// Sealer root covering the object-type space.
    seal_root: Capability,
    /// Compartment-identifier root.
    cid_root: Capability,
    /// Root compartment stack (compartment 0).
    root_stack: Capability,
    pub(crate) state: ExecState,
    pub(crate) cmpt: CmptManager,
    /// The protected-secret global pointer; see the vault module.
    pub(crate) vault: Option<Capability>,
}

impl Machine {
    /// Boot a machine with the default arena.
    #[must_use]
    pub fn new() -> Self {
        // The default arena dwarfs the boot-time mappings; failure
        // here is a wiring bug, handled like any boot panic.
        Self::with_arena(DEFAULT_ARENA_PAGES).expect("boot: default arena")
    }

    /// Boot a machine with an arena of `arena_pages` pages.
    pub fn with_arena(arena_pages: usize) -> Result<Self> {
        let mut mem = Memory::new(DATA_BASE, arena_pages);

        let map_root = Capability::root(
            DATA_BASE,
            arena_pages * PAGE_SIZE,
            CapPerms::GLOBAL
                | CapPerms::READ_CAP_PERMS
                | CapPerms::WRITE_CAP_PERMS
                | CapPerms::EXECUTE
                | CapPerms::BRANCH_SEALED_PAIR
                | CapPerms::VMEM,
        );
        let rw_root = map_root.perms_and(
            CapPerms::GLOBAL | CapPerms::READ_CAP_PERMS | CapPerms::WRITE_CAP_PERMS,
        );
        let rx_root = Capability::root(
            CODE_BASE,
            CODE_REGION_LEN,
            CapPerms::GLOBAL | CapPerms::READ_CAP_PERMS | CapPerms::EXEC_CAP_PERMS,
        );
        let seal_root = Capability::root(
            SEALER_BASE,
            SEALER_LIMIT - SEALER_BASE,
            CapPerms::GLOBAL | CapPerms::SEAL | CapPerms::UNSEAL,
        );
        let cid_root = Capability::root(
            0,
            1 << 20,
            CapPerms::GLOBAL | CapPerms::COMPARTMENT_ID,
        );

        let exec_base = mem.map_pages(EXEC_STACK_PAGES, Prot::RW)?;
        let exec_len = EXEC_STACK_PAGES * PAGE_SIZE;
        let exec_stack = rw_root
            .with_address(exec_base)
            .set_bounds_exact(exec_len)
            .with_address(exec_base + exec_len);

        let root_base = mem.map_pages(ROOT_STACK_PAGES, Prot::RW)?;
        let root_len = ROOT_STACK_PAGES * PAGE_SIZE;
        let root_stack = rw_root
            .with_address(root_base)
            .set_bounds_exact(root_len)
            .with_address(root_base + root_len);

        let state = ExecState {
            // Boot runs executive: the initial program counter holds
            // the full execute permission group.
            pcc: rx_root,
            csp: exec_stack,
            cid: cid_root,
        };

        debug!(
            "machine booted: arena {} pages, root stack {} pages",
            arena_pages, ROOT_STACK_PAGES
        );

        Ok(Self {
            mem,
            code: BTreeMap::new(),
            // Slot zero is reserved for the switch trampoline
            // template; registered targets start after it.
            next_code: CODE_BASE + CODE_SLOT_SIZE,
            map_root,
            rw_root,
            rx_root,
            seal_root,
            cid_root,
            root_stack,
            state,
            cmpt: CmptManager::new(),
            vault: None,
        })
    }

    /// Register a target function and return an executable capability
    /// for it.
    ///
    /// The capability deliberately lacks the executive permission:
    /// indirect calls through it run restricted, like any relocated
    /// function pointer.
    pub fn register_function(&mut self, f: TargetFn) -> Result<Capability> {
        if self.next_code + CODE_SLOT_SIZE > CODE_BASE + CODE_REGION_LEN {
            return Err(Fault::ResourceExhausted);
        }
        let addr = self.next_code;
        self.next_code += CODE_SLOT_SIZE;
        self.code.insert(addr, CodeEntry::Target(f));
        Ok(Capability::root(
            addr,
            CODE_SLOT_SIZE,
            CapPerms::GLOBAL | CapPerms::READ_CAP_PERMS | CapPerms::EXECUTE,
        ))
    }

    /// Capability for the switch trampoline template, sealed as an
    /// entry. Stored in every thunk record.
    pub(crate) fn switch_template(&self) -> Capability {
        Capability::root(
            CODE_BASE,
            CODE_SLOT_SIZE,
            CapPerms::GLOBAL | CapPerms::READ_CAP_PERMS | CapPerms::EXEC_CAP_PERMS,
        )
        .seal_entry()
    }

    /// Invoke a callable capability.
    ///
    /// Accepts an unsealed executable capability or a sealed entry;
    /// any other seal state is refused. The branch is the only
    /// operation that strips a sentry seal.
    pub fn call(&mut self, entry: &Capability, args: &CallArgs) -> Result<RegValue> {
        if !entry.tag() {
            return Err(Fault::InvalidCapability);
        }
        let target = match entry.seal_kind() {
            SealKind::None => *entry,
            SealKind::Rb => entry.unseal_raw(),
            _ => return Err(Fault::InvalidCapability),
        };
        if !target.check_perms(CapPerms::EXECUTE) {
            return Err(Fault::PermissionDenied);
        }
        let code = self
            .code
            .get(&target.base())
            .copied()
            .ok_or(Fault::InvalidCapability)?;
        match code {
            CodeEntry::Target(f) => self.direct_call(&target, f, args),
            CodeEntry::CmptSwitch { thunk } => switch::switch_call(self, &target, thunk, args),
            CodeEntry::VaultGate { gate } => vault::guarded_call(self, &target, gate, args),
        }
    }

    /// Atomic sealed-pair branch.
    ///
    /// Unseals a matched `{code, data}` pair sealed with the same
    /// object type and branches to the code half with the unsealed
    /// data half in the first argument register, as one indivisible
    /// step. Neither half is observable unsealed outside the branch.
    pub fn branch_sealed_pair(
        &mut self,
        code_half: &Capability,
        data_half: &Capability,
        args: &CallArgs,
    ) -> Result<RegValue> {
        let (code, data) = self.unseal_pair(code_half, data_half)?;
        let f = match self.code.get(&code.base()).copied() {
            Some(CodeEntry::Target(f)) => f,
            _ => return Err(Fault::InvalidCapability),
        };
        let mut inner = *args;
        inner.set(0, RegValue::Cap(data));
        self.direct_call(&code, f, &inner)
    }

    /// Check and unseal a sealed pair. Internal to branch semantics;
    /// callers never observe the halves unsealed except through the
    /// branch itself.
    pub(crate) fn unseal_pair(
        &self,
        code_half: &Capability,
        data_half: &Capability,
    ) -> Result<(Capability, Capability)> {
        if !code_half.tag() || !data_half.tag() {
            return Err(Fault::InvalidCapability);
        }
        match (code_half.seal_kind(), data_half.seal_kind()) {
            (SealKind::Obj(a), SealKind::Obj(b)) if a == b => {}
            _ => return Err(Fault::InvalidCapability),
        }
        let code = code_half.unseal_raw();
        let data = data_half.unseal_raw();
        let invoke = CapPerms::BRANCH_SEALED_PAIR;
        if !code.check_perms(CapPerms::EXECUTE | invoke) || !data.check_perms(invoke) {
            return Err(Fault::PermissionDenied);
        }
        Ok((code, data))
    }

    /// Run a target in restricted mode on the root compartment stack.
    ///
    /// This is the boot-to-main transition: it must be invoked from
    /// executive mode and restores the executive context when the
    /// target returns.
    pub fn run_restricted(&mut self, target: &Capability, args: &CallArgs) -> Result<RegValue> {
        if self.is_in_restricted() {
            return Err(Fault::PermissionDenied);
        }
        let saved = self.state;
        self.state.csp = self.root_stack;
        self.state.cid = self.cid_root.with_address(0);
        let result = self.call(target, args);
        self.state = saved;
        result
    }

    /// Current compartment identifier: 0 for the root compartment,
    /// positive for created compartments, −1 when executing at the
    /// executive privilege level.
    #[must_use]
    pub fn compartment_id(&self) -> i64 {
        if self.is_in_restricted() {
            self.state.cid.address() as i64
        } else {
            -1
        }
    }

    /// Check if the active program counter capability lacks the
    /// executive permission.
    #[must_use]
    pub fn is_in_restricted(&self) -> bool {
        !self.state.pcc.check_perms(CapPerms::EXECUTIVE)
    }

    /// Active program counter capability.
    #[must_use]
    pub fn pcc(&self) -> Capability {
        self.state.pcc
    }

    /// Active stack capability.
    #[must_use]
    pub fn csp(&self) -> Capability {
        self.state.csp
    }

    /// Ambient read/write root, as published to every domain.
    #[must_use]
    pub fn rw_root(&self) -> Capability {
        self.rw_root
    }

    /// Ambient read/execute root over the code region.
    #[must_use]
    pub fn rx_root(&self) -> Capability {
        self.rx_root
    }

    /// Sealer root covering the object-type space.
    #[must_use]
    pub fn seal_root(&self) -> Capability {
        self.seal_root
    }

    /// Compartment-identifier root.
    pub(crate) fn cid_root(&self) -> Capability {
        self.cid_root
    }

    /// The tagged memory, for checked loads.
    #[must_use]
    pub fn mem(&self) -> &Memory {
        &self.mem
    }

    /// The tagged memory, for checked stores.
    pub fn mem_mut(&mut self) -> &mut Memory {
        &mut self.mem
    }

    /// Map fresh pages and return the owning capability: exact
    /// bounds, read/write/execute capability permissions plus the
    /// mapping (vmem) authority.
    pub fn map_pages(&mut self, count: usize, prot: Prot) -> Result<Capability> {
        let base = self.mem.map_pages(count, prot)?;
        Ok(self
            .map_root
            .with_address(base)
            .set_bounds_exact(count * PAGE_SIZE))
    }

    /// Change the protection of the pages spanned by `owning`.
    pub fn protect(&mut self, owning: &Capability, prot: Prot) -> Result<()> {
        if !owning.is_valid() {
            return Err(Fault::InvalidCapability);
        }
        if !owning.check_perms(CapPerms::VMEM) {
            return Err(Fault::PermissionDenied);
        }
        self.mem.protect(owning.base(), owning.length(), prot)
    }

    /// Release the mapping spanned by `owning`. Pages are zeroed.
    pub fn unmap(&mut self, owning: &Capability) -> Result<()> {
        self.mem.unmap(owning)
    }

    /// Call a resolved target on the current stack.
    ///
    /// Sets the program counter to the target capability (dropping
    /// or keeping the executive bit as the capability dictates),
    /// homes capability arguments into a fresh frame, and zeroizes
    /// the transfer registers once the target returns.
    pub(crate) fn direct_call(
        &mut self,
        target: &Capability,
        f: TargetFn,
        args: &CallArgs,
    ) -> Result<RegValue> {
        let saved_pcc = self.state.pcc;
        let saved_csp = self.state.csp;
        self.state.pcc = *target;
        let result = match self.push_frame(args) {
            Ok(()) => {
                let mut regs = *args;
                let r = f(self, &regs);
                regs.zeroize();
                r
            }
            Err(fault) => Err(fault),
        };
        // The frame is abandoned, not scrubbed: whatever the callee
        // homed or spilled stays in stack memory.
        self.state.csp = saved_csp;
        self.state.pcc = saved_pcc;
        result
    }

    /// Push one call frame on the active stack and home the
    /// capability arguments into it.
    fn push_frame(&mut self, args: &CallArgs) -> Result<()> {
        let csp = self.state.csp;
        let top = csp
            .address()
            .checked_sub(FRAME_SIZE)
            .ok_or(Fault::InvalidCapability)?;
        if top < csp.base() {
            return Err(Fault::InvalidCapability);
        }
        let frame = csp.with_address(top);
        for (i, value) in args.iter().enumerate() {
            if let RegValue::Cap(c) = value {
                self.mem
                    .store_cap(&frame.with_address(top + i * CAP_SIZE), *c)?;
            }
        }
        self.state.csp = frame;
        Ok(())
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(_m: &mut Machine, args: &CallArgs) -> Result<RegValue> {
        Ok(RegValue::Int(args.int(0) + args.int(1)))
    }

    #[test]
    fn test_boot_is_executive() {
        let m = Machine::new();
        assert!(!m.is_in_restricted());
        assert_eq!(m.compartment_id(), -1);
    }

    #[test]
    fn test_direct_and_sealed_call() {
        let mut m = Machine::new();
        let f = m.register_function(add).unwrap();
        let args = CallArgs::of(&[RegValue::Int(2), RegValue::Int(3)]);
        assert_eq!(m.call(&f, &args).unwrap(), RegValue::Int(5));
        assert_eq!(m.call(&f.seal_entry(), &args).unwrap(), RegValue::Int(5));
    }

    #[test]
    fn test_only_entry_seals_are_callable() {
        let mut m = Machine::new();
        let f = m.register_function(add).unwrap();
        // Load-branch sentries are not ordinary entries.
        assert_eq!(
            m.call(&f.seal_lb(), &CallArgs::new()),
            Err(Fault::InvalidCapability)
        );
        assert_eq!(
            m.call(&f.seal_lpb(), &CallArgs::new()),
            Err(Fault::InvalidCapability)
        );
    }

    #[test]
    fn test_call_checks_execute_permission() {
        let mut m = Machine::new();
        let f = m.register_function(add).unwrap();
        let data_only = f.perms_and(CapPerms::GLOBAL | CapPerms::READ_CAP_PERMS);
        assert_eq!(
            m.call(&data_only, &CallArgs::new()),
            Err(Fault::PermissionDenied)
        );
    }

    #[test]
    fn test_indirect_call_runs_restricted() {
        fn probe(m: &mut Machine, _args: &CallArgs) -> Result<RegValue> {
            Ok(RegValue::Int(m.is_in_restricted() as u64))
        }
        let mut m = Machine::new();
        let f = m.register_function(probe).unwrap();
        // Registered functions lack the executive bit, so even a
        // call from executive mode lands restricted.
        assert_eq!(m.call(&f, &CallArgs::new()).unwrap(), RegValue::Int(1));
        assert!(!m.is_in_restricted());
    }

    #[test]
    fn test_run_restricted_root_id() {
        fn whoami(m: &mut Machine, _args: &CallArgs) -> Result<RegValue> {
            Ok(RegValue::Int(m.compartment_id() as u64))
        }
        let mut m = Machine::new();
        let f = m.register_function(whoami).unwrap();
        assert_eq!(
            m.run_restricted(&f, &CallArgs::new()).unwrap(),
            RegValue::Int(0)
        );
        assert_eq!(m.compartment_id(), -1);
    }

    #[test]
    fn test_branch_sealed_pair() {
        fn read_through(m: &mut Machine, args: &CallArgs) -> Result<RegValue> {
            let data = args.cap(0);
            Ok(RegValue::Int(u64::from(m.mem().load_u32(&data)?)))
        }
        let mut m = Machine::new();
        let f = m.register_function(read_through).unwrap();
        let sealer = m.seal_root().with_address(9);
        let buf = m.map_pages(1, Prot::RW).unwrap();
        m.mem_mut().store_u32(&buf, 0xfeed).unwrap();

        let invoke = CapPerms::BRANCH_SEALED_PAIR;
        let code = Capability::root(
            f.base(),
            CODE_SLOT_SIZE,
            CapPerms::GLOBAL | CapPerms::READ_CAP_PERMS | CapPerms::EXECUTE | invoke,
        )
        .seal_with(&sealer);
        let data = buf.seal_with(&sealer);

        let r = m.branch_sealed_pair(&code, &data, &CallArgs::new()).unwrap();
        assert_eq!(r, RegValue::Int(0xfeed));

        // Mismatched object types refuse to branch.
        let other = m.seal_root().with_address(10);
        let wrong = buf.seal_with(&other);
        assert_eq!(
            m.branch_sealed_pair(&code, &wrong, &CallArgs::new()),
            Err(Fault::InvalidCapability)
        );
    }
}
