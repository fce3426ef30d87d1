//! Compartment Manager
//!
//! Builds compartments: allocates a private stack and a thunk page,
//! binds the target behind a sealed sentry, and hands back a single
//! callable token.
//!
//! # Thunk Page Layout
//! ```text
//! ┌────────────────────────────┐ base
//! │  trampoline image (64 B)   │
//! ├────────────────────────────┤ base + 64
//! │  switch sentry             │
//! │  target sentry             │
//! │  thread pointer (unused)   │
//! │  stack capability          │
//! │  compartment id            │
//! └────────────────────────────┘ base + 144
//! ```
//! The page is populated read/write, then demoted to read+execute
//! before the entry capability is issued.
//!
//! # Security Properties
//! - The returned entry capability is sealed: callable, never
//!   readable or writable as data
//! - Compartment identifiers are sequential from 1; the root context
//!   is 0 and executive mode reports the −1 sentinel

use log::debug;

use crate::cap::{CapPerms, Capability, SealKind};
use crate::error::{Fault, Result};
use crate::machine::{CodeEntry, Machine};
use crate::mm::Prot;

use super::{
    SLOT_CID, SLOT_SP, SLOT_SWITCH, SLOT_TARGET, SLOT_TP, THUNK_DATA_OFFSET, THUNK_SIZE,
    TRAMPOLINE_TEMPLATE,
};

/// Default compartment capacity before [`Machine::init_cmpt_manager`]
/// raises it.
const DEFAULT_MAX_CMPTS: usize = 64;

/// Per-compartment tuning knobs.
///
/// The defaults give the compartment a fully capable private stack;
/// the flags only ever take permissions away (or, for the system
/// register bit, grant it from the manager's own authority).
#[derive(Clone, Copy, Debug)]
pub struct CmptFlags {
    /// Grant the target's program counter access to system registers.
    pub pcc_system_reg: bool,
    /// Allow storing local (non-global) capabilities on the private
    /// stack.
    pub stack_store_local: bool,
    /// Keep the mutable-load permission on the private stack.
    pub stack_mutable_load: bool,
}

impl Default for CmptFlags {
    fn default() -> Self {
        Self {
            pcc_system_reg: false,
            stack_store_local: true,
            stack_mutable_load: true,
        }
    }
}

/// Book-keeping for compartment creation.
pub(crate) struct CmptManager {
    /// Next identifier; the root compartment is 0, created
    /// compartments count up from 1.
    next_id: u64,
    /// Creation capacity.
    max: usize,
    /// Compartments created so far.
    count: usize,
}

impl CmptManager {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            max: DEFAULT_MAX_CMPTS,
            count: 0,
        }
    }
}

impl Machine {
    /// Set the compartment creation capacity.
    pub fn init_cmpt_manager(&mut self, max_cmpts: usize) {
        self.cmpt.max = max_cmpts;
    }

    /// Create a compartment around `target` with a private stack of
    /// `stack_pages` pages.
    ///
    /// Returns the sealed entry capability: invoke it with
    /// [`Machine::call`] in place of the original target. The target
    /// must be non-variadic and take at most eight register-passed
    /// arguments (a call-convention restriction).
    ///
    /// On allocation failure no entry capability is issued and no
    /// identifier is consumed.
    pub fn create_compartment(
        &mut self,
        target: &Capability,
        stack_pages: usize,
        flags: CmptFlags,
    ) -> Result<Capability> {
        if self.cmpt.count >= self.cmpt.max {
            return Err(Fault::ResourceExhausted);
        }

        // The bound target is always a sentry; an unsealed function
        // capability is promoted here.
        let mut plain = match target.seal_kind() {
            SealKind::None => *target,
            SealKind::Rb => target.unseal_raw(),
            _ => return Err(Fault::InvalidCapability),
        };
        if !plain.tag() {
            return Err(Fault::InvalidCapability);
        }
        if !plain.check_perms(CapPerms::EXECUTE) {
            return Err(Fault::PermissionDenied);
        }
        if flags.pcc_system_reg {
            // Granted from the manager's authority, not derived from
            // the caller's capability.
            plain.perms |= CapPerms::SYSTEM;
        }
        let sentry = plain.seal_entry();

        // Private stack: read/write only, never executable, with the
        // stack pointer parked at the top.
        let mut stack_perms = CapPerms::GLOBAL
            | CapPerms::LOAD
            | CapPerms::LOAD_CAP
            | CapPerms::STORE
            | CapPerms::STORE_CAP;
        if flags.stack_mutable_load {
            stack_perms |= CapPerms::MUTABLE_LOAD;
        }
        if flags.stack_store_local {
            stack_perms |= CapPerms::STORE_LOCAL_CAP;
        }
        let stack_owning = self.map_pages(stack_pages, Prot::RW)?;
        let stack = stack_owning
            .perms_and(stack_perms)
            .with_address(stack_owning.limit());

        // Thunk page: relocate the trampoline image, fill in the
        // record, then demote to read+execute.
        let thunk_owning = self.map_pages(1, Prot::RW)?;
        let base = thunk_owning.base();
        self.mem.store_bytes(&thunk_owning, &TRAMPOLINE_TEMPLATE)?;

        let id = self.cmpt.next_id;
        let cid = self.cid_root().with_address(id as usize);
        let switch = self.switch_template();

        let slot = |off: usize| thunk_owning.with_address(base + THUNK_DATA_OFFSET + off);
        self.mem.store_cap(&slot(SLOT_SWITCH), switch)?;
        self.mem.store_cap(&slot(SLOT_TARGET), sentry)?;
        self.mem.store_cap(&slot(SLOT_TP), Capability::NULL)?;
        self.mem.store_cap(&slot(SLOT_SP), stack)?;
        self.mem.store_cap(&slot(SLOT_CID), cid)?;

        self.protect(&thunk_owning, Prot::RX)?;
        self.code.insert(
            base,
            CodeEntry::CmptSwitch {
                thunk: base + THUNK_DATA_OFFSET,
            },
        );

        self.cmpt.next_id += 1;
        self.cmpt.count += 1;
        debug!(
            "compartment {} created: {} stack pages, thunk at {:#x}",
            id, stack_pages, base
        );

        // The one and only handle handed out: callable, nothing else.
        Ok(thunk_owning
            .perms_and(CapPerms::GLOBAL | CapPerms::READ_CAP_PERMS | CapPerms::EXECUTE)
            .set_bounds_exact(THUNK_SIZE)
            .seal_entry())
    }
}
