//! Cross-Domain Switch Protocol
//!
//! The call gate that moves execution between domains:
//!
//! ```text
//! Outside ──► Entering ──► Inside ──► Returning ──► Outside
//! ```
//!
//! - **Outside → Entering**: the caller branches to the sealed entry;
//!   the trampoline loads the thunk record through the entry
//!   capability
//! - **Entering → Inside**: the callee's private stack capability is
//!   installed, the caller's context is saved in the gate (this
//!   invocation's own frame, so nesting is reentrant), and control
//!   branches to the bound target
//! - **Inside → Returning → Outside**: the saved context is restored;
//!   neither party can derive the other's stack pointer except
//!   through this restore
//!
//! # Security Considerations
//! - Argument registers pass through unchanged; capability registers
//!   outside the convention are not carried and the transfer bank is
//!   zeroized after return
//! - A fault inside the callee surfaces as a contained fault naming
//!   the compartment; the caller's memory is intact

use log::trace;

use crate::cap::{Capability, SealKind};
use crate::error::{Fault, Result};
use crate::machine::{CallArgs, ExecState, Machine, RegValue};

use super::{SLOT_CID, SLOT_SP, SLOT_SWITCH, SLOT_TARGET};

/// Phase of one cross-domain call.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SwitchPhase {
    /// No switch in progress.
    Outside,
    /// Trampoline is loading the thunk record.
    Entering,
    /// Target executing on the private stack.
    Inside,
    /// Restoring the caller's context.
    Returning,
}

/// One in-flight cross-domain call.
///
/// Bundles the thunk record with the saved caller state. Each
/// invocation owns its gate, so nested and recursive compartment
/// calls never share mutable state.
pub(crate) struct CallGate {
    phase: SwitchPhase,
    /// Switch trampoline sentry from the record.
    switch: Capability,
    /// Bound target sentry from the record.
    target: Capability,
    /// Callee's private stack capability.
    stack: Capability,
    /// Callee's compartment identifier capability.
    cid: Capability,
    /// Caller context, restored on exit.
    saved: Option<ExecState>,
}

impl CallGate {
    /// Load the thunk record through the (unsealed) entry capability.
    ///
    /// The entry capability carries load permissions over exactly the
    /// thunk, so these loads need no ambient authority.
    fn load(m: &Machine, entry: &Capability, thunk: usize) -> Result<Self> {
        let slot = |off: usize| entry.with_address(thunk + off);
        let switch = m.mem().load_cap(&slot(SLOT_SWITCH))?;
        let target = m.mem().load_cap(&slot(SLOT_TARGET))?;
        let stack = m.mem().load_cap(&slot(SLOT_SP))?;
        let cid = m.mem().load_cap(&slot(SLOT_CID))?;
        if !switch.tag() || !target.tag() || !stack.tag() || !cid.tag() {
            return Err(Fault::InvalidCapability);
        }
        if switch.seal_kind() != SealKind::Rb {
            return Err(Fault::InvalidCapability);
        }
        Ok(Self {
            phase: SwitchPhase::Entering,
            switch,
            target,
            stack,
            cid,
            saved: None,
        })
    }

    /// Identifier of the compartment this gate enters.
    fn compartment_id(&self) -> i64 {
        self.cid.address() as i64
    }

    /// Install the callee context: save the caller's state into the
    /// gate and swap in the private stack and compartment id.
    fn enter(&mut self, m: &mut Machine) {
        debug_assert_eq!(self.phase, SwitchPhase::Entering);
        self.saved = Some(m.state);
        m.state.csp = self.stack;
        m.state.cid = self.cid;
        self.phase = SwitchPhase::Inside;
    }

    /// Restore the caller context saved at entry.
    fn exit(&mut self, m: &mut Machine) {
        debug_assert_eq!(self.phase, SwitchPhase::Inside);
        self.phase = SwitchPhase::Returning;
        if let Some(saved) = self.saved.take() {
            m.state = saved;
        }
        self.phase = SwitchPhase::Outside;
    }
}

/// Perform one compartment call: the entry capability has been
/// unsealed by the branch, `thunk` locates the record.
pub(crate) fn switch_call(
    m: &mut Machine,
    entry: &Capability,
    thunk: usize,
    args: &CallArgs,
) -> Result<RegValue> {
    let mut gate = CallGate::load(m, entry, thunk)?;
    let id = gate.compartment_id();
    trace!("switch: entering compartment {} via {}", id, gate.switch);

    gate.enter(m);
    // The target sentry is branched like any call; the frame and
    // transfer registers live on the private stack installed above.
    let result = m.call(&gate.target, args);
    gate.exit(m);

    trace!("switch: compartment {} returned", id);
    result.map_err(|fault| fault.contained(id))
}
