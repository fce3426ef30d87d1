//! Caprock - Simulated Morello Capability Runtime
//!
//! A software model of a hardware-capability security architecture:
//! memory references carry an address, bounds, permission bits, a
//! validity tag and an optional seal that makes them opaque until
//! unsealed through a controlled mechanism.
//!
//! Two things are built on that primitive:
//! - A compartmentalization runtime: isolated call targets with
//!   private stacks, reachable only through sealed entry capabilities
//! - A secret-protection pattern: a sensitive object whose only
//!   pointer stays sealed except while one designated code path runs
//!
//! # Simulation Boundary
//! Real capability hardware enforces these rules non-bypassably. This
//! crate reproduces the *protocol*: a [`machine::Machine`] owns a
//! page-granular tagged memory and checks every tag, bound,
//! permission and seal at the point of use. Unforgeability holds
//! against this crate's public API, not against arbitrary code in the
//! same process — it is a simulation for testing, not an equivalent
//! security boundary.
//!
//! # Architecture
//! - `cap`: capability values, queries, derivation, sealing
//! - `mm`: simulated tagged memory (map/protect/unmap, checked access)
//! - `machine`: roots, execution context, capability-checked branches
//! - `cmpt`: compartment manager and cross-domain switch protocol
//! - `vault`: the protected-secret trampoline
//! - `security`: zeroization of released pages and switch registers
//! - `logger`: serial-console style logging for demos and tests

#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod cap;
pub mod cmpt;
pub mod error;
pub mod logger;
pub mod machine;
pub mod mm;
pub mod security;
pub mod vault;

pub use cap::{CapPerms, Capability, SealKind};
pub use cmpt::{CmptFlags, SwitchPhase};
pub use error::{Fault, FaultCause, Result};
pub use machine::{CallArgs, Machine, RegValue, TargetFn, MAX_ARGS};
pub use mm::{Prot, PAGE_SIZE};
