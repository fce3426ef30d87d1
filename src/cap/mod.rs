//! Capability Primitives
//!
//! Implements the Morello-style capability model: bounded, tagged,
//! permission-carrying references that may be sealed into opaque
//! tokens.
//!
//! # Design
//! - A capability is the unit of authority; there is no ambient trust
//! - Bounds and permissions only narrow under derivation
//! - Sealing renders a capability opaque until unsealed through a
//!   matching mechanism (sentry branch, unsealer, sealed-pair branch)
//!
//! # Security Properties
//! - Query primitives are total and degrade safely on invalid input
//! - Tags, once cleared, cannot be restored by any public operation

pub mod capability;
pub mod perms;

pub use capability::{Capability, SealKind};
pub use perms::CapPerms;
