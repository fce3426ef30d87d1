//! Compartmentalization Runtime
//!
//! Creates isolated call targets with private stacks and unforgeable
//! entry points, and performs the cross-domain call protocol between
//! them.
//!
//! # Design
//! - Each compartment is a thunk page: a relocated trampoline image
//!   followed by a record of capabilities (switch, target, thread
//!   pointer, stack, compartment id)
//! - The only externally visible handle is the sealed entry
//!   capability over that page: callable, not readable
//! - The switch itself is a four-phase state machine; see
//!   [`switch::SwitchPhase`]
//!
//! # Security Properties
//! - A compartment's stack and target are reachable only through the
//!   entry capability, which a seal makes opaque
//! - Faults inside a compartment are bounded to its private stack

pub mod manager;
pub mod switch;

pub use manager::CmptFlags;
pub use switch::SwitchPhase;

/// Size of the relocated trampoline image at the start of a thunk
/// page.
pub(crate) const THUNK_CODE_SIZE: usize = 64;

/// Offset of the thunk record within the page.
pub(crate) const THUNK_DATA_OFFSET: usize = THUNK_CODE_SIZE;

/// Thunk record slot offsets, relative to the record.
pub(crate) const SLOT_SWITCH: usize = 0;
pub(crate) const SLOT_TARGET: usize = 16;
pub(crate) const SLOT_TP: usize = 32;
pub(crate) const SLOT_SP: usize = 48;
pub(crate) const SLOT_CID: usize = 64;

/// Total thunk size: trampoline image plus five capability slots.
pub(crate) const THUNK_SIZE: usize = THUNK_DATA_OFFSET + 80;

/// Position-independent trampoline template copied into every thunk
/// page. The simulation executes the trampoline's semantics natively;
/// the image itself is a placeholder sequence (AArch64 `nop`).
pub(crate) const TRAMPOLINE_TEMPLATE: [u8; THUNK_CODE_SIZE] = {
    let mut image = [0u8; THUNK_CODE_SIZE];
    let nop: [u8; 4] = [0x1f, 0x20, 0x03, 0xd5];
    let mut i = 0;
    while i < THUNK_CODE_SIZE {
        image[i] = nop[i % 4];
        i += 1;
    }
    image
};
