//! Security Primitives Module
//!
//! Provides confidential-computing support for the runtime:
//! - Secret zeroization for released pages and switch registers
//!
//! # Security Properties
//! - Cleared data is overwritten using volatile writes to prevent
//!   optimization

pub mod zeroize;

pub use zeroize::Zeroize;
