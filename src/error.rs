//! Runtime fault types
//!
//! This module defines the faults that capability-checked operations
//! can signal. Every failure is a terminal signal to the immediate
//! caller; there is no retry anywhere in the runtime.
//!
//! Recoverable violations are the ones caught by a tag or bounds
//! check before any memory is touched; they surface as one of these
//! values. Anything the checks cannot catch does not exist in the
//! simulation: the machine validates every access at the point of use.

use core::fmt;

/// Result alias for fallible runtime operations.
pub type Result<T> = core::result::Result<T, Fault>;

/// Why a checked operation was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultCause {
    /// Backing memory could not be obtained.
    ResourceExhausted,
    /// A capability failed its tag, seal or bounds check.
    InvalidCapability,
    /// A required permission bit is absent.
    PermissionDenied,
}

impl fmt::Display for FaultCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceExhausted => write!(f, "resource exhausted"),
            Self::InvalidCapability => write!(f, "invalid capability"),
            Self::PermissionDenied => write!(f, "permission denied"),
        }
    }
}

/// A fault raised by a capability-checked operation.
///
/// All faults are checked at the point of use, never pre-validated:
/// any code holding a capability can exercise exactly the rights
/// encoded in it, and nothing else.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[must_use = "faults must be handled"]
pub enum Fault {
    /// Allocation failure while setting up a compartment or a
    /// protected call. Surfaced to the caller; never retried.
    ResourceExhausted,

    /// A capability failed its validity check: tag clear, sealed when
    /// an unsealed capability was required, or out of bounds.
    InvalidCapability,

    /// The operation requires a permission bit the capability does
    /// not carry.
    PermissionDenied,

    /// A fault inside a compartment, bounded to that compartment's
    /// private stack. The caller's memory is intact; the cause names
    /// what went wrong inside.
    Contained {
        /// Identifier of the faulting compartment.
        compartment: i64,
        /// The original violation.
        cause: FaultCause,
    },
}

impl Fault {
    /// Attribute a fault to a compartment.
    ///
    /// A fault that is already contained keeps its original
    /// attribution: faults belong to the innermost compartment that
    /// raised them.
    pub(crate) fn contained(self, compartment: i64) -> Self {
        match self {
            Self::ResourceExhausted => Self::Contained {
                compartment,
                cause: FaultCause::ResourceExhausted,
            },
            Self::InvalidCapability => Self::Contained {
                compartment,
                cause: FaultCause::InvalidCapability,
            },
            Self::PermissionDenied => Self::Contained {
                compartment,
                cause: FaultCause::PermissionDenied,
            },
            contained @ Self::Contained { .. } => contained,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceExhausted => write!(f, "resource exhausted"),
            Self::InvalidCapability => write!(f, "invalid capability"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::Contained { compartment, cause } => {
                write!(f, "fault contained in compartment {}: {}", compartment, cause)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_containment_keeps_innermost_attribution() {
        let inner = Fault::InvalidCapability.contained(2);
        let outer = inner.contained(1);
        assert_eq!(inner, outer);
        assert_eq!(
            outer,
            Fault::Contained {
                compartment: 2,
                cause: FaultCause::InvalidCapability
            }
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Fault::PermissionDenied.to_string(), "permission denied");
        assert_eq!(
            Fault::InvalidCapability.contained(3).to_string(),
            "fault contained in compartment 3: invalid capability"
        );
    }
}
