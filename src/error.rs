// SPDX-License-Identifier: MPL-2.0

//! Crate-local error type for the interrupt engine.
//!
//! Kept separate from any generic framework error so that callers can match
//! on the exact kinds the control plane promises in its contract, rather than
//! a broad errno-style enum meant for the whole kernel.

use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

/// One of the six outcomes the control plane can fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A null pointer, unknown mode, zero `requested_irqs`, or an out-of-range `irq_id`.
    InvalidArgs,
    /// The operation is illegal in the device's current mode (e.g. registering
    /// a handler while disabled, or transitioning modes without going through
    /// `Disabled` first).
    BadState,
    /// MSI-X in any form, or a capability the platform/device does not have.
    NotSupported,
    /// Handler-table allocation failed.
    NoMemory,
    /// The platform refused to grant the requested resource (vector block,
    /// system IRQ mapping).
    NoResources,
    /// An invariant was violated; implementations should treat this as a bug.
    Internal(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgs => write!(f, "invalid argument"),
            Error::BadState => write!(f, "operation not valid in the current mode"),
            Error::NotSupported => write!(f, "capability not supported"),
            Error::NoMemory => write!(f, "handler table allocation failed"),
            Error::NoResources => write!(f, "platform could not grant the requested resource"),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}
