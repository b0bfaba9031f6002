//! Runtime error definitions shared by all three services.

use crate::machine::reg::Gpr;

/// Result alias used by every public operation.
pub type Result<T> = core::result::Result<T, Error>;

/// Error kinds surfaced to the caller.
///
/// A failing reserve leaves no code emitted and no state mutated; a failing
/// wrap registration leaves any prior registration unchanged; a fault the
/// core declines to handle is passed through to the host's next handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A parameter was out of range or inconsistent with current state.
    #[error("invalid parameter")]
    InvalidParam,
    /// Every spill slot, private and host-borrowed, is occupied.
    #[error("out of spill slots")]
    OutOfSlots,
    /// No register is dead at the requested point.
    #[error("no dead register at insertion point")]
    NoDeadReg,
    /// No register satisfies the allowed set, or the request collides with
    /// the host's stolen register.
    #[error("register conflict")]
    RegConflict,
    /// The application value of the register was discarded (dead at
    /// reservation, never spilled) and cannot be rematerialized.
    #[error("app value unavailable for {0:?}")]
    NoAppValue(Gpr),
    /// The resource is already reserved or already registered.
    #[error("resource in use")]
    InUse,
    /// The operation is not supported in the current configuration.
    #[error("feature not available")]
    FeatureNotAvailable,
    /// A registration already exists and duplicates are not permitted.
    #[error("already exists")]
    AlreadyExists,
    /// Internal bookkeeping no longer matches the requested transition.
    #[error("incompatible state")]
    IncompatibleState,
    /// A memory access needed by the operation faulted.
    #[error("memory fault")]
    MemoryFault,
}

/// Outcome of the user-installed error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHandled {
    /// The callback absorbed the condition; the call returns the error.
    Handled,
    /// The callback declined; the core re-raises via the host's assertion
    /// mechanism.
    Unhandled,
}

/// Callback invoked on internal-consistency violations (nesting overflow,
/// slot tracking mismatch).
pub type ErrorCallback = fn(Error) -> ErrorHandled;
