//! Payloads delivered by the host on faults.
//!
//! Two distinct events reach the core: machine-state restoration (the host
//! is about to surface a machine context for a fault inside translated
//! code and asks registered handlers to rewrite it back to application
//! terms) and the raw access-violation signal used by trace buffers.

use crate::machine::{
    ilist::{InsnList, InsnRef},
    insn::Insn,
    mcontext::Mcontext,
};

/// State-restoration event payload.
///
/// `cache_prefix` is always present: the cache contents from the fragment
/// start up to, and excluding, the faulting instruction, decoded into a
/// caller-owned buffer. `ilist` is the reconstructed instruction list with
/// meta markers, present only when the host can rebuild it; `fault_ref`
/// then names the faulting instruction within it.
#[derive(Debug)]
pub struct RestoreStateInfo<'a> {
    /// Machine context as the hardware produced it; handlers rewrite this
    /// toward application state in place.
    pub raw_mcontext: &'a mut Mcontext,
    /// Decoded cache contents preceding the fault point.
    pub cache_prefix: &'a [Insn],
    /// Reconstructed block IL, when the host can provide it.
    pub ilist: Option<&'a InsnList>,
    /// Faulting instruction within `ilist`.
    pub fault_ref: Option<InsnRef>,
    /// Application pc at which the faulting fragment starts.
    pub fragment_start: u64,
    /// Whether handlers should also rewrite application memory (not just
    /// the register file) back to application state.
    pub restore_memory: bool,
}

/// Disposition of a raw access-violation signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// The core consumed the fault; re-execute the faulting instruction.
    Suppressed,
    /// Not ours; deliver to the next handler unchanged.
    Deliver,
}

/// Access-violation event payload for the trace-buffer guard pages.
#[derive(Debug)]
pub struct AccessFault<'a> {
    /// Address whose access faulted.
    pub access_addr: u64,
    /// Machine context at the faulting store; the handler may rewrite the
    /// buffer-pointer register before the instruction is retried.
    pub raw_mcontext: &'a mut Mcontext,
    /// The faulting instruction, decoded by the host into a caller-owned
    /// buffer.
    pub faulting: &'a Insn,
}
