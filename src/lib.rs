//! Middleware core for dynamic binary instrumentation tools.
//!
//! `bridle` sits between a code-cache host runtime and user-written
//! instrumentation passes, letting several independent passes cooperate on
//! the same translated basic block without corrupting each other's use of
//! machine registers, arithmetic flags, or return-address flow.
//!
//! Three services are exported:
//!
//! - [`regmgr`] — lifetime-scoped reservation of general-purpose registers
//!   and the arithmetic flags, with lazy restore and fault-time state
//!   reconstruction.
//! - [`wrap`] — pre/post interception of application function calls,
//!   including nesting, tail calls, abnormal unwinds, and return-address
//!   replacement.
//! - [`tracebuf`] — fixed-size per-thread buffers for high-rate record
//!   emission from inline code, with ring-wrap or guard-page full
//!   detection.
//!
//! The host runtime is reached exclusively through the contracts in
//! [`host`]; the crate owns no code cache, no decoder, and no ISA tables.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

pub mod consts;
pub mod context;
pub mod runtime;
pub mod error;
pub mod host;
pub mod machine;
pub mod regmgr;
pub mod tracebuf;
pub mod wrap;

#[cfg(any(test, feature = "test-helpers"))]
pub mod emulator;

pub mod prelude {
    //! Re-exports for the common tool-facing surface.
    #[doc(no_inline)]
    pub use crate::{
        consts::*,
        context::ThreadId,
        runtime::{Core, CoreOptions, GlobalFlags},
        error::{Error, Result},
        host::{
            fault::RestoreStateInfo,
            phases::{Phase, Priority},
            tls::SlotHandle,
            HostRuntime,
        },
        machine::{
            flags::Aflags,
            ilist::{At, InsnList, InsnRef},
            insn::Insn,
            mcontext::Mcontext,
            opnd::{MemRef, Opnd},
            reg::{Gpr, GprSet, Width},
        },
        regmgr::{BlockProps, RegOptions, RegReservations},
        tracebuf::{TraceBuf, TraceBufKind},
        wrap::{CallConv, WrapCtx, WrapFlags},
    };
}
