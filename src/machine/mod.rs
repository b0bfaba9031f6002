//! Abstract machine model the emission layer works over.
//!
//! The crate deliberately owns no real ISA: instruction encoding, decoding,
//! and opcode tables belong to the host runtime. What the services need is
//! a small generic load/store representation with precise liveness
//! queries, a list type with stable insertion points, and a POD machine
//! context for the fault path. That is all this module provides.

pub mod flags;
pub mod ilist;
pub mod insn;
pub mod mcontext;
pub mod opnd;
pub mod reg;
