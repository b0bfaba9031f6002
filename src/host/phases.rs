//! Block-translation pipeline phases and pass ordering.
//!
//! All translated code flows through four ordered phases. Passes register
//! at an explicit priority; within one phase, callbacks run in ascending
//! priority order, so a numerically larger priority sees the output of a
//! smaller one. Pre-insertion stacks in callback order, which means the
//! last pass to insert before an app instruction executes closest to it.

/// The four translation phases, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// App-to-app rewriting; the instruction stream is still pure
    /// application code.
    AppToApp,
    /// Whole-block analysis over the final application IL.
    Analysis,
    /// Per-instruction insertion of instrumentation.
    Insertion,
    /// Instrumentation-to-instrumentation cleanup.
    InstruToInstru,
    /// Not inside a translation. Reservation requests made here fall back
    /// to single-point forward analysis.
    Outside,
}

/// Pass priority; smaller runs earlier within a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(pub i32);

impl Priority {
    /// The replace engine's app-to-app rewriting.
    pub const REPLACE_APP2APP: Priority = Priority(-100);
    /// Reservation-manager liveness analysis; runs late so it sees the
    /// final application IL.
    pub const REGMGR_ANALYSIS: Priority = Priority(900);
    /// Reservation-manager per-instruction cursor update; runs before any
    /// tool insertion.
    pub const REGMGR_INSERT_EARLY: Priority = Priority(-1000);
    /// Wrap entry/return hook insertion.
    pub const WRAP_INSERT: Priority = Priority(-500);
    /// Default priority for tool insertion passes.
    pub const TOOL_DEFAULT: Priority = Priority(0);
    /// Reservation-manager restore bookkeeping; runs after every tool so
    /// its restores land immediately before the app instruction.
    pub const REGMGR_INSERT_LATE: Priority = Priority(1000);
    /// Reservation-manager block finalization in the cleanup phase.
    pub const REGMGR_CLEANUP: Priority = Priority(1000);
}
