//! Core tunables and fixed magic numbers.

use core::mem;

/// Number of general-purpose registers in the modeled register file.
pub const NUM_GPRS: usize = 16;

/// Length of a machine word, in bytes.
pub const WORD_SIZE: usize = mem::size_of::<u64>();

/// Upper bound on private spill slots a tool configuration may request.
pub const MAX_PRIVATE_SLOTS: usize = 16;

/// Spill slots borrowed from the host runtime, valid only between adjacent
/// app instructions.
pub const HOST_SPILL_SLOTS: usize = 3;

/// Total size of the slot table (private pool plus host pool).
pub const MAX_SPILLS: usize = MAX_PRIVATE_SLOTS + HOST_SPILL_SLOTS;

/// Sentinel slot index meaning "no slot assigned".
pub const SLOT_NONE: usize = MAX_SPILLS;

/// Maximum depth of nested wrapped-function frames tracked per thread.
pub const MAX_WRAP_NESTING: usize = 64;

/// Bytes of code snapshotted immediately before a return address; a
/// mismatch on a later lookup means the code changed and the post-call
/// entry must be discarded.
pub const POST_CALL_PRIOR_BYTES: usize = 6;

/// Entries in the lock-free post-call address cache.
pub const POSTCALL_CACHE_SIZE: usize = 8;

/// Disabled wrap entries tolerated before a batched removal and flush.
pub const DISABLED_COUNT_FLUSH_THRESHOLD: usize = 16;

/// Pending lazily-unreserved registers tolerated before a forced flush of
/// their restores.
pub const PENDING_UNRESERVED_THRESHOLD: usize = 8;

/// Buffer size at which a circular buffer uses the zero-branch subword
/// wrap technique instead of a guard page.
pub const FAST_RING_SIZE: usize = 1 << 16;

/// Distinguished address marking a wrap-owned return path. Never observed
/// by the application: faults translate it away before the host sees the
/// machine context.
pub const RETADDR_SENTINEL: u64 = 0x5E17_7A9E_0000;

/// Generated return-point stubs kept for native replacement routines, one
/// per distinct stack adjustment.
pub const REPLACE_NATIVE_STUBS: usize = 4;

static_assertions::const_assert!(FAST_RING_SIZE.is_power_of_two());
static_assertions::const_assert!(MAX_PRIVATE_SLOTS < SLOT_NONE);
