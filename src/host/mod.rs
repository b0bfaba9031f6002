//! Contracts between the core and the host runtime that owns the code
//! cache.
//!
//! The core is a library linked into a host runtime. Everything it needs
//! from that runtime — raw TLS, cache control, memory services, fault
//! delivery — is reached through [`HostRuntime`], and everything it gives
//! back rides on the translation pipeline ordering defined in [`phases`].

pub mod fault;
pub mod phases;
pub mod tls;

use crate::{
    context::ThreadId,
    error::{Error, Result},
    host::tls::{SlotHandle, TlsBlock},
    machine::{mcontext::Mcontext, reg::Gpr},
};

/// Services provided by the host runtime.
///
/// All methods are called on the application thread being served, with the
/// host having suspended only that thread; implementations need no
/// internal synchronization beyond what their own tables require.
pub trait HostRuntime {
    /// System page size.
    fn page_size(&self) -> usize;

    /// The register the host has appropriated for its own use, if any.
    /// The core never hands it out and resolves its app value through
    /// [`HostRuntime::stolen_reg_slot`].
    fn stolen_reg(&self) -> Option<Gpr> {
        None
    }

    /// TLS slot where the host keeps the stolen register's app value.
    fn stolen_reg_slot(&self) -> Option<SlotHandle> {
        None
    }

    /// Allocate `n_slots` contiguous raw TLS slots, addressable from
    /// emitted code.
    fn allocate_raw_tls(&mut self, n_slots: usize) -> Result<TlsBlock>;

    /// Return a block obtained from [`HostRuntime::allocate_raw_tls`].
    fn free_raw_tls(&mut self, block: TlsBlock);

    /// Spill slots the host lends out. Not guaranteed to survive across
    /// app instructions.
    fn host_slot_block(&self) -> TlsBlock;

    /// Read a TLS slot of `thread` from handler code.
    fn read_tls(&self, thread: ThreadId, slot: SlotHandle) -> u64;

    /// Write a TLS slot of `thread` from handler code.
    fn write_tls(&mut self, thread: ThreadId, slot: SlotHandle, value: u64);

    /// Fault-tolerant read of application memory. Returns false if any
    /// byte is unreadable; `out` is then unspecified.
    fn safe_read(&self, addr: u64, out: &mut [u8]) -> bool;

    /// Read one application word, fault-tolerant.
    fn read_app_word(&self, addr: u64) -> Option<u64> {
        let mut bytes = [0u8; 8];
        self.safe_read(addr, &mut bytes).then(|| u64::from_le_bytes(bytes))
    }

    /// Write application memory. Returns false on fault; partial writes
    /// are possible on failure.
    fn write_app(&mut self, addr: u64, bytes: &[u8]) -> bool;

    /// Write one application word. Returns false on fault.
    fn write_app_word(&mut self, addr: u64, value: u64) -> bool {
        self.write_app(addr, &value.to_le_bytes())
    }

    /// Allocate page-aligned raw memory readable and writable by the
    /// application.
    fn alloc_raw(&mut self, size: usize) -> Result<u64>;

    /// Revoke write access to a page range previously allocated with
    /// [`HostRuntime::alloc_raw`].
    fn protect_read_only(&mut self, addr: u64, len: usize) -> Result<()>;

    /// Release memory allocated with [`HostRuntime::alloc_raw`].
    fn free_raw(&mut self, addr: u64, size: usize);

    /// Synchronously invalidate translations covering `[pc, pc + len)`.
    fn flush_region(&mut self, pc: u64, len: usize);

    /// Lazily invalidate translations covering `[pc, pc + len)`: the
    /// current thread finishes its current block unchanged; other threads
    /// see the flush on their next block exit.
    fn delay_flush_region(&mut self, pc: u64, len: usize);

    /// Request that, after the current clean call unwinds, execution
    /// resumes from `mc` instead of falling through.
    fn request_redirect(&mut self, mc: &Mcontext);
}

/// Validate a requested private-slot count against the compile-time pool.
pub fn check_slot_request(n_slots: usize) -> Result<()> {
    if n_slots > crate::consts::MAX_PRIVATE_SLOTS {
        return Err(Error::InvalidParam);
    }
    Ok(())
}
