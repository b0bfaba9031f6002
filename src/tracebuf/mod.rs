//! Per-thread streaming trace buffers.
//!
//! Tools emit high-rate records from inline code through a buffer pointer
//! kept in a raw TLS slot. Three flavors differ only in how "full" is
//! detected:
//!
//! - `CircularFast`: the buffer is a power-of-two ring aligned to its own
//!   size; advancing only the low-order bytes of the pointer wraps with
//!   zero branches and no callback.
//! - `Trace`: a read-only guard page follows the buffer; the faulting
//!   store triggers the full callback, the pointer resets, and the store
//!   retries.
//! - `Circular`: the guard-page technique with no callback.

mod emit;
mod fault;

use crate::{
    consts::FAST_RING_SIZE,
    context::ThreadId,
    error::{Error, Result},
    host::{tls::SlotHandle, HostRuntime},
};

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};
use tracing::{debug, trace};

/// Buffer flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceBufKind {
    /// Power-of-two ring with subword pointer wrap.
    CircularFast,
    /// Guard-page ring without a full callback.
    Circular,
    /// Guard-page buffer with a full callback.
    Trace,
}

/// Invoked when a trace buffer fills (and at thread exit with the
/// remaining bytes). Receives the client base and the used byte count.
pub type FullCallback = Arc<dyn Fn(&mut dyn HostRuntime, u64, usize) + Send + Sync>;

pub(crate) struct BufShared {
    pub(crate) kind: TraceBufKind,
    /// Usable bytes from the client's perspective.
    pub(crate) size: usize,
    /// Raw TLS slot holding the per-thread buffer pointer.
    pub(crate) tls_slot: SlotHandle,
    pub(crate) full_cb: Option<FullCallback>,
    /// Index into the registry's clients vector.
    pub(crate) vec_idx: usize,
}

/// Handle to one registered buffer.
#[derive(Clone)]
pub struct TraceBuf(pub(crate) Arc<BufShared>);

impl TraceBuf {
    /// Buffer flavor.
    pub fn kind(&self) -> TraceBufKind {
        self.0.kind
    }

    /// Usable size in bytes.
    pub fn size(&self) -> usize {
        self.0.size
    }

    /// The TLS slot holding this buffer's pointer.
    pub fn tls_slot(&self) -> SlotHandle {
        self.0.tls_slot
    }
}

/// Per-thread allocation backing one buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PerThreadBuf {
    /// Base of the buffer from the client's perspective.
    pub(crate) cli_base: u64,
    /// Actual allocation base.
    pub(crate) raw_base: u64,
    /// Actual allocation size.
    pub(crate) raw_size: usize,
}

/// Per-thread buffer state, keyed by registry index.
#[derive(Debug, Default)]
pub struct BufThread {
    pub(crate) bufs: HashMap<usize, PerThreadBuf>,
}

impl BufThread {
    /// Fresh state for a new thread.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Process-wide buffer registry.
pub struct BufRegistry {
    /// Tombstoned vector of registered buffers; readers include every
    /// thread init/exit and the fault handler.
    clients: RwLock<Vec<Option<Arc<BufShared>>>>,
    /// Cheap skip for the fault path when no buffer was ever created.
    any_created: AtomicBool,
}

impl BufRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(Vec::new()),
            any_created: AtomicBool::new(false),
        }
    }

    /// Create a circular buffer. The magic fast-ring size yields the
    /// subword-wrap flavor; anything else gets a guard page and silent
    /// wrap.
    pub fn create_circular_buffer(
        &self,
        host: &mut dyn HostRuntime,
        size: usize,
    ) -> Result<TraceBuf> {
        let kind = if size == FAST_RING_SIZE && size.is_power_of_two() {
            TraceBufKind::CircularFast
        } else {
            TraceBufKind::Circular
        };
        self.register(host, kind, size, None)
    }

    /// Create a trace buffer; `full_cb` runs each time the buffer fills
    /// and once at thread exit with the remainder.
    pub fn create_trace_buffer(
        &self,
        host: &mut dyn HostRuntime,
        size: usize,
        full_cb: FullCallback,
    ) -> Result<TraceBuf> {
        if size < host.page_size() {
            return Err(Error::InvalidParam);
        }
        self.register(host, TraceBufKind::Trace, size, Some(full_cb))
    }

    fn register(
        &self,
        host: &mut dyn HostRuntime,
        kind: TraceBufKind,
        size: usize,
        full_cb: Option<FullCallback>,
    ) -> Result<TraceBuf> {
        if size == 0 {
            return Err(Error::InvalidParam);
        }
        let tls = host.allocate_raw_tls(1)?;
        let mut clients = self.clients.write().expect("clients poisoned");
        let vec_idx = clients.len();
        let shared = Arc::new(BufShared {
            kind,
            size,
            tls_slot: tls.slot(0),
            full_cb,
            vec_idx,
        });
        clients.push(Some(shared.clone()));
        self.any_created.store(true, Ordering::Release);
        debug!(?kind, size, vec_idx, "trace buffer registered");
        Ok(TraceBuf(shared))
    }

    /// Unregister a buffer. Live threads release their backing memory at
    /// their next exit.
    pub fn free(&self, host: &mut dyn HostRuntime, buf: &TraceBuf) -> Result<()> {
        let mut clients = self.clients.write().expect("clients poisoned");
        let slot = clients
            .get_mut(buf.0.vec_idx)
            .ok_or(Error::InvalidParam)?;
        match slot {
            Some(existing) if Arc::ptr_eq(existing, &buf.0) => {
                *slot = None;
            }
            _ => return Err(Error::InvalidParam),
        }
        drop(clients);
        host.free_raw_tls(crate::host::tls::TlsBlock::new(buf.0.tls_slot.offset(), 1));
        Ok(())
    }

    pub(crate) fn for_each_live(&self, mut f: impl FnMut(&Arc<BufShared>)) {
        for shared in self
            .clients
            .read()
            .expect("clients poisoned")
            .iter()
            .flatten()
        {
            f(shared);
        }
    }

    pub(crate) fn any_created(&self) -> bool {
        self.any_created.load(Ordering::Acquire)
    }

    /// Per-thread setup: allocate backing memory for every live buffer and
    /// point the TLS pointer at the client base.
    pub fn thread_init(
        &self,
        host: &mut dyn HostRuntime,
        thread: ThreadId,
        pt: &mut BufThread,
    ) -> Result<()> {
        let mut pending = Vec::new();
        self.for_each_live(|shared| pending.push(shared.clone()));
        for shared in pending {
            let data = match shared.kind {
                TraceBufKind::CircularFast => Self::alloc_fast_ring(host, &shared)?,
                _ => Self::alloc_guarded(host, &shared)?,
            };
            host.write_tls(thread, shared.tls_slot, data.cli_base);
            pt.bufs.insert(shared.vec_idx, data);
            trace!(vec_idx = shared.vec_idx, base = data.cli_base, "thread buffer ready");
        }
        Ok(())
    }

    /// Per-thread teardown: flush remainders through the callback and free
    /// the backing memory.
    pub fn thread_exit(&self, host: &mut dyn HostRuntime, thread: ThreadId, pt: &mut BufThread) {
        let mut pending = Vec::new();
        self.for_each_live(|shared| pending.push(shared.clone()));
        for shared in pending {
            let Some(data) = pt.bufs.remove(&shared.vec_idx) else {
                continue;
            };
            let ptr = host.read_tls(thread, shared.tls_slot);
            if let Some(cb) = &shared.full_cb {
                let used = ptr.saturating_sub(data.cli_base) as usize;
                cb(host, data.cli_base, used);
            }
            host.free_raw(data.raw_base, data.raw_size);
        }
    }

    /// Double allocation so an aligned power-of-two window always fits.
    fn alloc_fast_ring(
        host: &mut dyn HostRuntime,
        shared: &BufShared,
    ) -> Result<PerThreadBuf> {
        let raw_size = shared.size * 2;
        let raw_base = host.alloc_raw(raw_size)?;
        let cli_base = align_up(raw_base, shared.size as u64);
        Ok(PerThreadBuf {
            cli_base,
            raw_base,
            raw_size,
        })
    }

    /// Page-rounded buffer plus one read-only guard page, positioned so
    /// exactly `size` writable bytes precede the guard.
    fn alloc_guarded(host: &mut dyn HostRuntime, shared: &BufShared) -> Result<PerThreadBuf> {
        let page = host.page_size() as u64;
        let rounded = align_up(shared.size as u64, page);
        let raw_size = (rounded + page) as usize;
        let raw_base = host.alloc_raw(raw_size)?;
        host.protect_read_only(raw_base + rounded, page as usize)?;
        Ok(PerThreadBuf {
            cli_base: raw_base + rounded - shared.size as u64,
            raw_base,
            raw_size,
        })
    }

    /// Current buffer pointer of `thread`.
    pub fn buffer_ptr(&self, host: &dyn HostRuntime, thread: ThreadId, buf: &TraceBuf) -> u64 {
        host.read_tls(thread, buf.0.tls_slot)
    }

    /// Overwrite the buffer pointer of `thread`.
    pub fn set_buffer_ptr(
        &self,
        host: &mut dyn HostRuntime,
        thread: ThreadId,
        buf: &TraceBuf,
        ptr: u64,
    ) {
        host.write_tls(thread, buf.0.tls_slot, ptr);
    }

    /// Client base address of `thread`'s backing allocation.
    pub fn buffer_base(&self, pt: &BufThread, buf: &TraceBuf) -> Option<u64> {
        pt.bufs.get(&buf.0.vec_idx).map(|d| d.cli_base)
    }

    /// Usable buffer size.
    pub fn buffer_size(&self, buf: &TraceBuf) -> usize {
        buf.0.size
    }
}

impl Default for BufRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn align_up(value: u64, to: u64) -> u64 {
    debug_assert!(to.is_power_of_two());
    (value + to - 1) & !(to - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_powers() {
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
        assert_eq!(align_up(1, 1 << 16), 1 << 16);
    }
}
