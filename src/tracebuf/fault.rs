//! Guard-page fault recovery.
//!
//! A store past the end of a guarded buffer lands on the read-only page.
//! The handler identifies the owning buffer by address range, invokes the
//! full callback, resets the pointer to the client base, and patches the
//! faulting store's pointer register so the retried instruction completes
//! into the start of the buffer.

use crate::{
    context::ThreadId,
    host::{fault::AccessFault, fault::FaultDisposition, HostRuntime},
    machine::{insn::Op, opnd::Opnd, reg::Gpr},
};

use super::{BufRegistry, BufThread};

use tracing::{debug, trace};

/// Extract the buffer-pointer register of a Buf-emitted store: the base
/// register of its destination memory operand. Anything else is not ours.
fn deduce_buf_ptr(inst: &crate::machine::insn::Insn) -> Option<Gpr> {
    if !matches!(inst.op, Op::Store) {
        return None;
    }
    inst.dsts.iter().find_map(|o| match o {
        Opnd::Mem(mem) => mem.base,
        _ => None,
    })
}

impl BufRegistry {
    /// Access-violation hook. Returns [`FaultDisposition::Suppressed`]
    /// after fixing up a guard-page overflow; anything unrecognized passes
    /// through unchanged.
    ///
    /// Takes only the clients read lock and never allocates.
    pub fn handle_fault(
        &self,
        host: &mut dyn HostRuntime,
        thread: ThreadId,
        pt: &BufThread,
        fault: &mut AccessFault<'_>,
    ) -> FaultDisposition {
        if !self.any_created() {
            return FaultDisposition::Deliver;
        }
        // Executing the page rather than writing it is not ours.
        if fault.raw_mcontext.pc == fault.access_addr {
            return FaultDisposition::Deliver;
        }
        let page = host.page_size() as u64;
        let mut owner = None;
        self.for_each_live(|shared| {
            if owner.is_some() || shared.kind == super::TraceBufKind::CircularFast {
                return;
            }
            let Some(data) = pt.bufs.get(&shared.vec_idx) else {
                return;
            };
            let ro_lo = data.cli_base + shared.size as u64;
            if fault.access_addr >= ro_lo && fault.access_addr < ro_lo + page {
                owner = Some((shared.clone(), *data));
            }
        });
        let Some((shared, data)) = owner else {
            return FaultDisposition::Deliver;
        };

        let Some(buf_ptr) = deduce_buf_ptr(fault.faulting) else {
            // A fault in the right range from a store we did not emit.
            debug!("guard-page fault from non-buffer store; delivering");
            return FaultDisposition::Deliver;
        };

        // Reset before the callback so the callback may override the
        // pointer it sees.
        let old_ptr = host.read_tls(thread, shared.tls_slot);
        host.write_tls(thread, shared.tls_slot, data.cli_base);
        if let Some(cb) = &shared.full_cb {
            let used = old_ptr.saturating_sub(data.cli_base) as usize;
            trace!(used, "buffer full");
            cb(host, data.cli_base, used);
        }
        let new_ptr = host.read_tls(thread, shared.tls_slot);
        fault.raw_mcontext.set_reg(buf_ptr, new_ptr);
        FaultDisposition::Suppressed
    }

    /// Bounded-copy helper reached by clean call from
    /// [`super::TraceBuf::insert_buf_memcpy`]. Wraps through the full
    /// callback when the copy would overflow.
    pub fn handle_memcpy(
        &self,
        host: &mut dyn HostRuntime,
        thread: ThreadId,
        pt: &BufThread,
        vec_idx: usize,
        src: u64,
        len: usize,
    ) {
        let mut target = None;
        self.for_each_live(|shared| {
            if shared.vec_idx == vec_idx {
                target = Some(shared.clone());
            }
        });
        let Some(shared) = target else { return };
        let Some(data) = pt.bufs.get(&vec_idx) else {
            return;
        };
        let mut dst = host.read_tls(thread, shared.tls_slot);
        if dst + len as u64 > data.cli_base + shared.size as u64 {
            host.write_tls(thread, shared.tls_slot, data.cli_base);
            if let Some(cb) = &shared.full_cb {
                let used = dst.saturating_sub(data.cli_base) as usize;
                cb(host, data.cli_base, used);
            }
            dst = host.read_tls(thread, shared.tls_slot);
        }
        // Chunked copy through a stack buffer; this path never allocates.
        let mut copied = 0usize;
        let mut chunk = [0u8; 64];
        while copied < len {
            let n = (len - copied).min(chunk.len());
            if !host.safe_read(src + copied as u64, &mut chunk[..n]) {
                return;
            }
            if !host.write_app(dst + copied as u64, &chunk[..n]) {
                return;
            }
            copied += n;
        }
    }
}
