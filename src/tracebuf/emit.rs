//! Emission helpers invoked from the insertion phase.
//!
//! Buf-emitted stores always address `[buf_ptr + const_disp]`; the fault
//! handler relies on that shape to identify the pointer register of a
//! faulting store.

use crate::{
    error::{Error, Result},
    machine::{
        ilist::{At, InsnList},
        insn::{Callee, CleanCallFlags, Insn},
        opnd::{MemRef, Opnd},
        reg::{Gpr, Width},
    },
};

use super::{TraceBuf, TraceBufKind};

impl TraceBuf {
    /// Load the per-thread buffer pointer into `reg`.
    pub fn insert_load_buf_ptr(&self, ilist: &mut InsnList, at: At, reg: Gpr) {
        ilist.insert_at(at, Insn::load_slot(reg, self.0.tls_slot));
    }

    /// Advance the buffer pointer by `stride` and store it back.
    ///
    /// For the fast ring only the low two bytes move, so the pointer wraps
    /// inside the aligned window with no branch. When the flags are dead
    /// at the insertion point the addition goes straight to the TLS
    /// subword; otherwise a flags-preserving add runs through `buf_ptr`.
    /// `aflags_dead` comes from the reservation manager's liveness query.
    pub fn insert_update_buf_ptr(
        &self,
        ilist: &mut InsnList,
        at: At,
        buf_ptr: Gpr,
        _scratch: Gpr,
        stride: u16,
        aflags_dead: bool,
    ) {
        match self.0.kind {
            TraceBufKind::CircularFast => {
                if aflags_dead {
                    ilist.insert_at(
                        at,
                        Insn::add(
                            Opnd::Slot(self.0.tls_slot, Width::W2),
                            Opnd::Imm(stride as i64, Width::W2),
                        ),
                    );
                } else {
                    ilist.insert_at(
                        at,
                        Insn::add_noflags(
                            Opnd::Reg(buf_ptr, Width::W2),
                            Opnd::Imm(stride as i64, Width::W2),
                        ),
                    );
                    ilist.insert_at(at, Insn::store_slot(self.0.tls_slot, buf_ptr));
                }
            }
            TraceBufKind::Circular | TraceBufKind::Trace => {
                // Straightforward increment; the guard page catches
                // overflow on the next store.
                ilist.insert_at(
                    at,
                    Insn::add_noflags(Opnd::reg(buf_ptr), Opnd::Imm(stride as i64, Width::W2)),
                );
                ilist.insert_at(at, Insn::store_slot(self.0.tls_slot, buf_ptr));
            }
        }
    }

    /// Store `value` (register or immediate) at `[buf_ptr + offset]` with
    /// the given width. Wide immediates travel through `scratch`.
    pub fn insert_buf_store(
        &self,
        ilist: &mut InsnList,
        at: At,
        buf_ptr: Gpr,
        scratch: Gpr,
        value: Opnd,
        width: Width,
        offset: i16,
    ) -> Result<()> {
        let mem = MemRef::base_disp(buf_ptr, offset as i64, width);
        match value {
            Opnd::Reg(reg, _) => {
                ilist.insert_at(at, Insn::store(mem, Opnd::Reg(reg, width)));
            }
            Opnd::Imm(imm, _) => {
                if width == Width::W8 {
                    // Full-width immediate stores are not encodable.
                    ilist.insert_at(
                        at,
                        Insn::mov(Opnd::reg(scratch), Opnd::Imm(imm, Width::W8)),
                    );
                    ilist.insert_at(at, Insn::store(mem, Opnd::Reg(scratch, width)));
                } else {
                    ilist.insert_at(at, Insn::store(mem, Opnd::Imm(imm, width)));
                }
            }
            _ => return Err(Error::InvalidParam),
        }
        Ok(())
    }

    /// Copy `len` bytes from `[src]` into the buffer and advance the
    /// pointer. Short copies inline a load/store pair; longer ones go
    /// through the bounded-copy helper via clean call. Not supported on
    /// the fast ring.
    pub fn insert_buf_memcpy(
        &self,
        ilist: &mut InsnList,
        at: At,
        dst: Gpr,
        src: Gpr,
        len: u16,
        aflags_dead: bool,
    ) -> Result<()> {
        if self.0.kind == TraceBufKind::CircularFast {
            return Err(Error::InvalidParam);
        }
        if usize::from(len) <= crate::consts::WORD_SIZE {
            let width = Width::from_bytes(usize::from(len)).ok_or(Error::InvalidParam)?;
            ilist.insert_at(
                at,
                Insn::load(src, MemRef::base_disp(src, 0, width)),
            );
            self.insert_buf_store(ilist, at, dst, src, Opnd::Reg(src, width), width, 0)?;
        } else {
            ilist.insert_at(
                at,
                Insn::clean_call(
                    Callee::BufMemcpy,
                    [
                        Opnd::imm(self.0.vec_idx as i64),
                        Opnd::reg(src),
                        Opnd::imm(len as i64),
                    ],
                    CleanCallFlags::empty(),
                ),
            );
        }
        // Advance on behalf of the client.
        self.insert_update_buf_ptr(ilist, at, dst, src, len, aflags_dead);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::insn::Op;

    fn fast_buf() -> TraceBuf {
        TraceBuf(std::sync::Arc::new(super::super::BufShared {
            kind: TraceBufKind::CircularFast,
            size: crate::consts::FAST_RING_SIZE,
            tls_slot: crate::host::tls::SlotHandle::from_offset(0x80),
            full_cb: None,
            vec_idx: 0,
        }))
    }

    fn r(idx: u8) -> Gpr {
        Gpr::new(idx).unwrap()
    }

    #[test]
    fn fast_update_with_dead_flags_is_single_subword_add() {
        let buf = fast_buf();
        let mut ilist = InsnList::new();
        buf.insert_update_buf_ptr(&mut ilist, At::End, r(1), r(2), 8, true);
        assert_eq!(ilist.len(), 1);
        let (_, insn) = ilist.iter().next().unwrap();
        assert!(matches!(insn.op, Op::Add));
        assert_eq!(insn.dsts[0].width(), Width::W2);
    }

    #[test]
    fn fast_update_with_live_flags_avoids_them() {
        let buf = fast_buf();
        let mut ilist = InsnList::new();
        buf.insert_update_buf_ptr(&mut ilist, At::End, r(1), r(2), 8, false);
        let ops: Vec<_> = ilist.iter().map(|(_, i)| i.op.clone()).collect();
        assert!(matches!(ops[0], Op::AddNoFlags));
        assert!(matches!(ops[1], Op::StoreSlot));
    }

    #[test]
    fn memcpy_rejected_on_fast_ring() {
        let buf = fast_buf();
        let mut ilist = InsnList::new();
        assert_eq!(
            buf.insert_buf_memcpy(&mut ilist, At::End, r(1), r(2), 4, true),
            Err(Error::InvalidParam)
        );
    }

    #[test]
    fn wide_immediate_store_uses_scratch() {
        let buf = fast_buf();
        let mut ilist = InsnList::new();
        buf.insert_buf_store(
            &mut ilist,
            At::End,
            r(1),
            r(2),
            Opnd::imm(0x1122_3344_5566_7788),
            Width::W8,
            0,
        )
        .unwrap();
        assert_eq!(ilist.len(), 2);
    }
}
