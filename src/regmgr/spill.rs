//! Slot table management and spill/restore emission.
//!
//! A spill is a store of a register to a slot operand; a restore is the
//! mirror load. Slot operands resolve to the manager's private raw-TLS
//! pool when the index is low, and to host-provided slots past it. Host
//! slots are not guaranteed across app instructions, which the restore
//! bookkeeping in `mod.rs` accounts for.

use crate::{
    consts::SLOT_NONE,
    host::{tls::SlotHandle, HostRuntime},
    machine::{
        ilist::{At, InsnList},
        insn::Insn,
        reg::Gpr,
    },
};

use super::{RegReservations, SlotUser};

use tracing::trace;

impl RegReservations {
    /// Resolve a slot index to its TLS handle.
    pub(crate) fn slot_opnd(&self, slot: usize) -> SlotHandle {
        debug_assert!(slot < self.num_slots(), "slot index out of range");
        if slot < self.opts.num_spill_slots {
            self.tls.slot(slot)
        } else {
            self.host_slots.slot(slot - self.opts.num_spill_slots)
        }
    }

    /// Inverse of [`RegReservations::slot_opnd`].
    pub(crate) fn slot_index_of(&self, handle: SlotHandle) -> Option<usize> {
        if let Some(idx) = self.tls.index_of(handle) {
            if idx < self.opts.num_spill_slots {
                return Some(idx);
            }
            return None;
        }
        self.host_slots
            .index_of(handle)
            .map(|idx| idx + self.opts.num_spill_slots)
    }

    /// Find an unused slot. With multi-phase handling requested, a slot is
    /// also rejected while an instruction at or after `at` still uses it;
    /// such a use was emitted by a prior pass and reusing the slot would
    /// clobber it.
    pub(crate) fn find_free_slot(&self, ilist: &InsnList, at: At) -> Option<usize> {
        (0..self.num_slots()).find(|&slot| {
            self.slot_use[slot].is_none() && !self.slot_pending_prior_pass(ilist, at, slot)
        })
    }

    fn slot_pending_prior_pass(&self, ilist: &InsnList, at: At, slot: usize) -> bool {
        if !self
            .bb_props
            .contains(super::BlockProps::HANDLE_MULTI_PHASE_SLOT_RESERVATIONS)
        {
            return false;
        }
        let from = match at {
            At::Before(r) => Some(r),
            At::End => None,
        };
        ilist.iter_from(from).any(|(_, inst)| {
            self.recognize_spill_or_restore(inst)
                .map_or(false, |(_, _, s)| s == slot)
        })
    }

    /// Identify a spill or restore emitted by this manager, by shape and
    /// slot range. Returns `(is_spill, reg, slot)`.
    pub(crate) fn recognize_spill_or_restore(
        &self,
        inst: &Insn,
    ) -> Option<(bool, Gpr, usize)> {
        if let Some((reg, handle)) = inst.as_slot_spill() {
            return self.slot_index_of(handle).map(|slot| (true, reg, slot));
        }
        if let Some((reg, handle)) = inst.as_slot_restore() {
            return self.slot_index_of(handle).map(|slot| (false, reg, slot));
        }
        None
    }

    /// Emit a spill of `reg` into `slot` at `at`. The caller updates the
    /// per-register state; this updates the slot table.
    pub(crate) fn spill_reg(&mut self, ilist: &mut InsnList, at: At, reg: Gpr, slot: usize) {
        trace!(?reg, slot, "spill");
        debug_assert!(
            self.slot_use[slot].is_none()
                || self.slot_use[slot] == Some(SlotUser::Reg(reg))
                // The flags travel through whichever register is handy.
                || slot == self.aflags.slot,
            "slot tracking mismatch"
        );
        if slot == self.aflags.slot {
            self.aflags.ever_spilled = true;
        }
        self.slot_use[slot] = Some(SlotUser::Reg(reg));
        let handle = self.slot_opnd(slot);
        ilist.insert_at(at, Insn::store_slot(handle, reg));
        if slot > self.stats_max_slot {
            self.stats_max_slot = slot;
        }
    }

    /// Emit a restore of `reg` from `slot` at `at`; releases the slot when
    /// `release`. The caller updates the per-register state.
    pub(crate) fn restore_reg(
        &mut self,
        ilist: &mut InsnList,
        at: At,
        reg: Gpr,
        slot: usize,
        release: bool,
    ) {
        trace!(?reg, slot, release, "restore");
        debug_assert!(
            self.slot_use[slot] == Some(SlotUser::Reg(reg))
                || (slot == self.aflags.slot && self.slot_use[slot].is_some()),
            "slot tracking mismatch"
        );
        if release {
            self.slot_use[slot] = None;
        }
        let handle = self.slot_opnd(slot);
        ilist.insert_at(at, Insn::load_slot(reg, handle));
    }

    /// Read the current contents of a slot from handler code (fault path).
    pub(crate) fn spilled_value(&self, host: &dyn HostRuntime, slot: usize) -> u64 {
        host.read_tls(self.thread, self.slot_opnd(slot))
    }

    /// Forget the flags' slot, if one is held.
    pub(crate) fn reset_aflags_spill_slot(&mut self) {
        if self.aflags.slot != SLOT_NONE {
            self.slot_use[self.aflags.slot] = None;
            self.aflags.slot = SLOT_NONE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consts::MAX_PRIVATE_SLOTS,
        context::ThreadId,
        host::tls::TlsBlock,
        regmgr::{BlockProps, RegOptions},
    };

    fn fresh() -> RegReservations {
        RegReservations::new(
            ThreadId(0),
            RegOptions::default(),
            TlsBlock::new(0, 4),
            TlsBlock::new(MAX_PRIVATE_SLOTS as u32 * 8, 3),
            None,
            None,
        )
    }

    #[test]
    fn slot_opnd_round_trip_private_and_host() {
        let pt = fresh();
        for slot in 0..pt.num_slots() {
            let handle = pt.slot_opnd(slot);
            assert_eq!(pt.slot_index_of(handle), Some(slot));
        }
    }

    #[test]
    fn find_free_skips_occupied() {
        let mut pt = fresh();
        let ilist = InsnList::new();
        pt.slot_use[0] = Some(SlotUser::Reg(Gpr::new(1).unwrap()));
        assert_eq!(pt.find_free_slot(&ilist, At::End), Some(1));
    }

    #[test]
    fn multi_phase_rejects_slot_used_later() {
        let mut pt = fresh();
        pt.set_block_properties(BlockProps::HANDLE_MULTI_PHASE_SLOT_RESERVATIONS);
        let mut ilist = InsnList::new();
        // A prior pass left a restore from slot 0 later in the list.
        let handle = pt.slot_opnd(0);
        let restore = ilist.push_back(Insn::load_slot(Gpr::new(2).unwrap(), handle));
        assert_eq!(pt.find_free_slot(&ilist, At::Before(restore)), Some(1));
        // Without the property the pending use is invisible.
        pt.bb_props = BlockProps::empty();
        assert_eq!(pt.find_free_slot(&ilist, At::Before(restore)), Some(0));
    }

    #[test]
    fn spill_then_restore_tracks_slot_table() {
        let mut pt = fresh();
        let mut ilist = InsnList::new();
        let reg = Gpr::new(3).unwrap();
        pt.spill_reg(&mut ilist, At::End, reg, 2);
        assert_eq!(pt.slot_use[2], Some(SlotUser::Reg(reg)));
        pt.restore_reg(&mut ilist, At::End, reg, 2, true);
        assert_eq!(pt.slot_use[2], None);
        assert_eq!(ilist.len(), 2);
        assert_eq!(pt.max_slots_used(), 2);
    }
}
