//! Arithmetic-flags spill and restore.
//!
//! The flags travel through a designated holder register
//! ([`Gpr::AFLAGS_HOLDER`]): flags→holder→slot on spill, slot→holder→flags
//! on restore. As an optimization the flags may stay cached in the holder
//! itself; the holder is then treated as reserved, and is surrendered to a
//! slot the moment the holder is wanted for anything else.

use crate::{
    consts::SLOT_NONE,
    error::{Error, Result},
    host::phases::Phase,
    machine::{
        ilist::{At, InsnList},
        insn::Insn,
        reg::Gpr,
    },
};

use super::{liveness::LiveState, RegReservations, SlotUser};

use tracing::trace;

impl RegReservations {
    /// Reserve the arithmetic flags, spilling them via the holder register
    /// unless they are dead at the insertion point.
    pub fn reserve_aflags(&mut self, ilist: &mut InsnList, at: At) -> Result<()> {
        if self.phase != Phase::Insertion {
            self.forward_analysis(ilist, at)?;
        }
        if self.aflags.in_use {
            return Err(Error::InUse);
        }
        let live = self.aflags_live_cur();
        if live.is_empty() {
            // Dead flags need no spill; drop any stale lazy slot.
            if !self.aflags.native {
                self.reset_aflags_spill_slot();
            }
            trace!("aflags are dead at reservation");
            self.aflags.in_use = true;
            self.aflags.native = true;
            return Ok(());
        }
        let holder = Gpr::AFLAGS_HOLDER;
        if !self.aflags.native
            || (self.reg[holder.index()].in_use && self.aflags.xchg == Some(holder))
        {
            // A prior reservation has not been lazily restored yet.
            trace!("reusing un-restored aflags");
            debug_assert!(
                self.aflags.xchg.is_some()
                    || (self.aflags.slot != SLOT_NONE
                        && self.slot_use[self.aflags.slot].is_some()),
                "lost aflags slot reservation"
            );
            self.aflags.native = false;
            self.aflags.in_use = true;
            return Ok(());
        }
        self.aflags.xchg = None;
        self.spill_aflags(ilist, at)?;
        self.aflags.in_use = true;
        self.aflags.native = false;
        Ok(())
    }

    /// Mark the flags idle; the restore is deferred exactly like a
    /// register unreserve.
    pub fn unreserve_aflags(&mut self, ilist: &mut InsnList, at: At) -> Result<()> {
        if !self.aflags.in_use {
            return Err(Error::InvalidParam);
        }
        self.aflags.in_use = false;
        if self.phase != Phase::Insertion {
            // No lazy window outside the insertion phase.
            if self.aflags.xchg.is_some() {
                self.move_aflags_from_reg(ilist, at, true);
            } else if !self.aflags.native {
                self.restore_aflags(ilist, at, true)?;
                self.aflags.native = true;
                self.reset_aflags_spill_slot();
            }
            debug_assert!(self.aflags.slot == SLOT_NONE, "aflags slot not reset");
        }
        trace!("aflags unreserved");
        Ok(())
    }

    /// Spill the flags. On exit they live either in the holder register
    /// (`aflags.xchg` set) or in `aflags.slot`.
    pub(crate) fn spill_aflags(&mut self, ilist: &mut InsnList, at: At) -> Result<()> {
        let holder = Gpr::AFLAGS_HOLDER;
        let mut swap: Option<Gpr> = None;

        if self.reg[holder.index()].in_use && self.aflags.xchg != Some(holder) {
            // Someone owns the holder. Borrow another register, park the
            // holder's tool value there while the flags pass through.
            let scratch = self.reserve_internal(ilist, at, None, false)?;
            trace!(?scratch, "holder in use: borrowing for flags transport");
            ilist.insert_at(at, Insn::xchg(holder, scratch));
            swap = Some(scratch);
        }

        if !self.reg[holder.index()].native {
            // The holder's app value already sits in its slot.
            debug_assert!(
                self.slot_use[self.reg[holder.index()].slot]
                    == Some(SlotUser::Reg(holder)),
                "holder tracking mismatch"
            );
        } else if self.aflags.xchg != Some(holder) {
            let slot = self
                .find_free_slot(ilist, at)
                .ok_or(Error::OutOfSlots)?;
            if self.opts.conservative_spills || self.live_of(holder) == LiveState::Live {
                self.spill_reg(ilist, at, holder, slot);
                self.reg[holder.index()].ever_spilled = true;
            } else {
                self.slot_use[slot] = Some(SlotUser::Reg(holder));
            }
            self.reg[holder.index()].slot = slot;
        }

        ilist.insert_at(at, Insn::flags_to_reg(holder));

        match swap {
            Some(scratch) => {
                debug_assert!(self.aflags.slot == SLOT_NONE, "aflags slot not reset");
                let slot = self
                    .find_free_slot(ilist, at)
                    .ok_or(Error::OutOfSlots)?;
                self.aflags.slot = slot;
                // Use the holder only as transport, then give it back.
                self.spill_reg(ilist, at, holder, slot);
                ilist.insert_at(at, Insn::xchg(scratch, holder));
                self.unreserve_register(ilist, at, scratch)?;
            }
            None => {
                // Keep the flags cached in the holder until forced out.
                self.reg[holder.index()].in_use = true;
                self.reg[holder.index()].native = false;
                self.aflags.xchg = Some(holder);
            }
        }
        Ok(())
    }

    /// Restore the app flags at `at`. With `release` the slot (or holder
    /// cache) is given up; without it the spilled copy stays valid.
    pub(crate) fn restore_aflags(
        &mut self,
        ilist: &mut InsnList,
        at: At,
        release: bool,
    ) -> Result<()> {
        if self.aflags.native {
            return Ok(());
        }
        let holder = Gpr::AFLAGS_HOLDER;

        if self.aflags.xchg == Some(holder) {
            debug_assert!(self.reg[holder.index()].in_use, "flags-in-holder mismatch");
            ilist.insert_at(at, Insn::reg_to_flags(holder));
            if release {
                self.aflags.xchg = None;
                self.reg[holder.index()].in_use = false;
            }
            return Ok(());
        }

        let temp_slot = self
            .find_free_slot(ilist, at)
            .ok_or(Error::OutOfSlots)?;
        let mut swap: Option<Gpr> = None;
        let holder_live =
            self.opts.conservative_spills || self.live_of(holder) == LiveState::Live;
        if self.reg[holder.index()].in_use {
            let scratch = self.reserve_internal(ilist, at, None, false)?;
            trace!(?scratch, "holder in use: borrowing for flags restore");
            ilist.insert_at(at, Insn::xchg(holder, scratch));
            swap = Some(scratch);
        } else if holder_live {
            self.spill_reg(ilist, at, holder, temp_slot);
        }
        if self.aflags.slot == SLOT_NONE {
            self.report_error(Error::IncompatibleState, "aflags slot not reserved");
            return Err(Error::IncompatibleState);
        }
        let aflags_slot = self.aflags.slot;
        debug_assert!(self.aflags.ever_spilled, "aflags slot holds no spill");
        self.restore_reg(ilist, at, holder, aflags_slot, release);
        ilist.insert_at(at, Insn::reg_to_flags(holder));
        match swap {
            Some(scratch) => {
                ilist.insert_at(at, Insn::xchg(scratch, holder));
                self.unreserve_register(ilist, at, scratch)?;
            }
            None => {
                if holder_live {
                    self.restore_reg(ilist, at, holder, temp_slot, true);
                }
            }
        }
        Ok(())
    }

    /// Stop caching the flags in the holder register: move them to a slot
    /// (or restore them if idle), then give the holder its app value back.
    pub(crate) fn move_aflags_from_reg(&mut self, ilist: &mut InsnList, at: At, stateful: bool) {
        let holder = Gpr::AFLAGS_HOLDER;
        if self.aflags.in_use || !stateful {
            trace!("moving aflags from holder to slot");
            debug_assert!(self.aflags.slot == SLOT_NONE, "aflags slot not reset");
            if self.aflags.slot == SLOT_NONE {
                match self.find_free_slot(ilist, at) {
                    Some(slot) => self.aflags.slot = slot,
                    None => {
                        self.report_error(Error::OutOfSlots, "no slot for displaced aflags");
                        return;
                    }
                }
            }
            let slot = self.aflags.slot;
            self.spill_reg(ilist, at, holder, slot);
        } else if !self.aflags.native {
            trace!("lazily restoring aflags to free the holder");
            if let Err(e) = self.restore_aflags(ilist, at, true) {
                self.report_error(e, "failed to restore flags before holder reuse");
                return;
            }
            self.aflags.native = true;
            self.reset_aflags_spill_slot();
        }
        // Give the holder its app value back.
        let holder_slot = self.reg[holder.index()].slot;
        if self.opts.conservative_spills || self.live_of(holder) == LiveState::Live {
            self.restore_reg(ilist, at, holder, holder_slot, stateful);
        } else if stateful {
            self.slot_use[holder_slot] = None;
        }
        if stateful {
            self.reg[holder.index()].in_use = false;
            self.reg[holder.index()].native = true;
            self.reg[holder.index()].ever_spilled = false;
            self.aflags.xchg = None;
        }
    }
}
