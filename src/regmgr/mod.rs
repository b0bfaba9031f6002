//! Cooperative register and flags reservation.
//!
//! Instrumentation passes ask for exclusive, lifetime-scoped access to
//! general-purpose registers and the arithmetic flags. The manager picks a
//! victim, spills the application value to a thread-local slot when it is
//! still live, and restores it as late as it can get away with: at the
//! next app read, at block end, or when the register is wanted again.
//!
//! All state here is per thread. The manager participates in the
//! translation pipeline at fixed priorities (see
//! [`crate::host::phases::Priority`]) so that its restores land
//! immediately before each application instruction, after every tool pass
//! has inserted its own code.

mod aflags;
mod liveness;
mod restore;
mod spill;

pub use liveness::LiveState;
pub use restore::reconstruct_machine_state;

use crate::{
    consts::{MAX_SPILLS, NUM_GPRS, PENDING_UNRESERVED_THRESHOLD, SLOT_NONE},
    context::ThreadId,
    error::{Error, ErrorCallback, ErrorHandled, Result},
    host::{
        phases::Phase,
        tls::{SlotHandle, TlsBlock},
    },
    machine::{
        flags::Aflags,
        ilist::{At, InsnList, InsnRef},
        insn::{CleanCallFlags, Insn, LabelKind},
        opnd::Opnd,
        reg::{Gpr, GprSet},
    },
};

use bitflags::bitflags;
use tracing::trace;

bitflags! {
    /// Properties a pass may declare for the current block.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct BlockProps: u8 {
        /// Trust lazy restores despite intra-block control flow.
        const IGNORE_CONTROL_FLOW = 1 << 0;
        /// A pass keeps spill regions open across branches; restore before
        /// every app instruction.
        const CONTAINS_SPANNING_CONTROL_FLOW = 1 << 1;
        /// Reject free slots that a prior pass still references later in
        /// the list.
        const HANDLE_MULTI_PHASE_SLOT_RESERVATIONS = 1 << 2;
        /// The tool restores everything itself before block end.
        const USER_RESTORES_AT_BB_END = 1 << 3;
    }
}

/// Init-time configuration of the reservation manager.
#[derive(Debug, Clone, Copy)]
pub struct RegOptions {
    /// Private TLS slots to allocate; host slots extend the pool past
    /// these.
    pub num_spill_slots: usize,
    /// Spill and restore unconditionally, ignoring liveness.
    pub conservative_spills: bool,
    /// Invoked on internal-consistency violations.
    pub error_callback: Option<ErrorCallback>,
}

impl Default for RegOptions {
    fn default() -> Self {
        Self {
            num_spill_slots: 4,
            conservative_spills: false,
            error_callback: None,
        }
    }
}

/// What occupies a spill slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotUser {
    /// The app value (or a tool temporary) of a register.
    Reg(Gpr),
}

/// Per-register reservation state.
#[derive(Debug, Clone)]
pub(crate) struct RegInfo {
    /// Liveness per reversed app-instruction index.
    pub(crate) live: Vec<LiveState>,
    /// App reads+writes in the current block; allocation tie-breaker.
    pub(crate) app_uses: u32,
    pub(crate) in_use: bool,
    /// Whether the app value has actually been written to a slot since
    /// reservation.
    pub(crate) ever_spilled: bool,
    /// Whether the register currently contains the app value.
    pub(crate) native: bool,
    /// Another register temporarily holding this one's app value.
    pub(crate) xchg: Option<Gpr>,
    /// Slot holding the spilled app value, or [`SLOT_NONE`].
    pub(crate) slot: usize,
}

impl Default for RegInfo {
    fn default() -> Self {
        Self {
            live: Vec::new(),
            app_uses: 0,
            in_use: false,
            ever_spilled: false,
            native: true,
            xchg: None,
            slot: SLOT_NONE,
        }
    }
}

/// Arithmetic-flags reservation state; mirrors [`RegInfo`] but liveness is
/// a mask of live flag bits per point.
#[derive(Debug, Clone)]
pub(crate) struct FlagsInfo {
    pub(crate) live: Vec<Aflags>,
    pub(crate) in_use: bool,
    pub(crate) ever_spilled: bool,
    pub(crate) native: bool,
    /// GPR currently caching the flags, when cheaper than a slot.
    pub(crate) xchg: Option<Gpr>,
    pub(crate) slot: usize,
}

impl Default for FlagsInfo {
    fn default() -> Self {
        Self {
            live: Vec::new(),
            in_use: false,
            ever_spilled: false,
            native: true,
            xchg: None,
            slot: SLOT_NONE,
        }
    }
}

/// Where a reserved register's app value currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveInfo {
    /// Whether the register is currently reserved.
    pub reserved: bool,
    /// Whether the register itself still holds the app value.
    pub holds_app_value: bool,
    /// Slot holding the spilled app value, if spilled.
    pub app_value_slot: Option<SlotHandle>,
    /// Whether that slot is borrowed from the host (not guaranteed across
    /// app instructions).
    pub is_host_slot: bool,
}

/// Per-thread reservation manager state and public API.
#[derive(Debug)]
pub struct RegReservations {
    pub(crate) thread: ThreadId,
    pub(crate) opts: RegOptions,
    /// Private slot pool, `opts.num_spill_slots` long.
    pub(crate) tls: TlsBlock,
    /// Host-borrowed slot pool.
    pub(crate) host_slots: TlsBlock,
    pub(crate) stolen: Option<Gpr>,
    pub(crate) stolen_slot: Option<SlotHandle>,
    pub(crate) reg: [RegInfo; NUM_GPRS],
    pub(crate) aflags: FlagsInfo,
    pub(crate) slot_use: [Option<SlotUser>; MAX_SPILLS],
    /// Unreserved registers whose restore is still pending.
    pub(crate) pending_unreserved: usize,
    /// Reversed liveness index of the current insertion point.
    pub(crate) live_idx: usize,
    pub(crate) phase: Phase,
    pub(crate) bb_props: BlockProps,
    pub(crate) bb_has_internal_flow: bool,
    pub(crate) stats_max_slot: usize,
}

impl RegReservations {
    /// Build the per-thread state. `tls` is the private pool allocated for
    /// this configuration; `host_slots` the host's lending pool.
    pub fn new(
        thread: ThreadId,
        opts: RegOptions,
        tls: TlsBlock,
        host_slots: TlsBlock,
        stolen: Option<Gpr>,
        stolen_slot: Option<SlotHandle>,
    ) -> Self {
        Self {
            thread,
            opts,
            tls,
            host_slots,
            stolen,
            stolen_slot,
            reg: core::array::from_fn(|_| RegInfo::default()),
            aflags: FlagsInfo::default(),
            slot_use: [None; MAX_SPILLS],
            pending_unreserved: 0,
            live_idx: 0,
            phase: Phase::Outside,
            bb_props: BlockProps::empty(),
            bb_has_internal_flow: false,
            stats_max_slot: 0,
        }
    }

    /// Total slots available to this thread.
    pub(crate) fn num_slots(&self) -> usize {
        self.opts.num_spill_slots + self.host_slots.len()
    }

    /// Merge properties into the current block.
    pub fn set_block_properties(&mut self, props: BlockProps) {
        self.bb_props |= props;
    }

    /// Properties of the current block.
    pub fn block_properties(&self) -> BlockProps {
        self.bb_props
    }

    /// High-water mark of slot indices ever used on this thread.
    pub fn max_slots_used(&self) -> usize {
        self.stats_max_slot
    }

    /// Liveness of `reg` at the current insertion point; assumes live when
    /// no analysis has run.
    pub(crate) fn live_of(&self, reg: Gpr) -> LiveState {
        self.reg[reg.index()]
            .live
            .get(self.live_idx)
            .copied()
            .unwrap_or(LiveState::Live)
    }

    /// Live flag mask at the current insertion point; assumes all live
    /// when no analysis has run.
    pub(crate) fn aflags_live_cur(&self) -> Aflags {
        self.aflags
            .live
            .get(self.live_idx)
            .copied()
            .unwrap_or(Aflags::ARITH)
    }

    /// Whether `reg` is dead at the current point.
    pub fn is_register_dead(&mut self, ilist: &InsnList, at: At, reg: Gpr) -> Result<bool> {
        if self.phase != Phase::Insertion {
            self.forward_analysis(ilist, at)?;
        }
        Ok(self.live_of(reg) == LiveState::Dead)
    }

    /// Live arithmetic-flag bits at the current point.
    pub fn aflags_liveness(&mut self, ilist: &InsnList, at: At) -> Result<Aflags> {
        if self.phase != Phase::Insertion {
            self.forward_analysis(ilist, at)?;
        }
        Ok(self.aflags_live_cur())
    }

    /// Where a reserved register's app value currently lives.
    pub fn reservation_info(&self, reg: Gpr) -> ReserveInfo {
        let info = &self.reg[reg.index()];
        let slotted = !info.native && info.ever_spilled && info.slot != SLOT_NONE;
        ReserveInfo {
            reserved: info.in_use,
            holds_app_value: info.native,
            app_value_slot: slotted.then(|| self.slot_opnd(info.slot)),
            is_host_slot: slotted && info.slot >= self.opts.num_spill_slots,
        }
    }

    pub(crate) fn report_error(&self, err: Error, msg: &str) {
        if let Some(cb) = self.opts.error_callback {
            if cb(err) == ErrorHandled::Handled {
                return;
            }
        }
        panic!("register reservation state corrupted: {msg}: {err}");
    }

    /// Reserve a scratch register at `at`, spilling the app value when it
    /// is live. Preference order: already-reserved-but-idle, dead at the
    /// insertion point, least-used in the block.
    pub fn reserve_register(
        &mut self,
        ilist: &mut InsnList,
        at: At,
        allowed: Option<&GprSet>,
    ) -> Result<Gpr> {
        if self.phase != Phase::Insertion {
            self.forward_analysis(ilist, at)?;
        }
        self.reserve_internal(ilist, at, allowed, false)
    }

    /// Reserve a register known dead at `at`; fails with
    /// [`Error::NoDeadReg`] rather than spilling.
    pub fn reserve_dead_register(
        &mut self,
        ilist: &mut InsnList,
        at: At,
        allowed: Option<&GprSet>,
    ) -> Result<Gpr> {
        if self.phase != Phase::Insertion {
            self.forward_analysis(ilist, at)?;
        }
        self.reserve_internal(ilist, at, allowed, true)
            .map_err(|e| match e {
                Error::RegConflict => Error::NoDeadReg,
                other => other,
            })
    }

    pub(crate) fn reserve_internal(
        &mut self,
        ilist: &mut InsnList,
        at: At,
        allowed: Option<&GprSet>,
        only_if_no_spill: bool,
    ) -> Result<Gpr> {
        let permitted = |reg: Gpr| allowed.map_or(true, |set| set.contains(reg));

        let mut choice: Option<Gpr> = None;
        let mut slot = SLOT_NONE;
        let mut already_spilled = false;

        // First preference: a previously unreserved register not yet
        // lazily restored; reusing it avoids accumulating slots.
        if self.pending_unreserved > 0 {
            for reg in Gpr::allocatable() {
                let info = &self.reg[reg.index()];
                if !info.native
                    && !info.in_use
                    && permitted(reg)
                    && (!only_if_no_spill
                        || info.ever_spilled
                        || self.live_of(reg) == LiveState::Dead)
                {
                    slot = info.slot;
                    already_spilled = info.ever_spilled;
                    choice = Some(reg);
                    self.pending_unreserved -= 1;
                    trace!(?reg, slot, "reusing un-restored register");
                    break;
                }
            }
        }

        if choice.is_none() {
            // Look for a dead register, falling back to the least used.
            let mut best: Option<Gpr> = None;
            let mut min_uses = u32::MAX;
            for reg in Gpr::allocatable() {
                let info = &self.reg[reg.index()];
                if info.in_use || Some(reg) == self.stolen || !permitted(reg) {
                    continue;
                }
                if self.live_of(reg) == LiveState::Dead {
                    choice = Some(reg);
                    break;
                }
                if only_if_no_spill {
                    continue;
                }
                if info.app_uses < min_uses {
                    best = Some(reg);
                    min_uses = info.app_uses;
                }
            }
            if choice.is_none() {
                match best {
                    Some(reg) => choice = Some(reg),
                    None => {
                        // If the flags sit unreserved in their holder, give
                        // that up rather than fail.
                        let holder = Gpr::AFLAGS_HOLDER;
                        if !self.aflags.in_use
                            && self.reg[holder.index()].in_use
                            && self.aflags.xchg == Some(holder)
                            && permitted(holder)
                        {
                            self.move_aflags_from_reg(ilist, at, true);
                            choice = Some(holder);
                        } else {
                            return Err(Error::RegConflict);
                        }
                    }
                }
            }
        }

        let reg = choice.expect("victim selected above");
        if slot == SLOT_NONE {
            slot = self.find_free_slot(ilist, at).ok_or(Error::OutOfSlots)?;
        }

        debug_assert!(!self.reg[reg.index()].in_use, "overlapping reservations");
        self.reg[reg.index()].in_use = true;
        if !already_spilled {
            // Even if dead now, the slot is owned in case the reservation
            // outlives the dead range.
            if self.opts.conservative_spills
                || self.live_of(reg) == LiveState::Live
            {
                self.spill_reg(ilist, at, reg, slot);
                self.reg[reg.index()].ever_spilled = true;
            } else {
                trace!(?reg, slot, "dead at reservation: slot claimed, no spill");
                self.slot_use[slot] = Some(SlotUser::Reg(reg));
                self.reg[reg.index()].ever_spilled = false;
            }
        }
        self.reg[reg.index()].native = false;
        self.reg[reg.index()].xchg = None;
        self.reg[reg.index()].slot = slot;
        Ok(reg)
    }

    /// Mark `reg` idle. The actual restore is deferred: it happens at the
    /// next app read, at block end, on [`RegReservations::restore_all`],
    /// or when the register is wanted for a new reservation.
    pub fn unreserve_register(&mut self, ilist: &mut InsnList, at: At, reg: Gpr) -> Result<()> {
        if !self.reg[reg.index()].in_use {
            return Err(Error::InvalidParam);
        }
        trace!(?reg, "unreserve");
        if self.phase != Phase::Insertion {
            // No lazy restore outside the insertion phase.
            self.restore_reg_now(ilist, at, reg)?;
        } else {
            self.pending_unreserved += 1;
        }
        self.reg[reg.index()].in_use = false;
        if self.phase == Phase::Insertion
            && self.pending_unreserved > PENDING_UNRESERVED_THRESHOLD
        {
            self.flush_pending_restores(ilist, at)?;
        }
        Ok(())
    }

    /// Restore every lazily-pending unreserved register immediately,
    /// bounding slot pressure.
    fn flush_pending_restores(&mut self, ilist: &mut InsnList, at: At) -> Result<()> {
        for reg in Gpr::allocatable() {
            let info = &self.reg[reg.index()];
            if !info.in_use && !info.native && self.aflags.xchg != Some(reg) {
                self.restore_reg_now(ilist, at, reg)?;
                self.pending_unreserved = self.pending_unreserved.saturating_sub(1);
            }
        }
        Ok(())
    }

    /// Emit the restore (or just release the slot) for a register whose
    /// lazy window is over. Caller clears `in_use` when appropriate.
    pub(crate) fn restore_reg_now(
        &mut self,
        ilist: &mut InsnList,
        at: At,
        reg: Gpr,
    ) -> Result<()> {
        if self.reg[reg.index()].ever_spilled {
            if self.reg[reg.index()].xchg.is_some() {
                return Err(Error::FeatureNotAvailable);
            }
            let slot = self.reg[reg.index()].slot;
            self.restore_reg(ilist, at, reg, slot, true);
        } else {
            // Never spilled: the slot is merely claimed.
            trace!(?reg, "never spilled: releasing slot");
            self.slot_use[self.reg[reg.index()].slot] = None;
        }
        self.reg[reg.index()].native = true;
        Ok(())
    }

    /// Materialize the app value of `app_reg` into `dst_reg` at `at`
    /// without releasing anything.
    pub fn get_app_value(
        &mut self,
        ilist: &mut InsnList,
        at: At,
        app_reg: Gpr,
        dst_reg: Gpr,
    ) -> Result<()> {
        self.restore_app_value(ilist, at, app_reg, dst_reg, true)
    }

    pub(crate) fn restore_app_value(
        &mut self,
        ilist: &mut InsnList,
        at: At,
        app_reg: Gpr,
        dst_reg: Gpr,
        stateful: bool,
    ) -> Result<()> {
        if Some(app_reg) == self.stolen {
            // The host must hand us its stash; loading the stolen register
            // directly would read the host's own value.
            if dst_reg == app_reg {
                return Err(Error::InvalidParam);
            }
            let slot = self.stolen_slot.ok_or(Error::FeatureNotAvailable)?;
            ilist.insert_at(at, Insn::load_slot(dst_reg, slot));
            return Ok(());
        }
        if self.reg[app_reg.index()].native {
            if dst_reg != app_reg {
                ilist.insert_at(at, Insn::mov(Opnd::reg(dst_reg), Opnd::reg(app_reg)));
            }
            return Ok(());
        }
        if !self.reg[app_reg.index()].ever_spilled {
            return Err(Error::NoAppValue(app_reg));
        }
        if self.reg[app_reg.index()].xchg.is_some() {
            return Err(Error::FeatureNotAvailable);
        }
        if self.aflags.xchg == Some(app_reg) {
            // The holder is wanted as an app value: stop caching the flags
            // in it.
            self.move_aflags_from_reg(ilist, at, stateful);
            return Ok(());
        }
        let slot = self.reg[app_reg.index()].slot;
        if dst_reg == app_reg {
            let release = stateful && !self.reg[app_reg.index()].in_use;
            self.restore_reg(ilist, at, app_reg, slot, release);
            if release {
                self.reg[app_reg.index()].native = true;
            }
        } else {
            // Read the slot without disturbing the reservation.
            ilist.insert_at(at, Insn::load_slot(dst_reg, self.slot_opnd(slot)));
        }
        Ok(())
    }

    /// Walk all register operands of `opnd` and ensure each holds its app
    /// value at `at`. `swap` receives (and may supply) the scratch holding
    /// the stolen register's app value.
    pub fn restore_app_values(
        &mut self,
        ilist: &mut InsnList,
        at: At,
        opnd: Opnd,
        swap: &mut Option<Gpr>,
    ) -> Result<Opnd> {
        let mut opnd = opnd;
        let mut no_app_value = false;
        for reg in opnd.regs_used() {
            let mut dst = reg;
            if Some(reg) == self.stolen {
                dst = match *swap {
                    Some(scratch) => scratch,
                    None => self.reserve_register(ilist, at, None)?,
                };
                if !opnd.replace_reg(reg, dst) {
                    return Err(Error::IncompatibleState);
                }
                *swap = Some(dst);
            }
            match self.restore_app_value(ilist, at, reg, dst, true) {
                Ok(()) => {}
                Err(Error::NoAppValue(_)) => no_app_value = true,
                Err(e) => return Err(e),
            }
        }
        if no_app_value {
            return Err(Error::NoAppValue(
                opnd.regs_used().first().copied().unwrap_or(Gpr::SP),
            ));
        }
        Ok(opnd)
    }

    /// Emit a restore at `where_restore` and a matching respill at
    /// `where_respill` without mutating logical reservation state. Used
    /// around read-only clean calls duplicated across block variants.
    ///
    /// `reg` of `None` means the arithmetic flags. Returns
    /// `(restore_emitted, respill_emitted)`.
    pub fn statelessly_restore_app_value(
        &mut self,
        ilist: &mut InsnList,
        reg: Option<Gpr>,
        where_restore: At,
        where_respill: At,
    ) -> Result<(bool, bool)> {
        let restored = match reg {
            None => {
                let was_native = self.aflags.native;
                self.restore_aflags(ilist, where_restore, false)?;
                !was_native
            }
            Some(reg) => {
                if Some(reg) == self.stolen {
                    return Err(Error::InvalidParam);
                }
                match self.restore_app_value(ilist, where_restore, reg, reg, false) {
                    Ok(()) => !self.reg[reg.index()].native,
                    Err(Error::NoAppValue(_)) => false,
                    Err(e) => return Err(e),
                }
            }
        };
        // If the flags were cached in this register, the stateless restore
        // moved them to their slot; bring them back at the respill point
        // and forget the temporary.
        let mut respilled = false;
        if let Some(reg) = reg {
            if restored && self.aflags.xchg == Some(reg) {
                let slot = self.aflags.slot;
                if slot == SLOT_NONE {
                    self.report_error(Error::IncompatibleState, "aflags slot not reserved");
                    return Err(Error::IncompatibleState);
                }
                self.restore_reg(ilist, where_respill, reg, slot, true);
                self.reset_aflags_spill_slot();
                respilled = true;
            }
        }
        Ok((restored, respilled))
    }

    /// Stateless restore of the flags and every register, with respills at
    /// `where_respill`. Returns `(any_restore, any_respill)`.
    pub fn statelessly_restore_all(
        &mut self,
        ilist: &mut InsnList,
        where_restore: At,
        where_respill: At,
    ) -> Result<(bool, bool)> {
        let (mut restored_any, mut respilled_any) =
            self.statelessly_restore_app_value(ilist, None, where_restore, where_respill)?;
        for reg in Gpr::allocatable() {
            if Some(reg) == self.stolen {
                continue;
            }
            let (restored, respilled) =
                self.statelessly_restore_app_value(ilist, Some(reg), where_restore, where_respill)?;
            restored_any |= restored;
            respilled_any |= respilled;
        }
        Ok((restored_any, respilled_any))
    }

    /// Force restoration of every currently-spilled register and the
    /// flags to app values at `at`.
    pub fn restore_all(&mut self, ilist: &mut InsnList, at: At) -> Result<()> {
        self.insert_restore_all(ilist, at, true, &mut [false; NUM_GPRS])
    }

    /// Restore app values needed by the instruction at `at`: flag reads,
    /// register reads, partial or conditional writes, barrier labels, and
    /// (with `force`) everything. `restored_for_read` records in_use
    /// registers restored around a read so the write path can share their
    /// temporary spill.
    pub(crate) fn insert_restore_all(
        &mut self,
        ilist: &mut InsnList,
        at: At,
        force: bool,
        restored_for_read: &mut [bool; NUM_GPRS],
    ) -> Result<()> {
        let inst = match at {
            At::Before(r) => Some(ilist.get(r).clone()),
            At::End => None,
        };
        let aflags_live = self.aflags_live_cur();

        let inst_reads_flags = inst
            .as_ref()
            .is_some_and(|i| !i.flags_read.is_empty());
        let inst_partial_flag_write = inst
            .as_ref()
            .is_some_and(|i| !i.flags_written.is_empty() && !aflags_live.is_empty());
        let at_barrier = inst
            .as_ref()
            .is_some_and(|i| i.is_label(LabelKind::RegBarrier));
        let aflags_host_slot =
            self.aflags.slot != SLOT_NONE && self.aflags.slot >= self.opts.num_spill_slots;

        if !self.aflags.native
            && (force
                || inst_reads_flags
                || inst_partial_flag_write
                || at_barrier
                || aflags_host_slot)
        {
            trace!("lazily restoring aflags");
            self.restore_aflags(ilist, at, false)?;
            if !self.aflags.in_use {
                self.aflags.native = true;
                self.reset_aflags_spill_slot();
            }
        }

        for reg in Gpr::allocatable() {
            restored_for_read[reg.index()] = false;
            if self.reg[reg.index()].native {
                continue;
            }
            let read = inst.as_ref().is_some_and(|i| i.reads_from_reg(reg, true));
            let partial_write = inst.as_ref().is_some_and(|i| {
                i.writes_to_reg(reg) && !i.writes_to_exact_reg(reg)
            });
            let cond_write = inst
                .as_ref()
                .is_some_and(|i| i.predicated && i.writes_to_reg(reg));
            let control_flow_barrier = !self.reg[reg.index()].in_use
                && ((self.bb_has_internal_flow
                    && !self.bb_props.contains(BlockProps::IGNORE_CONTROL_FLOW))
                    || self
                        .bb_props
                        .contains(BlockProps::CONTAINS_SPANNING_CONTROL_FLOW));
            let host_slot = self.reg[reg.index()].slot >= self.opts.num_spill_slots;

            if !(force
                || read
                || at_barrier
                || partial_write
                || cond_write
                || control_flow_barrier
                || host_slot)
            {
                continue;
            }
            if !self.reg[reg.index()].in_use {
                trace!(?reg, "lazy restore");
                self.restore_reg_now(ilist, at, reg)?;
                debug_assert!(self.pending_unreserved > 0, "pending count underflow");
                self.pending_unreserved = self.pending_unreserved.saturating_sub(1);
            } else if self.aflags.xchg == Some(reg) {
                self.move_aflags_from_reg(ilist, at, true);
            } else {
                // The tool still owns the register: park its value in a
                // fresh slot, expose the app value across the app
                // instruction, then bring the tool value back.
                let Some(tmp_slot) = self.find_free_slot(ilist, at) else {
                    self.report_error(
                        Error::OutOfSlots,
                        "cannot preserve tool value around app read",
                    );
                    return Err(Error::OutOfSlots);
                };
                trace!(?reg, tmp_slot, "restoring for app read around reservation");
                self.spill_reg(ilist, at, reg, tmp_slot);
                let app_slot = self.reg[reg.index()].slot;
                self.restore_reg(ilist, at, reg, app_slot, false);
                let after = self.after_point(ilist, at);
                self.restore_reg(ilist, after, reg, tmp_slot, true);
                restored_for_read[reg.index()] = true;
                // native stays false: the reservation continues.
            }
        }
        Ok(())
    }

    /// After an app write, refresh spilled app values: the slot contents
    /// are stale once the app has produced a new value.
    pub(crate) fn insert_respill_all(
        &mut self,
        ilist: &mut InsnList,
        at: At,
        force: bool,
        restored_for_read: &[bool; NUM_GPRS],
    ) -> Result<()> {
        let inst = match at {
            At::Before(r) => Some(ilist.get(r).clone()),
            At::End => None,
        };
        let after = self.after_point(ilist, at);

        let writes_flags = inst
            .as_ref()
            .is_some_and(|i| !i.flags_written.is_empty());
        let flags_live_after = self.live_idx == 0
            || !self
                .aflags
                .live
                .get(self.live_idx - 1)
                .copied()
                .unwrap_or(Aflags::ARITH)
                .is_empty();
        if (force || writes_flags) && flags_live_after {
            if self.aflags.in_use {
                trace!("re-spilling aflags after app write");
                self.reset_aflags_spill_slot();
                self.spill_aflags(ilist, after)?;
                self.aflags.native = false;
            } else if !self.aflags.native
                || (self.aflags.slot != SLOT_NONE
                    && self.slot_use[self.aflags.slot].is_some())
                || (self.reg[Gpr::AFLAGS_HOLDER.index()].in_use
                    && self.aflags.xchg == Some(Gpr::AFLAGS_HOLDER))
            {
                trace!("giving up aflags slot after app write");
                if self.reg[Gpr::AFLAGS_HOLDER.index()].in_use
                    && self.aflags.xchg == Some(Gpr::AFLAGS_HOLDER)
                {
                    self.move_aflags_from_reg(ilist, at, true);
                }
                self.reset_aflags_spill_slot();
                self.aflags.native = true;
            }
        }

        for reg in Gpr::allocatable() {
            let written = inst
                .as_ref()
                .is_some_and(|i| i.writes_to_reg(reg));
            if self.reg[reg.index()].in_use {
                let live_after = self.opts.conservative_spills
                    || self.live_idx == 0
                    || self.reg[reg.index()]
                        .live
                        .get(self.live_idx - 1)
                        .copied()
                        .unwrap_or(LiveState::Live)
                        == LiveState::Live
                    || self.aflags.xchg == Some(reg);
                if !(force || written) || !live_after {
                    continue;
                }
                if self.aflags.xchg == Some(reg) {
                    self.move_aflags_from_reg(ilist, at, true);
                    continue;
                }
                if self.reg[reg.index()].xchg.is_some() {
                    self.report_error(Error::FeatureNotAvailable, "xchg respill");
                    continue;
                }
                trace!(?reg, "re-spilling after app write");
                let app_slot = self.reg[reg.index()].slot;
                if restored_for_read[reg.index()] {
                    // Share the temporary spill emitted by the read path;
                    // the app respill must precede the tool-value restore
                    // already sitting after the instruction.
                    let before_tool_restore = match after {
                        At::Before(r) => At::Before(
                            ilist.prev(r).expect("tool restore emitted by read path"),
                        ),
                        At::End => At::End,
                    };
                    self.spill_reg(ilist, before_tool_restore, reg, app_slot);
                    self.reg[reg.index()].ever_spilled = true;
                } else {
                    let Some(tmp_slot) = self.find_free_slot(ilist, at) else {
                        self.report_error(
                            Error::OutOfSlots,
                            "cannot preserve tool value across app write",
                        );
                        return Err(Error::OutOfSlots);
                    };
                    self.spill_reg(ilist, at, reg, tmp_slot);
                    self.spill_reg(ilist, after, reg, app_slot);
                    self.reg[reg.index()].ever_spilled = true;
                    self.restore_reg(ilist, after, reg, tmp_slot, true);
                }
            } else if !self.reg[reg.index()].native && written {
                // Unreserved and now overwritten by the app: the stale
                // slot value must never be restored.
                trace!(?reg, "dropping slot after app write");
                self.reg[reg.index()].ever_spilled = false;
                self.restore_reg_now(ilist, at, reg)?;
                self.pending_unreserved = self.pending_unreserved.saturating_sub(1);
            }
        }
        Ok(())
    }

    /// The insertion point just after the instruction at `at`.
    fn after_point(&self, ilist: &InsnList, at: At) -> At {
        match at {
            At::Before(r) => match ilist.next(r) {
                Some(next) => At::Before(next),
                None => At::End,
            },
            At::End => At::End,
        }
    }

    /// Hook for clean-call emission: restore app context before calls that
    /// read it (statelessly when the site is multipath), refresh spills
    /// after calls that write it.
    pub(crate) fn clean_call_insertion(
        &mut self,
        ilist: &mut InsnList,
        at: At,
        flags: CleanCallFlags,
    ) -> Result<()> {
        if self.phase != Phase::Insertion {
            if flags
                .intersects(CleanCallFlags::READS_APP_CONTEXT | CleanCallFlags::WRITES_APP_CONTEXT)
            {
                return Err(Error::FeatureNotAvailable);
            }
            return Ok(());
        }
        let mut restored_for_read = [false; NUM_GPRS];
        if flags.contains(CleanCallFlags::READS_APP_CONTEXT) {
            if flags.contains(CleanCallFlags::MULTIPATH) {
                let after = self.after_point(ilist, at);
                self.statelessly_restore_all(ilist, at, after)?;
            } else {
                self.insert_restore_all(ilist, at, true, &mut restored_for_read)?;
            }
        }
        if flags.contains(CleanCallFlags::WRITES_APP_CONTEXT) {
            if flags.contains(CleanCallFlags::MULTIPATH) {
                return Err(Error::FeatureNotAvailable);
            }
            self.insert_respill_all(ilist, at, true, &restored_for_read)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
