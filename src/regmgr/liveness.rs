//! Register and flags liveness over one translated block.
//!
//! The analysis pass walks the block backward once; indices into the
//! per-register vectors are therefore reversed, with the last instruction
//! at index zero. The insertion pass decrements a cursor as it walks
//! forward so lookups stay O(1). Outside the insertion phase a single
//! forward scan from the requested point stands in, with `Unknown`
//! remainders treated as live.

use crate::{
    error::Result,
    host::phases::Phase,
    machine::{
        flags::Aflags,
        ilist::{At, InsnList},
        insn::Insn,
        opnd::Opnd,
        reg::Gpr,
    },
};

use super::RegReservations;

use tracing::trace;

/// Liveness of one register at one point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveState {
    /// The app value will be read before being overwritten.
    Live,
    /// The full register is overwritten before any read.
    Dead,
    /// Not determined; treated as live. Only produced outside the
    /// insertion phase.
    Unknown,
}

impl RegReservations {
    /// Whole-block backward liveness, run in the analysis phase.
    ///
    /// For each GPR, propagate live-ness unless the instruction writes the
    /// full register without reading it; control transfers terminate the
    /// walk as live-on-exit. For the flags the vector holds the mask of
    /// still-live bits. Also counts per-register app uses, with memory
    /// operands counted double.
    pub fn analyze_block(&mut self, ilist: &InsnList) {
        let len = ilist.len();
        for reg in Gpr::all() {
            let info = &mut self.reg[reg.index()];
            info.app_uses = 0;
            info.live.clear();
            info.live.resize(len, LiveState::Live);
        }
        self.aflags.live.clear();
        self.aflags.live.resize(len, Aflags::ARITH);
        self.bb_has_internal_flow = false;

        let mut index = 0usize;
        // Both meta and app instructions are considered: app-to-app passes
        // occasionally leave meta code behind.
        for (_, inst) in ilist.iter_back_from(ilist.last()) {
            let xfer = inst.is_cti();

            if !self.bb_has_internal_flow && xfer && Self::targets_inside_block(ilist, inst) {
                // Lazy restores are unsound when a branch can re-enter the
                // middle of the block.
                self.bb_has_internal_flow = true;
                trace!("intra-block control flow: lazy restores disabled");
            }

            for reg in Gpr::all() {
                let value = if inst.reads_from_reg(reg, true) {
                    LiveState::Live
                } else if inst.writes_to_exact_reg(reg) {
                    LiveState::Dead
                } else if xfer {
                    LiveState::Live
                } else if index > 0 {
                    self.reg[reg.index()].live[index - 1]
                } else {
                    LiveState::Live
                };
                self.reg[reg.index()].live[index] = value;
            }

            self.aflags.live[index] = if xfer {
                // Assume the flags are read before written on exit.
                Aflags::ARITH
            } else {
                let carried = if index > 0 {
                    self.aflags.live[index - 1]
                } else {
                    Aflags::ARITH
                };
                let read = inst.flags_read;
                let written_not_read = inst.flags_written & !read;
                (carried | read) & !written_not_read
            };

            if inst.app {
                self.count_app_uses(inst);
            }
            index += 1;
        }
        self.live_idx = index;
    }

    /// Per-instruction cursor update for the insertion phase; must be
    /// called once per instruction present at phase start, in order.
    pub(crate) fn insertion_step(&mut self) {
        debug_assert!(self.live_idx > 0, "insertion cursor underflow");
        self.live_idx = self.live_idx.saturating_sub(1);
    }

    /// Single forward scan from `at` to the next control transfer, used
    /// whenever a reservation is requested outside the insertion phase.
    /// First-read marks live, first-whole-write marks dead, anything still
    /// unknown at the transfer is live.
    pub(crate) fn forward_analysis(&mut self, ilist: &InsnList, at: At) -> Result<()> {
        for reg in Gpr::all() {
            let info = &mut self.reg[reg.index()];
            info.app_uses = 0;
            info.live.clear();
            info.live.push(LiveState::Unknown);
        }
        self.aflags.live.clear();

        let start = match at {
            At::Before(r) => Some(r),
            At::End => None,
        };
        let mut aflags_cur = Aflags::empty();
        let mut aflags_written = Aflags::empty();
        for (_, inst) in ilist.iter_from(start) {
            if inst.is_cti() {
                break;
            }
            for reg in Gpr::all() {
                if self.reg[reg.index()].live[0] != LiveState::Unknown {
                    continue;
                }
                if inst.reads_from_reg(reg, true) {
                    self.reg[reg.index()].live[0] = LiveState::Live;
                } else if inst.writes_to_exact_reg(reg) {
                    self.reg[reg.index()].live[0] = LiveState::Dead;
                }
            }
            // A flag read counts only if nothing wrote it first; a write
            // counts only if nothing read it first.
            aflags_cur |= inst.flags_read & !aflags_written;
            aflags_written |= inst.flags_written & !aflags_cur;

            if inst.app {
                self.count_app_uses(inst);
            }
        }
        for reg in Gpr::all() {
            if self.reg[reg.index()].live[0] == LiveState::Unknown {
                self.reg[reg.index()].live[0] = LiveState::Live;
            }
        }
        // Unwritten remainders are assumed read later.
        self.aflags.live.push((Aflags::ARITH & !aflags_written) | aflags_cur);
        self.live_idx = 0;
        Ok(())
    }

    /// Enter a translation phase; the core's pipeline driver owns this.
    pub(crate) fn begin_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    /// Block finalization at the end of the cleanup phase. Properties are
    /// preserved until here so later passes can still inspect them.
    pub(crate) fn end_block(&mut self) {
        self.bb_props = super::BlockProps::empty();
        self.phase = Phase::Outside;
    }

    fn count_app_uses(&mut self, inst: &Insn) {
        for opnd in inst.dsts.iter().chain(inst.srcs.iter()) {
            for reg in opnd.regs_used() {
                let info = &mut self.reg[reg.index()];
                info.app_uses = info.app_uses.saturating_add(1);
                // Tools instrument memory operands heavily; count their
                // addressing registers double.
                if matches!(opnd, Opnd::Mem(_)) {
                    info.app_uses = info.app_uses.saturating_add(1);
                }
            }
        }
    }

    fn targets_inside_block(ilist: &InsnList, inst: &Insn) -> bool {
        let target = inst.srcs.first().and_then(|o| match o {
            Opnd::Imm(v, _) => u64::try_from(*v).ok(),
            _ => None,
        });
        let Some(target) = target else {
            return false;
        };
        ilist
            .iter()
            .any(|(_, i)| i.app && i.pc == Some(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consts::MAX_PRIVATE_SLOTS,
        context::ThreadId,
        host::tls::TlsBlock,
        machine::opnd::MemRef,
        machine::reg::Width,
        regmgr::RegOptions,
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

    fn r(idx: u8) -> Gpr {
        Gpr::new(idx).unwrap()
    }

    #[test]
    fn dead_until_first_read() {
        // r1 = r2 + r2 ; load r3, [r1] ; ret
        let ilist = InsnList::from_insns([
            Insn::mov(Opnd::reg(r(1)), Opnd::reg(r(2))).app(0x100),
            Insn::load(r(3), MemRef::base_disp(r(1), 0, Width::W8)).app(0x104),
            Insn::ret().app(0x108),
        ]);
        let mut pt = fresh();
        pt.analyze_block(&ilist);
        // Reversed indices: entry 2 is the first instruction.
        assert_eq!(pt.reg[r(1).index()].live[2], LiveState::Dead);
        assert_eq!(pt.reg[r(2).index()].live[2], LiveState::Live);
        // r3 written at index 1 by a full-width load and never read.
        assert_eq!(pt.reg[r(3).index()].live[1], LiveState::Dead);
        // At the ret everything is live-on-exit.
        assert_eq!(pt.reg[r(3).index()].live[0], LiveState::Live);
    }

    #[test]
    fn subregister_write_stays_live() {
        let ilist = InsnList::from_insns([
            Insn::mov(Opnd::Reg(r(4), Width::W2), Opnd::Imm(7, Width::W2)).app(0x200),
            Insn::nop().app(0x204),
        ]);
        let mut pt = fresh();
        pt.analyze_block(&ilist);
        // A two-byte write preserves the rest, so the register is not dead.
        assert_ne!(pt.reg[r(4).index()].live[1], LiveState::Dead);
    }

    #[test]
    fn flags_dead_before_full_overwrite() {
        use crate::machine::flags::Aflags;
        let ilist = InsnList::from_insns([
            Insn::nop().app(0x300),
            Insn::add(Opnd::reg(r(1)), Opnd::imm(1)).app(0x304),
            Insn::bcc(0x400).app(0x308),
        ]);
        let mut pt = fresh();
        pt.analyze_block(&ilist);
        // The branch reads the flags, so they are live at index 0.
        assert_eq!(pt.aflags.live[0], Aflags::ARITH);
        // The add rewrites every flag first, so nothing is live before it.
        assert_eq!(pt.aflags.live[1], Aflags::empty());
        assert_eq!(pt.aflags.live[2], Aflags::empty());
    }

    #[test]
    fn app_uses_double_for_memory() {
        let ilist = InsnList::from_insns([
            Insn::load(r(3), MemRef::base_disp(r(1), 0, Width::W8)).app(0x400),
            Insn::mov(Opnd::reg(r(2)), Opnd::reg(r(1))).app(0x404),
        ]);
        let mut pt = fresh();
        pt.analyze_block(&ilist);
        // r1: once doubled as address, once as plain source.
        assert_eq!(pt.reg[r(1).index()].app_uses, 3);
        assert_eq!(pt.reg[r(2).index()].app_uses, 1);
    }

    #[test]
    fn forward_analysis_marks_unknown_live() {
        let ilist = InsnList::from_insns([
            Insn::mov(Opnd::reg(r(1)), Opnd::reg(r(2))).app(0x500),
            Insn::ret().app(0x504),
        ]);
        let mut pt = fresh();
        pt.forward_analysis(&ilist, At::Before(ilist.first().unwrap()))
            .unwrap();
        assert_eq!(pt.reg[r(1).index()].live[0], LiveState::Dead);
        assert_eq!(pt.reg[r(2).index()].live[0], LiveState::Live);
        // r5 is untouched before the ret: unknown, promoted to live.
        assert_eq!(pt.reg[r(5).index()].live[0], LiveState::Live);
    }

    #[test]
    fn internal_branch_disables_lazy_restores() {
        let ilist = InsnList::from_insns([
            Insn::nop().app(0x600),
            Insn::bcc(0x600).app(0x604),
            Insn::ret().app(0x608),
        ]);
        let mut pt = fresh();
        pt.analyze_block(&ilist);
        assert!(pt.bb_has_internal_flow);
    }
}
