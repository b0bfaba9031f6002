//! Fault-time machine-state reconstruction.
//!
//! When a fault lands inside translated code, registers may be sitting in
//! spill slots and the flags may be riding in the holder register. Before
//! the host surfaces the machine context, every such displacement must be
//! undone. Two algorithms exist, selected on whether the host can present
//! the reconstructed block IL:
//!
//! - Without IL: scan the decoded cache contents from block start to the
//!   fault point; each recognized spill opens a "register R lives in slot
//!   S" region and each restore closes it. Whatever is open at the fault
//!   is patched from the slots.
//! - With IL: walk the block backward from the last instruction to the
//!   fault (inclusive). The most recent restore of each register marks the
//!   end of a spill region; if its matching spill is also behind the
//!   fault, the region has not opened yet and no patch is needed.
//!
//! Spill-shaped sequences on app instructions are skipped when the IL's
//! meta markers are available; the cache scan cannot tell them apart.

use crate::{
    consts::{NUM_GPRS, SLOT_NONE},
    host::{fault::RestoreStateInfo, HostRuntime},
    machine::{
        flags::Aflags,
        insn::{Insn, Op},
        reg::Gpr,
    },
};

use super::RegReservations;

use itertools::Itertools;
use tracing::trace;

fn is_aflags_capture(inst: &Insn) -> bool {
    matches!(inst.op, Op::FlagsToReg)
}

fn is_aflags_deposit(inst: &Insn) -> bool {
    matches!(inst.op, Op::RegToFlags)
}

/// Reconstruct app machine state in `info.raw_mcontext`.
///
/// Free function form of [`RegReservations::restore_state`], convenient
/// for host glue that only holds the per-thread state immutably.
pub fn reconstruct_machine_state(
    pt: &RegReservations,
    host: &dyn HostRuntime,
    info: &mut RestoreStateInfo<'_>,
) -> bool {
    pt.restore_state(host, info)
}

impl RegReservations {
    /// Handle the host's state-restoration event. Returns true when the
    /// context is consistent (possibly after patching).
    pub fn restore_state(
        &self,
        host: &dyn HostRuntime,
        info: &mut RestoreStateInfo<'_>,
    ) -> bool {
        if info.ilist.is_some() && info.fault_ref.is_some() {
            self.restore_state_with_ilist(host, info)
        } else {
            self.restore_state_without_ilist(host, info)
        }
    }

    /// Forward cache scan; best effort when no IL is available.
    fn restore_state_without_ilist(
        &self,
        host: &dyn HostRuntime,
        info: &mut RestoreStateInfo<'_>,
    ) -> bool {
        let mut spilled_to = [SLOT_NONE; NUM_GPRS];
        let mut aflags_slot = SLOT_NONE;
        let mut aflags_reg: Option<Gpr> = None;

        for inst in info.cache_prefix {
            if let Some((is_spill, reg, slot)) = self.recognize_spill_or_restore(inst) {
                if is_spill {
                    if Some(reg) == aflags_reg {
                        // The captured flags move from the holder into a
                        // slot.
                        aflags_slot = slot;
                        aflags_reg = None;
                    } else if spilled_to[reg.index()] != SLOT_NONE
                        && spilled_to[reg.index()] != slot
                    {
                        // Already spilled elsewhere: this second spill
                        // parks a tool value, not the app value.
                        trace!(?reg, slot, "ignoring tool spill");
                    } else {
                        spilled_to[reg.index()] = slot;
                    }
                } else if aflags_slot == slot {
                    aflags_slot = SLOT_NONE;
                    aflags_reg = Some(reg);
                } else if spilled_to[reg.index()] == slot {
                    spilled_to[reg.index()] = SLOT_NONE;
                } else {
                    trace!(?reg, slot, "ignoring unmatched restore");
                }
            } else if is_aflags_capture(inst) {
                aflags_reg = inst.dsts.first().and_then(|o| o.as_reg());
            } else if aflags_reg.is_some()
                && is_aflags_deposit(inst)
                && inst.srcs.first().and_then(|o| o.as_reg()) == aflags_reg
            {
                aflags_reg = None;
            } else if let Some(holder) = aflags_reg {
                // A foreign write to the holder invalidates the tracking.
                if inst.writes_to_reg(holder) {
                    aflags_reg = None;
                }
            }
        }

        self.patch_mcontext(host, info, &spilled_to, aflags_slot, aflags_reg);
        true
    }

    /// Backward IL walk; robust against tool spills and multi-phase use.
    fn restore_state_with_ilist(
        &self,
        host: &dyn HostRuntime,
        info: &mut RestoreStateInfo<'_>,
    ) -> bool {
        let ilist = info.ilist.expect("caller checked");
        let fault_ref = info.fault_ref.expect("caller checked");

        let mut spill_slot = [SLOT_NONE; NUM_GPRS];
        let mut aflags_slot = SLOT_NONE;
        let mut aflags_spill_reg: Option<Gpr> = None;
        let mut tool_aflags_spill_reg: Option<Gpr> = None;

        // The walk includes the faulting instruction: it has not retired.
        for (at, inst) in ilist.iter_back_from(ilist.last()) {
            if !inst.app {
                if let Some((is_spill, reg, slot)) = self.recognize_spill_or_restore(inst) {
                    if !is_spill {
                        if Some(reg) == aflags_spill_reg {
                            debug_assert!(
                                aflags_slot == SLOT_NONE,
                                "no spill found for last aflags restore"
                            );
                            aflags_slot = slot;
                            aflags_spill_reg = None;
                        } else if Some(reg) == tool_aflags_spill_reg {
                            tool_aflags_spill_reg = None;
                            trace!(?reg, slot, "ignoring tool aflags restore");
                        } else if spill_slot[reg.index()] == SLOT_NONE {
                            spill_slot[reg.index()] = slot;
                        } else {
                            trace!(?reg, slot, "ignoring extra restore");
                        }
                    } else if aflags_slot == slot {
                        // The matching spill is behind the fault: the
                        // region has not opened, nothing to patch.
                        aflags_slot = SLOT_NONE;
                        aflags_spill_reg = Some(reg);
                    } else if spill_slot[reg.index()] == slot {
                        spill_slot[reg.index()] = SLOT_NONE;
                    } else {
                        trace!(?reg, slot, "ignoring unmatched spill");
                    }
                } else if is_aflags_deposit(inst) {
                    let src = inst.srcs.first().and_then(|o| o.as_reg());
                    if aflags_spill_reg.is_none() && aflags_slot == SLOT_NONE {
                        aflags_spill_reg = src;
                    } else {
                        tool_aflags_spill_reg = src;
                    }
                } else if is_aflags_capture(inst) {
                    let dst = inst.dsts.first().and_then(|o| o.as_reg());
                    if aflags_spill_reg == dst {
                        aflags_spill_reg = None;
                    } else if tool_aflags_spill_reg == dst {
                        tool_aflags_spill_reg = None;
                    }
                } else {
                    if let Some(holder) = aflags_spill_reg {
                        if inst.writes_to_reg(holder) {
                            aflags_spill_reg = None;
                        }
                    }
                    if let Some(holder) = tool_aflags_spill_reg {
                        if inst.writes_to_reg(holder) {
                            tool_aflags_spill_reg = None;
                        }
                    }
                }
            }
            if at == fault_ref {
                break;
            }
        }

        self.patch_mcontext(host, info, &spill_slot, aflags_slot, aflags_spill_reg);
        true
    }

    fn patch_mcontext(
        &self,
        host: &dyn HostRuntime,
        info: &mut RestoreStateInfo<'_>,
        spilled_to: &[usize; NUM_GPRS],
        aflags_slot: usize,
        aflags_reg: Option<Gpr>,
    ) {
        if aflags_slot != SLOT_NONE || aflags_reg.is_some() {
            let word = match aflags_reg {
                Some(holder) => info.raw_mcontext.reg(holder),
                None => self.spilled_value(host, aflags_slot),
            };
            let restored = Aflags::from_word(word);
            trace!(?restored, "patching aflags from spill");
            info.raw_mcontext.aflags = restored;
        }
        for (reg, &slot) in Gpr::all().zip_eq(spilled_to.iter()) {
            if slot != SLOT_NONE {
                let val = self.spilled_value(host, slot);
                trace!(?reg, slot, val, "patching register from slot");
                info.raw_mcontext.set_reg(reg, val);
            }
        }
    }
}
