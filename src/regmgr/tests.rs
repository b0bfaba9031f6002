use super::*;
use crate::{
    context::ThreadId,
    emulator::Emulator,
    host::fault::RestoreStateInfo,
    host::HostRuntime,
    machine::{insn::Op, mcontext::Mcontext, opnd::MemRef, reg::Width},
    regmgr::liveness::LiveState,
};

const TID: ThreadId = ThreadId(7);

fn r(idx: u8) -> Gpr {
    Gpr::new(idx).unwrap()
}

fn fresh_with(opts: RegOptions) -> RegReservations {
    RegReservations::new(
        TID,
        opts,
        TlsBlock::new(0x100, opts.num_spill_slots),
        TlsBlock::new(0x400, crate::consts::HOST_SPILL_SLOTS),
        None,
        None,
    )
}

fn fresh() -> RegReservations {
    fresh_with(RegOptions::default())
}

/// A block whose first instruction reads every low register, keeping them
/// live, and ends in a return.
fn all_live_block() -> InsnList {
    let mut insns = vec![];
    for i in 0..8 {
        insns.push(
            Insn::store(
                MemRef::base_disp(Gpr::SP, -8 * (i as i64 + 1), Width::W8),
                Opnd::reg(r(i)),
            )
            .app(0x1000 + 4 * i as u64),
        );
    }
    insns.push(Insn::ret().app(0x1020));
    InsnList::from_insns(insns)
}

fn ops_of(ilist: &InsnList) -> Vec<Op> {
    ilist.iter().map(|(_, i)| i.op.clone()).collect()
}

#[test]
fn reserve_live_register_spills_and_unreserve_restores() {
    let mut pt = fresh();
    let mut ilist = all_live_block();
    let first = ilist.first().unwrap();

    let before = ilist.len();
    let reg = pt
        .reserve_register(&mut ilist, At::Before(first), None)
        .unwrap();
    // Outside the insertion phase a forward scan ran; the victim was live
    // so a spill was emitted.
    assert!(pt.reg[reg.index()].in_use);
    assert!(pt.reg[reg.index()].ever_spilled);
    assert_eq!(ilist.len(), before + 1);

    pt.unreserve_register(&mut ilist, At::Before(first), reg)
        .unwrap();
    // Outside insertion there is no lazy window: the restore is immediate.
    assert!(!pt.reg[reg.index()].in_use);
    assert!(pt.reg[reg.index()].native);
    assert_eq!(ilist.len(), before + 2);
    assert!(pt.slot_use.iter().all(|s| s.is_none()));
}

#[test]
fn reserve_prefers_dead_register_without_spill() {
    let mut pt = fresh();
    // r3 is overwritten before any read: dead at the block head.
    let mut ilist = InsnList::from_insns([
        Insn::mov(Opnd::reg(r(3)), Opnd::imm(0)).app(0x2000),
        Insn::ret().app(0x2004),
    ]);
    let first = ilist.first().unwrap();
    let before = ilist.len();
    let reg = pt
        .reserve_register(&mut ilist, At::Before(first), None)
        .unwrap();
    assert_eq!(reg, r(3));
    assert!(!pt.reg[reg.index()].ever_spilled);
    // The slot is claimed for later but nothing was emitted.
    assert_eq!(ilist.len(), before);
    assert!(pt.slot_use[pt.reg[reg.index()].slot].is_some());
}

#[test]
fn reserve_dead_register_fails_when_all_live() {
    let mut pt = fresh();
    let mut ilist = all_live_block();
    let first = ilist.first().unwrap();
    // r0..r7 are live; r8..r14 are untouched, hence Unknown -> Live.
    assert_eq!(
        pt.reserve_dead_register(&mut ilist, At::Before(first), None),
        Err(Error::NoDeadReg)
    );
}

#[test]
fn allowed_set_restricts_choice() {
    let mut pt = fresh();
    let mut ilist = all_live_block();
    let first = ilist.first().unwrap();
    let mut allowed = GprSet::EMPTY;
    allowed.insert(r(9));
    let reg = pt
        .reserve_register(&mut ilist, At::Before(first), Some(&allowed))
        .unwrap();
    assert_eq!(reg, r(9));
}

#[test]
fn stolen_register_is_never_chosen() {
    let mut em = Emulator::new();
    em.steal_register(r(9));
    let mut pt = RegReservations::new(
        TID,
        RegOptions::default(),
        TlsBlock::new(0x100, 4),
        TlsBlock::new(0x400, crate::consts::HOST_SPILL_SLOTS),
        em.stolen_reg(),
        em.stolen_reg_slot(),
    );
    let mut ilist = all_live_block();
    let first = ilist.first().unwrap();
    let mut allowed = GprSet::EMPTY;
    allowed.insert(r(9));
    assert_eq!(
        pt.reserve_register(&mut ilist, At::Before(first), Some(&allowed)),
        Err(Error::RegConflict)
    );
}

#[test]
fn slots_exhaust() {
    let mut opts = RegOptions::default();
    opts.num_spill_slots = 1;
    let mut pt = fresh_with(opts);
    let mut ilist = all_live_block();
    let first = ilist.first().unwrap();
    // One private + the host slots; every reservation of a live register
    // takes one slot.
    let available = pt.num_slots();
    let mut taken = Vec::new();
    for _ in 0..available {
        taken.push(
            pt.reserve_register(&mut ilist, At::Before(first), None)
                .unwrap(),
        );
    }
    assert_eq!(
        pt.reserve_register(&mut ilist, At::Before(first), None),
        Err(Error::OutOfSlots)
    );
}

#[test]
fn get_app_value_from_native_moves() {
    let mut pt = fresh();
    let mut ilist = all_live_block();
    let first = ilist.first().unwrap();
    pt.get_app_value(&mut ilist, At::Before(first), r(2), r(4))
        .unwrap();
    let ops = ops_of(&ilist);
    assert!(matches!(ops[0], Op::Mov));
}

#[test]
fn get_app_value_from_slot_leaves_reservation() {
    let mut pt = fresh();
    let mut ilist = all_live_block();
    let first = ilist.first().unwrap();
    let reg = pt
        .reserve_register(&mut ilist, At::Before(first), None)
        .unwrap();
    let before = ilist.len();
    pt.get_app_value(&mut ilist, At::Before(first), reg, r(10))
        .unwrap();
    // A load from the slot, not a release.
    assert_eq!(ilist.len(), before + 1);
    assert!(pt.reg[reg.index()].in_use);
    assert!(!pt.reg[reg.index()].native);
}

#[test]
fn unreserve_unowned_register_is_invalid() {
    let mut pt = fresh();
    let mut ilist = all_live_block();
    let first = ilist.first().unwrap();
    assert_eq!(
        pt.unreserve_register(&mut ilist, At::Before(first), r(5)),
        Err(Error::InvalidParam)
    );
}

#[test]
fn dead_aflags_reserve_emits_nothing() {
    let mut pt = fresh();
    // The add overwrites every flag before anything reads them.
    let mut ilist = InsnList::from_insns([
        Insn::add(Opnd::reg(r(1)), Opnd::imm(1)).app(0x3000),
        Insn::ret().app(0x3004),
    ]);
    let first = ilist.first().unwrap();
    let before = ilist.len();
    pt.reserve_aflags(&mut ilist, At::Before(first)).unwrap();
    assert_eq!(ilist.len(), before);
    assert!(pt.aflags.in_use);
    assert!(pt.aflags.native);
    pt.unreserve_aflags(&mut ilist, At::Before(first)).unwrap();
    assert_eq!(ilist.len(), before);
}

#[test]
fn live_aflags_reserve_spills_through_holder() {
    let mut pt = fresh();
    // The branch reads the flags: they are live at the head.
    let mut ilist = InsnList::from_insns([
        Insn::nop().app(0x4000),
        Insn::bcc(0x5000).app(0x4004),
    ]);
    let first = ilist.first().unwrap();
    pt.reserve_aflags(&mut ilist, At::Before(first)).unwrap();
    assert!(pt.aflags.in_use);
    assert!(!pt.aflags.native);
    // Flags ride in the holder register, which is now reserved.
    assert_eq!(pt.aflags.xchg, Some(Gpr::AFLAGS_HOLDER));
    assert!(pt.reg[Gpr::AFLAGS_HOLDER.index()].in_use);
    let ops = ops_of(&ilist);
    assert!(ops.iter().any(|op| matches!(op, Op::FlagsToReg)));
    // The holder's own app value was parked first.
    assert!(matches!(ops[0], Op::StoreSlot));
}

#[test]
fn double_aflags_reserve_is_in_use() {
    let mut pt = fresh();
    let mut ilist = InsnList::from_insns([
        Insn::nop().app(0x4000),
        Insn::bcc(0x5000).app(0x4004),
    ]);
    let first = ilist.first().unwrap();
    pt.reserve_aflags(&mut ilist, At::Before(first)).unwrap();
    assert_eq!(
        pt.reserve_aflags(&mut ilist, At::Before(first)),
        Err(Error::InUse)
    );
}

#[test]
fn holder_available_after_aflags_unreserve() {
    let mut pt = fresh();
    let mut ilist = InsnList::from_insns([
        Insn::nop().app(0x4000),
        Insn::bcc(0x5000).app(0x4004),
    ]);
    let first = ilist.first().unwrap();
    pt.reserve_aflags(&mut ilist, At::Before(first)).unwrap();
    pt.unreserve_aflags(&mut ilist, At::Before(first)).unwrap();
    // Outside the insertion phase the unreserve restored the flags and
    // freed the holder; it must be reservable again.
    let mut allowed = GprSet::EMPTY;
    allowed.insert(Gpr::AFLAGS_HOLDER);
    let got = pt
        .reserve_register(&mut ilist, At::Before(first), Some(&allowed))
        .unwrap();
    assert_eq!(got, Gpr::AFLAGS_HOLDER);
    assert_eq!(pt.aflags.xchg, None);
}

#[test]
fn reservation_info_reports_slot() {
    let mut pt = fresh();
    let mut ilist = all_live_block();
    let first = ilist.first().unwrap();
    let reg = pt
        .reserve_register(&mut ilist, At::Before(first), None)
        .unwrap();
    let info = pt.reservation_info(reg);
    assert!(info.reserved);
    assert!(!info.holds_app_value);
    assert!(info.app_value_slot.is_some());
    assert!(!info.is_host_slot);
}

#[test]
fn restore_state_without_ilist_patches_registers() {
    let mut em = Emulator::new();
    let mut pt = fresh();
    let mut ilist = all_live_block();
    let first = ilist.first().unwrap();
    let reg = pt
        .reserve_register(&mut ilist, At::Before(first), None)
        .unwrap();
    let slot = pt.reg[reg.index()].slot;

    // Pretend the spill executed: the app value sits in the slot while
    // the register holds tool garbage.
    em.write_tls(TID, pt.slot_opnd(slot), 0xFEED_F00D);
    let mut mc = Mcontext::default();
    mc.set_reg(reg, 0xBAD);

    // The decoded cache prefix is exactly the emitted spill.
    let prefix: Vec<Insn> = ilist
        .iter()
        .filter(|(_, i)| !i.app)
        .map(|(_, i)| i.clone())
        .collect();
    let mut info = RestoreStateInfo {
        raw_mcontext: &mut mc,
        cache_prefix: &prefix,
        ilist: None,
        fault_ref: None,
        fragment_start: 0x1000,
        restore_memory: false,
    };
    assert!(pt.restore_state(&em, &mut info));
    assert_eq!(mc.reg(reg), 0xFEED_F00D);
}

#[test]
fn restore_state_skips_closed_spill_region() {
    let mut em = Emulator::new();
    let mut pt = fresh();
    let mut ilist = all_live_block();
    let first = ilist.first().unwrap();
    let reg = pt
        .reserve_register(&mut ilist, At::Before(first), None)
        .unwrap();
    pt.unreserve_register(&mut ilist, At::Before(first), reg)
        .unwrap();
    // Spill and restore both precede the fault: nothing to patch.
    em.write_tls(TID, TlsBlock::new(0x100, 4).slot(0), 0xFEED_F00D);
    let mut mc = Mcontext::default();
    mc.set_reg(reg, 0x1234);
    let prefix: Vec<Insn> = ilist
        .iter()
        .filter(|(_, i)| !i.app)
        .map(|(_, i)| i.clone())
        .collect();
    let mut info = RestoreStateInfo {
        raw_mcontext: &mut mc,
        cache_prefix: &prefix,
        ilist: None,
        fault_ref: None,
        fragment_start: 0x1000,
        restore_memory: false,
    };
    assert!(pt.restore_state(&em, &mut info));
    assert_eq!(mc.reg(reg), 0x1234);
}

#[test]
fn restore_state_with_ilist_ignores_app_lookalikes() {
    let em = Emulator::new();
    let pt = fresh();
    // An app instruction that happens to look like one of our restores
    // must not fool the walker when meta markers are available.
    let slot_handle = pt.slot_opnd(0);
    let mut ilist = InsnList::new();
    let fake = ilist.push_back(Insn::load_slot(r(4), slot_handle).app(0x6000));
    ilist.push_back(Insn::ret().app(0x6004));
    let mut mc = Mcontext::default();
    mc.set_reg(r(4), 0x5555);
    let mut info = RestoreStateInfo {
        raw_mcontext: &mut mc,
        cache_prefix: &[],
        ilist: Some(&ilist),
        fault_ref: Some(fake),
        fragment_start: 0x6000,
        restore_memory: false,
    };
    assert!(pt.restore_state(&em, &mut info));
    assert_eq!(mc.reg(r(4)), 0x5555);
}

#[test]
fn forward_liveness_state_matches_block() {
    let mut pt = fresh();
    let ilist = InsnList::from_insns([
        Insn::mov(Opnd::reg(r(1)), Opnd::imm(1)).app(0x100),
        Insn::ret().app(0x104),
    ]);
    pt.forward_analysis(&ilist, At::Before(ilist.first().unwrap()))
        .unwrap();
    assert_eq!(pt.reg[r(1).index()].live[0], LiveState::Dead);
    assert_eq!(pt.live_idx, 0);
}
