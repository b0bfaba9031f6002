//! Trace-buffer behavior end to end: fast-ring wraparound, guard-page
//! recovery, and thread-exit flushing.

mod common;

use bridle::{
    emulator::Emulator,
    machine::{
        insn::Insn,
        opnd::Opnd,
        reg::{Gpr, Width},
    },
    prelude::*,
    tracebuf::FullCallback,
};
use common::{boot, run, setup, TID};

use std::sync::{Arc, Mutex};

fn r(idx: u8) -> Gpr {
    Gpr::new(idx).unwrap()
}

/// A one-nop block; the record emission rides on the nop.
fn record_program(em: &mut Emulator) {
    em.load_program([Insn::nop().app(0x1000), Insn::ret().app(0x1004)]);
}

/// Register an insertion pass emitting one `stride`-byte record per block
/// execution, value taken from app `r3`.
fn emit_record_pass(core: &mut Core, buf: TraceBuf, stride: u16) {
    core.register_insert_hook(
        Priority::TOOL_DEFAULT,
        Box::new(move |ctx| {
            if ctx.ilist.get(ctx.instr).pc != Some(0x1000) {
                return Ok(());
            }
            let at = ctx.before();
            let ptr = ctx.regs.reserve_register(ctx.ilist, at, None)?;
            let scratch = ctx.regs.reserve_register(ctx.ilist, at, None)?;
            let width = Width::from_bytes(stride as usize).unwrap();
            let dead = ctx.regs.aflags_liveness(ctx.ilist, at)?.is_empty();
            buf.insert_load_buf_ptr(ctx.ilist, at, ptr);
            buf.insert_buf_store(
                ctx.ilist,
                at,
                ptr,
                scratch,
                Opnd::Reg(r(3), width),
                width,
                0,
            )?;
            buf.insert_update_buf_ptr(ctx.ilist, at, ptr, scratch, stride, dead);
            ctx.regs.unreserve_register(ctx.ilist, at, scratch)?;
            ctx.regs.unreserve_register(ctx.ilist, at, ptr)
        }),
    );
}

fn run_records(
    em: &mut Emulator,
    core: &mut Core,
    mc: &mut Mcontext,
    start: usize,
    count: usize,
) {
    for i in start..start + count {
        mc.set_reg(r(3), 0xB000 + i as u64);
        mc.pc = 0x1000;
        mc.set_sp(common::STACK_TOP - 64);
        em.write_app_word(mc.sp(), common::EXIT_PC);
        run(em, core, mc);
    }
}

#[test]
fn fast_ring_wraps_with_subword_arithmetic() {
    let (mut em, mut core) = setup(CoreOptions::default());
    record_program(&mut em);
    let buf = core
        .bufs
        .create_circular_buffer(&mut em, FAST_RING_SIZE)
        .unwrap();
    assert_eq!(buf.kind(), TraceBufKind::CircularFast);
    emit_record_pass(&mut core, buf.clone(), 2);

    let mut mc = boot(&mut em, &mut core);
    let base = core
        .bufs
        .buffer_base(&core.thread(TID).unwrap().bufs, &buf)
        .unwrap();
    assert_eq!(base % FAST_RING_SIZE as u64, 0, "ring base must be aligned");

    run_records(&mut em, &mut core, &mut mc, 0, 40_000);

    // 40000 two-byte strides wrap once: 80000 mod 65536.
    let ptr = core.bufs.buffer_ptr(&em, TID, &buf);
    assert_eq!(ptr, base + (80_000 % 65_536));
    // Nothing leaked outside the aligned window.
    for offs in 0..16u64 {
        assert_eq!(em.read_app_word(base + FAST_RING_SIZE as u64 + offs * 8), Some(0));
    }
}

#[test]
fn trace_buffer_full_callback_fires_exactly_once_at_the_boundary() {
    let (mut em, mut core) = setup(CoreOptions::default());
    record_program(&mut em);
    let calls: Arc<Mutex<Vec<(u64, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let cb: FullCallback = {
        let calls = calls.clone();
        Arc::new(move |_host, base, used| {
            calls.lock().unwrap().push((base, used));
        })
    };
    let buf = core.bufs.create_trace_buffer(&mut em, 4096, cb).unwrap();
    assert_eq!(buf.kind(), TraceBufKind::Trace);
    emit_record_pass(&mut core, buf.clone(), 8);

    let mut mc = boot(&mut em, &mut core);
    let base = core
        .bufs
        .buffer_base(&core.thread(TID).unwrap().bufs, &buf)
        .unwrap();

    run_records(&mut em, &mut core, &mut mc, 0, 512);
    assert!(calls.lock().unwrap().is_empty());
    assert_eq!(core.bufs.buffer_ptr(&em, TID, &buf), base + 4096);

    // Record 513 overflows into the guard page: exactly one callback,
    // then the store lands at offset 0.
    run_records(&mut em, &mut core, &mut mc, 512, 1);
    assert_eq!(*calls.lock().unwrap(), vec![(base, 4096)]);
    assert_eq!(em.read_app_word(base), Some(0xB000 + 512));
    assert_eq!(core.bufs.buffer_ptr(&em, TID, &buf), base + 8);

    // Record 514 lands at offset 8.
    run_records(&mut em, &mut core, &mut mc, 513, 1);
    assert_eq!(calls.lock().unwrap().len(), 1);
    assert_eq!(em.read_app_word(base + 8), Some(0xB000 + 513));
}

#[test]
fn plain_circular_buffer_wraps_silently() {
    let (mut em, mut core) = setup(CoreOptions::default());
    record_program(&mut em);
    let buf = core.bufs.create_circular_buffer(&mut em, 8192).unwrap();
    assert_eq!(buf.kind(), TraceBufKind::Circular);
    emit_record_pass(&mut core, buf.clone(), 8);

    let mut mc = boot(&mut em, &mut core);
    let base = core
        .bufs
        .buffer_base(&core.thread(TID).unwrap().bufs, &buf)
        .unwrap();

    run_records(&mut em, &mut core, &mut mc, 0, 1025);
    assert_eq!(core.bufs.buffer_ptr(&em, TID, &buf), base + 8);
    assert_eq!(em.read_app_word(base), Some(0xB000 + 1024));
}

#[test]
fn thread_exit_flushes_the_remainder() {
    let (mut em, mut core) = setup(CoreOptions::default());
    record_program(&mut em);
    let calls: Arc<Mutex<Vec<(u64, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let cb: FullCallback = {
        let calls = calls.clone();
        Arc::new(move |_host, base, used| {
            calls.lock().unwrap().push((base, used));
        })
    };
    let buf = core.bufs.create_trace_buffer(&mut em, 4096, cb).unwrap();
    emit_record_pass(&mut core, buf.clone(), 8);

    let mut mc = boot(&mut em, &mut core);
    let base = core
        .bufs
        .buffer_base(&core.thread(TID).unwrap().bufs, &buf)
        .unwrap();
    run_records(&mut em, &mut core, &mut mc, 0, 3);

    core.thread_exit(&mut em, TID).unwrap();
    assert_eq!(*calls.lock().unwrap(), vec![(base, 24)]);
}

#[test]
fn trace_buffer_smaller_than_a_page_is_rejected() {
    let (mut em, mut core) = setup(CoreOptions::default());
    let cb: FullCallback = Arc::new(|_host, _base, _used| {});
    assert_eq!(
        core.bufs.create_trace_buffer(&mut em, 512, cb).err(),
        Some(Error::InvalidParam)
    );
}

#[test]
fn buffer_pointer_can_be_repositioned() {
    let (mut em, mut core) = setup(CoreOptions::default());
    record_program(&mut em);
    let buf = core.bufs.create_circular_buffer(&mut em, 8192).unwrap();
    emit_record_pass(&mut core, buf.clone(), 8);
    let mut mc = boot(&mut em, &mut core);
    let base = core
        .bufs
        .buffer_base(&core.thread(TID).unwrap().bufs, &buf)
        .unwrap();

    run_records(&mut em, &mut core, &mut mc, 0, 2);
    assert_eq!(core.bufs.buffer_ptr(&em, TID, &buf), base + 16);
    core.bufs.set_buffer_ptr(&mut em, TID, &buf, base);
    run_records(&mut em, &mut core, &mut mc, 2, 1);
    assert_eq!(em.read_app_word(base), Some(0xB000 + 2));
    assert_eq!(core.bufs.buffer_size(&buf), 8192);
}
