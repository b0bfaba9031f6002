//! Function wrapping end to end: interception, nesting, skip, return
//! address replacement, abnormal unwinds, and replacement routing.

mod common;

use bridle::{
    consts::RETADDR_SENTINEL,
    emulator::Emulator,
    machine::{
        insn::Insn,
        opnd::{MemRef, Opnd},
        reg::{Gpr, Width},
    },
    prelude::*,
    wrap::{PostCallback, PreCallback},
};
use common::{boot, run, setup, EXIT_PC, TID};

use std::sync::{Arc, Mutex};

fn r(idx: u8) -> Gpr {
    Gpr::new(idx).unwrap()
}

type Trace = Arc<Mutex<Vec<String>>>;

fn pre_recording(trace: &Trace, name: &'static str) -> PreCallback {
    let trace = trace.clone();
    Arc::new(move |_ctx, _data| {
        trace.lock().unwrap().push(format!("pre{name}"));
    })
}

fn post_recording(trace: &Trace, name: &'static str) -> PostCallback {
    let trace = trace.clone();
    Arc::new(move |ctx, _data| {
        let tag = if ctx.is_some() { "" } else { "!" };
        trace.lock().unwrap().push(format!("post{name}{tag}"));
    })
}

/// A caller at 0x3000 invoking `func`, storing the return register to
/// 0x8000 afterwards.
fn caller_program(em: &mut Emulator, func: u64) {
    em.map_zero(0x2ff0, 0x10);
    em.map_zero(0x8000, 0x40);
    em.load_program([
        Insn::call(func).app(0x3000).encoded_len(5),
        Insn::store(MemRef::absolute(0x8000, Width::W8), Opnd::reg(r(0))).app(0x3005),
        Insn::ret().app(0x3009),
    ]);
}

#[test]
fn skip_call_bypasses_the_body() {
    let (mut em, mut core) = setup(CoreOptions::default());
    caller_program(&mut em, 0x4000);
    em.load_program([
        Insn::mov(Opnd::reg(r(0)), Opnd::imm(7)).app(0x4000),
        Insn::ret().app(0x4004),
    ]);
    let pre: PreCallback = Arc::new(|ctx, _data| {
        ctx.skip_call(42, 0).unwrap();
    });
    core.wrap.wrap(&mut em, 0x4000, Some(pre), None, 0).unwrap();

    let mut mc = boot(&mut em, &mut core);
    mc.pc = 0x3000;
    run(&mut em, &mut core, &mut mc);

    // Control returned to the fall-through with the forced return value;
    // the body never ran.
    assert_eq!(mc.reg(r(0)), 42);
    assert_eq!(em.read_app_word(0x8000), Some(42));
    assert_eq!(mc.pc, EXIT_PC);
}

#[test]
fn two_wraps_nest_lifo_on_one_function() {
    let (mut em, mut core) = setup(CoreOptions::default());
    caller_program(&mut em, 0x4000);
    em.load_program([
        Insn::mov(Opnd::reg(r(9)), Opnd::imm(1)).app(0x4000),
        Insn::ret().app(0x4004),
    ]);
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));
    core.wrap
        .wrap(
            &mut em,
            0x4000,
            Some(pre_recording(&trace, "A")),
            Some(post_recording(&trace, "A")),
            0,
        )
        .unwrap();
    core.wrap
        .wrap(
            &mut em,
            0x4000,
            Some(pre_recording(&trace, "B")),
            Some(post_recording(&trace, "B")),
            0,
        )
        .unwrap();

    let mut mc = boot(&mut em, &mut core);
    mc.pc = 0x3000;
    run(&mut em, &mut core, &mut mc);

    assert_eq!(
        *trace.lock().unwrap(),
        vec!["preB", "preA", "postA", "postB"]
    );
    assert_eq!(mc.reg(r(9)), 1);
}

#[test]
fn nested_wrapped_functions_fire_posts_lifo() {
    let (mut em, mut core) = setup(CoreOptions::default());
    caller_program(&mut em, 0x4000);
    em.load_program([
        // A calls B calls C.
        Insn::call(0x4100).app(0x4000).encoded_len(5),
        Insn::ret().app(0x4005),
        Insn::call(0x4200).app(0x4100).encoded_len(5),
        Insn::ret().app(0x4105),
        Insn::mov(Opnd::reg(r(0)), Opnd::imm(7)).app(0x4200),
        Insn::ret().app(0x4204),
    ]);
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));
    for (func, name) in [(0x4000u64, "A"), (0x4100, "B"), (0x4200, "C")] {
        core.wrap
            .wrap(
                &mut em,
                func,
                Some(pre_recording(&trace, name)),
                Some(post_recording(&trace, name)),
                0,
            )
            .unwrap();
    }

    let mut mc = boot(&mut em, &mut core);
    mc.pc = 0x3000;
    run(&mut em, &mut core, &mut mc);

    assert_eq!(
        *trace.lock().unwrap(),
        vec!["preA", "preB", "preC", "postC", "postB", "postA"]
    );
}

#[test]
fn replace_retaddr_uses_sentinel_and_returns() {
    let (mut em, mut core) = setup(CoreOptions::default());
    em.map_zero(0x8000, 0x40);
    em.load_program([
        Insn::call(0x4100).app(0x3010).encoded_len(5),
        Insn::store(MemRef::absolute(0x8000, Width::W8), Opnd::reg(r(4))).app(0x3015),
        Insn::ret().app(0x3019),
        Insn::mov(Opnd::reg(r(4)), Opnd::imm(9)).app(0x4100),
        Insn::ret().app(0x4104),
    ]);
    let seen_sentinel = Arc::new(Mutex::new(None));
    let post_count = Arc::new(Mutex::new(0usize));
    let pre: PreCallback = {
        let seen = seen_sentinel.clone();
        Arc::new(move |ctx, _data| {
            let sp = ctx.mcontext().sp();
            *seen.lock().unwrap() = ctx.host().read_app_word(sp);
        })
    };
    let post: PostCallback = {
        let count = post_count.clone();
        Arc::new(move |ctx, _data| {
            assert!(ctx.is_some());
            *count.lock().unwrap() += 1;
        })
    };
    core.wrap
        .wrap_ex(
            &mut em,
            0x4100,
            Some(pre),
            Some(post),
            0,
            WrapFlags::REPLACE_RETADDR,
            CallConv::default(),
        )
        .unwrap();

    let mut mc = boot(&mut em, &mut core);
    mc.pc = 0x3010;
    run(&mut em, &mut core, &mut mc);

    // Inside the body the in-memory return address was the sentinel, yet
    // execution came back to the real fall-through exactly once.
    assert_eq!(*seen_sentinel.lock().unwrap(), Some(RETADDR_SENTINEL));
    assert_eq!(*post_count.lock().unwrap(), 1);
    assert_eq!(em.read_app_word(0x8000), Some(9));
    assert_eq!(mc.pc, EXIT_PC);
}

#[test]
fn sentinel_is_invisible_on_fault_translation() {
    let (mut em, mut core) = setup(CoreOptions::default());
    em.map_zero(0x8000, 0x40);
    em.load_program([
        Insn::call(0x4100).app(0x3010).encoded_len(5),
        Insn::ret().app(0x3015),
        // The body leaves through a jump, with the frame still live.
        Insn::store(MemRef::absolute(0x8008, Width::W8), Opnd::reg(r(1))).app(0x4100),
        Insn::jmp(0xEEEE_0000).app(0x4104),
    ]);
    let pre: PreCallback = Arc::new(|_ctx, _data| {});
    let post: PostCallback = Arc::new(|_ctx, _data| {});
    core.wrap
        .wrap_ex(
            &mut em,
            0x4100,
            Some(pre),
            Some(post),
            0,
            WrapFlags::REPLACE_RETADDR,
            CallConv::default(),
        )
        .unwrap();

    let mut mc = boot(&mut em, &mut core);
    mc.pc = 0x3010;
    run(&mut em, &mut core, &mut mc);

    // Mid-body: the stack top holds the sentinel.
    let frame_sp = mc.sp();
    assert_eq!(em.read_app_word(frame_sp), Some(RETADDR_SENTINEL));

    // Deliver a fault whose context exposes both the sentinel pc and the
    // sentinel stack word; both must translate to the real address.
    mc.pc = RETADDR_SENTINEL;
    let mut info = RestoreStateInfo {
        raw_mcontext: &mut mc,
        cache_prefix: &[],
        ilist: None,
        fault_ref: None,
        fragment_start: 0x4100,
        restore_memory: true,
    };
    assert!(core.handle_restore_state(&mut em, TID, &mut info));
    assert_eq!(mc.pc, 0x3015);
    assert_eq!(em.read_app_word(frame_sp), Some(0x3015));
}

#[test]
fn abnormal_unwind_delivers_posts_lifo_with_no_retval() {
    let (mut em, mut core) = setup(CoreOptions::default());
    em.map_zero(0x2ff0, 0x10);
    em.load_program([
        // Caller digs some extra stack before calling F1.
        Insn::add_noflags(Opnd::reg(Gpr::SP), Opnd::imm(-16)).app(0x3000),
        Insn::call(0x4000).app(0x3004).encoded_len(5),
        Insn::ret().app(0x3009),
        // F1 calls F2.
        Insn::call(0x4100).app(0x4000).encoded_len(5),
        Insn::ret().app(0x4005),
        // F2 longjmps: stack pointer from r12, then a jump far away.
        Insn::mov(Opnd::reg(Gpr::SP), Opnd::reg(r(12))).app(0x4100),
        Insn::jmp(0x3100).app(0x4104),
        // The longjmp landing pad calls another wrapped function.
        Insn::call(0x4300).app(0x3100).encoded_len(5),
        Insn::ret().app(0x3105),
        Insn::mov(Opnd::reg(r(0)), Opnd::imm(1)).app(0x4300),
        Insn::ret().app(0x4304),
    ]);
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));
    for (func, name) in [(0x4000u64, "F1"), (0x4100, "F2")] {
        core.wrap
            .wrap(
                &mut em,
                func,
                Some(pre_recording(&trace, name)),
                Some(post_recording(&trace, name)),
                0,
            )
            .unwrap();
    }
    core.wrap
        .wrap(&mut em, 0x4300, Some(pre_recording(&trace, "F3")), None, 0)
        .unwrap();

    let mut mc = boot(&mut em, &mut core);
    mc.set_reg(r(12), mc.sp());
    mc.pc = 0x3000;
    run(&mut em, &mut core, &mut mc);

    // The two bypassed frames get their posts with the null indicator, in
    // LIFO order, before F3's pre runs.
    assert_eq!(
        *trace.lock().unwrap(),
        vec!["preF1", "preF2", "postF2!", "postF1!", "preF3"]
    );
}

#[test]
fn replace_routes_execution_to_the_replacement() {
    let (mut em, mut core) = setup(CoreOptions::default());
    caller_program(&mut em, 0x4000);
    em.load_program([
        Insn::mov(Opnd::reg(r(0)), Opnd::imm(7)).app(0x4000),
        Insn::ret().app(0x4004),
        Insn::mov(Opnd::reg(r(0)), Opnd::imm(99)).app(0x5000),
        Insn::ret().app(0x5004),
    ]);
    core.replace(&mut em, 0x4000, Some(0x5000)).unwrap();

    let mut mc = boot(&mut em, &mut core);
    mc.pc = 0x3000;
    run(&mut em, &mut core, &mut mc);

    assert_eq!(em.read_app_word(0x8000), Some(99));
}

#[test]
fn lazy_unwrap_collects_in_batches() {
    let (mut em, mut core) = setup(CoreOptions::default());
    caller_program(&mut em, 0x4000);
    em.load_program([
        Insn::mov(Opnd::reg(r(0)), Opnd::imm(7)).app(0x4000),
        Insn::ret().app(0x4004),
    ]);
    // A pile of wraps on addresses that never run, all tombstoned.
    let doomed: Vec<PreCallback> = (0..20)
        .map(|_| -> PreCallback { Arc::new(|_ctx, _data| {}) })
        .collect();
    for (i, pre) in doomed.iter().enumerate() {
        let func = 0x9000 + i as u64 * 0x10;
        core.wrap
            .wrap(&mut em, func, Some(pre.clone()), None, 0)
            .unwrap();
        core.wrap.unwrap(func, Some(pre.clone()), None).unwrap();
    }
    let flushes_before = core.wrap.stats().flush_count;

    // One live wrap with a post drives the collection pass.
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));
    core.wrap
        .wrap(
            &mut em,
            0x4000,
            Some(pre_recording(&trace, "G")),
            Some(post_recording(&trace, "G")),
            0,
        )
        .unwrap();
    let mut mc = boot(&mut em, &mut core);
    mc.pc = 0x3000;
    run(&mut em, &mut core, &mut mc);

    assert_eq!(*trace.lock().unwrap(), vec!["preG", "postG"]);
    // The tombstoned functions were physically removed and flushed.
    let flushed = core.wrap.stats().flush_count - flushes_before;
    assert!(flushed >= 20, "expected batched flushes, got {flushed}");
    for i in 0..20 {
        assert!(!core.wrap.is_wrapped(0x9000 + i * 0x10));
    }
}

#[test]
fn invert_control_defers_wrap_insertion_to_the_tool() {
    let opts = CoreOptions {
        global_flags: GlobalFlags::INVERT_CONTROL,
        ..Default::default()
    };
    let (mut em, mut core) = setup(opts);
    caller_program(&mut em, 0x4000);
    em.load_program([
        Insn::mov(Opnd::reg(r(0)), Opnd::imm(7)).app(0x4000),
        Insn::ret().app(0x4004),
    ]);
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));
    core.wrap
        .wrap(&mut em, 0x4000, Some(pre_recording(&trace, "X")), None, 0)
        .unwrap();

    // Without the tool invoking the pass, nothing fires.
    let mut mc = boot(&mut em, &mut core);
    mc.pc = 0x3000;
    run(&mut em, &mut core, &mut mc);
    assert!(trace.lock().unwrap().is_empty());

    // With the tool driving it explicitly, the wrap fires.
    em.clear_cache();
    core.register_insert_hook(
        Priority::TOOL_DEFAULT,
        Box::new(|ctx| ctx.invoke_wrap_insertion()),
    );
    let mut mc = Mcontext::default();
    mc.set_sp(common::STACK_TOP - 64);
    em.write_app_word(mc.sp(), EXIT_PC);
    mc.pc = 0x3000;
    run(&mut em, &mut core, &mut mc);
    assert_eq!(*trace.lock().unwrap(), vec!["preX"]);
}
