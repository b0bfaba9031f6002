#![allow(dead_code)]

//! Shared harness for the integration suites: an emulator host, a core,
//! and a bootstrapped thread with a mapped stack.

use bridle::{emulator::Emulator, prelude::*};

pub const TID: ThreadId = ThreadId(1);
pub const STACK_BASE: u64 = 0x7_E000;
pub const STACK_TOP: u64 = 0x7_F000;
/// Unmapped; reaching it ends the run.
pub const EXIT_PC: u64 = 0xDEAD_0000;

pub fn setup(opts: CoreOptions) -> (Emulator, Core) {
    let mut em = Emulator::new();
    let core = Core::new(&mut em, opts).expect("core construction");
    (em, core)
}

/// Init the thread and build a machine context sitting on a fresh stack
/// whose top word returns to [`EXIT_PC`].
pub fn boot(em: &mut Emulator, core: &mut Core) -> Mcontext {
    core.thread_init(em, TID).expect("thread init");
    em.map_zero(STACK_BASE, (STACK_TOP - STACK_BASE) as usize + 64);
    let mut mc = Mcontext::default();
    mc.set_sp(STACK_TOP - 64);
    em.write_app_word(mc.sp(), EXIT_PC);
    mc
}

/// Run until the program exits through an unmapped pc.
pub fn run(em: &mut Emulator, core: &mut Core, mc: &mut Mcontext) {
    em.run(core, TID, mc, 10_000).expect("execution");
}
