//! Abnormal-unwind detection and sentinel fault translation.
//!
//! A wrapped function can be exited without its return site ever running:
//! exceptions, longjmp, and tail transfers all move the stack pointer past
//! recorded frames. Entry interception compares the current stack pointer
//! against every recorded frame and delivers the abnormal post (a `None`
//! context, no return value) for frames the stack has grown past. The
//! host's exception hook does the same eagerly for wraps that opted in.
//!
//! With return-address replacement in use, the app stack and machine
//! context may momentarily expose the sentinel pc; every app-visible
//! context is translated back before the host observes it.

use crate::{
    consts::{RETADDR_SENTINEL, WORD_SIZE},
    context::ThreadId,
    host::{fault::RestoreStateInfo, HostRuntime},
    machine::mcontext::Mcontext,
};

use super::{WrapEngine, WrapThread};

use tracing::{debug, trace};

impl WrapEngine {
    /// Pop every frame the stack has abnormally grown past, invoking its
    /// post callbacks with no return value. Runs on each wrap entry.
    pub(crate) fn check_unwind(
        &self,
        host: &mut dyn HostRuntime,
        thread: ThreadId,
        pt: &mut WrapThread,
        mc: &mut Mcontext,
    ) {
        while pt
            .frames
            .last()
            .map_or(false, |frame| frame.app_sp < mc.sp())
        {
            debug!(sp = mc.sp(), "abnormal exit detected on wrap entry");
            self.after_callee(host, thread, pt, None, mc, true, false);
        }
    }

    /// Host exception/signal hook: deliver abnormal posts for every live
    /// frame that opted into unwind notification. Frames whose wraps did
    /// not opt in stay recorded and fall to the stack-pointer heuristics.
    pub fn on_exception(
        &self,
        host: &mut dyn HostRuntime,
        thread: ThreadId,
        pt: &mut WrapThread,
        mc: &mut Mcontext,
    ) {
        trace!(levels = pt.frames.len(), "exception unwind sweep");
        // Each frame is visited exactly once; frames whose wraps did not
        // opt in survive the sweep and are put back afterwards.
        let mut kept = Vec::new();
        while !pt.frames.is_empty() {
            let before = pt.frames.len();
            self.after_callee(host, thread, pt, None, mc, true, true);
            if pt.frames.len() == before {
                if let Some(frame) = pt.frames.pop() {
                    kept.push(frame);
                }
            }
        }
        pt.overflow = 0;
        for frame in kept.into_iter().rev() {
            pt.frames.push(frame);
        }
    }

    /// Fault-translation hook: rewrite the sentinel pc and any sentinel
    /// stack words back to real return addresses before the host surfaces
    /// the context.
    pub fn restore_state(
        &self,
        host: &mut dyn HostRuntime,
        pt: &WrapThread,
        info: &mut RestoreStateInfo<'_>,
    ) -> bool {
        // Innermost frame owning the sentinel wins for the pc itself.
        if info.raw_mcontext.pc == RETADDR_SENTINEL {
            if let Some(real) = pt
                .frames
                .iter()
                .rev()
                .find(|f| f.replaced_retaddr)
                .and_then(|f| f.retaddr)
            {
                debug!(real, "translating sentinel pc");
                info.raw_mcontext.pc = real;
            }
        }
        if !info.restore_memory {
            return true;
        }
        // Scan each live frame's stack span for sentinel words and rewrite
        // them in place.
        let sp_now = info.raw_mcontext.sp();
        for frame in pt.frames.iter() {
            if !frame.replaced_retaddr {
                continue;
            }
            let Some(real) = frame.retaddr else { continue };
            let mut addr = sp_now;
            while addr <= frame.app_sp {
                if host.read_app_word(addr) == Some(RETADDR_SENTINEL) {
                    trace!(addr, real, "rewriting sentinel stack word");
                    let _ = host.write_app_word(addr, real);
                }
                addr = addr.wrapping_add(WORD_SIZE as u64);
            }
        }
        true
    }
}
