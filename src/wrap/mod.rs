//! Function wrap/replace engine.
//!
//! Tools register pre and post callbacks against arbitrary application
//! functions. Entry interception rides the translation pipeline: blocks
//! starting at a wrapped pc get a clean call to the entry helper, and
//! every known post-call site gets a clean call to the return helper.
//! Nesting, tail calls, abnormal unwinds, and return-address replacement
//! are handled per thread on a bounded frame stack.
//!
//! Registration is append-LIFO: the most recent wrap runs outermost (its
//! pre first, its post last). Unregistration is lazy: entries are
//! tombstoned and physically removed in batches from a post callback, so
//! iteration never observes a freed entry.

pub mod callconv;
pub mod context;
pub mod post_call;
pub mod replace;
pub mod unwind;

pub use callconv::{ArgLocation, CallConv};
pub use context::{WrapCtx, WrapWhere};
pub use post_call::PostCallNotify;

use crate::{
    consts::{DISABLED_COUNT_FLUSH_THRESHOLD, MAX_WRAP_NESTING, RETADDR_SENTINEL, WORD_SIZE},
    context::ThreadId,
    runtime::GlobalFlags,
    error::{Error, Result},
    host::{tls::SlotHandle, HostRuntime},
    machine::{
        ilist::{At, InsnList, InsnRef},
        insn::{Callee, CleanCallFlags, Insn, Op},
        mcontext::Mcontext,
        opnd::Opnd,
        reg::Gpr,
    },
};

use bitflags::bitflags;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tracing::{debug, trace, warn};

/// Pre-call callback: wrap context plus the per-frame user-data slot.
pub type PreCallback = Arc<dyn Fn(&mut WrapCtx<'_>, &mut u64) + Send + Sync>;

/// Post-call callback. `None` context means the frame was exited
/// abnormally and no return value is available.
pub type PostCallback = Arc<dyn Fn(Option<&mut WrapCtx<'_>>, &mut u64) + Send + Sync>;

bitflags! {
    /// Per-wrap behavior flags.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct WrapFlags: u8 {
        /// Deliver the abnormal post callback on any unwind, not only on
        /// stack-pointer detection.
        const UNWIND_ON_EXCEPTION = 1 << 0;
        /// Replace the in-memory return address with the sentinel stub
        /// instead of instrumenting the return site.
        const REPLACE_RETADDR = 1 << 1;
    }
}

/// Aggregate counters, exposed for tools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WrapStats {
    /// Code flushes performed on behalf of wrapping.
    pub flush_count: u64,
}

#[derive(Clone)]
struct WrapEntry {
    pre: Option<PreCallback>,
    post: Option<PostCallback>,
    enabled: bool,
    flags: WrapFlags,
    callconv: CallConv,
    user_data: u64,
}

impl WrapEntry {
    fn same_pair(&self, pre: &Option<PreCallback>, post: &Option<PostCallback>) -> bool {
        fn same<T: ?Sized>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
            match (a, b) {
                (None, None) => true,
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            }
        }
        same(&self.pre, pre) && same(&self.post, post)
    }
}

/// One entered wrapped function on a thread's stack.
struct Frame {
    func: u64,
    app_sp: u64,
    /// Real return address; with REPLACE_RETADDR this is what the
    /// sentinel stands for.
    retaddr: Option<u64>,
    /// Whether the in-memory return address was replaced by the sentinel.
    replaced_retaddr: bool,
    skip: bool,
    user_data: Vec<u64>,
    /// Identity of the entries whose pre ran, for post matching.
    pairs: Vec<(Option<PreCallback>, Option<PostCallback>, bool)>,
}

/// Per-thread wrap state.
pub struct WrapThread {
    frames: Vec<Frame>,
    /// Frames beyond [`MAX_WRAP_NESTING`], tracked only as a depth.
    overflow: usize,
    /// Restrict post processing to frame cleanup (multipath blocks).
    cleanup_only: bool,
}

impl WrapThread {
    /// Fresh state for a new thread.
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            overflow: 0,
            cleanup_only: false,
        }
    }

    /// Current wrap nesting depth.
    pub fn wrap_level(&self) -> usize {
        self.frames.len() + self.overflow
    }
}

impl Default for WrapThread {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide wrap engine: registration tables, post-call sites, and the
/// replace engine.
pub struct WrapEngine {
    global: GlobalFlags,
    wrap_table: Mutex<HashMap<u64, Vec<WrapEntry>>>,
    disabled_count: Mutex<usize>,
    pub(crate) post_call: post_call::PostCallTable,
    pub(crate) replace: replace::ReplaceTables,
    /// TLS slot through which the sentinel stub reaches the real return
    /// address.
    retaddr_slot: SlotHandle,
    stats_flushes: AtomicU64,
}

impl WrapEngine {
    /// Build the engine. `retaddr_slot` must be a raw TLS slot dedicated
    /// to the sentinel return stub.
    pub fn new(global: GlobalFlags, retaddr_slot: SlotHandle) -> Self {
        Self {
            global,
            wrap_table: Mutex::new(HashMap::new()),
            disabled_count: Mutex::new(0),
            post_call: post_call::PostCallTable::new(),
            replace: replace::ReplaceTables::new(),
            retaddr_slot,
            stats_flushes: AtomicU64::new(0),
        }
    }

    /// Register a wrap with default flags and calling convention.
    pub fn wrap(
        &self,
        host: &mut dyn HostRuntime,
        func: u64,
        pre: Option<PreCallback>,
        post: Option<PostCallback>,
        user_data: u64,
    ) -> Result<()> {
        self.wrap_ex(
            host,
            func,
            pre,
            post,
            user_data,
            WrapFlags::empty(),
            CallConv::default(),
        )
    }

    /// Register a wrap. At least one of `pre`/`post` must be present.
    ///
    /// Re-registering an identical (pre, post) pair re-enables a
    /// tombstoned entry in place.
    pub fn wrap_ex(
        &self,
        host: &mut dyn HostRuntime,
        func: u64,
        pre: Option<PreCallback>,
        post: Option<PostCallback>,
        user_data: u64,
        flags: WrapFlags,
        callconv: CallConv,
    ) -> Result<()> {
        if pre.is_none() && post.is_none() {
            return Err(Error::InvalidParam);
        }
        if flags.contains(WrapFlags::REPLACE_RETADDR) && post.is_none() {
            // The sentinel exists only to reach a post callback.
            return Err(Error::InvalidParam);
        }
        let mut flush_needed = false;
        {
            let mut table = self.wrap_table.lock().expect("wrap table poisoned");
            let entries = table.entry(func).or_default();
            if let Some(existing) = entries.iter_mut().find(|e| e.same_pair(&pre, &post)) {
                if existing.enabled {
                    return Err(Error::AlreadyExists);
                }
                trace!(func, "re-enabling tombstoned wrap");
                existing.enabled = true;
                existing.user_data = user_data;
                existing.flags = flags;
                existing.callconv = callconv;
                return Ok(());
            }
            if self.global.contains(GlobalFlags::NO_FRILLS)
                && entries.iter().any(|e| e.enabled)
            {
                return Err(Error::AlreadyExists);
            }
            flush_needed = entries.iter().all(|e| !e.enabled);
            // Prepend: the most recent wrap runs outermost.
            entries.insert(
                0,
                WrapEntry {
                    pre,
                    post,
                    enabled: true,
                    flags,
                    callconv,
                    user_data,
                },
            );
        }
        if flush_needed {
            // Existing translations of the function lack the entry hook.
            debug!(func, "first wrap: flushing stale translations");
            host.flush_region(func, 1);
            self.stats_flushes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Tombstone a wrap registration. Physical removal and code flush are
    /// batched until enough tombstones accumulate.
    pub fn unwrap(
        &self,
        func: u64,
        pre: Option<PreCallback>,
        post: Option<PostCallback>,
    ) -> Result<()> {
        let mut table = self.wrap_table.lock().expect("wrap table poisoned");
        let entries = table.get_mut(&func).ok_or(Error::InvalidParam)?;
        let entry = entries
            .iter_mut()
            .find(|e| e.enabled && e.same_pair(&pre, &post))
            .ok_or(Error::InvalidParam)?;
        entry.enabled = false;
        drop(table);
        *self.disabled_count.lock().expect("count poisoned") += 1;
        trace!(func, "wrap tombstoned");
        Ok(())
    }

    /// Whether any enabled wrap exists for `func`.
    pub fn is_wrapped(&self, func: u64) -> bool {
        self.wrap_table
            .lock()
            .expect("wrap table poisoned")
            .get(&func)
            .map_or(false, |entries| entries.iter().any(|e| e.enabled))
    }

    /// Whether `pc` is a known, instrumented post-call site.
    pub fn is_post_wrap(&self, pc: u64) -> bool {
        self.post_call.is_instrumented(pc)
    }

    /// Externally mark `pc` as a post-call site (tool persistence).
    pub fn mark_as_post_call(&self, host: &dyn HostRuntime, pc: u64) -> Result<()> {
        if pc == 0 {
            return Err(Error::InvalidParam);
        }
        self.post_call.add(host, pc, true);
        Ok(())
    }

    /// Register a callback for newly discovered post-call sites.
    pub fn register_post_call_notify(&self, cb: PostCallNotify) {
        self.post_call.register_notify(cb);
    }

    /// Remove a post-call notify callback.
    pub fn unregister_post_call_notify(&self, cb: PostCallNotify) -> bool {
        self.post_call.unregister_notify(cb)
    }

    /// Aggregate counters.
    pub fn stats(&self) -> WrapStats {
        WrapStats {
            flush_count: self.stats_flushes.load(Ordering::Relaxed),
        }
    }

    fn entries_snapshot(&self, func: u64) -> Vec<WrapEntry> {
        self.wrap_table
            .lock()
            .expect("wrap table poisoned")
            .get(&func)
            .cloned()
            .unwrap_or_default()
    }

    /// Insertion-phase hook for one application instruction.
    pub(crate) fn insertion(
        &self,
        host: &mut dyn HostRuntime,
        regs: &mut crate::regmgr::RegReservations,
        ilist: &mut InsnList,
        at: InsnRef,
    ) {
        let Some(pc) = ilist.get(at).pc else { return };
        // FAST_CLEANCALLS elides non-parameter scratch saves on the host
        // side; the app-context contract is unchanged from ours.
        let call_flags = CleanCallFlags::READS_APP_CONTEXT | CleanCallFlags::WRITES_APP_CONTEXT;

        if self.is_wrapped(pc) {
            trace!(pc, "inserting wrap entry hook");
            let call_ref = ilist.insert_at(
                At::Before(at),
                Insn::clean_call(
                    Callee::WrapEntry,
                    [Opnd::imm(pc as i64), Opnd::reg(Gpr::SP)],
                    call_flags,
                ),
            );
            if let Err(e) = regs.clean_call_insertion(ilist, At::Before(call_ref), call_flags) {
                warn!(?e, "clean-call context restore failed at wrap entry");
            }
        }

        if self.post_call.lookup_for_instru(host, pc) {
            trace!(pc, "inserting post-call hook");
            let call_ref = ilist.insert_at(
                At::Before(at),
                Insn::clean_call(
                    Callee::WrapReturn,
                    [Opnd::imm(pc as i64), Opnd::reg(Gpr::SP)],
                    call_flags,
                ),
            );
            if let Err(e) = regs.clean_call_insertion(ilist, At::Before(call_ref), call_flags) {
                warn!(?e, "clean-call context restore failed at post-call site");
            }
        }

        // A direct call to a wrapped function with a post callback tells
        // us the fall-through is a post-call site; remember it so future
        // translations of that block carry the hook without a flush.
        let inst = ilist.get(at);
        if matches!(inst.op, Op::Call) {
            let target = inst.srcs.first().and_then(|o| match o {
                Opnd::Imm(v, _) => u64::try_from(*v).ok(),
                _ => None,
            });
            if let Some(target) = target {
                if self.has_enabled_post(target) {
                    let fallthrough = pc.wrapping_add(inst.app_len as u64);
                    self.post_call.add(host, fallthrough, false);
                }
            }
        }
    }

    fn has_enabled_post(&self, func: u64) -> bool {
        self.entries_snapshot(func)
            .iter()
            .any(|e| e.enabled && e.post.is_some())
    }

    /// Build the translation of the sentinel return stub: the post-call
    /// helper followed by an indirect jump through the dedicated TLS slot,
    /// which the helper fills with the real return address.
    pub(crate) fn build_sentinel_stub(&self) -> InsnList {
        let mut ilist = InsnList::new();
        ilist.push_back(Insn::clean_call(
            Callee::WrapReturn,
            [
                Opnd::imm(RETADDR_SENTINEL as i64),
                Opnd::reg(Gpr::SP),
            ],
            CleanCallFlags::READS_APP_CONTEXT | CleanCallFlags::WRITES_APP_CONTEXT,
        ));
        ilist.push_back(Insn::jmp_slot(self.retaddr_slot));
        ilist
    }

    /// Entry helper, reached by clean call from every translation of a
    /// wrapped function's entry.
    pub fn on_entry(
        &self,
        host: &mut dyn HostRuntime,
        thread: ThreadId,
        pt: &mut WrapThread,
        pc: u64,
        mc: &mut Mcontext,
    ) {
        let retaddr = self.read_retaddr(host, mc.sp());
        trace!(pc, level = pt.wrap_level() + 1, "wrap entry");

        self.check_unwind(host, thread, pt, mc);

        let entries = self.entries_snapshot(pc);
        if entries.is_empty() {
            // Stale hook: the wrap was removed and the flush has not
            // reached this translation yet.
            return;
        }

        if pt.frames.len() >= MAX_WRAP_NESTING {
            warn!(pc, "wrap nesting limit exceeded; skipping frame");
            pt.overflow += 1;
            return;
        }

        let intercept_post = entries.iter().any(|e| e.enabled && e.post.is_some());
        let mut frame = Frame {
            func: pc,
            app_sp: mc.sp(),
            retaddr,
            replaced_retaddr: false,
            skip: false,
            user_data: entries.iter().map(|e| e.user_data).collect(),
            pairs: entries
                .iter()
                .map(|e| (e.pre.clone(), e.post.clone(), false))
                .collect(),
        };

        if intercept_post {
            if let Some(ra) = retaddr {
                self.ensure_postcall(host, &entries, &mut frame, mc, ra);
            }
        }

        // Invoke pre callbacks outermost-first (registration LIFO order).
        let mut skip = false;
        let mut redirect = false;
        for (idx, entry) in entries.iter().enumerate() {
            if !entry.enabled {
                *self.disabled_count.lock().expect("count poisoned") += 1;
                continue;
            }
            if let Some(pre) = &entry.pre {
                let mut ctx = WrapCtx::new(
                    host,
                    pc,
                    frame.retaddr,
                    mc,
                    entry.callconv,
                    WrapWhere::PreFunc,
                    self.global,
                    frame.app_sp,
                );
                pre(&mut ctx, &mut frame.user_data[idx]);
                frame.pairs[idx].2 = true;
                skip = ctx.skip_requested;
                redirect = ctx.redirect_requested;
                if skip {
                    frame.skip = true;
                    break;
                }
                if redirect {
                    break;
                }
            } else {
                frame.pairs[idx].2 = true;
            }
        }

        let keep_frame = intercept_post || frame.skip;
        if keep_frame {
            pt.frames.push(frame);
        }
        if skip || redirect {
            // The stack and pc were already adjusted by the callback.
            host.request_redirect(mc);
        }
    }

    fn read_retaddr(&self, host: &dyn HostRuntime, sp: u64) -> Option<u64> {
        if self.global.contains(GlobalFlags::SAFE_READ_RETADDR) {
            let mut bytes = [0u8; WORD_SIZE];
            host.safe_read(sp, &mut bytes)
                .then(|| u64::from_le_bytes(bytes))
        } else {
            host.read_app_word(sp)
        }
    }

    /// Guarantee the return site will run the post helper: either via the
    /// sentinel replacement, or by registering the site and flushing any
    /// stale translation of it.
    fn ensure_postcall(
        &self,
        host: &mut dyn HostRuntime,
        entries: &[WrapEntry],
        frame: &mut Frame,
        mc: &mut Mcontext,
        retaddr: u64,
    ) {
        let wants_sentinel = entries
            .iter()
            .any(|e| e.enabled && e.flags.contains(WrapFlags::REPLACE_RETADDR));
        if wants_sentinel {
            // The app stack briefly holds a non-app pointer; every
            // app-visible machine context translates it back.
            trace!(retaddr, "replacing return address with sentinel");
            if host.write_app_word(mc.sp(), RETADDR_SENTINEL) {
                frame.replaced_retaddr = true;
                return;
            }
            warn!("failed to write sentinel; falling back to site instrumentation");
        }
        if self.global.contains(GlobalFlags::NO_DYNAMIC_RETADDRS) {
            return;
        }
        if self.post_call.is_instrumented(retaddr) {
            return;
        }
        self.post_call.add(host, retaddr, false);
        // A translation of the return site may already exist without the
        // hook; it must go before the callee returns. The return has not
        // executed yet, so a lazy flush is sufficient.
        debug!(retaddr, "flushing return site for post-call instrumentation");
        host.delay_flush_region(retaddr, 1);
        self.stats_flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Return helper, reached by clean call at every instrumented
    /// post-call site and from the sentinel stub.
    pub fn on_return(
        &self,
        host: &mut dyn HostRuntime,
        thread: ThreadId,
        pt: &mut WrapThread,
        retaddr: u64,
        mc: &mut Mcontext,
    ) {
        if pt.overflow > 0 {
            // This return unwinds a frame beyond the nesting limit that
            // was never materialized.
            pt.overflow -= 1;
            return;
        }
        if pt.frames.is_empty() {
            // A jump or other transfer reached the site without a call.
            return;
        }
        // Pop every frame the stack has grown past: tail calls bypass
        // return sites, and their posts still must run, in LIFO order.
        while pt
            .frames
            .last()
            .map_or(false, |frame| frame.app_sp < mc.sp())
        {
            self.after_callee(host, thread, pt, Some(retaddr), mc, false, false);
        }
    }

    /// Run the post phase for the top frame. `unwind` marks abnormal
    /// exits; `only_requested` restricts delivery to wraps that opted in.
    pub(crate) fn after_callee(
        &self,
        host: &mut dyn HostRuntime,
        thread: ThreadId,
        pt: &mut WrapThread,
        retaddr: Option<u64>,
        mc: &mut Mcontext,
        unwind: bool,
        only_requested: bool,
    ) {
        let Some(mut frame) = pt.frames.pop() else {
            return;
        };
        trace!(func = frame.func, unwind, "wrap return");
        if frame.skip {
            return;
        }

        let func = frame.func;
        let cleanup_only = pt.cleanup_only;
        let entries = self.entries_snapshot(func);
        let mut unwound_all = true;
        let mut redirect = false;

        // Posts run oldest-first, the reverse of the pre order, so the
        // outermost pre pairs with the last post.
        for entry in entries.iter().rev() {
            if !entry.enabled {
                *self.disabled_count.lock().expect("count poisoned") += 1;
                continue;
            }
            // Match this entry against the pre-phase snapshot; entries
            // registered since then had no pre and get no post.
            let Some(idx) = frame
                .pairs
                .iter()
                .position(|(pre, post, _)| entry.same_pair(pre, post))
            else {
                continue;
            };
            if !frame.pairs[idx].2 {
                continue;
            }
            if entry.flags.contains(WrapFlags::REPLACE_RETADDR) && frame.replaced_retaddr {
                // The stub's indirect jump reads the real return address
                // from our slot.
                if let Some(ra) = frame.retaddr {
                    host.write_tls(thread, self.retaddr_slot, ra);
                }
            }
            if cleanup_only {
                continue;
            }
            let Some(post) = &entry.post else { continue };
            if !unwind {
                let mut ctx = WrapCtx::new(
                    host,
                    func,
                    frame.retaddr.or(retaddr),
                    mc,
                    entry.callconv,
                    WrapWhere::PostFunc,
                    self.global,
                    frame.app_sp,
                );
                post(Some(&mut ctx), &mut frame.user_data[idx]);
                redirect |= ctx.redirect_requested;
            } else if !only_requested || entry.flags.contains(WrapFlags::UNWIND_ON_EXCEPTION) {
                // No return value exists on an abnormal exit.
                post(None, &mut frame.user_data[idx]);
            } else {
                unwound_all = false;
            }
        }

        if !unwound_all {
            // Some posts were withheld pending explicit unwind detection;
            // the frame stays for the stack-pointer heuristics.
            pt.frames.push(frame);
        }

        self.maybe_collect_tombstones(host);

        if redirect {
            host.request_redirect(mc);
        }
    }

    /// Batched physical removal of tombstoned entries, plus the flushes
    /// they owe. Runs with the table lock held only for the rebuild; the
    /// flushes happen lock-free.
    fn maybe_collect_tombstones(&self, host: &mut dyn HostRuntime) {
        {
            let count = self.disabled_count.lock().expect("count poisoned");
            if *count <= DISABLED_COUNT_FLUSH_THRESHOLD {
                return;
            }
        }
        let mut to_flush = Vec::new();
        {
            let mut table = self.wrap_table.lock().expect("wrap table poisoned");
            table.retain(|func, entries| {
                entries.retain(|e| e.enabled);
                if entries.is_empty() {
                    // No wrappings left: the entry hook must go too.
                    to_flush.push(*func);
                    false
                } else {
                    true
                }
            });
            *self.disabled_count.lock().expect("count poisoned") = 0;
        }
        debug!(flushes = to_flush.len(), "collected tombstoned wraps");
        for func in to_flush {
            host.flush_region(func, 1);
            self.stats_flushes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Return helper variant that only cleans frames (multipath blocks).
    pub fn on_return_cleanup_only(
        &self,
        host: &mut dyn HostRuntime,
        thread: ThreadId,
        pt: &mut WrapThread,
        retaddr: u64,
        mc: &mut Mcontext,
    ) {
        pt.cleanup_only = true;
        self.on_return(host, thread, pt, retaddr, mc);
        pt.cleanup_only = false;
    }
}
