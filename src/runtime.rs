//! Process-wide core: configuration, per-thread state, and the
//! translation pipeline driver.
//!
//! The host runtime owns one [`Core`] and drives it with thread
//! init/exit events, block translations, clean-call dispatch, and fault
//! events. Tools reach the three services through the core's fields and
//! register insertion passes with explicit priorities.

use crate::{
    consts::RETADDR_SENTINEL,
    context::{ThreadId, ThreadStore},
    error::{Error, Result},
    host::{
        fault::{AccessFault, FaultDisposition, RestoreStateInfo},
        phases::{Phase, Priority},
        tls::TlsBlock,
        HostRuntime,
    },
    machine::{
        ilist::{At, InsnList, InsnRef},
        insn::{Callee, CleanCallFlags, Insn},
        mcontext::Mcontext,
        opnd::Opnd,
    },
    regmgr::{RegOptions, RegReservations},
    tracebuf::{BufRegistry, BufThread},
    wrap::{replace::ReplaceNative, WrapEngine, WrapThread},
};

use bitflags::bitflags;
use std::collections::HashMap;
use tracing::debug;

bitflags! {
    /// Link-time/init-time behavior flags.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct GlobalFlags: u32 {
        /// Use fault-tolerant reads for return addresses.
        const SAFE_READ_RETADDR = 1 << 0;
        /// Use fault-tolerant reads for stack arguments.
        const SAFE_READ_ARGS = 1 << 1;
        /// At most one wrap per function; minimal bookkeeping.
        const NO_FRILLS = 1 << 2;
        /// Skip saving non-parameter scratch registers across callbacks.
        const FAST_CLEANCALLS = 1 << 3;
        /// Do not auto-run the wrap insertion pass; the tool invokes it
        /// explicitly.
        const INVERT_CONTROL = 1 << 4;
        /// Do not discover return sites at call time (indirect calls).
        const NO_DYNAMIC_RETADDRS = 1 << 5;
    }
}

/// Init-time configuration, supplied by the host's link-time glue.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreOptions {
    /// Reservation-manager options.
    pub reg: RegOptions,
    /// Global behavior flags.
    pub global_flags: GlobalFlags,
}

/// Per-thread state for all three services.
pub struct ThreadCtx {
    /// Register reservation state and API.
    pub regs: RegReservations,
    /// Wrap frame stack.
    pub wrap: WrapThread,
    /// Trace-buffer allocations.
    pub bufs: BufThread,
}

/// Context handed to tool insertion passes, once per application
/// instruction.
pub struct InsertCtx<'a> {
    /// Host services.
    pub host: &'a mut dyn HostRuntime,
    /// Thread being translated for.
    pub thread: ThreadId,
    /// The block under translation.
    pub ilist: &'a mut InsnList,
    /// The application instruction this invocation is for; insert before
    /// it.
    pub instr: InsnRef,
    /// Register reservation API, positioned at this instruction.
    pub regs: &'a mut RegReservations,
    wrap: &'a WrapEngine,
    invert_control: bool,
}

impl InsertCtx<'_> {
    /// The insertion point before the current instruction.
    pub fn before(&self) -> At {
        At::Before(self.instr)
    }

    /// Emit a clean call at `at`, letting the reservation manager restore
    /// app context before it and refresh spills after it as the flags
    /// demand.
    pub fn insert_clean_call(
        &mut self,
        at: At,
        callee: Callee,
        args: impl IntoIterator<Item = Opnd>,
        flags: CleanCallFlags,
    ) -> Result<InsnRef> {
        let call_ref = self.ilist.insert_at(at, Insn::clean_call(callee, args, flags));
        self.regs
            .clean_call_insertion(self.ilist, At::Before(call_ref), flags)?;
        Ok(call_ref)
    }

    /// Run the wrap insertion pass for this instruction. Only meaningful
    /// (and only permitted) under [`GlobalFlags::INVERT_CONTROL`].
    pub fn invoke_wrap_insertion(&mut self) -> Result<()> {
        if !self.invert_control {
            return Err(Error::IncompatibleState);
        }
        self.wrap
            .insertion(self.host, self.regs, self.ilist, self.instr);
        Ok(())
    }
}

/// Tool insertion pass, invoked once per application instruction.
pub type InsertHook = Box<dyn FnMut(&mut InsertCtx<'_>) -> Result<()> + Send>;

/// Tool clean-call target, reached through [`Callee::Tool`].
pub type ToolCallee =
    Box<dyn FnMut(&mut dyn HostRuntime, ThreadId, &mut Mcontext, &[u64]) + Send>;

/// The assembled middleware core.
pub struct Core {
    opts: CoreOptions,
    regmgr_tls: TlsBlock,
    /// Function wrap/replace engine.
    pub wrap: WrapEngine,
    /// Trace-buffer registry.
    pub bufs: BufRegistry,
    threads: ThreadStore<ThreadCtx>,
    insert_hooks: Vec<(Priority, InsertHook)>,
    tool_callees: HashMap<u32, ToolCallee>,
    next_callee: u32,
}

impl Core {
    /// Build the core against a host. Allocates the private spill-slot
    /// pool and the wrap engine's sentinel slot from raw TLS.
    pub fn new(host: &mut dyn HostRuntime, opts: CoreOptions) -> Result<Self> {
        crate::host::check_slot_request(opts.reg.num_spill_slots)?;
        let regmgr_tls = host.allocate_raw_tls(opts.reg.num_spill_slots)?;
        let wrap_tls = host.allocate_raw_tls(1)?;
        Ok(Self {
            opts,
            regmgr_tls,
            wrap: WrapEngine::new(opts.global_flags, wrap_tls.slot(0)),
            bufs: BufRegistry::new(),
            threads: ThreadStore::new(),
            insert_hooks: Vec::new(),
            tool_callees: HashMap::new(),
            next_callee: 0,
        })
    }

    /// Configuration in effect.
    pub fn options(&self) -> &CoreOptions {
        &self.opts
    }

    /// Register a tool insertion pass at `priority`; ties run in
    /// registration order.
    pub fn register_insert_hook(&mut self, priority: Priority, hook: InsertHook) {
        self.insert_hooks.push((priority, hook));
        self.insert_hooks.sort_by_key(|(p, _)| *p);
    }

    /// Register a native tool callee and return its id for clean calls
    /// and native replacement.
    pub fn register_tool_callee(&mut self, callee: ToolCallee) -> u32 {
        let id = self.next_callee;
        self.next_callee += 1;
        self.tool_callees.insert(id, callee);
        id
    }

    /// Redirect execution at `orig` to `replacement`; `None` removes.
    pub fn replace(
        &self,
        host: &mut dyn HostRuntime,
        orig: u64,
        replacement: Option<u64>,
    ) -> Result<()> {
        self.wrap.replace.replace(host, orig, replacement)
    }

    /// Redirect `orig` to a natively-running tool callee.
    pub fn replace_native(
        &self,
        host: &mut dyn HostRuntime,
        orig: u64,
        registration: Option<ReplaceNative>,
    ) -> Result<()> {
        self.wrap.replace.replace_native(host, orig, registration)
    }

    /// Host thread-init event.
    pub fn thread_init(&mut self, host: &mut dyn HostRuntime, thread: ThreadId) -> Result<()> {
        debug!(?thread, "thread init");
        let regs = RegReservations::new(
            thread,
            self.opts.reg,
            self.regmgr_tls,
            host.host_slot_block(),
            host.stolen_reg(),
            host.stolen_reg_slot(),
        );
        let mut ctx = ThreadCtx {
            regs,
            wrap: WrapThread::new(),
            bufs: BufThread::new(),
        };
        self.bufs.thread_init(host, thread, &mut ctx.bufs)?;
        if self.threads.init(thread, ctx).is_some() {
            return Err(Error::IncompatibleState);
        }
        Ok(())
    }

    /// Host thread-exit event. Flushes trace-buffer remainders through
    /// their callbacks.
    pub fn thread_exit(&mut self, host: &mut dyn HostRuntime, thread: ThreadId) -> Result<()> {
        debug!(?thread, "thread exit");
        let mut ctx = self.threads.exit(thread).ok_or(Error::InvalidParam)?;
        self.bufs.thread_exit(host, thread, &mut ctx.bufs);
        Ok(())
    }

    /// Borrow a thread's state block.
    pub fn thread(&self, thread: ThreadId) -> Option<&ThreadCtx> {
        self.threads.get(thread)
    }

    /// Mutably borrow a thread's state block.
    pub fn thread_mut(&mut self, thread: ThreadId) -> Option<&mut ThreadCtx> {
        self.threads.get_mut(thread)
    }

    /// Drive one block translation through the four phases.
    ///
    /// `start_pc` is the application pc the block translates. The sentinel
    /// return stub translates to generated code and skips the pipeline.
    pub fn translate_block(
        &mut self,
        host: &mut dyn HostRuntime,
        thread: ThreadId,
        start_pc: u64,
        ilist: &mut InsnList,
    ) -> Result<()> {
        if start_pc == RETADDR_SENTINEL {
            *ilist = self.wrap.build_sentinel_stub();
            return Ok(());
        }
        let invert_control = self.opts.global_flags.contains(GlobalFlags::INVERT_CONTROL);
        let Core {
            wrap,
            threads,
            insert_hooks,
            ..
        } = self;
        let ctx = threads.get_mut(thread).ok_or(Error::InvalidParam)?;

        // App-to-app rewriting; the replace engine runs at priority -100
        // and is the only built-in pass here.
        ctx.regs.begin_phase(Phase::AppToApp);
        wrap.replace.app2app(ilist, start_pc);

        // Whole-block analysis over the final app IL.
        ctx.regs.begin_phase(Phase::Analysis);
        ctx.regs.analyze_block(ilist);

        // Per-instruction insertion. The instruction set is snapshotted at
        // phase entry: code inserted during the walk is never revisited.
        ctx.regs.begin_phase(Phase::Insertion);
        let snapshot: Vec<InsnRef> = ilist.iter().map(|(at, _)| at).collect();
        let last = snapshot.last().copied();
        for at in snapshot {
            ctx.regs.insertion_step();
            if !invert_control {
                wrap.insertion(host, &mut ctx.regs, ilist, at);
            }
            for (_, hook) in insert_hooks.iter_mut() {
                let mut ictx = InsertCtx {
                    host: &mut *host,
                    thread,
                    ilist: &mut *ilist,
                    instr: at,
                    regs: &mut ctx.regs,
                    wrap: &*wrap,
                    invert_control,
                };
                hook(&mut ictx)?;
            }
            let is_last = Some(at) == last;
            let force = is_last
                && !ctx
                    .regs
                    .block_properties()
                    .contains(crate::regmgr::BlockProps::USER_RESTORES_AT_BB_END);
            let mut restored_for_read = [false; crate::consts::NUM_GPRS];
            ctx.regs
                .insert_restore_all(ilist, At::Before(at), force, &mut restored_for_read)?;
            ctx.regs
                .insert_respill_all(ilist, At::Before(at), false, &restored_for_read)?;
        }

        // Cleanup phase: nothing rewrites today; block state retires.
        ctx.regs.begin_phase(Phase::InstruToInstru);
        ctx.regs.end_block();
        Ok(())
    }

    /// Dispatch a clean call emitted by any service or tool. `args` are
    /// the evaluated argument values.
    pub fn dispatch_clean_call(
        &mut self,
        host: &mut dyn HostRuntime,
        thread: ThreadId,
        callee: Callee,
        args: &[u64],
        mc: &mut Mcontext,
    ) -> Result<()> {
        let Core {
            wrap,
            bufs,
            threads,
            tool_callees,
            ..
        } = self;
        let ctx = threads.get_mut(thread).ok_or(Error::InvalidParam)?;
        match callee {
            Callee::WrapEntry => {
                let pc = *args.first().ok_or(Error::InvalidParam)?;
                wrap.on_entry(host, thread, &mut ctx.wrap, pc, mc);
            }
            Callee::WrapReturn => {
                let retaddr = *args.first().ok_or(Error::InvalidParam)?;
                wrap.on_return(host, thread, &mut ctx.wrap, retaddr, mc);
            }
            Callee::WrapReturnCleanup => {
                let retaddr = *args.first().ok_or(Error::InvalidParam)?;
                wrap.on_return_cleanup_only(host, thread, &mut ctx.wrap, retaddr, mc);
            }
            Callee::BufMemcpy => {
                let (&idx, rest) = args.split_first().ok_or(Error::InvalidParam)?;
                let (&src, rest) = rest.split_first().ok_or(Error::InvalidParam)?;
                let (&len, _) = rest.split_first().ok_or(Error::InvalidParam)?;
                bufs.handle_memcpy(host, thread, &ctx.bufs, idx as usize, src, len as usize);
            }
            Callee::Tool(id) => {
                let callee = tool_callees.get_mut(&id).ok_or(Error::InvalidParam)?;
                callee(host, thread, mc, args);
            }
        }
        Ok(())
    }

    /// Host machine-state restoration event: each service patches the raw
    /// context in turn.
    pub fn handle_restore_state(
        &mut self,
        host: &mut dyn HostRuntime,
        thread: ThreadId,
        info: &mut RestoreStateInfo<'_>,
    ) -> bool {
        let Core { wrap, threads, .. } = self;
        let Some(ctx) = threads.get_mut(thread) else {
            return true;
        };
        let regs_ok = ctx.regs.restore_state(host, info);
        let wrap_ok = wrap.restore_state(host, &ctx.wrap, info);
        regs_ok && wrap_ok
    }

    /// Host access-violation event, consumed by the trace buffers.
    pub fn handle_access_fault(
        &mut self,
        host: &mut dyn HostRuntime,
        thread: ThreadId,
        fault: &mut AccessFault<'_>,
    ) -> FaultDisposition {
        let Core { bufs, threads, .. } = self;
        let Some(ctx) = threads.get(thread) else {
            return FaultDisposition::Deliver;
        };
        bufs.handle_fault(host, thread, &ctx.bufs, fault)
    }

    /// Host exception event: abnormal-unwind sweep for opted-in wraps.
    pub fn handle_exception(
        &mut self,
        host: &mut dyn HostRuntime,
        thread: ThreadId,
        mc: &mut Mcontext,
    ) {
        let Core { wrap, threads, .. } = self;
        if let Some(ctx) = threads.get_mut(thread) {
            wrap.on_exception(host, thread, &mut ctx.wrap, mc);
        }
    }
}
