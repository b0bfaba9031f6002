//! Instruction representation and the liveness queries made against it.

use crate::machine::{
    flags::Aflags,
    opnd::{MemRef, Opnd},
    reg::{Gpr, Width},
};

use bitflags::bitflags;
use smallvec::SmallVec;

/// Runtime helper entry points reachable through emitted clean calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callee {
    /// Function-wrap entry helper, `on_entry(entry_or_pc, sp[, lr])`.
    WrapEntry,
    /// Post-call return helper, `on_return(retaddr, sp)`.
    WrapReturn,
    /// Post-call helper restricted to frame cleanup (multipath blocks).
    WrapReturnCleanup,
    /// Trace-buffer bounded copy helper.
    BufMemcpy,
    /// A tool-registered callee, keyed by registration id.
    Tool(u32),
}

bitflags! {
    /// Properties of a clean call relevant to the reservation manager.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct CleanCallFlags: u8 {
        /// The callee observes application register state; app values must
        /// be restored before the call.
        const READS_APP_CONTEXT = 1 << 0;
        /// The callee may modify application register state; spills must
        /// be refreshed after the call.
        const WRITES_APP_CONTEXT = 1 << 1;
        /// The call site is duplicated across block variants; restores
        /// around it must not change logical reservation state.
        const MULTIPATH = 1 << 2;
    }
}

/// A clean call emitted into the instruction stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanCall {
    /// Target helper.
    pub callee: Callee,
    /// Arguments, evaluated against machine state at the call site.
    pub args: SmallVec<[Opnd; 4]>,
    /// Call properties.
    pub flags: CleanCallFlags,
}

/// Label annotations that act as barriers for lazy restoration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    /// Plain position marker.
    Plain,
    /// All application values must be visible at this point.
    RegBarrier,
}

/// Operation kinds of the modeled load/store ISA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Register load from memory.
    Load,
    /// Store of a register or immediate to memory.
    Store,
    /// Register load from a raw TLS slot.
    LoadSlot,
    /// Register store to a raw TLS slot.
    StoreSlot,
    /// Register-to-register or immediate-to-register copy.
    Mov,
    /// Exchange of two registers.
    Xchg,
    /// Addition; writes the arithmetic flags.
    Add,
    /// Address-style addition that leaves the flags untouched.
    AddNoFlags,
    /// Comparison; writes the arithmetic flags.
    Cmp,
    /// Capture of the arithmetic flags into the low byte of a register.
    FlagsToReg,
    /// Restoration of the arithmetic flags from the low byte of a register.
    RegToFlags,
    /// Direct call; pushes the return address.
    Call,
    /// Indirect call through a register.
    CallInd,
    /// Return; pops the return address.
    Ret,
    /// Direct jump.
    Jmp,
    /// Indirect jump through a register.
    JmpInd,
    /// Conditional branch; reads the arithmetic flags.
    Bcc,
    /// Clean call into native helper code.
    CleanCall(CleanCall),
    /// Position marker.
    Label(LabelKind),
    /// No operation.
    Nop,
}

/// One instruction: an operation, destination and source operands, an
/// app/meta marker, and the app pc it translates (app instructions only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insn {
    /// Operation.
    pub op: Op,
    /// Destination operands.
    pub dsts: SmallVec<[Opnd; 1]>,
    /// Source operands.
    pub srcs: SmallVec<[Opnd; 2]>,
    /// True for original application instructions, false for
    /// instrumentation-emitted (meta) ones.
    pub app: bool,
    /// Application pc, present on app instructions.
    pub pc: Option<u64>,
    /// Arithmetic flags read, beyond what the opcode implies.
    pub flags_read: Aflags,
    /// Arithmetic flags written.
    pub flags_written: Aflags,
    /// True when the write to the destination is predicated on a
    /// condition; treated as read-then-write by liveness.
    pub predicated: bool,
    /// Encoded length of the app instruction, used to compute fall-through
    /// addresses. Meaningless on meta instructions.
    pub app_len: u8,
}

impl Insn {
    fn new(op: Op) -> Self {
        let (flags_read, flags_written) = match &op {
            Op::Add | Op::Cmp => (Aflags::empty(), Aflags::ARITH),
            Op::Bcc => (Aflags::ARITH, Aflags::empty()),
            Op::FlagsToReg => (Aflags::ARITH, Aflags::empty()),
            Op::RegToFlags => (Aflags::empty(), Aflags::ARITH),
            _ => (Aflags::empty(), Aflags::empty()),
        };
        Self {
            op,
            dsts: SmallVec::new(),
            srcs: SmallVec::new(),
            app: false,
            pc: None,
            flags_read,
            flags_written,
            predicated: false,
            app_len: 4,
        }
    }

    /// Mark as an application instruction translating `pc`.
    #[must_use]
    pub fn app(mut self, pc: u64) -> Self {
        self.app = true;
        self.pc = Some(pc);
        self
    }

    /// Mark the destination write as predicated.
    #[must_use]
    pub fn predicated(mut self) -> Self {
        self.predicated = true;
        self
    }

    /// Set the encoded length of an app instruction.
    #[must_use]
    pub fn encoded_len(mut self, bytes: u8) -> Self {
        self.app_len = bytes;
        self
    }

    /// Override the flag effects, for modeling instructions with partial
    /// masks.
    #[must_use]
    pub fn with_flag_effects(mut self, read: Aflags, written: Aflags) -> Self {
        self.flags_read = read;
        self.flags_written = written;
        self
    }

    /// `dst ← [mem]`.
    pub fn load(dst: Gpr, mem: MemRef) -> Self {
        let mut insn = Self::new(Op::Load);
        insn.dsts.push(Opnd::Reg(dst, mem.width));
        insn.srcs.push(Opnd::Mem(mem));
        insn
    }

    /// `[mem] ← src` where `src` is a register or immediate.
    pub fn store(mem: MemRef, src: Opnd) -> Self {
        let mut insn = Self::new(Op::Store);
        insn.dsts.push(Opnd::Mem(mem));
        insn.srcs.push(src);
        insn
    }

    /// `dst ← tls[slot]`.
    pub fn load_slot(dst: Gpr, slot: crate::host::tls::SlotHandle) -> Self {
        let mut insn = Self::new(Op::LoadSlot);
        insn.dsts.push(Opnd::reg(dst));
        insn.srcs.push(Opnd::slot(slot));
        insn
    }

    /// `tls[slot] ← src`.
    pub fn store_slot(slot: crate::host::tls::SlotHandle, src: Gpr) -> Self {
        let mut insn = Self::new(Op::StoreSlot);
        insn.dsts.push(Opnd::slot(slot));
        insn.srcs.push(Opnd::reg(src));
        insn
    }

    /// `dst ← src` register or immediate copy at the operand's width.
    pub fn mov(dst: Opnd, src: Opnd) -> Self {
        let mut insn = Self::new(Op::Mov);
        insn.dsts.push(dst);
        insn.srcs.push(src);
        insn
    }

    /// Exchange of two full-width registers.
    pub fn xchg(a: Gpr, b: Gpr) -> Self {
        let mut insn = Self::new(Op::Xchg);
        insn.dsts.push(Opnd::reg(a));
        insn.dsts.push(Opnd::reg(b));
        insn.srcs.push(Opnd::reg(a));
        insn.srcs.push(Opnd::reg(b));
        insn
    }

    /// `dst ← dst + src`, writing the arithmetic flags. `dst` may be a
    /// register view or a TLS-slot subword.
    pub fn add(dst: Opnd, src: Opnd) -> Self {
        let mut insn = Self::new(Op::Add);
        insn.dsts.push(dst);
        insn.srcs.push(dst);
        insn.srcs.push(src);
        insn
    }

    /// `dst ← dst + src` without touching the flags.
    pub fn add_noflags(dst: Opnd, src: Opnd) -> Self {
        let mut insn = Self::new(Op::AddNoFlags);
        insn.dsts.push(dst);
        insn.srcs.push(dst);
        insn.srcs.push(src);
        insn
    }

    /// Flag-writing comparison of two operands.
    pub fn cmp(a: Opnd, b: Opnd) -> Self {
        let mut insn = Self::new(Op::Cmp);
        insn.srcs.push(a);
        insn.srcs.push(b);
        insn
    }

    /// Capture the arithmetic flags into the low byte of `dst`.
    pub fn flags_to_reg(dst: Gpr) -> Self {
        let mut insn = Self::new(Op::FlagsToReg);
        insn.dsts.push(Opnd::Reg(dst, Width::W1));
        insn
    }

    /// Restore the arithmetic flags from the low byte of `src`.
    pub fn reg_to_flags(src: Gpr) -> Self {
        let mut insn = Self::new(Op::RegToFlags);
        insn.srcs.push(Opnd::Reg(src, Width::W1));
        insn
    }

    /// Direct call to `target`.
    pub fn call(target: u64) -> Self {
        let mut insn = Self::new(Op::Call);
        insn.srcs.push(Opnd::imm(target as i64));
        insn
    }

    /// Indirect call through `target`.
    pub fn call_ind(target: Gpr) -> Self {
        let mut insn = Self::new(Op::CallInd);
        insn.srcs.push(Opnd::reg(target));
        insn
    }

    /// Return.
    pub fn ret() -> Self {
        Self::new(Op::Ret)
    }

    /// Direct jump to `target`.
    pub fn jmp(target: u64) -> Self {
        let mut insn = Self::new(Op::Jmp);
        insn.srcs.push(Opnd::imm(target as i64));
        insn
    }

    /// Indirect jump through `target`.
    pub fn jmp_ind(target: Gpr) -> Self {
        let mut insn = Self::new(Op::JmpInd);
        insn.srcs.push(Opnd::reg(target));
        insn
    }

    /// Indirect jump through a raw TLS slot.
    pub fn jmp_slot(slot: crate::host::tls::SlotHandle) -> Self {
        let mut insn = Self::new(Op::JmpInd);
        insn.srcs.push(Opnd::slot(slot));
        insn
    }

    /// Conditional branch to `target`, reading the arithmetic flags.
    pub fn bcc(target: u64) -> Self {
        let mut insn = Self::new(Op::Bcc);
        insn.srcs.push(Opnd::imm(target as i64));
        insn
    }

    /// Clean call to a runtime helper.
    pub fn clean_call(
        callee: Callee,
        args: impl IntoIterator<Item = Opnd>,
        flags: CleanCallFlags,
    ) -> Self {
        Self::new(Op::CleanCall(CleanCall {
            callee,
            args: args.into_iter().collect(),
            flags,
        }))
    }

    /// Position marker.
    pub fn label(kind: LabelKind) -> Self {
        Self::new(Op::Label(kind))
    }

    /// No operation.
    pub fn nop() -> Self {
        Self::new(Op::Nop)
    }

    /// Whether this is a control transfer (terminates liveness walks).
    pub fn is_cti(&self) -> bool {
        matches!(
            self.op,
            Op::Call | Op::CallInd | Op::Ret | Op::Jmp | Op::JmpInd | Op::Bcc
        )
    }

    /// Whether this is a position marker of the given kind.
    pub fn is_label(&self, kind: LabelKind) -> bool {
        matches!(self.op, Op::Label(k) if k == kind)
    }

    /// Whether the instruction reads `reg`.
    ///
    /// With `include_cond`, addressing registers inside destination memory
    /// operands and the old value of predicated destinations count as
    /// reads.
    pub fn reads_from_reg(&self, reg: Gpr, include_cond: bool) -> bool {
        if self.srcs.iter().any(|o| o.regs_used().contains(&reg)) {
            return true;
        }
        // Address computation in a destination is always a read.
        if self
            .dsts
            .iter()
            .filter_map(Opnd::as_mem)
            .any(|m| m.regs_used().any(|r| r == reg))
        {
            return true;
        }
        if include_cond && self.predicated && self.writes_to_reg(reg) {
            return true;
        }
        if matches!(self.op, Op::Call | Op::CallInd | Op::Ret) && reg == Gpr::SP {
            return true;
        }
        false
    }

    /// Whether the instruction writes any part of `reg`.
    pub fn writes_to_reg(&self, reg: Gpr) -> bool {
        if self
            .dsts
            .iter()
            .any(|o| matches!(o, Opnd::Reg(r, _) if *r == reg))
        {
            return true;
        }
        matches!(self.op, Op::Call | Op::CallInd | Op::Ret) && reg == Gpr::SP
    }

    /// Whether the instruction overwrites the full width of `reg`, leaving
    /// no live bytes behind.
    pub fn writes_to_exact_reg(&self, reg: Gpr) -> bool {
        self.dsts
            .iter()
            .any(|o| matches!(o, Opnd::Reg(r, w) if *r == reg && *w == Width::W8))
    }

    /// Memory operands among sources and destinations.
    pub fn mem_operands(&self) -> impl Iterator<Item = MemRef> + '_ {
        self.dsts
            .iter()
            .chain(self.srcs.iter())
            .filter_map(Opnd::as_mem)
    }

    /// The clean call payload, when this is a clean call.
    pub fn as_clean_call(&self) -> Option<&CleanCall> {
        match &self.op {
            Op::CleanCall(call) => Some(call),
            _ => None,
        }
    }

    /// Recognize the shape of a reservation-manager spill: a meta-style
    /// store of a full register to a TLS slot. Returns the register and
    /// slot handle. Works on raw cache contents, so app instructions may
    /// match; callers with IL access must additionally check [`Insn::app`].
    pub fn as_slot_spill(&self) -> Option<(Gpr, crate::host::tls::SlotHandle)> {
        if !matches!(self.op, Op::StoreSlot) {
            return None;
        }
        let reg = self.srcs.first()?.as_reg()?;
        match self.dsts.first()? {
            Opnd::Slot(handle, Width::W8) => Some((reg, *handle)),
            _ => None,
        }
    }

    /// Recognize the shape of a reservation-manager restore, the mirror of
    /// [`Insn::as_slot_spill`].
    pub fn as_slot_restore(&self) -> Option<(Gpr, crate::host::tls::SlotHandle)> {
        if !matches!(self.op, Op::LoadSlot) {
            return None;
        }
        let reg = self.dsts.first()?.as_reg()?;
        match self.srcs.first()? {
            Opnd::Slot(handle, Width::W8) => Some((reg, *handle)),
            _ => None,
        }
    }
}
