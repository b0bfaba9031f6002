//! Reference host runtime and executor for the modeled ISA.
//!
//! The emulator plays the part of the code-cache host in the test suites:
//! it owns sparse memory with page protection, raw TLS, a translation
//! cache keyed by block start pc, and an interpreter for the instruction
//! set in [`crate::machine`]. Blocks are translated on demand through
//! [`Core::translate_block`], guard-page stores raise the access-fault
//! event, and clean calls dispatch back into the core.
//!
//! This is test tooling, not a DBI runtime: it executes instruction lists
//! the services emitted, nothing more.

use crate::{
    consts::{RETADDR_SENTINEL, WORD_SIZE},
    context::ThreadId,
    error::{Error, Result},
    host::{
        fault::{AccessFault, FaultDisposition},
        tls::{SlotHandle, TlsBlock},
        HostRuntime,
    },
    machine::{
        flags::Aflags,
        ilist::InsnList,
        insn::{Insn, LabelKind, Op},
        mcontext::Mcontext,
        opnd::{MemRef, Opnd},
        reg::{Gpr, Width},
    },
    runtime::Core,
};

use std::{collections::HashMap, sync::Arc};

const PAGE_SIZE: usize = 4096;
const ALLOC_BASE: u64 = 0xA000_0000;
const HOST_TLS_SLOTS: usize = crate::consts::HOST_SPILL_SLOTS;

#[derive(Clone)]
struct CachedBlock {
    ilist: Arc<InsnList>,
    lo: u64,
    hi: u64,
}

/// How a block finished executing.
enum BlockExit {
    /// Control transferred; `mc.pc` holds the target.
    Transfer,
    /// Fell off the end; `mc.pc` holds the fall-through.
    FallThrough,
}

/// The emulator host.
pub struct Emulator {
    mem: HashMap<u64, u8>,
    /// Read-only ranges, `[start, end)`.
    ro: Vec<(u64, u64)>,
    tls: HashMap<(ThreadId, u32), u64>,
    next_tls: u32,
    host_slots: TlsBlock,
    next_alloc: u64,
    program: HashMap<u64, Insn>,
    cache: HashMap<u64, CachedBlock>,
    redirect: Option<Mcontext>,
    stolen: Option<Gpr>,
    stolen_slot: Option<SlotHandle>,
}

impl Emulator {
    /// Fresh emulator with empty memory and no program.
    pub fn new() -> Self {
        let host_slots = TlsBlock::new(0, HOST_TLS_SLOTS);
        Self {
            mem: HashMap::new(),
            ro: Vec::new(),
            tls: HashMap::new(),
            next_tls: (HOST_TLS_SLOTS * WORD_SIZE) as u32,
            host_slots,
            next_alloc: ALLOC_BASE,
            program: HashMap::new(),
            cache: HashMap::new(),
            redirect: None,
            stolen: None,
            stolen_slot: None,
        }
    }

    /// Configure a stolen register backed by a dedicated TLS slot.
    pub fn steal_register(&mut self, reg: Gpr) {
        let block = self
            .allocate_raw_tls(1)
            .expect("tls allocation for stolen register");
        self.stolen = Some(reg);
        self.stolen_slot = Some(block.slot(0));
    }

    /// Map raw bytes at `addr`, read-write.
    pub fn map_bytes(&mut self, addr: u64, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.mem.insert(addr + i as u64, *b);
        }
    }

    /// Map `len` zero bytes at `addr`.
    pub fn map_zero(&mut self, addr: u64, len: usize) {
        for i in 0..len {
            self.mem.insert(addr + i as u64, 0);
        }
    }

    /// Install application instructions; each must carry a pc. Pseudo
    /// code bytes derived from the instruction back the range so that
    /// code reads (prior-bytes snapshots) behave.
    pub fn load_program(&mut self, insns: impl IntoIterator<Item = Insn>) {
        for insn in insns {
            let pc = insn.pc.expect("program instructions must carry a pc");
            let len = insn.app_len.max(1) as u64;
            let tag = Self::pseudo_byte(&insn);
            for i in 0..len {
                self.mem.insert(pc + i, tag.wrapping_add(i as u8));
            }
            self.program.insert(pc, insn);
        }
    }

    fn pseudo_byte(insn: &Insn) -> u8 {
        // Deterministic per-operation tag so changed code changes bytes.
        let disc = match insn.op {
            Op::Load => 1,
            Op::Store => 2,
            Op::LoadSlot => 3,
            Op::StoreSlot => 4,
            Op::Mov => 5,
            Op::Xchg => 6,
            Op::Add => 7,
            Op::AddNoFlags => 8,
            Op::Cmp => 9,
            Op::FlagsToReg => 10,
            Op::RegToFlags => 11,
            Op::Call => 12,
            Op::CallInd => 13,
            Op::Ret => 14,
            Op::Jmp => 15,
            Op::JmpInd => 16,
            Op::Bcc => 17,
            Op::CleanCall(_) => 18,
            Op::Label(_) => 19,
            Op::Nop => 20,
        };
        disc * 11
    }

    /// Drop every cached translation; next execution re-translates.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Current value of a raw TLS slot, for assertions.
    pub fn tls_value(&self, thread: ThreadId, slot: SlotHandle) -> u64 {
        self.tls
            .get(&(thread, slot.offset()))
            .copied()
            .unwrap_or(0)
    }

    fn decode_block(&self, start_pc: u64) -> InsnList {
        let mut ilist = InsnList::new();
        let mut pc = start_pc;
        while let Some(insn) = self.program.get(&pc) {
            ilist.push_back(insn.clone());
            if insn.is_cti() {
                break;
            }
            pc += insn.app_len as u64;
        }
        ilist
    }

    fn fetch_block(
        &mut self,
        core: &mut Core,
        thread: ThreadId,
        pc: u64,
    ) -> Result<Arc<InsnList>> {
        if let Some(cached) = self.cache.get(&pc) {
            return Ok(cached.ilist.clone());
        }
        let mut ilist = if pc == RETADDR_SENTINEL {
            InsnList::new()
        } else {
            self.decode_block(pc)
        };
        if ilist.is_empty() && pc != RETADDR_SENTINEL {
            return Err(Error::InvalidParam);
        }
        core.translate_block(self, thread, pc, &mut ilist)?;
        let (lo, hi) = block_range(pc, &ilist);
        let block = CachedBlock {
            ilist: Arc::new(ilist),
            lo,
            hi,
        };
        self.cache.insert(pc, block.clone());
        Ok(block.ilist)
    }

    /// Execute from `mc.pc` until control reaches an address with no
    /// program behind it, or `max_blocks` is exhausted.
    pub fn run(
        &mut self,
        core: &mut Core,
        thread: ThreadId,
        mc: &mut Mcontext,
        max_blocks: usize,
    ) -> Result<()> {
        for _ in 0..max_blocks {
            let pc = mc.pc;
            if pc != RETADDR_SENTINEL && !self.program.contains_key(&pc) {
                return Ok(());
            }
            let block = self.fetch_block(core, thread, pc)?;
            match self.exec_block(core, thread, &block, mc)? {
                BlockExit::Transfer | BlockExit::FallThrough => {}
            }
        }
        Err(Error::IncompatibleState)
    }

    fn exec_block(
        &mut self,
        core: &mut Core,
        thread: ThreadId,
        block: &InsnList,
        mc: &mut Mcontext,
    ) -> Result<BlockExit> {
        let mut fall_through = mc.pc;
        for (_, insn) in block.iter() {
            if insn.app {
                if let Some(pc) = insn.pc {
                    fall_through = pc + insn.app_len as u64;
                }
            }
            match self.exec_insn(core, thread, insn, mc)? {
                InsnOutcome::Continue => {}
                InsnOutcome::Transfer => return Ok(BlockExit::Transfer),
            }
            if let Some(target) = self.redirect.take() {
                *mc = target;
                return Ok(BlockExit::Transfer);
            }
        }
        mc.pc = fall_through;
        Ok(BlockExit::FallThrough)
    }

    fn exec_insn(
        &mut self,
        core: &mut Core,
        thread: ThreadId,
        insn: &Insn,
        mc: &mut Mcontext,
    ) -> Result<InsnOutcome> {
        match &insn.op {
            Op::Nop | Op::Label(LabelKind::Plain) | Op::Label(LabelKind::RegBarrier) => {}
            Op::Mov => {
                let value = self.eval(thread, mc, &insn.srcs[0])?;
                self.write_opnd(thread, mc, &insn.dsts[0], value)?;
            }
            Op::Xchg => {
                let a = insn.dsts[0].as_reg().ok_or(Error::InvalidParam)?;
                let b = insn.dsts[1].as_reg().ok_or(Error::InvalidParam)?;
                let (va, vb) = (mc.reg(a), mc.reg(b));
                mc.set_reg(a, vb);
                mc.set_reg(b, va);
            }
            Op::Add | Op::AddNoFlags => {
                let width = insn.dsts[0].width();
                let lhs = self.eval(thread, mc, &insn.srcs[0])?;
                let rhs = self.eval(thread, mc, &insn.srcs[1])?;
                let mask = width.mask();
                let result = lhs.wrapping_add(rhs) & mask;
                self.write_opnd(thread, mc, &insn.dsts[0], result)?;
                if matches!(insn.op, Op::Add) {
                    mc.aflags = add_flags(lhs & mask, rhs & mask, result, width);
                }
            }
            Op::Cmp => {
                let width = insn.srcs[0].width();
                let lhs = self.eval(thread, mc, &insn.srcs[0])?;
                let rhs = self.eval(thread, mc, &insn.srcs[1])?;
                let mask = width.mask();
                let result = lhs.wrapping_sub(rhs) & mask;
                mc.aflags = sub_flags(lhs & mask, rhs & mask, result, width);
            }
            Op::Load => {
                let mem = insn.srcs[0].as_mem().ok_or(Error::InvalidParam)?;
                let addr = self.mem_addr(mc, &mem);
                let value = self
                    .read_mem(addr, mem.width.bytes())
                    .ok_or(Error::MemoryFault)?;
                self.write_opnd(thread, mc, &insn.dsts[0], value)?;
            }
            Op::Store => {
                let mem = insn.dsts[0].as_mem().ok_or(Error::InvalidParam)?;
                let value = self.eval(thread, mc, &insn.srcs[0])?;
                let addr = self.mem_addr(mc, &mem);
                if let Some(ro_addr) = self.first_ro_byte(addr, mem.width.bytes()) {
                    // Guard-page fault: hand it to the core, then retry
                    // once with the (possibly patched) context.
                    let mut fault = AccessFault {
                        access_addr: ro_addr,
                        raw_mcontext: &mut *mc,
                        faulting: insn,
                    };
                    match core.handle_access_fault(self, thread, &mut fault) {
                        FaultDisposition::Suppressed => {
                            let addr = self.mem_addr(mc, &mem);
                            let value = self.eval(thread, mc, &insn.srcs[0])?;
                            if !self.write_mem(addr, mem.width.bytes(), value) {
                                return Err(Error::MemoryFault);
                            }
                        }
                        FaultDisposition::Deliver => return Err(Error::MemoryFault),
                    }
                } else if !self.write_mem(addr, mem.width.bytes(), value) {
                    return Err(Error::MemoryFault);
                }
            }
            Op::LoadSlot => {
                let value = self.eval(thread, mc, &insn.srcs[0])?;
                self.write_opnd(thread, mc, &insn.dsts[0], value)?;
            }
            Op::StoreSlot => {
                let value = self.eval(thread, mc, &insn.srcs[0])?;
                self.write_opnd(thread, mc, &insn.dsts[0], value)?;
            }
            Op::FlagsToReg => {
                let dst = insn.dsts[0].as_reg().ok_or(Error::InvalidParam)?;
                let word = mc.aflags.to_word();
                write_reg(mc, dst, Width::W1, word);
            }
            Op::RegToFlags => {
                let src = insn.srcs[0].as_reg().ok_or(Error::InvalidParam)?;
                mc.aflags = Aflags::from_word(mc.reg(src));
            }
            Op::Call | Op::CallInd => {
                let target = self.eval(thread, mc, &insn.srcs[0])?;
                let retaddr = insn.pc.map_or(0, |pc| pc + insn.app_len as u64);
                let sp = mc.sp().wrapping_sub(WORD_SIZE as u64);
                if !self.write_mem(sp, WORD_SIZE, retaddr) {
                    return Err(Error::MemoryFault);
                }
                mc.set_sp(sp);
                mc.pc = target;
                return Ok(InsnOutcome::Transfer);
            }
            Op::Ret => {
                let sp = mc.sp();
                let retaddr = self.read_mem(sp, WORD_SIZE).ok_or(Error::MemoryFault)?;
                mc.set_sp(sp.wrapping_add(WORD_SIZE as u64));
                mc.pc = retaddr;
                return Ok(InsnOutcome::Transfer);
            }
            Op::Jmp | Op::JmpInd => {
                mc.pc = self.eval(thread, mc, &insn.srcs[0])?;
                return Ok(InsnOutcome::Transfer);
            }
            Op::Bcc => {
                // Modeled as branch-if-zero.
                if mc.aflags.contains(Aflags::ZF) {
                    mc.pc = self.eval(thread, mc, &insn.srcs[0])?;
                    return Ok(InsnOutcome::Transfer);
                }
            }
            Op::CleanCall(call) => {
                let args: Vec<u64> = call
                    .args
                    .iter()
                    .map(|a| self.eval(thread, mc, a))
                    .collect::<Result<_>>()?;
                let callee = call.callee;
                core.dispatch_clean_call(self, thread, callee, &args, mc)?;
            }
        }
        Ok(InsnOutcome::Continue)
    }

    fn eval(&self, thread: ThreadId, mc: &Mcontext, opnd: &Opnd) -> Result<u64> {
        Ok(match opnd {
            Opnd::Reg(reg, width) => mc.reg(*reg) & width.mask(),
            Opnd::Imm(value, width) => (*value as u64) & width.mask(),
            Opnd::Slot(slot, width) => self.tls_value(thread, *slot) & width.mask(),
            Opnd::Mem(mem) => {
                let addr = self.mem_addr(mc, mem);
                self.read_mem(addr, mem.width.bytes())
                    .ok_or(Error::MemoryFault)?
            }
        })
    }

    fn write_opnd(
        &mut self,
        thread: ThreadId,
        mc: &mut Mcontext,
        opnd: &Opnd,
        value: u64,
    ) -> Result<()> {
        match opnd {
            Opnd::Reg(reg, width) => write_reg(mc, *reg, *width, value),
            Opnd::Slot(slot, width) => {
                let old = self.tls_value(thread, *slot);
                let merged = (old & !width.mask()) | (value & width.mask());
                self.tls.insert((thread, slot.offset()), merged);
            }
            Opnd::Mem(mem) => {
                let addr = self.mem_addr(mc, mem);
                if !self.write_mem(addr, mem.width.bytes(), value) {
                    return Err(Error::MemoryFault);
                }
            }
            Opnd::Imm(..) => return Err(Error::InvalidParam),
        }
        Ok(())
    }

    fn mem_addr(&self, mc: &Mcontext, mem: &MemRef) -> u64 {
        let base = mem.base.map_or(0, |r| mc.reg(r));
        let index = mem.index.map_or(0, |r| mc.reg(r));
        base.wrapping_add(index).wrapping_add(mem.disp as u64)
    }

    fn read_mem(&self, addr: u64, len: usize) -> Option<u64> {
        let mut value = 0u64;
        for i in 0..len {
            let byte = *self.mem.get(&(addr + i as u64))?;
            value |= (byte as u64) << (8 * i);
        }
        Some(value)
    }

    fn write_mem(&mut self, addr: u64, len: usize, value: u64) -> bool {
        if self.first_ro_byte(addr, len).is_some() {
            return false;
        }
        for i in 0..len {
            let a = addr + i as u64;
            if !self.mem.contains_key(&a) {
                return false;
            }
            self.mem.insert(a, ((value >> (8 * i)) & 0xff) as u8);
        }
        true
    }

    fn first_ro_byte(&self, addr: u64, len: usize) -> Option<u64> {
        for i in 0..len as u64 {
            let a = addr + i;
            if self.ro.iter().any(|&(lo, hi)| a >= lo && a < hi) {
                return Some(a);
            }
        }
        None
    }
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new()
    }
}

enum InsnOutcome {
    Continue,
    Transfer,
}

fn block_range(start_pc: u64, ilist: &InsnList) -> (u64, u64) {
    let mut lo = start_pc;
    let mut hi = start_pc.saturating_add(1);
    for (_, insn) in ilist.iter() {
        if let Some(pc) = insn.pc {
            lo = lo.min(pc);
            hi = hi.max(pc + insn.app_len as u64);
        }
    }
    (lo, hi)
}

fn write_reg(mc: &mut Mcontext, reg: Gpr, width: Width, value: u64) {
    let old = mc.reg(reg);
    let merged = (old & !width.mask()) | (value & width.mask());
    mc.set_reg(reg, merged);
}

fn parity_even(byte: u8) -> bool {
    byte.count_ones() % 2 == 0
}

fn add_flags(lhs: u64, rhs: u64, result: u64, width: Width) -> Aflags {
    let top = 1u64 << (width.bytes() * 8 - 1);
    let mut flags = Aflags::empty();
    if result == 0 {
        flags |= Aflags::ZF;
    }
    if result & top != 0 {
        flags |= Aflags::SF;
    }
    if result < lhs {
        flags |= Aflags::CF;
    }
    if ((lhs ^ result) & (rhs ^ result) & top) != 0 {
        flags |= Aflags::OF;
    }
    if ((lhs & 0xf) + (rhs & 0xf)) > 0xf {
        flags |= Aflags::AF;
    }
    if parity_even((result & 0xff) as u8) {
        flags |= Aflags::PF;
    }
    flags
}

fn sub_flags(lhs: u64, rhs: u64, result: u64, width: Width) -> Aflags {
    let top = 1u64 << (width.bytes() * 8 - 1);
    let mut flags = Aflags::empty();
    if result == 0 {
        flags |= Aflags::ZF;
    }
    if result & top != 0 {
        flags |= Aflags::SF;
    }
    if lhs < rhs {
        flags |= Aflags::CF;
    }
    if ((lhs ^ rhs) & (lhs ^ result) & top) != 0 {
        flags |= Aflags::OF;
    }
    if (lhs & 0xf) < (rhs & 0xf) {
        flags |= Aflags::AF;
    }
    if parity_even((result & 0xff) as u8) {
        flags |= Aflags::PF;
    }
    flags
}

impl HostRuntime for Emulator {
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn stolen_reg(&self) -> Option<Gpr> {
        self.stolen
    }

    fn stolen_reg_slot(&self) -> Option<SlotHandle> {
        self.stolen_slot
    }

    fn allocate_raw_tls(&mut self, n_slots: usize) -> Result<TlsBlock> {
        let block = TlsBlock::new(self.next_tls, n_slots);
        self.next_tls += (n_slots * WORD_SIZE) as u32;
        Ok(block)
    }

    fn free_raw_tls(&mut self, _block: TlsBlock) {}

    fn host_slot_block(&self) -> TlsBlock {
        self.host_slots
    }

    fn read_tls(&self, thread: ThreadId, slot: SlotHandle) -> u64 {
        self.tls_value(thread, slot)
    }

    fn write_tls(&mut self, thread: ThreadId, slot: SlotHandle, value: u64) {
        self.tls.insert((thread, slot.offset()), value);
    }

    fn safe_read(&self, addr: u64, out: &mut [u8]) -> bool {
        for (i, dst) in out.iter_mut().enumerate() {
            match self.mem.get(&(addr + i as u64)) {
                Some(byte) => *dst = *byte,
                None => return false,
            }
        }
        true
    }

    fn write_app(&mut self, addr: u64, bytes: &[u8]) -> bool {
        if self.first_ro_byte(addr, bytes.len()).is_some() {
            return false;
        }
        for (i, b) in bytes.iter().enumerate() {
            let a = addr + i as u64;
            if !self.mem.contains_key(&a) {
                return false;
            }
            self.mem.insert(a, *b);
        }
        true
    }

    fn alloc_raw(&mut self, size: usize) -> Result<u64> {
        let rounded = crate::tracebuf::align_up(size as u64, PAGE_SIZE as u64);
        let addr = self.next_alloc;
        self.next_alloc += rounded + PAGE_SIZE as u64;
        self.map_zero(addr, rounded as usize);
        Ok(addr)
    }

    fn protect_read_only(&mut self, addr: u64, len: usize) -> Result<()> {
        self.ro.push((addr, addr + len as u64));
        Ok(())
    }

    fn free_raw(&mut self, addr: u64, size: usize) {
        for i in 0..size as u64 {
            self.mem.remove(&(addr + i));
        }
        self.ro
            .retain(|&(lo, hi)| hi <= addr || lo >= addr + size as u64);
    }

    fn flush_region(&mut self, pc: u64, len: usize) {
        let end = pc.saturating_add(len.max(1) as u64);
        self.cache
            .retain(|_, block| block.hi <= pc || block.lo >= end);
    }

    fn delay_flush_region(&mut self, pc: u64, len: usize) {
        // The emulator finishes the current block from its own copy, so a
        // lazy flush degenerates to an eager one.
        self.flush_region(pc, len);
    }

    fn request_redirect(&mut self, mc: &Mcontext) {
        self.redirect = Some(*mc);
    }
}
