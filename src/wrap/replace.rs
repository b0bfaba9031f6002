//! Function replacement.
//!
//! Two flavors exist. A regular replacement redirects execution at the
//! original entry to a replacement function; both control flows stay in
//! the code cache, so the rewrite is a bare jump installed in the
//! app-to-app phase. A native replacement routes to a routine that runs
//! outside the cache; a fixed-size table of generated return points, one
//! per distinct stack adjustment, brings control back into the cache at
//! the original return address.

use crate::{
    consts::{REPLACE_NATIVE_STUBS, WORD_SIZE},
    error::{Error, Result},
    host::HostRuntime,
    machine::{
        ilist::InsnList,
        insn::{Callee, CleanCallFlags, Insn},
        opnd::Opnd,
        reg::Gpr,
    },
};

use std::{collections::HashMap, sync::Mutex};
use tracing::debug;

/// A native replacement registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaceNative {
    /// Tool callee id executing natively in place of the function.
    pub replacement: u32,
    /// Replace at function entry (true) or at a mid-function point where
    /// the return address is already in place (false).
    pub at_entry: bool,
    /// Bytes of stack the native routine's return must clean beyond the
    /// return address.
    pub stack_adjust: u64,
    /// Opaque value handed to the native routine.
    pub user_data: u64,
}

/// Registration tables for both replacement flavors.
pub(crate) struct ReplaceTables {
    replace: Mutex<HashMap<u64, u64>>,
    replace_native: Mutex<HashMap<u64, ReplaceNative>>,
    /// Stack adjustments with a generated return stub.
    stub_adjusts: Mutex<Vec<u64>>,
}

impl ReplaceTables {
    pub(crate) fn new() -> Self {
        Self {
            replace: Mutex::new(HashMap::new()),
            replace_native: Mutex::new(HashMap::new()),
            stub_adjusts: Mutex::new(Vec::new()),
        }
    }

    /// Redirect execution at `orig` to `replacement`, both translated
    /// normally. Passing `None` removes an existing replacement.
    pub(crate) fn replace(
        &self,
        host: &mut dyn HostRuntime,
        orig: u64,
        replacement: Option<u64>,
    ) -> Result<()> {
        let mut table = self.replace.lock().expect("replace table poisoned");
        match replacement {
            Some(target) => {
                if table.insert(orig, target).is_some() {
                    debug!(orig, target, "replacement updated");
                }
            }
            None => {
                table.remove(&orig).ok_or(Error::InvalidParam)?;
            }
        }
        drop(table);
        // Stale translations of the original must not keep running.
        host.flush_region(orig, 1);
        Ok(())
    }

    /// Redirect `orig` to a routine running outside the code cache. The
    /// return stub for `stack_adjust` is generated on first use; the stub
    /// table is fixed-size.
    pub(crate) fn replace_native(
        &self,
        host: &mut dyn HostRuntime,
        orig: u64,
        registration: Option<ReplaceNative>,
    ) -> Result<()> {
        let mut table = self
            .replace_native
            .lock()
            .expect("replace-native table poisoned");
        match registration {
            Some(reg) => {
                let mut adjusts = self.stub_adjusts.lock().expect("stub table poisoned");
                if !adjusts.contains(&reg.stack_adjust) {
                    if adjusts.len() >= REPLACE_NATIVE_STUBS {
                        return Err(Error::FeatureNotAvailable);
                    }
                    adjusts.push(reg.stack_adjust);
                }
                table.insert(orig, reg);
            }
            None => {
                table.remove(&orig).ok_or(Error::InvalidParam)?;
            }
        }
        drop(table);
        host.flush_region(orig, 1);
        Ok(())
    }

    pub(crate) fn lookup(&self, orig: u64) -> Option<u64> {
        self.replace
            .lock()
            .expect("replace table poisoned")
            .get(&orig)
            .copied()
    }

    pub(crate) fn lookup_native(&self, orig: u64) -> Option<ReplaceNative> {
        self.replace_native
            .lock()
            .expect("replace-native table poisoned")
            .get(&orig)
            .copied()
    }

    /// App-to-app rewriting: a block starting at a replaced pc becomes a
    /// jump to the replacement (regular), or the native dispatch sequence
    /// followed by the generated return point (native).
    pub(crate) fn app2app(&self, ilist: &mut InsnList, start_pc: u64) -> bool {
        if let Some(target) = self.lookup(start_pc) {
            debug!(start_pc, target, "rewriting block to replacement jump");
            *ilist = InsnList::from_insns([Insn::jmp(target).app(start_pc)]);
            return true;
        }
        if let Some(native) = self.lookup_native(start_pc) {
            debug!(
                start_pc,
                native.replacement, "rewriting block to native dispatch"
            );
            *ilist = self.build_native_dispatch(start_pc, native);
            return true;
        }
        false
    }

    /// The native dispatch: run the routine via clean call, pop the call
    /// frame (return address plus, at entry, the declared stack
    /// adjustment), and re-enter the cache at the original return address.
    fn build_native_dispatch(&self, _pc: u64, native: ReplaceNative) -> InsnList {
        let mut ilist = InsnList::new();
        ilist.push_back(Insn::clean_call(
            Callee::Tool(native.replacement),
            [Opnd::imm(native.user_data as i64), Opnd::reg(Gpr::SP)],
            CleanCallFlags::READS_APP_CONTEXT | CleanCallFlags::WRITES_APP_CONTEXT,
        ));
        // At entry the frame still holds the arguments the routine was
        // declared to clean; mid-function, only the return address.
        let pop = if native.at_entry {
            WORD_SIZE as u64 + native.stack_adjust
        } else {
            WORD_SIZE as u64
        };
        let scratch = Gpr::new(14).expect("static scratch");
        ilist.push_back(Insn::load(
            scratch,
            crate::machine::opnd::MemRef::base_disp(Gpr::SP, 0, crate::machine::reg::Width::W8),
        ));
        ilist.push_back(Insn::add_noflags(Opnd::reg(Gpr::SP), Opnd::imm(pop as i64)));
        ilist.push_back(Insn::jmp_ind(scratch));
        ilist
    }
}
