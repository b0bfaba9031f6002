//! The wrapping context handed to pre and post callbacks.

use crate::{
    consts::WORD_SIZE,
    runtime::GlobalFlags,
    error::{Error, Result},
    host::HostRuntime,
    machine::mcontext::Mcontext,
    wrap::callconv::{ArgLocation, CallConv},
};

/// Which callback phase the context currently serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapWhere {
    /// Inside a pre-call callback.
    PreFunc,
    /// Inside a post-call callback.
    PostFunc,
    /// Context has been retired; queries are invalid.
    OutsideCallback,
}

/// Per-invocation wrapping context.
///
/// Arguments and the return value are resolved through the calling
/// convention in effect for the wrap being invoked; stack-resident
/// arguments go through the host's (optionally fault-tolerant) memory
/// access.
pub struct WrapCtx<'a> {
    host: &'a mut dyn HostRuntime,
    /// Wrapped function entry.
    pub(crate) func: u64,
    /// Return address of the intercepted call, when known.
    pub(crate) retaddr: Option<u64>,
    pub(crate) mc: &'a mut Mcontext,
    pub(crate) mc_modified: bool,
    pub(crate) callconv: CallConv,
    pub(crate) where_am_i: WrapWhere,
    pub(crate) skip_requested: bool,
    pub(crate) redirect_requested: bool,
    pub(crate) global: GlobalFlags,
    /// Stack pointer recorded at function entry; argument addressing for
    /// post callbacks is relative to this, not the current sp.
    pub(crate) entry_sp: u64,
}

impl<'a> WrapCtx<'a> {
    pub(crate) fn new(
        host: &'a mut dyn HostRuntime,
        func: u64,
        retaddr: Option<u64>,
        mc: &'a mut Mcontext,
        callconv: CallConv,
        where_am_i: WrapWhere,
        global: GlobalFlags,
        entry_sp: u64,
    ) -> Self {
        Self {
            host,
            func,
            retaddr,
            mc,
            mc_modified: false,
            callconv,
            where_am_i,
            skip_requested: false,
            redirect_requested: false,
            global,
            entry_sp,
        }
    }

    /// Entry pc of the wrapped function.
    pub fn func(&self) -> u64 {
        self.func
    }

    /// Return address of the intercepted call.
    pub fn retaddr(&self) -> Option<u64> {
        self.retaddr
    }

    /// Which callback phase this context serves.
    pub fn where_am_i(&self) -> WrapWhere {
        self.where_am_i
    }

    /// Calling convention of the wrap being invoked.
    pub fn callconv(&self) -> CallConv {
        self.callconv
    }

    /// Read the machine context.
    pub fn mcontext(&self) -> &Mcontext {
        self.mc
    }

    /// Mutate the machine context; changes are applied when the callback
    /// returns.
    pub fn mcontext_mut(&mut self) -> &mut Mcontext {
        self.mc_modified = true;
        self.mc
    }

    /// Read the i-th argument of the wrapped call. Only valid in a pre
    /// callback (stack arguments may be dead afterwards).
    pub fn arg(&self, index: usize) -> Result<u64> {
        match self.callconv.arg_location(self.entry_sp, index) {
            ArgLocation::Register(reg) => Ok(self.mc.reg(reg)),
            ArgLocation::Stack(addr) => {
                if self.global.contains(GlobalFlags::SAFE_READ_ARGS) {
                    let mut bytes = [0u8; WORD_SIZE];
                    if !self.host.safe_read(addr, &mut bytes) {
                        return Err(Error::MemoryFault);
                    }
                    Ok(u64::from_le_bytes(bytes))
                } else {
                    self.host.read_app_word(addr).ok_or(Error::MemoryFault)
                }
            }
        }
    }

    /// Overwrite the i-th argument.
    pub fn set_arg(&mut self, index: usize, value: u64) -> Result<()> {
        match self.callconv.arg_location(self.entry_sp, index) {
            ArgLocation::Register(reg) => {
                self.mc.set_reg(reg, value);
                self.mc_modified = true;
                Ok(())
            }
            ArgLocation::Stack(addr) => {
                if self.host.write_app_word(addr, value) {
                    Ok(())
                } else {
                    Err(Error::MemoryFault)
                }
            }
        }
    }

    /// Read the return value. Only meaningful in a post callback.
    pub fn retval(&self) -> Result<u64> {
        if self.where_am_i != WrapWhere::PostFunc {
            return Err(Error::IncompatibleState);
        }
        Ok(self.mc.reg(self.callconv.table().retval))
    }

    /// Overwrite the return value.
    pub fn set_retval(&mut self, value: u64) -> Result<()> {
        self.mc.set_reg(self.callconv.table().retval, value);
        self.mc_modified = true;
        Ok(())
    }

    /// Bypass the wrapped function entirely: set the return value, pop the
    /// call, and resume at the return address. Only valid in a pre
    /// callback. `stdcall_args_size` is the callee-cleaned byte count for
    /// conventions that need it.
    pub fn skip_call(&mut self, retval: u64, stdcall_args_size: u64) -> Result<()> {
        if self.where_am_i != WrapWhere::PreFunc {
            return Err(Error::IncompatibleState);
        }
        let retaddr = self.retaddr.ok_or(Error::IncompatibleState)?;
        self.set_retval(retval)?;
        if self.callconv.table().retaddr_on_stack {
            self.mc
                .set_sp(self.mc.sp().wrapping_add(stdcall_args_size + WORD_SIZE as u64));
        }
        self.mc.pc = retaddr;
        self.mc_modified = true;
        self.skip_requested = true;
        Ok(())
    }

    /// Request that execution resume from the (modified) machine context
    /// after the current callback, instead of falling through.
    pub fn redirect_execution(&mut self) -> Result<()> {
        if self.where_am_i == WrapWhere::OutsideCallback {
            return Err(Error::IncompatibleState);
        }
        self.mc_modified = true;
        self.redirect_requested = true;
        Ok(())
    }

    /// Whether a redirect has been requested on this context.
    pub fn is_redirect_requested(&self) -> bool {
        self.redirect_requested
    }

    /// Whether the callback has modified the machine context.
    pub fn is_mcontext_modified(&self) -> bool {
        self.mc_modified
    }

    /// Host services, for callbacks that need memory access.
    pub fn host(&mut self) -> &mut dyn HostRuntime {
        self.host
    }
}
