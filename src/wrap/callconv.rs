//! Calling-convention tables for argument and return-value access.
//!
//! The conventions form a closed set. For each, the i-th argument lives
//! either in a named register of the machine context (the first K
//! arguments) or on the stack at `sp + header + (i - K) * word`, where the
//! header accounts for the pushed return address and any reserved shadow
//! space. The return value lives in one fixed register.
//!
//! Register names are positions in the modeled register file; the host
//! runtime maps them onto hardware registers.

use crate::{consts::WORD_SIZE, machine::reg::Gpr};

const fn r(idx: u8) -> Gpr {
    match Gpr::new(idx) {
        Some(reg) => reg,
        None => panic!("register index out of range"),
    }
}

/// Supported calling conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallConv {
    /// All arguments on the stack above the return address.
    Cdecl,
    /// Stack arguments, callee cleans; layout identical to `Cdecl`.
    Stdcall,
    /// First two arguments in registers.
    Fastcall,
    /// Implicit object pointer in a register, rest on the stack.
    Thiscall,
    /// Four register arguments plus reserved shadow space.
    MsX64,
    /// Six register arguments, no shadow space.
    #[default]
    SysVx64,
    /// Four register arguments, return address in a link register.
    Arm32,
    /// Eight register arguments, return address in a link register.
    AArch64,
    /// Standard LP64 convention with register arguments.
    RiscvLp64,
}

/// Per-convention dispatch row.
#[derive(Debug, Clone, Copy)]
pub struct ConvTable {
    /// Registers carrying the first arguments, in order.
    pub reg_args: &'static [Gpr],
    /// Words between the entry stack pointer and the first stack argument
    /// (pushed return address plus any shadow space).
    pub stack_header_words: u8,
    /// Register carrying the return value.
    pub retval: Gpr,
    /// Whether the return address is on the stack (false: link register).
    pub retaddr_on_stack: bool,
}

impl CallConv {
    /// Dispatch row for this convention.
    pub const fn table(&self) -> ConvTable {
        match self {
            CallConv::Cdecl | CallConv::Stdcall => ConvTable {
                reg_args: &[],
                stack_header_words: 1,
                retval: r(0),
                retaddr_on_stack: true,
            },
            CallConv::Fastcall => ConvTable {
                reg_args: &[const { r(1) }, const { r(2) }],
                stack_header_words: 1,
                retval: r(0),
                retaddr_on_stack: true,
            },
            CallConv::Thiscall => ConvTable {
                reg_args: &[const { r(1) }],
                stack_header_words: 1,
                retval: r(0),
                retaddr_on_stack: true,
            },
            CallConv::MsX64 => ConvTable {
                reg_args: &[const { r(1) }, const { r(2) }, const { r(8) }, const { r(9) }],
                // Return address plus four shadow words.
                stack_header_words: 5,
                retval: r(0),
                retaddr_on_stack: true,
            },
            CallConv::SysVx64 => ConvTable {
                reg_args: &[const { r(7) }, const { r(6) }, const { r(2) }, const { r(1) }, const { r(8) }, const { r(9) }],
                stack_header_words: 1,
                retval: r(0),
                retaddr_on_stack: true,
            },
            CallConv::Arm32 => ConvTable {
                reg_args: &[const { r(0) }, const { r(1) }, const { r(2) }, const { r(3) }],
                stack_header_words: 0,
                retval: r(0),
                retaddr_on_stack: false,
            },
            CallConv::AArch64 => ConvTable {
                reg_args: &[const { r(0) }, const { r(1) }, const { r(2) }, const { r(3) }, const { r(4) }, const { r(5) }, const { r(6) }, const { r(7) }],
                stack_header_words: 0,
                retval: r(0),
                retaddr_on_stack: false,
            },
            CallConv::RiscvLp64 => ConvTable {
                reg_args: &[const { r(10) }, const { r(11) }, const { r(12) }, const { r(13) }],
                stack_header_words: 0,
                retval: r(10),
                retaddr_on_stack: false,
            },
        }
    }

    /// Where the i-th argument lives: a register, or a stack address
    /// relative to the entry stack pointer.
    pub fn arg_location(&self, sp: u64, index: usize) -> ArgLocation {
        let table = self.table();
        if index < table.reg_args.len() {
            ArgLocation::Register(table.reg_args[index])
        } else {
            let beyond = index - table.reg_args.len();
            let offset = (table.stack_header_words as u64 + beyond as u64)
                .wrapping_mul(WORD_SIZE as u64);
            ArgLocation::Stack(sp.wrapping_add(offset))
        }
    }
}

/// Resolved location of one argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLocation {
    /// Lives in a machine-context register.
    Register(Gpr),
    /// Lives at this application stack address.
    Stack(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(CallConv::SysVx64, 0 => ArgLocation::Register(r(7)); "sysv first in reg")]
    #[test_case(CallConv::SysVx64, 6 => ArgLocation::Stack(0x1000 + 8); "sysv seventh above retaddr")]
    #[test_case(CallConv::Cdecl, 0 => ArgLocation::Stack(0x1000 + 8); "cdecl first above retaddr")]
    #[test_case(CallConv::MsX64, 4 => ArgLocation::Stack(0x1000 + 40); "msx64 fifth above shadow")]
    #[test_case(CallConv::AArch64, 1 => ArgLocation::Register(r(1)); "aarch64 second in reg")]
    fn arg_locations(conv: CallConv, index: usize) -> ArgLocation {
        conv.arg_location(0x1000, index)
    }

    #[test]
    fn retval_register_is_fixed() {
        assert_eq!(CallConv::SysVx64.table().retval, r(0));
        assert_eq!(CallConv::RiscvLp64.table().retval, r(10));
    }
}
