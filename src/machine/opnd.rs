//! Instruction operands.

use crate::{
    host::tls::SlotHandle,
    machine::reg::{Gpr, Width},
};

use smallvec::SmallVec;

/// A memory reference of the form `[base + index + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRef {
    /// Base register, if any.
    pub base: Option<Gpr>,
    /// Index register, if any.
    pub index: Option<Gpr>,
    /// Constant displacement.
    pub disp: i64,
    /// Access width.
    pub width: Width,
}

impl MemRef {
    /// `[base + disp]` at the given width.
    pub const fn base_disp(base: Gpr, disp: i64, width: Width) -> Self {
        Self {
            base: Some(base),
            index: None,
            disp,
            width,
        }
    }

    /// Absolute `[disp]` reference.
    pub const fn absolute(disp: i64, width: Width) -> Self {
        Self {
            base: None,
            index: None,
            disp,
            width,
        }
    }

    /// Registers used in the address computation.
    pub fn regs_used(&self) -> impl Iterator<Item = Gpr> {
        self.base.into_iter().chain(self.index)
    }
}

/// An instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opnd {
    /// A register view at the given width. Widths below the full word
    /// alias the low-order bytes.
    Reg(Gpr, Width),
    /// An immediate value.
    Imm(i64, Width),
    /// A memory reference through general-purpose registers.
    Mem(MemRef),
    /// A raw TLS slot reached through the host's segment register. Private
    /// slots are always full-word, but subword views exist for the fast
    /// ring-pointer update.
    Slot(SlotHandle, Width),
}

impl Opnd {
    /// Full-width register operand.
    pub const fn reg(reg: Gpr) -> Self {
        Opnd::Reg(reg, Width::W8)
    }

    /// Full-width immediate operand.
    pub const fn imm(value: i64) -> Self {
        Opnd::Imm(value, Width::W8)
    }

    /// Full-width TLS slot operand.
    pub const fn slot(handle: SlotHandle) -> Self {
        Opnd::Slot(handle, Width::W8)
    }

    /// Access width of the operand.
    pub const fn width(&self) -> Width {
        match self {
            Opnd::Reg(_, w) | Opnd::Imm(_, w) | Opnd::Slot(_, w) => *w,
            Opnd::Mem(mem) => mem.width,
        }
    }

    /// Every register the operand touches, addressing registers included.
    pub fn regs_used(&self) -> SmallVec<[Gpr; 2]> {
        match self {
            Opnd::Reg(reg, _) => SmallVec::from_slice(&[*reg]),
            Opnd::Mem(mem) => mem.regs_used().collect(),
            Opnd::Imm(..) | Opnd::Slot(..) => SmallVec::new(),
        }
    }

    /// The register directly named, for register operands only.
    pub const fn as_reg(&self) -> Option<Gpr> {
        match self {
            Opnd::Reg(reg, _) => Some(*reg),
            _ => None,
        }
    }

    /// The memory reference, for memory operands only.
    pub const fn as_mem(&self) -> Option<MemRef> {
        match self {
            Opnd::Mem(mem) => Some(*mem),
            _ => None,
        }
    }

    /// Replace every use of `from` with `to`, returning whether anything
    /// changed.
    pub fn replace_reg(&mut self, from: Gpr, to: Gpr) -> bool {
        match self {
            Opnd::Reg(reg, _) if *reg == from => {
                *reg = to;
                true
            }
            Opnd::Mem(mem) => {
                let mut replaced = false;
                if mem.base == Some(from) {
                    mem.base = Some(to);
                    replaced = true;
                }
                if mem.index == Some(from) {
                    mem.index = Some(to);
                    replaced = true;
                }
                replaced
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_regs_used() {
        let r1 = Gpr::new(1).unwrap();
        let r2 = Gpr::new(2).unwrap();
        let mem = MemRef {
            base: Some(r1),
            index: Some(r2),
            disp: 8,
            width: Width::W8,
        };
        let used: Vec<_> = mem.regs_used().collect();
        assert_eq!(used, vec![r1, r2]);
    }

    #[test]
    fn replace_reg_in_mem() {
        let r1 = Gpr::new(1).unwrap();
        let r9 = Gpr::new(9).unwrap();
        let mut opnd = Opnd::Mem(MemRef::base_disp(r1, 0, Width::W4));
        assert!(opnd.replace_reg(r1, r9));
        assert_eq!(opnd.as_mem().unwrap().base, Some(r9));
    }
}
