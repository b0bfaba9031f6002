//! Arithmetic-flags bitmask.

use bitflags::bitflags;

bitflags! {
    /// The arithmetic condition flags tracked by the reservation manager.
    ///
    /// Liveness for flags is a mask rather than a single bit: an
    /// instruction may read carry while writing the full set, and only the
    /// still-live subset needs preserving.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Aflags: u8 {
        /// Carry.
        const CF = 1 << 0;
        /// Parity.
        const PF = 1 << 1;
        /// Auxiliary carry.
        const AF = 1 << 2;
        /// Zero.
        const ZF = 1 << 3;
        /// Sign.
        const SF = 1 << 4;
        /// Overflow.
        const OF = 1 << 5;
    }
}

impl Aflags {
    /// The full arithmetic set.
    pub const ARITH: Aflags = Aflags::all();

    /// Pack into the low byte of a word, for the flags→register transport.
    pub const fn to_word(self) -> u64 {
        self.bits() as u64
    }

    /// Unpack from the low byte of a word.
    pub const fn from_word(word: u64) -> Self {
        Aflags::from_bits_truncate(word as u8)
    }
}
