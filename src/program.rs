//! Program images.
//!
//! A [`Program`] is the raw flash image a [`Simulator`] is loaded with.
//! Reading and parsing program files is left to the caller.
//! This module only handles the byte image and instruction access on top of it.
//!
//! ```
//! use avr_sim::isa::{Instr, reg_consts::R16};
//! use avr_sim::program::Program;
//!
//! let program = Program::from_instrs(&[
//!     Instr::LDI { rd: R16, k: 1 },
//!     Instr::JMP { k: 0 },
//! ]);
//! assert_eq!(program.len(), 6);
//! assert_eq!(program.read_instr(2), Some(Instr::JMP { k: 0 }));
//! assert_eq!(program.read_program_byte(0), Some(0x01));
//! ```
//!
//! [`Simulator`]: crate::sim::Simulator

use crate::isa::Instr;

/// A loaded flash image.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Program {
    bytes: Vec<u8>
}

impl Program {
    /// Creates a program from its little-endian byte image.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self { bytes: bytes.into() }
    }

    /// Creates a program from a sequence of instruction words.
    pub fn from_words(words: &[u16]) -> Self {
        let bytes = words.iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();

        Self { bytes }
    }

    /// Creates a program by encoding a sequence of instructions back to back.
    pub fn from_instrs(instrs: &[Instr]) -> Self {
        let words: Vec<_> = instrs.iter()
            .flat_map(|i| {
                let (w, next) = i.encode();
                std::iter::once(w).chain(next)
            })
            .collect();

        Self::from_words(&words)
    }

    /// The length of this program in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the program is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The byte image of this program.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Reads the byte at the given byte address, if it is part of the program.
    pub fn read_program_byte(&self, addr: usize) -> Option<u8> {
        self.bytes.get(addr).copied()
    }

    /// Reads the word at the given byte address, if it is part of the program.
    pub fn read_word(&self, addr: usize) -> Option<u16> {
        let lo = self.read_program_byte(addr)?;
        let hi = self.read_program_byte(addr + 1)?;
        Some(u16::from_le_bytes([lo, hi]))
    }

    /// Decodes the instruction at the given byte address.
    ///
    /// This returns `None` if the address is not word-aligned or not part of the program.
    /// A 32-bit instruction whose second word is past the end of the program
    /// is decoded with that word read as erased flash (`0xFFFF`).
    pub fn read_instr(&self, addr: usize) -> Option<Instr> {
        if addr % 2 != 0 { return None; }

        let word = self.read_word(addr)?;
        let next = self.read_word(addr + 2).unwrap_or(0xFFFF);
        Some(Instr::decode(word, next))
    }
}

#[cfg(test)]
mod tests {
    use crate::isa::Instr;
    use crate::isa::reg_consts::{R0, R1};

    use super::Program;

    #[test]
    fn test_words_little_endian() {
        let program = Program::from_words(&[0x1234, 0xABCD]);
        assert_eq!(program.as_bytes(), &[0x34, 0x12, 0xCD, 0xAB]);
        assert_eq!(program.read_word(2), Some(0xABCD));
        assert_eq!(program.read_word(3), None);
    }

    #[test]
    fn test_read_instr() {
        let program = Program::from_instrs(&[
            Instr::ADD { rd: R0, rr: R1 },
            Instr::STS { k: 0x0100, rr: R0 },
            Instr::BREAK,
        ]);

        assert_eq!(program.len(), 8);
        assert_eq!(program.read_instr(0), Some(Instr::ADD { rd: R0, rr: R1 }));
        assert_eq!(program.read_instr(1), None);
        assert_eq!(program.read_instr(2), Some(Instr::STS { k: 0x0100, rr: R0 }));
        assert_eq!(program.read_instr(6), Some(Instr::BREAK));
        assert_eq!(program.read_instr(8), None);
    }
}
