//! The AVR instruction set.
//!
//! This module holds [`Instr`], the decoded form of an AVR instruction, along with
//! [`Reg`] (a general purpose register) and the pointer addressing modes used by the load/store family.
//!
//! Decoding is infallible. Every 16-bit word decodes to *some* [`Instr`],
//! with words that do not correspond to a supported encoding decoding to [`Instr::Undefined`].
//! Executing an undefined instruction is a fatal simulation error.
//!
//! Instruction aliases (`LSL`, `ROL`, `TST`, `CLR`, `SER`, `CBR`, `SBR`, the `BRxx` family,
//! and the `SEx`/`CLx` family) are not separate variants. They decode to the canonical instruction
//! they are encoded as, which has identical semantics.
//!
//! ```
//! use avr_sim::isa::{Instr, reg_consts::{R1, R16}};
//!
//! // LDI R16, 0x2A
//! assert_eq!(Instr::decode(0xE20A, 0), Instr::LDI { rd: R16, k: 0x2A });
//! // LSL R1 is encoded as ADD R1, R1
//! assert_eq!(Instr::decode(0x0C11, 0), Instr::ADD { rd: R1, rr: R1 });
//!
//! // JMP takes two words:
//! let jmp = Instr::decode(0x940C, 0x0100);
//! assert_eq!(jmp, Instr::JMP { k: 0x0100 });
//! assert_eq!(jmp.size(), 4);
//! ```

use std::fmt::Write as _;
use std::num::TryFromIntError;

/// A general purpose register. Must be between 0 and 31.
///
/// This `Reg` struct can either be constructed by selecting a register from [`reg_consts`],
/// or by using [`Reg::try_from`].
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct Reg(pub(crate) u8);

macro_rules! reg_consts {
    ($($name:ident = $no:literal),+) => {
        /// Register constants!
        pub mod reg_consts {
            use super::Reg;

            $(
                #[doc = concat!("General purpose register ", stringify!($no), ".")]
                pub const $name: Reg = Reg($no);
            )+
        }
    }
}
reg_consts!(
    R0 = 0, R1 = 1, R2 = 2, R3 = 3, R4 = 4, R5 = 5, R6 = 6, R7 = 7,
    R8 = 8, R9 = 9, R10 = 10, R11 = 11, R12 = 12, R13 = 13, R14 = 14, R15 = 15,
    R16 = 16, R17 = 17, R18 = 18, R19 = 19, R20 = 20, R21 = 21, R22 = 22, R23 = 23,
    R24 = 24, R25 = 25, R26 = 26, R27 = 27, R28 = 28, R29 = 29, R30 = 30, R31 = 31
);

impl Reg {
    /// Gets the register number of this [`Reg`]. This is always between 0 and 31.
    pub fn reg_no(self) -> u8 {
        self.0
    }
}
impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "R{}", self.0)
    }
}
impl From<Reg> for usize {
    fn from(value: Reg) -> Self {
        usize::from(value.0)
    }
}
impl TryFrom<u8> for Reg {
    type Error = TryFromIntError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0..=31 => Ok(Reg(value)),
            _      => u8::try_from(256u16).map(|_| unreachable!("should've been TryFromIntError")),
        }
    }
}

/// One of the three 16-bit pointer registers.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Ptr {
    /// `R27:R26`
    X,
    /// `R29:R28`
    Y,
    /// `R31:R30`
    Z
}
impl Ptr {
    /// The low register of this pointer pair.
    pub fn low(self) -> Reg {
        match self {
            Ptr::X => Reg(26),
            Ptr::Y => Reg(28),
            Ptr::Z => Reg(30),
        }
    }
}
impl std::fmt::Display for Ptr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ptr::X => f.write_char('X'),
            Ptr::Y => f.write_char('Y'),
            Ptr::Z => f.write_char('Z'),
        }
    }
}

/// How a pointer register is used (and updated) by `LD`/`ST`.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum PtrMode {
    /// Access `ptr + q`. `X` only supports `q == 0`.
    Disp(u8),
    /// Access `ptr`, then increment it.
    PostInc,
    /// Decrement `ptr`, then access it.
    PreDec
}

/// A decoded AVR instruction.
///
/// Addresses held in control flow instructions (`k`) are in words, as the hardware encodes them.
/// Relative offsets are signed word offsets from the following instruction.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[allow(missing_docs)]
pub enum Instr {
    // Two-register arithmetic and logic
    ADD { rd: Reg, rr: Reg },
    ADC { rd: Reg, rr: Reg },
    SUB { rd: Reg, rr: Reg },
    SBC { rd: Reg, rr: Reg },
    AND { rd: Reg, rr: Reg },
    OR { rd: Reg, rr: Reg },
    EOR { rd: Reg, rr: Reg },
    CP { rd: Reg, rr: Reg },
    CPC { rd: Reg, rr: Reg },
    CPSE { rd: Reg, rr: Reg },
    MOV { rd: Reg, rr: Reg },
    MOVW { rd: Reg, rr: Reg },

    // Register-immediate (R16-R31)
    SUBI { rd: Reg, k: u8 },
    SBCI { rd: Reg, k: u8 },
    ANDI { rd: Reg, k: u8 },
    ORI { rd: Reg, k: u8 },
    CPI { rd: Reg, k: u8 },
    LDI { rd: Reg, k: u8 },

    // Word-immediate (R24, R26, R28, R30)
    ADIW { rd: Reg, k: u8 },
    SBIW { rd: Reg, k: u8 },

    // Single register
    COM { rd: Reg },
    NEG { rd: Reg },
    INC { rd: Reg },
    DEC { rd: Reg },
    LSR { rd: Reg },
    ROR { rd: Reg },
    ASR { rd: Reg },
    SWAP { rd: Reg },
    PUSH { rr: Reg },
    POP { rd: Reg },

    // Multiplication
    MUL { rd: Reg, rr: Reg },
    MULS { rd: Reg, rr: Reg },
    MULSU { rd: Reg, rr: Reg },
    FMUL { rd: Reg, rr: Reg },
    FMULS { rd: Reg, rr: Reg },
    FMULSU { rd: Reg, rr: Reg },

    // Status and bit operations
    BSET { s: u8 },
    BCLR { s: u8 },
    BST { rd: Reg, b: u8 },
    BLD { rd: Reg, b: u8 },
    SBRC { rr: Reg, b: u8 },
    SBRS { rr: Reg, b: u8 },

    // Control flow
    BRBS { s: u8, k: i8 },
    BRBC { s: u8, k: i8 },
    RJMP { k: i16 },
    RCALL { k: i16 },
    JMP { k: u32 },
    CALL { k: u32 },
    IJMP,
    ICALL,
    EIJMP,
    EICALL,
    RET,
    RETI,

    // IO
    IN { rd: Reg, a: u8 },
    OUT { a: u8, rr: Reg },
    CBI { a: u8, b: u8 },
    SBI { a: u8, b: u8 },
    SBIC { a: u8, b: u8 },
    SBIS { a: u8, b: u8 },

    // Data memory
    LD { rd: Reg, ptr: Ptr, mode: PtrMode },
    ST { ptr: Ptr, mode: PtrMode, rr: Reg },
    LDS { rd: Reg, k: u16 },
    STS { k: u16, rr: Reg },

    // Program memory
    LPM { rd: Reg, inc: bool },
    ELPM { rd: Reg, inc: bool },
    SPM,

    // MCU control
    NOP,
    SLEEP,
    BREAK,
    WDR,

    /// A word which does not decode to a supported instruction.
    Undefined(u16),
}

fn rd5(w: u16) -> Reg {
    Reg(((w >> 4) & 0x1F) as u8)
}
fn rr5(w: u16) -> Reg {
    Reg((((w >> 5) & 0x10) | (w & 0xF)) as u8)
}
fn rd4(w: u16) -> Reg {
    Reg(16 + ((w >> 4) & 0xF) as u8)
}
fn k8(w: u16) -> u8 {
    (((w >> 4) & 0xF0) | (w & 0xF)) as u8
}
fn io5(w: u16) -> u8 {
    ((w >> 3) & 0x1F) as u8
}
fn bit3(w: u16) -> u8 {
    (w & 0x7) as u8
}

fn enc_rd_rr(op: u16, rd: Reg, rr: Reg) -> u16 {
    let (d, r) = (u16::from(rd.0), u16::from(rr.0));
    op | ((d & 0x1F) << 4) | ((r & 0x10) << 5) | (r & 0xF)
}
fn enc_rd_k(op: u16, rd: Reg, k: u8) -> u16 {
    let (d, k) = (u16::from(rd.0.wrapping_sub(16)), u16::from(k));
    op | ((d & 0xF) << 4) | ((k & 0xF0) << 4) | (k & 0xF)
}
fn enc_rd(op: u16, rd: Reg) -> u16 {
    op | ((u16::from(rd.0) & 0x1F) << 4)
}
fn enc_io_bit(op: u16, a: u8, b: u8) -> u16 {
    op | ((u16::from(a) & 0x1F) << 3) | (u16::from(b) & 0x7)
}
fn enc_far(op: u16, k: u32) -> (u16, Option<u16>) {
    let hi = ((k >> 16) & 0x3F) as u16;
    (op | ((hi >> 1) << 4) | (hi & 1), Some(k as u16))
}

impl Instr {
    /// Decodes the instruction starting at `word`.
    ///
    /// `next` is the word following `word` in program memory.
    /// It is only consulted by the 32-bit instructions (`JMP`, `CALL`, `LDS`, `STS`).
    pub fn decode(word: u16, next: u16) -> Instr {
        let w = word;
        match w >> 12 {
            0x0 => match (w >> 10) & 0x3 {
                0b00 => match (w >> 8) & 0x3 {
                    0b00 if w == 0 => Instr::NOP,
                    0b00 => Instr::Undefined(w),
                    0b01 => Instr::MOVW { rd: Reg((((w >> 4) & 0xF) * 2) as u8), rr: Reg(((w & 0xF) * 2) as u8) },
                    0b10 => Instr::MULS { rd: rd4(w), rr: Reg(16 + (w & 0xF) as u8) },
                    _ => {
                        let rd = Reg(16 + ((w >> 4) & 0x7) as u8);
                        let rr = Reg(16 + (w & 0x7) as u8);
                        match (w & 0x80 != 0, w & 0x08 != 0) {
                            (false, false) => Instr::MULSU { rd, rr },
                            (false, true)  => Instr::FMUL { rd, rr },
                            (true,  false) => Instr::FMULS { rd, rr },
                            (true,  true)  => Instr::FMULSU { rd, rr },
                        }
                    }
                },
                0b01 => Instr::CPC { rd: rd5(w), rr: rr5(w) },
                0b10 => Instr::SBC { rd: rd5(w), rr: rr5(w) },
                _    => Instr::ADD { rd: rd5(w), rr: rr5(w) },
            },
            0x1 => match (w >> 10) & 0x3 {
                0b00 => Instr::CPSE { rd: rd5(w), rr: rr5(w) },
                0b01 => Instr::CP { rd: rd5(w), rr: rr5(w) },
                0b10 => Instr::SUB { rd: rd5(w), rr: rr5(w) },
                _    => Instr::ADC { rd: rd5(w), rr: rr5(w) },
            },
            0x2 => match (w >> 10) & 0x3 {
                0b00 => Instr::AND { rd: rd5(w), rr: rr5(w) },
                0b01 => Instr::EOR { rd: rd5(w), rr: rr5(w) },
                0b10 => Instr::OR { rd: rd5(w), rr: rr5(w) },
                _    => Instr::MOV { rd: rd5(w), rr: rr5(w) },
            },
            0x3 => Instr::CPI { rd: rd4(w), k: k8(w) },
            0x4 => Instr::SBCI { rd: rd4(w), k: k8(w) },
            0x5 => Instr::SUBI { rd: rd4(w), k: k8(w) },
            0x6 => Instr::ORI { rd: rd4(w), k: k8(w) },
            0x7 => Instr::ANDI { rd: rd4(w), k: k8(w) },
            0x8 | 0xA => {
                let q = (((w >> 8) & 0x20) | ((w >> 7) & 0x18) | (w & 0x7)) as u8;
                let ptr = if w & 0x8 != 0 { Ptr::Y } else { Ptr::Z };
                let mode = PtrMode::Disp(q);
                match w & 0x0200 != 0 {
                    false => Instr::LD { rd: rd5(w), ptr, mode },
                    true  => Instr::ST { ptr, mode, rr: rd5(w) },
                }
            },
            0x9 => Self::decode_9(w, next),
            0xB => {
                let a = (((w >> 5) & 0x30) | (w & 0xF)) as u8;
                match w & 0x0800 != 0 {
                    false => Instr::IN { rd: rd5(w), a },
                    true  => Instr::OUT { a, rr: rd5(w) },
                }
            },
            0xC => Instr::RJMP { k: ((w << 4) as i16) >> 4 },
            0xD => Instr::RCALL { k: ((w << 4) as i16) >> 4 },
            0xE => Instr::LDI { rd: rd4(w), k: k8(w) },
            _ => {
                let s = bit3(w);
                match (w >> 9) & 0x7 {
                    0b000 | 0b001 => Instr::BRBS { s, k: ((((w >> 3) & 0x7F) as u8) << 1) as i8 >> 1 },
                    0b010 | 0b011 => Instr::BRBC { s, k: ((((w >> 3) & 0x7F) as u8) << 1) as i8 >> 1 },
                    _ if w & 0x8 != 0 => Instr::Undefined(w),
                    0b100 => Instr::BLD { rd: rd5(w), b: s },
                    0b101 => Instr::BST { rd: rd5(w), b: s },
                    0b110 => Instr::SBRC { rr: rd5(w), b: s },
                    _     => Instr::SBRS { rr: rd5(w), b: s },
                }
            }
        }
    }

    /// Decodes the `1001 xxxx xxxx xxxx` block, which holds most of the irregular encodings.
    fn decode_9(w: u16, next: u16) -> Instr {
        match (w >> 9) & 0x7 {
            0b000 => {
                let rd = rd5(w);
                match w & 0xF {
                    0x0 => Instr::LDS { rd, k: next },
                    0x1 => Instr::LD { rd, ptr: Ptr::Z, mode: PtrMode::PostInc },
                    0x2 => Instr::LD { rd, ptr: Ptr::Z, mode: PtrMode::PreDec },
                    0x4 => Instr::LPM { rd, inc: false },
                    0x5 => Instr::LPM { rd, inc: true },
                    0x6 => Instr::ELPM { rd, inc: false },
                    0x7 => Instr::ELPM { rd, inc: true },
                    0x9 => Instr::LD { rd, ptr: Ptr::Y, mode: PtrMode::PostInc },
                    0xA => Instr::LD { rd, ptr: Ptr::Y, mode: PtrMode::PreDec },
                    0xC => Instr::LD { rd, ptr: Ptr::X, mode: PtrMode::Disp(0) },
                    0xD => Instr::LD { rd, ptr: Ptr::X, mode: PtrMode::PostInc },
                    0xE => Instr::LD { rd, ptr: Ptr::X, mode: PtrMode::PreDec },
                    0xF => Instr::POP { rd },
                    _   => Instr::Undefined(w),
                }
            },
            0b001 => {
                let rr = rd5(w);
                match w & 0xF {
                    0x0 => Instr::STS { k: next, rr },
                    0x1 => Instr::ST { ptr: Ptr::Z, mode: PtrMode::PostInc, rr },
                    0x2 => Instr::ST { ptr: Ptr::Z, mode: PtrMode::PreDec, rr },
                    0x9 => Instr::ST { ptr: Ptr::Y, mode: PtrMode::PostInc, rr },
                    0xA => Instr::ST { ptr: Ptr::Y, mode: PtrMode::PreDec, rr },
                    0xC => Instr::ST { ptr: Ptr::X, mode: PtrMode::Disp(0), rr },
                    0xD => Instr::ST { ptr: Ptr::X, mode: PtrMode::PostInc, rr },
                    0xE => Instr::ST { ptr: Ptr::X, mode: PtrMode::PreDec, rr },
                    0xF => Instr::PUSH { rr },
                    _   => Instr::Undefined(w),
                }
            },
            0b010 => {
                let rd = rd5(w);
                match w & 0xF {
                    0x0 => Instr::COM { rd },
                    0x1 => Instr::NEG { rd },
                    0x2 => Instr::SWAP { rd },
                    0x3 => Instr::INC { rd },
                    0x5 => Instr::ASR { rd },
                    0x6 => Instr::LSR { rd },
                    0x7 => Instr::ROR { rd },
                    0xA => Instr::DEC { rd },
                    0x8 => match w {
                        0x9408..=0x9478 if w & 0x8F == 0x08 => Instr::BSET { s: ((w >> 4) & 0x7) as u8 },
                        0x9488..=0x94F8 if w & 0x8F == 0x88 => Instr::BCLR { s: ((w >> 4) & 0x7) as u8 },
                        0x9508 => Instr::RET,
                        0x9518 => Instr::RETI,
                        0x9588 => Instr::SLEEP,
                        0x9598 => Instr::BREAK,
                        0x95A8 => Instr::WDR,
                        0x95C8 => Instr::LPM { rd: Reg(0), inc: false },
                        0x95D8 => Instr::ELPM { rd: Reg(0), inc: false },
                        0x95E8 => Instr::SPM,
                        _ => Instr::Undefined(w),
                    },
                    0x9 => match w {
                        0x9409 => Instr::IJMP,
                        0x9419 => Instr::EIJMP,
                        0x9509 => Instr::ICALL,
                        0x9519 => Instr::EICALL,
                        _ => Instr::Undefined(w),
                    },
                    0xC | 0xD | 0xE | 0xF => {
                        let k = ((u32::from(w >> 4) & 0x1F) << 17) | (u32::from(w & 1) << 16) | u32::from(next);
                        match w & 0x2 != 0 {
                            false => Instr::JMP { k },
                            true  => Instr::CALL { k },
                        }
                    },
                    _ => Instr::Undefined(w),
                }
            },
            0b011 => {
                let rd = Reg(24 + 2 * ((w >> 4) & 0x3) as u8);
                let k = (((w >> 2) & 0x30) | (w & 0xF)) as u8;
                match w & 0x0100 != 0 {
                    false => Instr::ADIW { rd, k },
                    true  => Instr::SBIW { rd, k },
                }
            },
            0b100 => match w & 0x0100 != 0 {
                false => Instr::CBI { a: io5(w), b: bit3(w) },
                true  => Instr::SBIC { a: io5(w), b: bit3(w) },
            },
            0b101 => match w & 0x0100 != 0 {
                false => Instr::SBI { a: io5(w), b: bit3(w) },
                true  => Instr::SBIS { a: io5(w), b: bit3(w) },
            },
            _ => Instr::MUL { rd: rd5(w), rr: rr5(w) },
        }
    }

    /// Encodes this instruction into its machine words.
    ///
    /// The second word is present only for 32-bit instructions.
    /// Operands which do not fit their field are truncated to the field width.
    pub fn encode(&self) -> (u16, Option<u16>) {
        let single = |w: u16| (w, None);
        let ld_st = |store: bool, r: Reg, ptr: Ptr, mode: PtrMode| {
            let base = if store { 0x9200 } else { 0x9000 };
            let w = match (ptr, mode) {
                (Ptr::X, PtrMode::Disp(_)) => enc_rd(base | 0xC, r),
                (Ptr::X, PtrMode::PostInc) => enc_rd(base | 0xD, r),
                (Ptr::X, PtrMode::PreDec)  => enc_rd(base | 0xE, r),
                (Ptr::Y, PtrMode::PostInc) => enc_rd(base | 0x9, r),
                (Ptr::Y, PtrMode::PreDec)  => enc_rd(base | 0xA, r),
                (Ptr::Z, PtrMode::PostInc) => enc_rd(base | 0x1, r),
                (Ptr::Z, PtrMode::PreDec)  => enc_rd(base | 0x2, r),
                (Ptr::Y | Ptr::Z, PtrMode::Disp(q)) => {
                    let q = u16::from(q);
                    let y = if ptr == Ptr::Y { 0x8 } else { 0 };
                    let s = if store { 0x0200 } else { 0 };
                    enc_rd(0x8000 | s | y | ((q & 0x20) << 8) | ((q & 0x18) << 7) | (q & 0x7), r)
                }
            };
            (w, None)
        };

        match *self {
            Instr::ADD { rd, rr }  => single(enc_rd_rr(0x0C00, rd, rr)),
            Instr::ADC { rd, rr }  => single(enc_rd_rr(0x1C00, rd, rr)),
            Instr::SUB { rd, rr }  => single(enc_rd_rr(0x1800, rd, rr)),
            Instr::SBC { rd, rr }  => single(enc_rd_rr(0x0800, rd, rr)),
            Instr::AND { rd, rr }  => single(enc_rd_rr(0x2000, rd, rr)),
            Instr::OR { rd, rr }   => single(enc_rd_rr(0x2800, rd, rr)),
            Instr::EOR { rd, rr }  => single(enc_rd_rr(0x2400, rd, rr)),
            Instr::CP { rd, rr }   => single(enc_rd_rr(0x1400, rd, rr)),
            Instr::CPC { rd, rr }  => single(enc_rd_rr(0x0400, rd, rr)),
            Instr::CPSE { rd, rr } => single(enc_rd_rr(0x1000, rd, rr)),
            Instr::MOV { rd, rr }  => single(enc_rd_rr(0x2C00, rd, rr)),
            Instr::MOVW { rd, rr } => single(0x0100 | (u16::from(rd.0 / 2 & 0xF) << 4) | u16::from(rr.0 / 2 & 0xF)),
            Instr::SUBI { rd, k } => single(enc_rd_k(0x5000, rd, k)),
            Instr::SBCI { rd, k } => single(enc_rd_k(0x4000, rd, k)),
            Instr::ANDI { rd, k } => single(enc_rd_k(0x7000, rd, k)),
            Instr::ORI { rd, k }  => single(enc_rd_k(0x6000, rd, k)),
            Instr::CPI { rd, k }  => single(enc_rd_k(0x3000, rd, k)),
            Instr::LDI { rd, k }  => single(enc_rd_k(0xE000, rd, k)),
            Instr::ADIW { rd, k } | Instr::SBIW { rd, k } => {
                let op = if matches!(self, Instr::ADIW { .. }) { 0x9600 } else { 0x9700 };
                let d = u16::from(rd.0.wrapping_sub(24) / 2 & 0x3);
                let k = u16::from(k);
                single(op | (d << 4) | ((k & 0x30) << 2) | (k & 0xF))
            },
            Instr::COM { rd }  => single(enc_rd(0x9400, rd)),
            Instr::NEG { rd }  => single(enc_rd(0x9401, rd)),
            Instr::SWAP { rd } => single(enc_rd(0x9402, rd)),
            Instr::INC { rd }  => single(enc_rd(0x9403, rd)),
            Instr::ASR { rd }  => single(enc_rd(0x9405, rd)),
            Instr::LSR { rd }  => single(enc_rd(0x9406, rd)),
            Instr::ROR { rd }  => single(enc_rd(0x9407, rd)),
            Instr::DEC { rd }  => single(enc_rd(0x940A, rd)),
            Instr::PUSH { rr } => single(enc_rd(0x920F, rr)),
            Instr::POP { rd }  => single(enc_rd(0x900F, rd)),
            Instr::MUL { rd, rr }  => single(enc_rd_rr(0x9C00, rd, rr)),
            Instr::MULS { rd, rr } => single(0x0200 | (u16::from(rd.0.wrapping_sub(16) & 0xF) << 4) | u16::from(rr.0.wrapping_sub(16) & 0xF)),
            Instr::MULSU { rd, rr } | Instr::FMUL { rd, rr } | Instr::FMULS { rd, rr } | Instr::FMULSU { rd, rr } => {
                let op = match self {
                    Instr::MULSU { .. } => 0x0300,
                    Instr::FMUL { .. }  => 0x0308,
                    Instr::FMULS { .. } => 0x0380,
                    _                   => 0x0388,
                };
                single(op | (u16::from(rd.0.wrapping_sub(16) & 0x7) << 4) | u16::from(rr.0.wrapping_sub(16) & 0x7))
            },
            Instr::BSET { s } => single(0x9408 | (u16::from(s & 0x7) << 4)),
            Instr::BCLR { s } => single(0x9488 | (u16::from(s & 0x7) << 4)),
            Instr::BLD { rd, b }  => single(enc_rd(0xF800, rd) | u16::from(b & 0x7)),
            Instr::BST { rd, b }  => single(enc_rd(0xFA00, rd) | u16::from(b & 0x7)),
            Instr::SBRC { rr, b } => single(enc_rd(0xFC00, rr) | u16::from(b & 0x7)),
            Instr::SBRS { rr, b } => single(enc_rd(0xFE00, rr) | u16::from(b & 0x7)),
            Instr::BRBS { s, k } => single(0xF000 | ((k as u16 & 0x7F) << 3) | u16::from(s & 0x7)),
            Instr::BRBC { s, k } => single(0xF400 | ((k as u16 & 0x7F) << 3) | u16::from(s & 0x7)),
            Instr::RJMP { k }  => single(0xC000 | (k as u16 & 0x0FFF)),
            Instr::RCALL { k } => single(0xD000 | (k as u16 & 0x0FFF)),
            Instr::JMP { k }  => enc_far(0x940C, k),
            Instr::CALL { k } => enc_far(0x940E, k),
            Instr::IJMP   => single(0x9409),
            Instr::ICALL  => single(0x9509),
            Instr::EIJMP  => single(0x9419),
            Instr::EICALL => single(0x9519),
            Instr::RET    => single(0x9508),
            Instr::RETI   => single(0x9518),
            Instr::IN { rd, a }  => single(enc_rd(0xB000, rd) | ((u16::from(a) & 0x30) << 5) | (u16::from(a) & 0xF)),
            Instr::OUT { a, rr } => single(enc_rd(0xB800, rr) | ((u16::from(a) & 0x30) << 5) | (u16::from(a) & 0xF)),
            Instr::CBI { a, b }  => single(enc_io_bit(0x9800, a, b)),
            Instr::SBIC { a, b } => single(enc_io_bit(0x9900, a, b)),
            Instr::SBI { a, b }  => single(enc_io_bit(0x9A00, a, b)),
            Instr::SBIS { a, b } => single(enc_io_bit(0x9B00, a, b)),
            Instr::LD { rd, ptr, mode } => ld_st(false, rd, ptr, mode),
            Instr::ST { ptr, mode, rr } => ld_st(true, rr, ptr, mode),
            Instr::LDS { rd, k } => (enc_rd(0x9000, rd), Some(k)),
            Instr::STS { k, rr } => (enc_rd(0x9200, rr), Some(k)),
            Instr::LPM { rd: Reg(0), inc: false }  => single(0x95C8),
            Instr::ELPM { rd: Reg(0), inc: false } => single(0x95D8),
            Instr::LPM { rd, inc }  => single(enc_rd(0x9004 | u16::from(inc), rd)),
            Instr::ELPM { rd, inc } => single(enc_rd(0x9006 | u16::from(inc), rd)),
            Instr::SPM   => single(0x95E8),
            Instr::NOP   => single(0x0000),
            Instr::SLEEP => single(0x9588),
            Instr::BREAK => single(0x9598),
            Instr::WDR   => single(0x95A8),
            Instr::Undefined(w) => single(w),
        }
    }

    /// The size of this instruction in bytes (2 or 4).
    pub fn size(&self) -> u32 {
        match self {
            Instr::JMP { .. } | Instr::CALL { .. } | Instr::LDS { .. } | Instr::STS { .. } => 4,
            _ => 2
        }
    }

    /// Whether the word starts a 32-bit instruction.
    ///
    /// This only needs the first word, so it can be used to size an instruction
    /// without reading the word after it.
    pub fn is_two_word(word: u16) -> bool {
        word & 0xFE0E == 0x940C       // JMP
            || word & 0xFE0E == 0x940E  // CALL
            || word & 0xFE0F == 0x9000  // LDS
            || word & 0xFE0F == 0x9200  // STS
    }

    /// The mnemonic of this instruction.
    pub fn name(&self) -> &'static str {
        match self {
            Instr::ADD { .. }    => "ADD",
            Instr::ADC { .. }    => "ADC",
            Instr::SUB { .. }    => "SUB",
            Instr::SBC { .. }    => "SBC",
            Instr::AND { .. }    => "AND",
            Instr::OR { .. }     => "OR",
            Instr::EOR { .. }    => "EOR",
            Instr::CP { .. }     => "CP",
            Instr::CPC { .. }    => "CPC",
            Instr::CPSE { .. }   => "CPSE",
            Instr::MOV { .. }    => "MOV",
            Instr::MOVW { .. }   => "MOVW",
            Instr::SUBI { .. }   => "SUBI",
            Instr::SBCI { .. }   => "SBCI",
            Instr::ANDI { .. }   => "ANDI",
            Instr::ORI { .. }    => "ORI",
            Instr::CPI { .. }    => "CPI",
            Instr::LDI { .. }    => "LDI",
            Instr::ADIW { .. }   => "ADIW",
            Instr::SBIW { .. }   => "SBIW",
            Instr::COM { .. }    => "COM",
            Instr::NEG { .. }    => "NEG",
            Instr::INC { .. }    => "INC",
            Instr::DEC { .. }    => "DEC",
            Instr::LSR { .. }    => "LSR",
            Instr::ROR { .. }    => "ROR",
            Instr::ASR { .. }    => "ASR",
            Instr::SWAP { .. }   => "SWAP",
            Instr::PUSH { .. }   => "PUSH",
            Instr::POP { .. }    => "POP",
            Instr::MUL { .. }    => "MUL",
            Instr::MULS { .. }   => "MULS",
            Instr::MULSU { .. }  => "MULSU",
            Instr::FMUL { .. }   => "FMUL",
            Instr::FMULS { .. }  => "FMULS",
            Instr::FMULSU { .. } => "FMULSU",
            Instr::BSET { .. }   => "BSET",
            Instr::BCLR { .. }   => "BCLR",
            Instr::BST { .. }    => "BST",
            Instr::BLD { .. }    => "BLD",
            Instr::SBRC { .. }   => "SBRC",
            Instr::SBRS { .. }   => "SBRS",
            Instr::BRBS { .. }   => "BRBS",
            Instr::BRBC { .. }   => "BRBC",
            Instr::RJMP { .. }   => "RJMP",
            Instr::RCALL { .. }  => "RCALL",
            Instr::JMP { .. }    => "JMP",
            Instr::CALL { .. }   => "CALL",
            Instr::IJMP          => "IJMP",
            Instr::ICALL         => "ICALL",
            Instr::EIJMP         => "EIJMP",
            Instr::EICALL        => "EICALL",
            Instr::RET           => "RET",
            Instr::RETI          => "RETI",
            Instr::IN { .. }     => "IN",
            Instr::OUT { .. }    => "OUT",
            Instr::CBI { .. }    => "CBI",
            Instr::SBI { .. }    => "SBI",
            Instr::SBIC { .. }   => "SBIC",
            Instr::SBIS { .. }   => "SBIS",
            Instr::LD { mode: PtrMode::Disp(q), .. } if *q != 0 => "LDD",
            Instr::LD { .. }     => "LD",
            Instr::ST { mode: PtrMode::Disp(q), .. } if *q != 0 => "STD",
            Instr::ST { .. }     => "ST",
            Instr::LDS { .. }    => "LDS",
            Instr::STS { .. }    => "STS",
            Instr::LPM { .. }    => "LPM",
            Instr::ELPM { .. }   => "ELPM",
            Instr::SPM           => "SPM",
            Instr::NOP           => "NOP",
            Instr::SLEEP         => "SLEEP",
            Instr::BREAK         => "BREAK",
            Instr::WDR           => "WDR",
            Instr::Undefined(_)  => ".word",
        }
    }
}

struct PtrOperand(Ptr, PtrMode);
impl std::fmt::Display for PtrOperand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.1 {
            PtrMode::Disp(0) => write!(f, "{}", self.0),
            PtrMode::Disp(q) => write!(f, "{}+{q}", self.0),
            PtrMode::PostInc => write!(f, "{}+", self.0),
            PtrMode::PreDec  => write!(f, "-{}", self.0),
        }
    }
}

impl std::fmt::Display for Instr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self.name();
        match *self {
            Instr::ADD { rd, rr } | Instr::ADC { rd, rr } | Instr::SUB { rd, rr }
            | Instr::SBC { rd, rr } | Instr::AND { rd, rr } | Instr::OR { rd, rr }
            | Instr::EOR { rd, rr } | Instr::CP { rd, rr } | Instr::CPC { rd, rr }
            | Instr::CPSE { rd, rr } | Instr::MOV { rd, rr } | Instr::MOVW { rd, rr }
            | Instr::MUL { rd, rr } | Instr::MULS { rd, rr } | Instr::MULSU { rd, rr }
            | Instr::FMUL { rd, rr } | Instr::FMULS { rd, rr } | Instr::FMULSU { rd, rr } => write!(f, "{name} {rd}, {rr}"),
            Instr::SUBI { rd, k } | Instr::SBCI { rd, k } | Instr::ANDI { rd, k }
            | Instr::ORI { rd, k } | Instr::CPI { rd, k } | Instr::LDI { rd, k }
            | Instr::ADIW { rd, k } | Instr::SBIW { rd, k } => write!(f, "{name} {rd}, 0x{k:02X}"),
            Instr::COM { rd } | Instr::NEG { rd } | Instr::INC { rd } | Instr::DEC { rd }
            | Instr::LSR { rd } | Instr::ROR { rd } | Instr::ASR { rd } | Instr::SWAP { rd }
            | Instr::POP { rd } | Instr::PUSH { rr: rd } => write!(f, "{name} {rd}"),
            Instr::BSET { s } | Instr::BCLR { s } => write!(f, "{name} {s}"),
            Instr::BST { rd, b } | Instr::BLD { rd, b } | Instr::SBRC { rr: rd, b } | Instr::SBRS { rr: rd, b } => write!(f, "{name} {rd}, {b}"),
            Instr::BRBS { s, k } | Instr::BRBC { s, k } => write!(f, "{name} {s}, .{:+}", i32::from(k) * 2),
            Instr::RJMP { k } | Instr::RCALL { k } => write!(f, "{name} .{:+}", i32::from(k) * 2),
            Instr::JMP { k } | Instr::CALL { k } => write!(f, "{name} 0x{:04X}", k * 2),
            Instr::IN { rd, a }  => write!(f, "{name} {rd}, 0x{a:02X}"),
            Instr::OUT { a, rr } => write!(f, "{name} 0x{a:02X}, {rr}"),
            Instr::CBI { a, b } | Instr::SBI { a, b } | Instr::SBIC { a, b } | Instr::SBIS { a, b } => write!(f, "{name} 0x{a:02X}, {b}"),
            Instr::LD { rd, ptr, mode } => write!(f, "{name} {rd}, {}", PtrOperand(ptr, mode)),
            Instr::ST { ptr, mode, rr } => write!(f, "{name} {}, {rr}", PtrOperand(ptr, mode)),
            Instr::LDS { rd, k } => write!(f, "{name} {rd}, 0x{k:04X}"),
            Instr::STS { k, rr } => write!(f, "{name} 0x{k:04X}, {rr}"),
            Instr::LPM { rd: Reg(0), inc: false } | Instr::ELPM { rd: Reg(0), inc: false } => f.write_str(name),
            Instr::LPM { rd, inc } | Instr::ELPM { rd, inc } => {
                write!(f, "{name} {rd}, Z")?;
                if inc { f.write_char('+')?; }
                Ok(())
            },
            Instr::Undefined(w) => write!(f, "{name} 0x{w:04X}"),
            Instr::IJMP | Instr::ICALL | Instr::EIJMP | Instr::EICALL | Instr::RET | Instr::RETI
            | Instr::SPM | Instr::NOP | Instr::SLEEP | Instr::BREAK | Instr::WDR => f.write_str(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::reg_consts::*;
    use super::{Instr, Ptr, PtrMode};

    #[test]
    fn test_decode_aliases() {
        // CLR R5 = EOR R5, R5
        assert_eq!(Instr::decode(0x2455, 0), Instr::EOR { rd: R5, rr: R5 });
        // SER R17 = LDI R17, 0xFF
        assert_eq!(Instr::decode(0xEF1F, 0), Instr::LDI { rd: R17, k: 0xFF });
        // SEI = BSET 7, CLI = BCLR 7
        assert_eq!(Instr::decode(0x9478, 0), Instr::BSET { s: 7 });
        assert_eq!(Instr::decode(0x94F8, 0), Instr::BCLR { s: 7 });
        // BREQ .+4 = BRBS 1, 2
        assert_eq!(Instr::decode(0xF011, 0), Instr::BRBS { s: 1, k: 2 });
        // BRNE .-2 = BRBC 1, -1
        assert_eq!(Instr::decode(0xF7F9, 0), Instr::BRBC { s: 1, k: -1 });
    }

    #[test]
    fn test_decode_pointer_modes() {
        assert_eq!(Instr::decode(0x910D, 0), Instr::LD { rd: R16, ptr: Ptr::X, mode: PtrMode::PostInc });
        assert_eq!(Instr::decode(0x8108, 0), Instr::LD { rd: R16, ptr: Ptr::Y, mode: PtrMode::Disp(0) });
        // LDD R24, Z+63
        assert_eq!(Instr::decode(0xAD87, 0), Instr::LD { rd: R24, ptr: Ptr::Z, mode: PtrMode::Disp(63) });
        // STD Y+1, R25
        assert_eq!(Instr::decode(0x8399, 0), Instr::ST { ptr: Ptr::Y, mode: PtrMode::Disp(1), rr: R25 });
        assert_eq!(Instr::decode(0x93EA, 0), Instr::ST { ptr: Ptr::Y, mode: PtrMode::PreDec, rr: R30 });
    }

    #[test]
    fn test_decode_irregular() {
        assert_eq!(Instr::decode(0x0000, 0), Instr::NOP);
        assert_eq!(Instr::decode(0x0001, 0), Instr::Undefined(0x0001));
        assert_eq!(Instr::decode(0x9508, 0), Instr::RET);
        assert_eq!(Instr::decode(0x9518, 0), Instr::RETI);
        assert_eq!(Instr::decode(0x9598, 0), Instr::BREAK);
        assert_eq!(Instr::decode(0xFFFF, 0), Instr::Undefined(0xFFFF));
        assert_eq!(Instr::decode(0x9611, 0), Instr::ADIW { rd: R26, k: 1 });
        assert_eq!(Instr::decode(0x97E1, 0), Instr::SBIW { rd: R28, k: 0x31 });
        assert_eq!(Instr::decode(0x9A5A, 0), Instr::SBI { a: 0x0B, b: 2 });
        assert_eq!(Instr::decode(0xB78F, 0), Instr::IN { rd: R24, a: 0x3F });
        assert_eq!(Instr::decode(0xBF8D, 0), Instr::OUT { a: 0x3D, rr: R24 });
        assert_eq!(Instr::decode(0x9F23, 0), Instr::MUL { rd: R18, rr: R19 });
        assert_eq!(Instr::decode(0x0389, 0), Instr::FMULSU { rd: R16, rr: R17 });
        assert_eq!(Instr::decode(0x940E, 0x1234), Instr::CALL { k: 0x1234 });
        assert_eq!(Instr::decode(0x91E0, 0x0100), Instr::LDS { rd: R30, k: 0x0100 });
    }

    #[test]
    fn test_encode_inverts_decode() {
        let instrs = [
            Instr::ADD { rd: R31, rr: R17 },
            Instr::LDI { rd: R20, k: 0xA5 },
            Instr::MOVW { rd: R24, rr: R30 },
            Instr::MULSU { rd: R23, rr: R16 },
            Instr::ADIW { rd: R30, k: 63 },
            Instr::BRBC { s: 0, k: -64 },
            Instr::RJMP { k: -2048 },
            Instr::CALL { k: 0x3_FFFF },
            Instr::LD { rd: R1, ptr: Ptr::Z, mode: PtrMode::Disp(42) },
            Instr::ST { ptr: Ptr::X, mode: PtrMode::PreDec, rr: R0 },
            Instr::ELPM { rd: R4, inc: true },
            Instr::STS { k: 0x10FF, rr: R9 },
            Instr::SBIS { a: 31, b: 7 },
        ];
        for instr in instrs {
            let (w, next) = instr.encode();
            assert_eq!(Instr::decode(w, next.unwrap_or(0)), instr, "{instr}");
            assert_eq!(Instr::is_two_word(w), instr.size() == 4, "{instr}");
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(Instr::ADD { rd: R0, rr: R1 }.to_string(), "ADD R0, R1");
        assert_eq!(Instr::LD { rd: R2, ptr: Ptr::Y, mode: PtrMode::Disp(4) }.to_string(), "LDD R2, Y+4");
        assert_eq!(Instr::ST { ptr: Ptr::X, mode: PtrMode::PostInc, rr: R3 }.to_string(), "ST X+, R3");
        assert_eq!(Instr::RJMP { k: -1 }.to_string(), "RJMP .-2");
        assert_eq!(Instr::LPM { rd: R0, inc: false }.to_string(), "LPM");
    }
}
