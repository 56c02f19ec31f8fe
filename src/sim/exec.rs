//! Instruction semantics.
//!
//! [`Simulator::execute`] runs one decoded instruction against the simulator state,
//! commits the PC, and reports how many cycles the instruction took.
//! The caller advances the clock by that amount.

use crate::isa::{reg_consts::R0, Instr, Ptr, PtrMode, Reg};

use super::{PauseCondition, RunState, SimErr, Simulator, Sreg};

fn bit(value: u8, n: u8) -> bool {
    (value >> n) & 1 != 0
}

/// Flags of `ADD`/`ADC`.
fn add_flags(s: &mut Sreg, a: u8, b: u8, r: u8) {
    let carries = (a & b) | (b & !r) | (!r & a);
    s.set_h(bit(carries, 3));
    s.set_c(bit(carries, 7));
    s.set_v(bit((a & b & !r) | (!a & !b & r), 7));
    s.set_nzs(r);
}

/// Flags of the subtraction family.
///
/// If `chain` is set (`SBC`, `SBCI`, `CPC`), `Z` can only be cleared.
fn sub_flags(s: &mut Sreg, a: u8, b: u8, r: u8, chain: bool) {
    let borrows = (!a & b) | (b & r) | (r & !a);
    let z = s.z();
    s.set_h(bit(borrows, 3));
    s.set_c(bit(borrows, 7));
    s.set_v(bit((a & !b & !r) | (!a & b & r), 7));
    s.set_nzs(r);
    if chain {
        s.set_z(r == 0 && z);
    }
}

/// Flags of the logic family.
fn logic_flags(s: &mut Sreg, r: u8) {
    s.set_v(false);
    s.set_nzs(r);
}

/// Flags of the right shifts, where `c` is the bit shifted out.
fn shift_flags(s: &mut Sreg, r: u8, c: bool) {
    s.set_c(c);
    s.set_n(bit(r, 7));
    s.set_z(r == 0);
    s.set_v(s.n() ^ s.c());
    s.set_s(s.n() ^ s.v());
}

/// Flags of the multiply family, where `c` is bit 15 of the unshifted product.
fn mul_flags(s: &mut Sreg, r: u16, c: bool) {
    s.set_c(c);
    s.set_z(r == 0);
}

impl Simulator {
    fn unimplemented(&self, instr: Instr) -> SimErr {
        SimErr::UnimplementedInstr { pc: self.pc, opcode: instr.encode().0, name: instr.name() }
    }

    /// A PC-relative target, wrapped around flash.
    fn relative(&self, next: u32, k: i32) -> u32 {
        let len = self.flash.len().max(2) as i64;
        (i64::from(next) + 2 * i64::from(k)).rem_euclid(len) as u32
    }

    /// The PC after skipping the instruction at `next`, and the cycles the skip costs.
    fn skip(&self, next: u32) -> (u32, u64) {
        let a = next as usize;
        let word = u16::from_le_bytes([self.flash.read(a), self.flash.read(a + 1)]);
        match Instr::is_two_word(word) {
            true  => (next + 4, 3),
            false => (next + 2, 2),
        }
    }

    /// The data address a `LD`/`ST` accesses, applying the pointer update.
    fn ptr_address(&mut self, ptr: Ptr, mode: PtrMode) -> u16 {
        let p = self.pointer(ptr);
        match mode {
            PtrMode::Disp(q) => p.wrapping_add(u16::from(q)),
            PtrMode::PostInc => {
                self.set_pointer(ptr, p.wrapping_add(1));
                p
            },
            PtrMode::PreDec => {
                let p = p.wrapping_sub(1);
                self.set_pointer(ptr, p);
                p
            },
        }
    }

    /// `RAMPZ:Z`.
    fn extended_z(&self) -> u32 {
        u32::from(self.io_stored(self.props.rampz)) << 16 | u32::from(self.pointer(Ptr::Z))
    }
    fn set_extended_z(&mut self, z: u32) {
        let [lo, hi, ext, _] = z.to_le_bytes();
        self.set_pointer(Ptr::Z, u16::from_le_bytes([lo, hi]));
        self.set_io_stored(self.props.rampz, ext);
    }

    fn mul(&mut self, a: i32, b: i32, shift: bool) {
        let product = (a * b) as u16;
        let r = match shift {
            true  => product << 1,
            false => product,
        };
        mul_flags(&mut self.sreg, r, product & 0x8000 != 0);
        self.set_reg_pair(R0, r);
    }

    /// Executes one instruction at the PC and commits the next PC.
    ///
    /// This returns the number of cycles the instruction took.
    pub(super) fn execute(&mut self, instr: Instr) -> Result<u64, SimErr> {
        let next = self.pc.wrapping_add(instr.size());
        let mut new_pc = next;

        let cycles = match instr {
            Instr::ADD { rd, rr } | Instr::ADC { rd, rr } => {
                let (a, b) = (self.reg(rd), self.reg(rr));
                let c = matches!(instr, Instr::ADC { .. }) && self.sreg.c();
                let r = a.wrapping_add(b).wrapping_add(u8::from(c));
                add_flags(&mut self.sreg, a, b, r);
                self.set_reg(rd, r);
                1
            },
            Instr::SUB { rd, rr } | Instr::SBC { rd, rr } => {
                let chain = matches!(instr, Instr::SBC { .. });
                let r = self.subtract(rd, self.reg(rr), chain);
                self.set_reg(rd, r);
                1
            },
            Instr::SUBI { rd, k } | Instr::SBCI { rd, k } => {
                let chain = matches!(instr, Instr::SBCI { .. });
                let r = self.subtract(rd, k, chain);
                self.set_reg(rd, r);
                1
            },
            Instr::CP { rd, rr } | Instr::CPC { rd, rr } => {
                self.subtract(rd, self.reg(rr), matches!(instr, Instr::CPC { .. }));
                1
            },
            Instr::CPI { rd, k } => {
                self.subtract(rd, k, false);
                1
            },
            Instr::AND { rd, rr } => self.logic(rd, self.reg(rr), |a, b| a & b),
            Instr::OR { rd, rr } => self.logic(rd, self.reg(rr), |a, b| a | b),
            Instr::EOR { rd, rr } => self.logic(rd, self.reg(rr), |a, b| a ^ b),
            Instr::ANDI { rd, k } => self.logic(rd, k, |a, b| a & b),
            Instr::ORI { rd, k } => self.logic(rd, k, |a, b| a | b),
            Instr::CPSE { rd, rr } => match self.reg(rd) == self.reg(rr) {
                true => {
                    let (pc, cycles) = self.skip(next);
                    new_pc = pc;
                    cycles
                },
                false => 1,
            },
            Instr::MOV { rd, rr } => {
                self.set_reg(rd, self.reg(rr));
                1
            },
            Instr::MOVW { rd, rr } => {
                self.set_reg_pair(rd, self.reg_pair(rr));
                1
            },
            Instr::LDI { rd, k } => {
                self.set_reg(rd, k);
                1
            },

            Instr::ADIW { rd, k } => {
                let a = self.reg_pair(rd);
                let r = a.wrapping_add(u16::from(k));
                let (a15, r15) = (a & 0x8000 != 0, r & 0x8000 != 0);
                self.sreg.set_v(!a15 && r15);
                self.sreg.set_c(!r15 && a15);
                self.set_word_nzs(r);
                self.set_reg_pair(rd, r);
                2
            },
            Instr::SBIW { rd, k } => {
                let a = self.reg_pair(rd);
                let r = a.wrapping_sub(u16::from(k));
                let (a15, r15) = (a & 0x8000 != 0, r & 0x8000 != 0);
                self.sreg.set_v(a15 && !r15);
                self.sreg.set_c(r15 && !a15);
                self.set_word_nzs(r);
                self.set_reg_pair(rd, r);
                2
            },

            Instr::COM { rd } => {
                let r = !self.reg(rd);
                logic_flags(&mut self.sreg, r);
                self.sreg.set_c(true);
                self.set_reg(rd, r);
                1
            },
            Instr::NEG { rd } => {
                let a = self.reg(rd);
                let r = 0u8.wrapping_sub(a);
                sub_flags(&mut self.sreg, 0, a, r, false);
                self.set_reg(rd, r);
                1
            },
            Instr::INC { rd } => {
                let a = self.reg(rd);
                let r = a.wrapping_add(1);
                self.sreg.set_v(a == 0x7F);
                self.sreg.set_nzs(r);
                self.set_reg(rd, r);
                1
            },
            Instr::DEC { rd } => {
                let a = self.reg(rd);
                let r = a.wrapping_sub(1);
                self.sreg.set_v(a == 0x80);
                self.sreg.set_nzs(r);
                self.set_reg(rd, r);
                1
            },
            Instr::LSR { rd } => {
                let a = self.reg(rd);
                let r = a >> 1;
                shift_flags(&mut self.sreg, r, bit(a, 0));
                self.set_reg(rd, r);
                1
            },
            Instr::ROR { rd } => {
                let a = self.reg(rd);
                let r = a >> 1 | u8::from(self.sreg.c()) << 7;
                shift_flags(&mut self.sreg, r, bit(a, 0));
                self.set_reg(rd, r);
                1
            },
            Instr::ASR { rd } => {
                let a = self.reg(rd);
                let r = a >> 1 | a & 0x80;
                shift_flags(&mut self.sreg, r, bit(a, 0));
                self.set_reg(rd, r);
                1
            },
            Instr::SWAP { rd } => {
                self.set_reg(rd, self.reg(rd).rotate_left(4));
                1
            },
            Instr::PUSH { rr } => {
                self.push_byte(self.reg(rr))?;
                2
            },
            Instr::POP { rd } => {
                let v = self.pop_byte();
                self.set_reg(rd, v);
                2
            },

            Instr::MUL { rd, rr } => {
                self.mul(i32::from(self.reg(rd)), i32::from(self.reg(rr)), false);
                2
            },
            Instr::MULS { rd, rr } => {
                self.mul(i32::from(self.reg(rd) as i8), i32::from(self.reg(rr) as i8), false);
                2
            },
            Instr::MULSU { rd, rr } => {
                self.mul(i32::from(self.reg(rd) as i8), i32::from(self.reg(rr)), false);
                2
            },
            Instr::FMUL { rd, rr } => {
                self.mul(i32::from(self.reg(rd)), i32::from(self.reg(rr)), true);
                2
            },
            Instr::FMULS { rd, rr } => {
                self.mul(i32::from(self.reg(rd) as i8), i32::from(self.reg(rr) as i8), true);
                2
            },
            Instr::FMULSU { rd, rr } => {
                self.mul(i32::from(self.reg(rd) as i8), i32::from(self.reg(rr)), true);
                2
            },

            Instr::BSET { s: 7 } => {
                self.enable_interrupts();
                1
            },
            Instr::BCLR { s: 7 } => {
                self.disable_interrupts();
                1
            },
            Instr::BSET { s } => {
                self.sreg.set(1 << s, true);
                1
            },
            Instr::BCLR { s } => {
                self.sreg.set(1 << s, false);
                1
            },
            Instr::BST { rd, b } => {
                self.sreg.set_t(bit(self.reg(rd), b));
                1
            },
            Instr::BLD { rd, b } => {
                let v = self.reg(rd) & !(1 << b) | u8::from(self.sreg.t()) << b;
                self.set_reg(rd, v);
                1
            },
            Instr::SBRC { rr, b } | Instr::SBRS { rr, b } => {
                let want = matches!(instr, Instr::SBRS { .. });
                match bit(self.reg(rr), b) == want {
                    true => {
                        let (pc, cycles) = self.skip(next);
                        new_pc = pc;
                        cycles
                    },
                    false => 1,
                }
            },

            Instr::BRBS { s, k } | Instr::BRBC { s, k } => {
                let want = matches!(instr, Instr::BRBS { .. });
                match self.sreg.bit(s) == want {
                    true => {
                        new_pc = self.relative(next, i32::from(k));
                        2
                    },
                    false => 1,
                }
            },
            Instr::RJMP { k } => {
                new_pc = self.relative(next, i32::from(k));
                2
            },
            Instr::RCALL { k } => {
                self.push_pc(next / 2)?;
                new_pc = self.relative(next, i32::from(k));
                3
            },
            Instr::JMP { k } => {
                new_pc = k * 2;
                3
            },
            Instr::CALL { k } => {
                self.push_pc(next / 2)?;
                new_pc = k * 2;
                4
            },
            Instr::IJMP => {
                new_pc = u32::from(self.pointer(Ptr::Z)) * 2;
                2
            },
            Instr::ICALL => {
                self.push_pc(next / 2)?;
                new_pc = u32::from(self.pointer(Ptr::Z)) * 2;
                3
            },
            Instr::RET => {
                new_pc = self.pop_pc() * 2;
                4
            },
            Instr::RETI => {
                new_pc = self.pop_pc() * 2;
                self.enable_interrupts();
                self.just_returned = true;
                4
            },

            Instr::IN { rd, a } => {
                let v = self.read_io(a);
                self.set_reg(rd, v);
                1
            },
            Instr::OUT { a, rr } => {
                self.write_io(a, self.reg(rr))?;
                1
            },
            Instr::CBI { a, b } => {
                self.write_io_bit(a, b, false)?;
                2
            },
            Instr::SBI { a, b } => {
                self.write_io_bit(a, b, true)?;
                2
            },
            Instr::SBIC { a, b } | Instr::SBIS { a, b } => {
                let want = matches!(instr, Instr::SBIS { .. });
                match self.read_io_bit(a, b) == want {
                    true => {
                        let (pc, cycles) = self.skip(next);
                        new_pc = pc;
                        cycles
                    },
                    false => 1,
                }
            },

            Instr::LD { rd, ptr, mode } => {
                let addr = self.ptr_address(ptr, mode);
                let v = self.read_data(addr);
                self.set_reg(rd, v);
                2
            },
            Instr::ST { ptr, mode, rr } => {
                let v = self.reg(rr);
                let addr = self.ptr_address(ptr, mode);
                self.write_data(addr, v)?;
                2
            },
            Instr::LDS { rd, k } => {
                let v = self.read_data(k);
                self.set_reg(rd, v);
                2
            },
            Instr::STS { k, rr } => {
                self.write_data(k, self.reg(rr))?;
                2
            },

            Instr::LPM { rd, inc } => {
                let z = self.pointer(Ptr::Z);
                self.set_reg(rd, self.flash.read(usize::from(z)));
                if inc {
                    self.set_pointer(Ptr::Z, z.wrapping_add(1));
                }
                3
            },
            Instr::ELPM { rd, inc } => {
                let z = self.extended_z();
                self.set_reg(rd, self.flash.read(z as usize));
                if inc {
                    self.set_extended_z((z + 1) & 0xFF_FFFF);
                }
                3
            },
            Instr::SPM => {
                self.store_program_memory()?;
                1
            },

            Instr::NOP | Instr::WDR => 1,
            Instr::SLEEP => {
                log::debug!("sleeping at cycle {}", self.cycles());
                self.sleeping = true;
                self.state = RunState::Sleeping;
                self.inner_loop = false;
                1
            },
            Instr::BREAK => {
                log::debug!("BREAK at {:#07x}", self.pc);
                self.state = RunState::Stopped;
                self.halt = Some(PauseCondition::Break);
                1
            },

            Instr::EIJMP | Instr::EICALL | Instr::Undefined(_) => return Err(self.unimplemented(instr)),
        };

        self.pc = new_pc;
        Ok(cycles)
    }

    /// `rd - b` (minus carry if `chain`), setting the subtraction flags.
    fn subtract(&mut self, rd: Reg, b: u8, chain: bool) -> u8 {
        let a = self.reg(rd);
        let c = chain && self.sreg.c();
        let r = a.wrapping_sub(b).wrapping_sub(u8::from(c));
        sub_flags(&mut self.sreg, a, b, r, chain);
        r
    }

    fn logic(&mut self, rd: Reg, b: u8, f: fn(u8, u8) -> u8) -> u64 {
        let r = f(self.reg(rd), b);
        logic_flags(&mut self.sreg, r);
        self.set_reg(rd, r);
        1
    }

    fn set_word_nzs(&mut self, r: u16) {
        self.sreg.set_n(r & 0x8000 != 0);
        self.sreg.set_z(r == 0);
        self.sreg.set_s(self.sreg.n() ^ self.sreg.v());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::isa::reg_consts::*;
    use crate::isa::{Instr, Ptr, PtrMode, Reg};
    use crate::program::Program;
    use crate::sim::{SimErr, Simulator};

    fn run(instrs: &[Instr]) -> Simulator {
        let mut program = instrs.to_vec();
        program.push(Instr::BREAK);
        let mut sim = Simulator::default();
        sim.load_program(&Program::from_instrs(&program)).unwrap();
        sim.run().unwrap();
        assert!(sim.hit_break_instr(), "program did not reach BREAK");
        sim
    }

    /// Runs one instruction with the given registers set, returning the simulator.
    fn one(setup: &[(Reg, u8)], sreg: u8, instr: Instr) -> Simulator {
        let mut sim = Simulator::default();
        sim.load_program(&Program::from_instrs(&[instr])).unwrap();
        for &(r, v) in setup {
            sim.set_reg(r, v);
        }
        sim.set_sreg(sreg);
        sim.step_in().unwrap();
        sim
    }

    fn flags(sim: &Simulator) -> String {
        format!("{:?}", sim.sreg())
    }

    #[test]
    fn test_add_overflow() {
        let sim = one(&[(R16, 0x7F), (R17, 0x01)], 0, Instr::ADD { rd: R16, rr: R17 });
        assert_eq!(sim.reg(R16), 0x80);
        assert_eq!(flags(&sim), "Sreg(HVN)");

        let sim = one(&[(R16, 0xFF), (R17, 0x01)], 0, Instr::ADD { rd: R16, rr: R17 });
        assert_eq!(sim.reg(R16), 0);
        assert_eq!(flags(&sim), "Sreg(HZC)");

        // ADC takes the carry in
        let sim = one(&[(R16, 0x0F), (R17, 0x00)], 0b1, Instr::ADC { rd: R16, rr: R17 });
        assert_eq!(sim.reg(R16), 0x10);
        assert!(sim.sreg().h());
        assert!(!sim.sreg().c());
    }

    #[test]
    fn test_sub_flags() {
        let sim = one(&[(R16, 0x00), (R17, 0x01)], 0, Instr::SUB { rd: R16, rr: R17 });
        assert_eq!(sim.reg(R16), 0xFF);
        assert_eq!(flags(&sim), "Sreg(HSNC)");

        let sim = one(&[(R16, 0x80)], 0, Instr::SUBI { rd: R16, k: 1 });
        assert_eq!(sim.reg(R16), 0x7F);
        assert_eq!(flags(&sim), "Sreg(HSV)");

        // CPC only clears Z
        let sim = one(&[(R16, 0), (R17, 0)], 0, Instr::CPC { rd: R16, rr: R17 });
        assert!(!sim.sreg().z());
        let sim = one(&[(R16, 0), (R17, 0)], 0b10, Instr::CPC { rd: R16, rr: R17 });
        assert!(sim.sreg().z());
        assert_eq!(sim.reg(R16), 0);
    }

    #[test]
    fn test_sixteen_bit_subtract() {
        // 0x0100 - 0x0001 with SUB/SBC
        let sim = run(&[
            Instr::LDI { rd: R24, k: 0x00 },
            Instr::LDI { rd: R25, k: 0x01 },
            Instr::LDI { rd: R16, k: 0x01 },
            Instr::LDI { rd: R17, k: 0x00 },
            Instr::SUB { rd: R24, rr: R16 },
            Instr::SBC { rd: R25, rr: R17 },
        ]);
        assert_eq!(sim.reg_pair(R24), 0x00FF);
        assert!(!sim.sreg().z());
        assert!(!sim.sreg().c());
    }

    #[test]
    fn test_unary() {
        let sim = one(&[(R16, 0x80)], 0, Instr::NEG { rd: R16 });
        assert_eq!(sim.reg(R16), 0x80);
        assert!(sim.sreg().v());
        assert!(sim.sreg().c());

        let sim = one(&[(R16, 0x7F)], 0b1, Instr::INC { rd: R16 });
        assert_eq!(flags(&sim), "Sreg(VNC)");

        let sim = one(&[(R16, 0x80)], 0, Instr::DEC { rd: R16 });
        assert_eq!(sim.reg(R16), 0x7F);
        assert_eq!(flags(&sim), "Sreg(SV)");

        let sim = one(&[(R16, 0x0F)], 0, Instr::COM { rd: R16 });
        assert_eq!(sim.reg(R16), 0xF0);
        assert_eq!(flags(&sim), "Sreg(SNC)");

        let sim = one(&[(R16, 0x1E)], 0, Instr::SWAP { rd: R16 });
        assert_eq!(sim.reg(R16), 0xE1);
    }

    #[test]
    fn test_shifts() {
        let sim = one(&[(R16, 0x01)], 0, Instr::LSR { rd: R16 });
        assert_eq!(sim.reg(R16), 0);
        assert_eq!(flags(&sim), "Sreg(SVZC)");

        let sim = one(&[(R16, 0x02)], 0b1, Instr::ROR { rd: R16 });
        assert_eq!(sim.reg(R16), 0x81);
        assert!(!sim.sreg().c());
        assert!(sim.sreg().n());
        assert!(sim.sreg().v());

        let sim = one(&[(R16, 0x81)], 0, Instr::ASR { rd: R16 });
        assert_eq!(sim.reg(R16), 0xC0);
        assert!(sim.sreg().c());
        assert!(!sim.sreg().v());
    }

    #[test]
    fn test_word_immediate() {
        let sim = one(&[(R24, 0xFF), (R25, 0x7F)], 0, Instr::ADIW { rd: R24, k: 1 });
        assert_eq!(sim.reg_pair(R24), 0x8000);
        assert!(sim.sreg().v());
        assert!(sim.sreg().n());
        assert!(!sim.sreg().c());
        assert_eq!(sim.cycles(), 2);

        let sim = one(&[(R30, 0x00), (R31, 0x00)], 0, Instr::SBIW { rd: R30, k: 1 });
        assert_eq!(sim.pointer(Ptr::Z), 0xFFFF);
        assert!(sim.sreg().c());
        assert!(!sim.sreg().v());
    }

    #[test]
    fn test_multiply() {
        let sim = one(&[(R16, 200), (R17, 3)], 0, Instr::MUL { rd: R16, rr: R17 });
        assert_eq!(sim.reg_pair(R0), 600);
        assert!(!sim.sreg().c());

        let sim = one(&[(R16, 0xFF), (R17, 0x02)], 0, Instr::MULS { rd: R16, rr: R17 });
        assert_eq!(sim.reg_pair(R0), 0xFFFE);
        assert!(sim.sreg().c());

        let sim = one(&[(R16, 0xFF), (R17, 0x02)], 0, Instr::MULSU { rd: R16, rr: R17 });
        assert_eq!(sim.reg_pair(R0), 0xFFFE);

        // 0.5 * 0.5 in 1.7 fixed point
        let sim = one(&[(R16, 0x40), (R17, 0x40)], 0, Instr::FMULS { rd: R16, rr: R17 });
        assert_eq!(sim.reg_pair(R0), 0x2000);
        assert!(!sim.sreg().c());

        let sim = one(&[(R16, 0x80), (R17, 0x80)], 0, Instr::FMUL { rd: R16, rr: R17 });
        assert_eq!(sim.reg_pair(R0), 0x8000);
        assert!(!sim.sreg().c());

        let sim = one(&[(R16, 0), (R17, 5)], 0, Instr::MUL { rd: R16, rr: R17 });
        assert!(sim.sreg().z());
    }

    #[test]
    fn test_branch_cycles() {
        // BRBS Z (BREQ) not taken, then taken
        let mut sim = Simulator::default();
        sim.load_program(&Program::from_instrs(&[
            Instr::BRBS { s: 1, k: 1 },
            Instr::BSET { s: 1 },
            Instr::BRBS { s: 1, k: 1 },
            Instr::BREAK,
            Instr::NOP,
        ])).unwrap();
        sim.step_in().unwrap();
        assert_eq!((sim.pc, sim.cycles()), (2, 1));
        sim.step_in().unwrap();
        sim.step_in().unwrap();
        assert_eq!((sim.pc, sim.cycles()), (8, 4));
    }

    #[test]
    fn test_skip_cycles() {
        // skipping a 1-word instruction
        let sim = one(&[(R16, 1), (R17, 1)], 0, Instr::CPSE { rd: R16, rr: R17 });
        assert_eq!((sim.pc, sim.cycles()), (4, 2));

        // skipping a 2-word instruction
        let mut sim = Simulator::default();
        sim.load_program(&Program::from_instrs(&[
            Instr::SBRS { rr: R16, b: 0 },
            Instr::STS { k: 0x200, rr: R16 },
            Instr::NOP,
        ])).unwrap();
        sim.set_reg(R16, 1);
        sim.step_in().unwrap();
        assert_eq!((sim.pc, sim.cycles()), (6, 3));

        // not skipping
        let sim = one(&[(R16, 1), (R17, 2)], 0, Instr::CPSE { rd: R16, rr: R17 });
        assert_eq!((sim.pc, sim.cycles()), (2, 1));
    }

    #[test]
    fn test_pointer_modes() {
        let sim = run(&[
            Instr::LDI { rd: R26, k: 0x00 },
            Instr::LDI { rd: R27, k: 0x02 },
            Instr::LDI { rd: R16, k: 0xA5 },
            Instr::ST { ptr: Ptr::X, mode: PtrMode::PostInc, rr: R16 },
            Instr::ST { ptr: Ptr::X, mode: PtrMode::PostInc, rr: R16 },
            Instr::LD { rd: R17, ptr: Ptr::X, mode: PtrMode::PreDec },
            Instr::MOVW { rd: R28, rr: R26 },
            Instr::LD { rd: R18, ptr: Ptr::Y, mode: PtrMode::Disp(1) },
            Instr::LDS { rd: R19, k: 0x0200 },
        ]);
        assert_eq!(sim.pointer(Ptr::X), 0x0201);
        assert_eq!(sim.pointer(Ptr::Y), 0x0201);
        assert_eq!(sim.reg(R17), 0xA5);
        assert_eq!(sim.reg(R19), 0xA5);
        assert_eq!(sim.data.get(0x201).unwrap(), 0xA5);
        // 0x202 is past what was stored
        assert_eq!(sim.reg(R18), sim.data.get(0x202).unwrap());
    }

    #[test]
    fn test_program_memory() {
        let mut sim = Simulator::default();
        sim.load_program(&Program::from_instrs(&[
            Instr::LPM { rd: R16, inc: true },
            Instr::LPM { rd: R17, inc: false },
            Instr::ELPM { rd: R18, inc: false },
            Instr::BREAK,
        ])).unwrap();
        sim.flash.set(0x1_0000, 0x5A).unwrap();
        sim.flash.set(0x1_0001, 0x6B).unwrap();

        sim.set_pointer(Ptr::Z, 0x0000);
        sim.step_in().unwrap();
        assert_eq!(sim.cycles(), 3);
        sim.step_in().unwrap();

        let (lo, hi) = Instr::LPM { rd: R16, inc: true }.encode();
        assert_eq!(hi, None);
        assert_eq!(sim.reg(R16), lo.to_le_bytes()[0]);
        assert_eq!(sim.reg(R17), lo.to_le_bytes()[1]);

        let rampz = sim.props().rampz;
        sim.write_io(rampz, 1).unwrap();
        sim.set_pointer(Ptr::Z, 0x0000);
        sim.step_in().unwrap();
        assert_eq!(sim.reg(R18), 0x5A);
    }

    #[test]
    fn test_extended_post_increment() {
        let mut sim = Simulator::default();
        sim.load_program(&Program::from_instrs(&[Instr::ELPM { rd: R0, inc: true }])).unwrap();
        let rampz = sim.props().rampz;
        sim.set_pointer(Ptr::Z, 0xFFFF);
        sim.step_in().unwrap();
        assert_eq!(sim.pointer(Ptr::Z), 0);
        assert_eq!(sim.read_io(rampz), 1);
    }

    #[test]
    fn test_stack_and_calls() {
        let sim = run(&[
            Instr::LDI { rd: R16, k: 0x11 },
            Instr::PUSH { rr: R16 },
            Instr::CALL { k: 6 },
            Instr::POP { rd: R17 },
            Instr::BREAK,
            // 6:
            Instr::LDI { rd: R16, k: 0x22 },
            Instr::RET,
        ]);
        assert_eq!(sim.reg(R16), 0x22);
        assert_eq!(sim.reg(R17), 0x11);
        assert_eq!(sim.sp(), sim.props().ramend());
        // LDI + PUSH + CALL + LDI + RET + POP + BREAK
        assert_eq!(sim.cycles(), 1 + 2 + 4 + 1 + 4 + 2 + 1);
    }

    #[test]
    fn test_indirect_calls() {
        let sim = run(&[
            Instr::LDI { rd: R30, k: 5 },
            Instr::LDI { rd: R31, k: 0 },
            Instr::ICALL,
            Instr::BREAK,
            Instr::NOP,
            // 5:
            Instr::LDI { rd: R16, k: 1 },
            Instr::RET,
        ]);
        assert_eq!(sim.reg(R16), 1);
        assert_eq!(sim.pc, 8);
    }

    #[test]
    fn test_bit_ops() {
        let sim = run(&[
            Instr::LDI { rd: R16, k: 0b0000_1000 },
            Instr::BST { rd: R16, b: 3 },
            Instr::BLD { rd: R17, b: 6 },
            Instr::BCLR { s: 6 },
            Instr::BLD { rd: R16, b: 3 },
        ]);
        assert_eq!(sim.reg(R17), 0b0100_0000);
        assert_eq!(sim.reg(R16), 0);
        assert!(!sim.sreg().t());
    }

    #[test]
    fn test_io_ops() {
        let sim = run(&[
            Instr::LDI { rd: R16, k: 0x0F },
            Instr::OUT { a: 0x12, rr: R16 },
            Instr::SBI { a: 0x12, b: 7 },
            Instr::CBI { a: 0x12, b: 0 },
            Instr::IN { rd: R17, a: 0x12 },
            Instr::SBIS { a: 0x12, b: 7 },
            Instr::LDI { rd: R18, k: 1 },
            Instr::SBIC { a: 0x12, b: 0 },
            Instr::LDI { rd: R19, k: 1 },
        ]);
        assert_eq!(sim.reg(R17), 0x8E);
        assert_eq!(sim.reg(R18), 0);
        assert_eq!(sim.reg(R19), 0);
    }

    #[test]
    fn test_status_register_io() {
        let mut sim = Simulator::default();
        let sreg = sim.props().sreg;
        sim.load_program(&Program::from_instrs(&[
            Instr::LDI { rd: R16, k: 0x83 },
            Instr::OUT { a: sreg, rr: R16 },
            Instr::IN { rd: R17, a: sreg },
            Instr::BREAK,
        ])).unwrap();
        sim.run().unwrap();
        assert_eq!(sim.reg(R17), 0x83);
        assert!(sim.sreg().i());
    }

    #[test]
    fn test_stack_pointer_io() {
        let mut sim = Simulator::default();
        let (spl, sph) = (sim.props().spl, sim.props().sph);
        sim.load_program(&Program::from_instrs(&[
            Instr::LDI { rd: R16, k: 0x00 },
            Instr::OUT { a: spl, rr: R16 },
            Instr::LDI { rd: R16, k: 0x08 },
            Instr::OUT { a: sph, rr: R16 },
            Instr::PUSH { rr: R16 },
            Instr::BREAK,
        ])).unwrap();
        sim.run().unwrap();
        assert_eq!(sim.sp(), 0x07FF);
        assert_eq!(sim.data.get(0x0800).unwrap(), 0x08);
    }

    #[test]
    fn test_relative_wraps() {
        let sim = one(&[], 0, Instr::RJMP { k: -2 });
        assert_eq!(sim.pc as usize, sim.flash.len() - 2);
    }

    #[test]
    fn test_unimplemented() {
        let mut sim = Simulator::default();
        sim.load_program(&Program::from_instrs(&[Instr::NOP, Instr::EICALL])).unwrap();
        let err = sim.run().unwrap_err();
        assert!(matches!(err, SimErr::UnimplementedInstr { pc: 2, name: "EICALL", .. }));
        assert_eq!(sim.instructions_run, 1);
    }

    #[test]
    fn test_watch_sees_stack_writes() {
        use std::sync::Mutex;
        use crate::sim::probe::Watch;

        #[derive(Default)]
        struct Writes(Mutex<Vec<(u16, u8)>>);
        impl Watch for Writes {
            fn fire_after_write(&self, _: &mut Simulator, addr: u16, value: u8) {
                self.0.lock().unwrap().push((addr, value));
            }
        }

        let mut sim = Simulator::default();
        sim.load_program(&Program::from_instrs(&[
            Instr::LDI { rd: R16, k: 9 },
            Instr::PUSH { rr: R16 },
            Instr::BREAK,
        ])).unwrap();
        let ramend = sim.props().ramend();
        let watch = Arc::new(Writes::default());
        sim.insert_watch(ramend, watch.clone()).unwrap();
        sim.run().unwrap();
        assert_eq!(watch.0.lock().unwrap()[..], [(ramend, 9)]);
    }
}
