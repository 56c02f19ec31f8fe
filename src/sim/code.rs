//! Program memory.
//!
//! The [`CodeSegment`] holds the flash image along with a cache of decoded instructions,
//! one slot per flash word. Slots are decoded lazily on first execution
//! and invalidated when the flash bytes under them change.
//!
//! Instruction probes and breakpoints are attached to slots. Attaching the first one
//! wraps the slot's instruction, and removing the last one restores it.
//!
//! ```
//! use avr_sim::isa::Instr;
//! use avr_sim::program::Program;
//! use avr_sim::sim::Simulator;
//!
//! let mut sim = Simulator::default();
//! sim.load_program(&Program::from_instrs(&[Instr::NOP, Instr::NOP, Instr::BREAK])).unwrap();
//! sim.insert_breakpoint(2).unwrap();
//!
//! sim.run().unwrap();
//! assert!(sim.hit_breakpoint());
//! assert_eq!(sim.pc, 2);
//!
//! // resuming runs the instruction under the breakpoint:
//! sim.run().unwrap();
//! assert!(sim.hit_break_instr());
//! ```
//!
//! # Self-programming
//!
//! If [`SimFlags::reprogrammable_flash`] is set, the `SPMCSR` register and the `SPM` instruction
//! can rewrite flash pages at run time, with the erase and write delays of the hardware.
//!
//! [`SimFlags::reprogrammable_flash`]: super::SimFlags::reprogrammable_flash

use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::isa::{reg_consts::{R0, R1}, Instr, Ptr};
use crate::program::Program;

use super::clock::{Event, EventRef};
use super::ioreg::ActiveRegister;
use super::mem::Segment;
use super::probe::{remove_ref, ProbeRef};
use super::{SimErr, Simulator};

/// A decoded instruction cache slot.
enum Slot {
    Empty,
    Ready(Instr),
    Probed(Box<ProbedInstr>),
}

/// An instruction with probes or a breakpoint attached.
struct ProbedInstr {
    instr: Instr,
    probes: Vec<ProbeRef>,
    breakpoint: bool,
    /// Set once the breakpoint has paused execution, so the next fetch runs the instruction.
    break_fired: bool,
}

/// What the interpreter should do with the instruction at the PC.
pub(super) enum Fetch {
    Plain(Instr),
    Probed(Instr, Vec<ProbeRef>),
    Break,
}

/// The flash memory of a simulator.
pub struct CodeSegment {
    bytes: Segment,
    slots: Vec<Slot>,
}
impl CodeSegment {
    /// Creates an erased (all `0xFF`) code segment with the given size in bytes.
    pub fn new(size: usize) -> Self {
        let mut slots = Vec::with_capacity(size / 2);
        slots.resize_with(size / 2, || Slot::Empty);
        Self { bytes: Segment::new("flash", size, 0xFF), slots }
    }

    /// The size of flash in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }
    /// Whether flash has no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
    /// The flash bytes.
    pub fn as_segment(&self) -> &Segment {
        &self.bytes
    }

    fn word_index(&self, addr: u32) -> Result<usize, SimErr> {
        if addr % 2 != 0 {
            return Err(SimErr::MisalignedPc { pc: addr });
        }
        let w = addr as usize / 2;
        match w < self.slots.len() {
            true  => Ok(w),
            false => Err(SimErr::AddressOutOfBounds { segment: String::from("flash"), address: addr as usize }),
        }
    }

    fn word(&self, w: usize) -> u16 {
        let s = self.bytes.as_slice();
        match (s.get(2 * w), s.get(2 * w + 1)) {
            (Some(&lo), Some(&hi)) => u16::from_le_bytes([lo, hi]),
            _ => 0xFFFF
        }
    }
    fn decode_at(&self, w: usize) -> Instr {
        Instr::decode(self.word(w), self.word(w + 1))
    }

    /// Reads a byte as simulated code (`LPM`).
    pub fn read(&self, addr: usize) -> u8 {
        self.bytes.read(addr)
    }
    /// Reads a byte, failing if the address is out of bounds.
    pub fn get(&self, addr: usize) -> Result<u8, SimErr> {
        self.bytes.get(addr)
    }
    /// Writes a byte, failing if the address is out of bounds.
    ///
    /// The decoded instruction containing the byte is invalidated.
    pub fn set(&mut self, addr: usize, value: u8) -> Result<(), SimErr> {
        self.bytes.set(addr, value)?;
        self.invalidate(addr / 2);
        Ok(())
    }

    /// Copies bytes into flash starting at `offset`, invalidating every affected instruction.
    pub fn load(&mut self, offset: usize, bytes: &[u8]) -> Result<(), SimErr> {
        self.bytes.load(offset, bytes)?;
        let words = offset / 2 ..= (offset + bytes.len() + 1) / 2;
        for w in words {
            self.invalidate(w);
        }
        Ok(())
    }

    /// Invalidates the slot of word `w` and the slot before it
    /// (which holds a 32-bit instruction whose second word may be `w`).
    fn invalidate(&mut self, w: usize) {
        for w in w.saturating_sub(1)..=w {
            match self.slots.get(w) {
                Some(Slot::Ready(_)) => self.slots[w] = Slot::Empty,
                Some(Slot::Probed(_)) => {
                    let fresh = self.decode_at(w);
                    if let Slot::Probed(p) = &mut self.slots[w] {
                        p.instr = fresh;
                    }
                },
                Some(Slot::Empty) | None => {}
            }
        }
    }

    /// Decodes the instruction at the given byte address.
    ///
    /// This sees through any probe or breakpoint on the instruction.
    pub fn read_instr(&self, addr: u32) -> Result<Instr, SimErr> {
        let w = self.word_index(addr)?;
        match &self.slots[w] {
            Slot::Ready(i) => Ok(*i),
            Slot::Probed(p) => Ok(p.instr),
            Slot::Empty => Ok(self.decode_at(w)),
        }
    }

    /// Fetches the slot at the PC for execution.
    pub(super) fn fetch(&mut self, pc: u32) -> Result<Fetch, SimErr> {
        let w = self.word_index(pc)?;
        match &mut self.slots[w] {
            Slot::Ready(i) => return Ok(Fetch::Plain(*i)),
            Slot::Probed(p) if p.breakpoint && !p.break_fired => {
                p.break_fired = true;
                return Ok(Fetch::Break);
            },
            Slot::Probed(p) => {
                p.break_fired = false;
                return Ok(Fetch::Probed(p.instr, p.probes.clone()));
            },
            Slot::Empty => {}
        }

        let instr = self.decode_at(w);
        self.slots[w] = Slot::Ready(instr);
        Ok(Fetch::Plain(instr))
    }

    /// Applies `f` to the wrapper at the address, wrapping the slot first if needed.
    fn with_probed(&mut self, addr: u32, f: impl FnOnce(&mut ProbedInstr)) -> Result<(), SimErr> {
        let w = self.word_index(addr)?;
        if !matches!(self.slots[w], Slot::Probed(_)) {
            let instr = self.read_instr(addr)?;
            self.slots[w] = Slot::Probed(Box::new(ProbedInstr { instr, probes: vec![], breakpoint: false, break_fired: false }));
        }
        if let Slot::Probed(p) = &mut self.slots[w] {
            f(p);
        }
        Ok(())
    }

    /// Unwraps the slot at word `w` if nothing is attached to it anymore.
    fn restore_if_bare(&mut self, w: usize) {
        let bare = match &self.slots[w] {
            Slot::Probed(p) if p.probes.is_empty() && !p.breakpoint => p.instr,
            _ => return
        };
        self.slots[w] = Slot::Ready(bare);
    }

    /// Attaches a probe to the instruction at the byte address.
    ///
    /// Probes are not deduplicated: a probe inserted twice fires twice.
    pub fn insert_probe(&mut self, addr: u32, probe: ProbeRef) -> Result<(), SimErr> {
        self.with_probed(addr, |p| p.probes.push(probe))
    }

    /// Removes a probe from the instruction at the byte address, comparing by reference identity.
    pub fn remove_probe(&mut self, addr: u32, probe: &ProbeRef) -> bool {
        let Ok(w) = self.word_index(addr) else { return false };
        let Slot::Probed(p) = &mut self.slots[w] else { return false };

        let removed = remove_ref(&mut p.probes, probe);
        self.restore_if_bare(w);
        removed
    }

    /// Sets a breakpoint on the instruction at the byte address.
    pub fn insert_breakpoint(&mut self, addr: u32) -> Result<(), SimErr> {
        self.with_probed(addr, |p| {
            p.breakpoint = true;
            p.break_fired = false;
        })
    }

    /// Removes the breakpoint on the instruction at the byte address.
    pub fn remove_breakpoint(&mut self, addr: u32) -> bool {
        let Ok(w) = self.word_index(addr) else { return false };
        let Slot::Probed(p) = &mut self.slots[w] else { return false };

        let had = std::mem::take(&mut p.breakpoint);
        p.break_fired = false;
        self.restore_if_bare(w);
        had
    }

    /// Whether the instruction at the byte address has a breakpoint.
    pub fn has_breakpoint(&self, addr: u32) -> bool {
        self.word_index(addr)
            .is_ok_and(|w| matches!(&self.slots[w], Slot::Probed(p) if p.breakpoint))
    }

    /// The number of probes attached to the instruction at the byte address.
    pub fn probe_count(&self, addr: u32) -> usize {
        match self.word_index(addr).map(|w| &self.slots[w]) {
            Ok(Slot::Probed(p)) => p.probes.len(),
            _ => 0
        }
    }

    /// Forgets every breakpoint's fired state.
    pub(super) fn rearm_breakpoints(&mut self) {
        for slot in &mut self.slots {
            if let Slot::Probed(p) = slot {
                p.break_fired = false;
            }
        }
    }
}
impl std::fmt::Debug for CodeSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let probed = self.slots.iter()
            .filter(|s| matches!(s, Slot::Probed(_)))
            .count();

        f.debug_struct("CodeSegment")
            .field("len", &self.len())
            .field("probed", &probed)
            .finish_non_exhaustive()
    }
}

const SPMCSR_LOWER: u8 = 0x1F;
const SPM_TIMEOUT: u64 = 4;
const STATE_NONE: u8 = 0;
const STATE_FILL: u8 = 1;
const STATE_PGERASE: u8 = 1 << 1 | 1;
const STATE_PGWRITE: u8 = 1 << 2 | 1;
const STATE_BLBSET: u8 = 1 << 3 | 1;
const STATE_RWWSRE: u8 = 1 << 4 | 1;
const SPMIE: u8 = 1 << 7;
const SPMEN: u8 = 1;
/// Page erase and page write time.
const PAGE_OP_MS: f64 = 4.5;

/// The `SPMCSR` register and page buffer of a reprogrammable flash.
pub(super) struct SpmControl {
    spm_ready: u8,
    page_size: usize,
    state: Mutex<SpmState>,
    reset: EventRef,
}
struct SpmState {
    value: u8,
    buffer: Vec<u8>,
}

impl SpmControl {
    pub(super) fn new(spm_ready: u8, page_size: usize) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<SpmControl>| Self {
            spm_ready,
            page_size,
            state: Mutex::new(SpmState { value: 0, buffer: vec![0xFF; page_size] }),
            reset: Arc::new(SpmReset(me.clone())),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SpmState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn value(&self) -> u8 {
        self.lock().value
    }

    /// Clears the operation bits, as the hardware does once an operation completes or times out.
    fn reset_bits(&self, sim: &mut Simulator) -> Result<(), SimErr> {
        let value = self.value();
        self.write(sim, value & !SPMCSR_LOWER)
    }

    /// Executes `SPM` with the operation armed in `SPMCSR`.
    fn update(&self, sim: &mut Simulator) -> Result<(), SimErr> {
        let z = u32::from(sim.io_stored(sim.props.rampz)) << 16 | u32::from(sim.pointer(Ptr::Z));
        let page = z as usize / self.page_size;
        let offset = z as usize % self.page_size & !1;

        match self.value() & SPMCSR_LOWER {
            STATE_FILL => {
                let (r0, r1) = (sim.reg(R0), sim.reg(R1));
                self.reset_bits(sim)?;
                let mut state = self.lock();
                state.buffer[offset] = r0;
                state.buffer[offset + 1] = r1;
                drop(state);
                sim.clock.remove_event(&self.reset);
            },
            STATE_PGERASE => {
                sim.clock.remove_event(&self.reset);
                self.schedule_page_op(sim, page, None);
            },
            STATE_PGWRITE => {
                sim.clock.remove_event(&self.reset);
                let data = std::mem::replace(&mut self.lock().buffer, vec![0xFF; self.page_size]);
                self.schedule_page_op(sim, page, Some(data));
            },
            STATE_RWWSRE | STATE_BLBSET => {
                sim.clock.remove_event(&self.reset);
            },
            _ => {}
        }
        Ok(())
    }

    fn schedule_page_op(&self, sim: &mut Simulator, page: usize, data: Option<Vec<u8>>) {
        let Some(spm) = sim.spm.as_ref().map(Arc::downgrade) else { return };
        let cycles = sim.clock.millis_to_cycles(PAGE_OP_MS);
        let event = PageOp { spm, start: page * self.page_size, len: self.page_size, data };
        sim.clock.insert_event(Arc::new(event), cycles);
    }
}
impl ActiveRegister for SpmControl {
    fn read(&self, _sim: &mut Simulator) -> u8 {
        self.value()
    }

    fn write(&self, sim: &mut Simulator, value: u8) -> Result<(), SimErr> {
        let lower = match value & SPMCSR_LOWER {
            l @ (STATE_PGERASE | STATE_RWWSRE | STATE_BLBSET | STATE_FILL | STATE_PGWRITE) => {
                sim.clock.remove_event(&self.reset);
                sim.clock.insert_event(Arc::clone(&self.reset), SPM_TIMEOUT + 2);
                l
            },
            _ => STATE_NONE
        };

        let value = value & !SPMCSR_LOWER | lower;
        self.lock().value = value;

        let ready = value & SPMIE != 0 && value & SPMEN == 0;
        sim.set_posted(self.spm_ready, ready)
    }
}

/// Disarms `SPMCSR` when an armed operation is not started in time.
struct SpmReset(Weak<SpmControl>);
impl Event for SpmReset {
    fn fire(&self, sim: &mut Simulator) {
        let Some(spm) = self.0.upgrade() else { return };
        if let Err(e) = spm.reset_bits(sim) {
            log::warn!("SPMCSR reset failed: {e}");
        }
    }
}

/// A page erase (`data == None`) or page write completing.
struct PageOp {
    spm: Weak<SpmControl>,
    start: usize,
    len: usize,
    data: Option<Vec<u8>>,
}
impl Event for PageOp {
    fn fire(&self, sim: &mut Simulator) {
        let erased;
        let bytes = match &self.data {
            Some(d) => d.as_slice(),
            None => {
                erased = vec![0xFF; self.len];
                erased.as_slice()
            }
        };

        let kind = if self.data.is_some() { "write" } else { "erase" };
        match sim.flash.load(self.start, bytes) {
            Ok(()) => log::debug!("flash page {kind} at 0x{:05X} complete", self.start),
            Err(e) => log::warn!("flash page {kind} failed: {e}"),
        }

        if let Some(spm) = self.spm.upgrade() {
            if let Err(e) = spm.reset_bits(sim) {
                log::warn!("SPMCSR reset failed: {e}");
            }
        }
    }
}

impl Simulator {
    /// Loads a program into flash, starting at address 0.
    ///
    /// This replaces the start of flash and invalidates the decoded instructions under it.
    /// Probes and breakpoints stay attached.
    pub fn load_program(&mut self, program: &Program) -> Result<(), SimErr> {
        if program.len() > self.flash.len() {
            return Err(SimErr::ProgramTooLarge { size: program.len(), flash: self.flash.len() });
        }
        self.flash.load(0, program.as_bytes())
    }

    /// Executes `SPM`.
    pub(super) fn store_program_memory(&mut self) -> Result<(), SimErr> {
        match self.spm.clone() {
            Some(spm) => spm.update(self),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::isa::reg_consts::{R0, R1, R16, R30, R31};
    use crate::isa::Instr;
    use crate::program::Program;
    use crate::sim::probe::{Probe, ProbeRef};
    use crate::sim::{SimErr, SimFlags, Simulator};

    use super::{CodeSegment, Fetch};

    #[derive(Default)]
    struct Count(AtomicUsize);
    impl Probe for Count {
        fn fire_before(&self, _: &mut Simulator, _: u32) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn flash_with(instrs: &[Instr]) -> CodeSegment {
        let mut flash = CodeSegment::new(64);
        flash.load(0, Program::from_instrs(instrs).as_bytes()).unwrap();
        flash
    }

    #[test]
    fn test_probe_restores_instr() {
        let ldi = Instr::LDI { rd: R16, k: 3 };
        let mut flash = flash_with(&[ldi, Instr::NOP]);
        let p: ProbeRef = Arc::new(Count::default());

        flash.insert_probe(0, p.clone()).unwrap();
        flash.insert_probe(0, p.clone()).unwrap();
        assert_eq!(flash.probe_count(0), 2);
        assert_eq!(flash.read_instr(0).unwrap(), ldi);

        assert!(flash.remove_probe(0, &p));
        assert!(flash.remove_probe(0, &p));
        assert!(!flash.remove_probe(0, &p));
        assert_eq!(flash.probe_count(0), 0);
        assert_eq!(flash.read_instr(0).unwrap(), ldi);
        assert!(matches!(flash.fetch(0), Ok(Fetch::Plain(i)) if i == ldi));
    }

    #[test]
    fn test_breakpoint_fires_once() {
        let mut flash = flash_with(&[Instr::NOP]);
        flash.insert_breakpoint(0).unwrap();
        assert!(flash.has_breakpoint(0));

        assert!(matches!(flash.fetch(0), Ok(Fetch::Break)));
        assert!(matches!(flash.fetch(0), Ok(Fetch::Probed(Instr::NOP, _))));
        assert!(matches!(flash.fetch(0), Ok(Fetch::Break)));

        assert!(flash.remove_breakpoint(0));
        assert!(!flash.has_breakpoint(0));
        assert!(matches!(flash.fetch(0), Ok(Fetch::Plain(Instr::NOP))));
    }

    #[test]
    fn test_set_invalidates_previous_slot() {
        // STS 0x0100, R0 followed by a NOP
        let mut flash = flash_with(&[Instr::STS { k: 0x0100, rr: R0 }, Instr::NOP]);
        assert!(matches!(flash.fetch(0), Ok(Fetch::Plain(Instr::STS { k: 0x0100, .. }))));

        // rewriting the second word of STS changes its address
        flash.set(2, 0x00).unwrap();
        flash.set(3, 0x02).unwrap();
        assert_eq!(flash.read_instr(0).unwrap(), Instr::STS { k: 0x0200, rr: R0 });
        assert!(matches!(flash.fetch(0), Ok(Fetch::Plain(Instr::STS { k: 0x0200, .. }))));
    }

    #[test]
    fn test_bad_pc() {
        let mut flash = CodeSegment::new(8);
        assert!(matches!(flash.fetch(3), Err(SimErr::MisalignedPc { pc: 3 })));
        assert!(matches!(flash.fetch(8), Err(SimErr::AddressOutOfBounds { .. })));
        assert!(flash.insert_breakpoint(1).is_err());
    }

    #[test]
    fn test_program_too_large() {
        let mut sim = Simulator::default();
        let size = sim.flash.len() + 2;
        let program = Program::from_bytes(vec![0; size]);
        assert!(matches!(sim.load_program(&program), Err(SimErr::ProgramTooLarge { .. })));
    }

    fn spm_sim(program: &[Instr]) -> Simulator {
        let mut sim = Simulator::new(SimFlags { reprogrammable_flash: true, ..Default::default() });
        sim.load_program(&Program::from_instrs(program)).unwrap();
        sim
    }

    #[test]
    fn test_spm_fill_and_write() {
        let spmcsr = Simulator::default().props().spmcsr;
        let mut sim = spm_sim(&[Instr::SPM, Instr::SPM, Instr::NOP]);
        let page = sim.props().page_size as u16;

        // fill the word at offset 4 of page 1 with 0xBEEF
        sim.set_reg(R0, 0xEF);
        sim.set_reg(R1, 0xBE);
        sim.set_reg(R30, (page + 4) as u8);
        sim.set_reg(R31, ((page + 4) >> 8) as u8);
        sim.write_io(spmcsr, 0x01).unwrap();
        sim.step_in().unwrap();

        // page write
        sim.write_io(spmcsr, 0x05).unwrap();
        sim.step_in().unwrap();
        let base = usize::from(page);
        assert_eq!(sim.flash.get(base + 4).unwrap(), 0xFF);

        let wait = sim.clock.millis_to_cycles(4.5);
        sim.advance_cycles(wait);
        assert_eq!(sim.flash.get(base + 4).unwrap(), 0xEF);
        assert_eq!(sim.flash.get(base + 5).unwrap(), 0xBE);
        assert_eq!(sim.flash.get(base + 6).unwrap(), 0xFF);
        assert_eq!(sim.read_io(spmcsr) & 0x1F, 0);
    }

    #[test]
    fn test_spm_erase() {
        let spmcsr = Simulator::default().props().spmcsr;
        let mut sim = spm_sim(&[Instr::SPM, Instr::NOP, Instr::NOP]);
        assert_eq!(sim.flash.read_instr(2).unwrap(), Instr::NOP);

        // Z = 0: erase page 0, which holds this program
        sim.write_io(spmcsr, 0x03).unwrap();
        sim.step_in().unwrap();
        let wait = sim.clock.millis_to_cycles(4.5);
        sim.advance_cycles(wait);

        assert_eq!(sim.flash.get(2).unwrap(), 0xFF);
        assert_eq!(sim.flash.read_instr(2).unwrap(), Instr::Undefined(0xFFFF));
    }

    #[test]
    fn test_spm_arm_times_out() {
        let props = Simulator::default().props().clone();
        let mut sim = spm_sim(&[Instr::NOP]);

        sim.write_io(props.spmcsr, 0x80 | 0x01).unwrap();
        assert_eq!(sim.read_io(props.spmcsr), 0x81);
        assert!(!sim.interrupts().is_posted(props.spm_ready));

        sim.advance_cycles(6);
        assert_eq!(sim.read_io(props.spmcsr), 0x80);
        // SPMIE set and SPMEN clear: ready
        assert!(sim.interrupts().is_posted(props.spm_ready));
    }

    #[test]
    fn test_spm_without_flag_is_nop() {
        let mut sim = Simulator::default();
        sim.load_program(&Program::from_instrs(&[Instr::SPM])).unwrap();
        sim.step_in().unwrap();
        assert_eq!(sim.pc, 2);
        assert_eq!(sim.cycles(), 1);
    }
}
