//! Utilities to debug simulation.
//!
//! These are ready-made [`Probe`]s. They can be inserted globally ([`Simulator::insert_probe`])
//! or on one instruction ([`Simulator::insert_probe_at`]).
//!
//! ```
//! use std::sync::Arc;
//! use avr_sim::isa::Instr;
//! use avr_sim::program::Program;
//! use avr_sim::sim::debug::{BranchCounter, Counter};
//! use avr_sim::sim::Simulator;
//!
//! let mut sim = Simulator::default();
//! sim.load_program(&Program::from_instrs(&[
//!     Instr::NOP,
//!     Instr::RJMP { k: -2 },
//! ])).unwrap();
//!
//! let total = Arc::new(Counter::default());
//! let loops = Arc::new(BranchCounter::default());
//! sim.insert_probe(total.clone());
//! sim.insert_probe_at(2, loops.clone()).unwrap();
//!
//! sim.run_with_limit(10).unwrap();
//! assert_eq!(total.count(), 10);
//! assert_eq!(loops.taken(), 5);
//! assert_eq!(loops.not_taken(), 0);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use super::probe::{Probe, ProbeRef};
use super::Simulator;

/// Counts how many times it fires.
#[derive(Debug, Default)]
pub struct Counter {
    count: AtomicU64,
}
impl Counter {
    /// The number of times this probe has fired.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
    /// Resets the count to 0.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
    }
}
impl Probe for Counter {
    fn fire_before(&self, _sim: &mut Simulator, _addr: u32) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counts how often a control flow instruction is taken.
///
/// After the instruction executes, the branch counts as not taken
/// if the PC is the instruction following it.
#[derive(Debug, Default)]
pub struct BranchCounter {
    taken: AtomicU64,
    not_taken: AtomicU64,
}
impl BranchCounter {
    /// The number of times the branch was taken.
    pub fn taken(&self) -> u64 {
        self.taken.load(Ordering::Relaxed)
    }
    /// The number of times the branch fell through.
    pub fn not_taken(&self) -> u64 {
        self.not_taken.load(Ordering::Relaxed)
    }
}
impl Probe for BranchCounter {
    fn fire_after(&self, sim: &mut Simulator, addr: u32) {
        let size = sim.flash.read_instr(addr).map_or(2, |i| i.size());
        match sim.pc == addr + size {
            true  => self.not_taken.fetch_add(1, Ordering::Relaxed),
            false => self.taken.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// Forwards to another probe only between an entry and an exit instruction.
///
/// Firing before `entry` opens a level of nesting and firing after `exit` closes one,
/// so recursive sequences are followed until the outermost one exits.
pub struct SequenceProbe {
    probe: ProbeRef,
    entry: u32,
    exit: u32,
    nesting: AtomicU64,
}
impl SequenceProbe {
    /// Creates a probe forwarding to `probe` between `entry` and `exit` (byte addresses).
    pub fn new(probe: ProbeRef, entry: u32, exit: u32) -> Self {
        Self { probe, entry, exit, nesting: AtomicU64::new(0) }
    }
    /// The current nesting depth.
    pub fn nesting(&self) -> u64 {
        self.nesting.load(Ordering::Relaxed)
    }
    /// Leaves every sequence.
    pub fn reset(&self) {
        self.nesting.store(0, Ordering::Relaxed);
    }
}
impl Probe for SequenceProbe {
    fn fire_before(&self, sim: &mut Simulator, addr: u32) {
        if addr == self.entry {
            self.nesting.fetch_add(1, Ordering::Relaxed);
        }
        if self.nesting() > 0 {
            self.probe.fire_before(sim, addr);
        }
    }
    fn fire_after(&self, sim: &mut Simulator, addr: u32) {
        if self.nesting() > 0 {
            self.probe.fire_after(sim, addr);
        }
        if addr == self.exit {
            let _ = self.nesting.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
        }
    }
}
impl std::fmt::Debug for SequenceProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceProbe")
            .field("entry", &format_args!("{:#07x}", self.entry))
            .field("exit", &format_args!("{:#07x}", self.exit))
            .field("nesting", &self.nesting())
            .finish_non_exhaustive()
    }
}

/// Pauses execution as a timeout once it has seen a number of instructions.
///
/// This is the instruction count analogue of [`Simulator::insert_timeout`].
#[derive(Debug)]
pub struct InstructionCountTimeout {
    limit: u64,
    seen: AtomicU64,
}
impl InstructionCountTimeout {
    /// Creates a timeout which expires after `limit` instructions.
    pub fn new(limit: u64) -> Self {
        Self { limit, seen: AtomicU64::new(0) }
    }
    /// The number of instructions seen so far.
    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}
impl Probe for InstructionCountTimeout {
    fn fire_after(&self, sim: &mut Simulator, _addr: u32) {
        let seen = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        if seen == self.limit {
            log::debug!("instruction count timeout after {seen} instructions");
            sim.timeout();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::isa::reg_consts::{R16, R17};
    use crate::isa::Instr;
    use crate::program::Program;
    use crate::sim::Simulator;

    use super::{BranchCounter, Counter, InstructionCountTimeout, SequenceProbe};

    fn sim_with(instrs: &[Instr]) -> Simulator {
        let mut sim = Simulator::default();
        sim.load_program(&Program::from_instrs(instrs)).unwrap();
        sim
    }

    #[test]
    fn test_branch_counter() {
        // count R16 down from 3: BRNE is taken twice, then falls through
        let mut sim = sim_with(&[
            Instr::LDI { rd: R16, k: 3 },
            Instr::DEC { rd: R16 },
            Instr::BRBC { s: 1, k: -2 },
            Instr::BREAK,
        ]);
        let branch = Arc::new(BranchCounter::default());
        sim.insert_probe_at(4, branch.clone()).unwrap();
        sim.run().unwrap();

        assert!(sim.hit_break_instr());
        assert_eq!(branch.taken(), 2);
        assert_eq!(branch.not_taken(), 1);
    }

    #[test]
    fn test_sequence_probe() {
        // 0: RCALL f; 2: LDI; 4: BREAK; 6 (f): INC; 8: RET
        let mut sim = sim_with(&[
            Instr::RCALL { k: 2 },
            Instr::LDI { rd: R17, k: 1 },
            Instr::BREAK,
            Instr::INC { rd: R16 },
            Instr::RET,
        ]);
        let inside = Arc::new(Counter::default());
        let seq = Arc::new(SequenceProbe::new(inside.clone(), 6, 8));
        sim.insert_probe(seq.clone());
        sim.run().unwrap();

        // INC and RET
        assert_eq!(inside.count(), 2);
        assert_eq!(seq.nesting(), 0);
    }

    #[test]
    fn test_instruction_count_timeout() {
        let mut sim = sim_with(&[Instr::RJMP { k: -1 }]);
        let timeout = Arc::new(InstructionCountTimeout::new(7));
        sim.insert_probe(timeout.clone());
        sim.run().unwrap();

        assert!(sim.hit_timeout());
        assert_eq!(timeout.seen(), 7);
        assert_eq!(sim.instructions_run, 7);
    }

    #[test]
    fn test_counter_reset() {
        let mut sim = sim_with(&[Instr::NOP, Instr::NOP, Instr::BREAK]);
        let counter = Arc::new(Counter::default());
        sim.insert_probe_at(2, counter.clone()).unwrap();
        sim.run().unwrap();
        assert_eq!(counter.count(), 1);
        counter.reset();
        assert_eq!(counter.count(), 0);
    }
}
