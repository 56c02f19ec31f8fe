//! Simulating and execution for AVR microcontrollers.
//!
//! This module is focused on executing program images (i.e., [`Program`]) cycle by cycle.
//!
//! This module consists of:
//! - [`Simulator`]: The struct that simulates a microcontroller.
//! - [`mem`]: The module handling data memory segments.
//! - [`code`]: The module handling flash and the decoded instruction cache.
//! - [`ioreg`]: The module handling IO registers and device hooks.
//! - [`interrupt`]: The module handling the interrupt table.
//! - [`clock`]: The module handling simulated time and events.
//! - [`probe`]: The module defining instrumentation callbacks.
//! - [`debug`]: The module with ready-made probes (counters, timeouts).
//! - [`fsm`]: The module handling finite state machines for device modeling.
//! - [`sync`]: The module synchronizing several simulators running in parallel.
//!
//! # Usage
//!
//! To simulate some code, you need to instantiate a Simulator and load a program to it:
//!
//! ```
//! use avr_sim::isa::{Instr, reg_consts::{R16, R17}};
//! use avr_sim::program::Program;
//! use avr_sim::sim::Simulator;
//!
//! let program = Program::from_instrs(&[
//!     Instr::LDI { rd: R16, k: 40 },
//!     Instr::LDI { rd: R17, k: 2 },
//!     Instr::ADD { rd: R16, rr: R17 },
//!     Instr::BREAK,
//! ]);
//!
//! let mut sim = Simulator::new(Default::default());
//! sim.load_program(&program).unwrap();
//! sim.run().unwrap();
//!
//! assert!(sim.hit_break_instr());
//! assert_eq!(sim.reg(R16), 42);
//! assert_eq!(sim.cycles(), 4);
//! ```
//!
//! ## Flags
//!
//! Here, we define `sim` to have the default flags.
//! We could also configure the simulator by editing the flags. For example,
//! if we wish to let the program rewrite its own flash, we can edit the flags like so:
//!
//! ```
//! # use avr_sim::sim::{Simulator, SimFlags};
//! let mut sim = Simulator::new(SimFlags { reprogrammable_flash: true, ..Default::default() });
//! ```
//!
//! All of the available flags can be found in [`SimFlags`].
//! The part being simulated is described by [`McuProps`] (see [`Simulator::with_props`]).
//!
//! ## Execution
//!
//! Beyond the basic [`Simulator::run`] (which runs until the machine stops),
//! there are also:
//! - [`Simulator::step_in`]: manual step-by-step simulation
//! - [`Simulator::run_while`], [`Simulator::run_with_limit`], [`Simulator::run_for_cycles`]:
//!     more advanced programmatic execution
//!
//! Execution pauses without error when:
//! - `BREAK` is executed ([`Simulator::hit_break_instr`]),
//! - the simulator is stopped, from a probe or event with [`Simulator::stop`]
//!     or from another thread with a [`StopHandle`] ([`Simulator::hit_stop`]),
//! - a breakpoint is reached ([`Simulator::hit_breakpoint`]),
//! - a timeout expires ([`Simulator::hit_timeout`]).
//!
//! A stopped simulator stays stopped until [`Simulator::reset`].
//!
//! ## Querying State
//!
//! - The PC is the `sim.pc` field. It is a byte address.
//! - Registers are accessed with [`Simulator::reg`] and [`Simulator::set_reg`].
//! - The status register is accessed with [`Simulator::sreg`] and [`Simulator::set_sreg`].
//! - Data memory can be accessed two ways:
//!     - Directly through the `data` field (a [`Segment`]), which does not trigger watches or IO.
//!     - Through [`Simulator::read_data`] and [`Simulator::write_data`], which go through IO registers and watches
//!         exactly as simulated code does.
//!
//! ```
//! use avr_sim::isa::reg_consts::R5;
//! use avr_sim::sim::Simulator;
//!
//! let mut sim = Simulator::default();
//!
//! // Registers are mapped at the start of the data space:
//! sim.write_data(5, 0x12).unwrap();
//! assert_eq!(sim.reg(R5), 0x12);
//!
//! // Raw memory access:
//! sim.data.set(0x200, 0x34).unwrap();
//! assert_eq!(sim.read_data(0x200), 0x34);
//! ```
//!
//! ## Interrupts
//!
//! Devices post and enable interrupts through the simulator
//! (see the [`interrupt`] module). Before each instruction, if the `I` flag is set,
//! the lowest pending interrupt is dispatched.
//!
//! [`Program`]: crate::program::Program
//! [`Segment`]: mem::Segment

pub mod mem;
pub mod code;
pub mod ioreg;
pub mod interrupt;
pub mod clock;
pub mod probe;
pub mod debug;
pub mod fsm;
pub mod sync;
mod mcu;
mod exec;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::isa::{Ptr, Reg};

pub use mcu::McuProps;
use self::clock::{EventRef, MainClock, PeriodicEvent};
use self::code::{CodeSegment, Fetch, SpmControl};
use self::interrupt::InterruptTable;
use self::ioreg::IoReg;
use self::mem::{MemInitStrategy, Segment};
use self::probe::{remove_ref, ProbeRef, WatchRef};

/// Errors that can occur during simulation.
///
/// These are fatal to the simulation.
/// Faults which simulated code can recover from (such as out-of-bounds data accesses)
/// are instead routed to a segment's [`ErrorReporter`](mem::ErrorReporter).
#[derive(Debug, thiserror::Error)]
pub enum SimErr {
    /// The instruction at the PC cannot be executed on this part.
    #[error("unimplemented instruction {name} ({opcode:#06x}) at {pc:#07x}")]
    UnimplementedInstr {
        /// The byte address of the instruction.
        pc: u32,
        /// The first word of the instruction.
        opcode: u16,
        /// The mnemonic of the instruction.
        name: &'static str,
    },
    /// An inspection access fell outside of a segment.
    #[error("address {address:#x} is out of bounds of segment {segment}")]
    AddressOutOfBounds {
        /// The name of the segment.
        segment: String,
        /// The address accessed.
        address: usize,
    },
    /// A reserved IO register was written while strict IO is enabled.
    #[error("wrote {value:#04x} to reserved IO register {ioreg:#04x}")]
    ReservedRegisterWrite {
        /// The IO register number.
        ioreg: u8,
        /// The value written.
        value: u8,
    },
    /// A finite state machine was asked to take a transition it does not have.
    #[error("state machine {machine} has no transition from {from} to {to}")]
    IllegalTransition {
        /// The name of the state machine.
        machine: String,
        /// The current state.
        from: i32,
        /// The requested state.
        to: i32,
    },
    /// A finite state machine was asked to transition during a timed transition.
    #[error("state machine {machine} cannot transition to {to} while a transition is in progress")]
    TransitionInProgress {
        /// The name of the state machine.
        machine: String,
        /// The requested state.
        to: i32,
    },
    /// The PC is not word-aligned.
    #[error("PC {pc:#x} is not word-aligned")]
    MisalignedPc {
        /// The PC.
        pc: u32,
    },
    /// A program image does not fit in flash.
    #[error("program of {size} bytes does not fit in {flash} bytes of flash")]
    ProgramTooLarge {
        /// The size of the program.
        size: usize,
        /// The size of flash.
        flash: usize,
    },
    /// An interrupt number is outside of the interrupt table.
    #[error("interrupt {inum} is out of range (the table has {count} slots)")]
    InvalidInterrupt {
        /// The interrupt number.
        inum: u8,
        /// The number of slots in the table.
        count: u8,
    },
}

/// Anything that can cause a step to abruptly fail to finish.
enum StepBreak {
    /// A breakpoint was reached at the given address.
    Breakpoint(u32),
    /// `BREAK` was executed.
    Break,
    /// The simulator is stopped.
    Stopped,
    /// A timeout expired.
    Timeout,
    /// A simulation error occurred.
    Err(SimErr),
}
impl From<SimErr> for StepBreak {
    fn from(value: SimErr) -> Self {
        Self::Err(value)
    }
}

/// Reason for why execution paused if it wasn't due to an error.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
enum PauseCondition {
    /// Program executed `BREAK`.
    Break,
    /// The simulator was stopped.
    Stop,
    /// Program hit a breakpoint.
    Breakpoint,
    /// A timeout expired.
    Timeout,
    /// Program hit a tripwire condition.
    Tripwire,
    /// Program hit an error and did not pause successfully.
    #[default]
    Unsuccessful
}

/// The run state of the processor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum RunState {
    /// Executing instructions.
    #[default]
    Running,
    /// Asleep until an interrupt is dispatched.
    Sleeping,
    /// Stopped until reset.
    Stopped,
}

/// Configuration flags for [`Simulator`].
///
/// These can be modified after the `Simulator` is created with [`Simulator::new`]
/// and their effects should still apply (unless noted otherwise).
///
/// Read the field descriptions for more details.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct SimFlags {
    /// The creation strategy for SRAM.
    ///
    /// This is used to fill SRAM on [`Simulator::new`] and [`Simulator::reset`].
    ///
    /// By default, this flag is [`MemInitStrategy::default`].
    pub mem_init: MemInitStrategy,

    /// Whether the program can rewrite flash with `SPM`.
    ///
    /// If disabled, `SPM` does nothing and `SPMCSR` is a plain register.
    ///
    /// This flag only goes into effect during `Simulator::new`.
    ///
    /// By default, this flag is `false`.
    pub reprogrammable_flash: bool,

    /// Whether writing a reserved IO register is an error.
    ///
    /// If disabled, such writes are logged and dropped.
    ///
    /// By default, this flag is `false`.
    pub strict_io: bool,
}

#[allow(clippy::derivable_impls)]
impl Default for SimFlags {
    fn default() -> Self {
        Self {
            mem_init: Default::default(),
            reprogrammable_flash: false,
            strict_io: false,
        }
    }
}

/// A handle which stops a [`Simulator`] from another thread.
///
/// A stop requested while no run is in progress stops the next run before its first step.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);
impl StopHandle {
    /// Stops the simulator at the next step.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Executes AVR programs.
pub struct Simulator {
    // ------------------ SIMULATION STATE ------------------
    // Calling [`Simulator::reset`] resets these values.

    /// The program counter, as a byte address.
    pub pc: u32,

    /// The status register. See [`Sreg`] for more details.
    sreg: Sreg,

    /// The data space: registers, the IO window, and SRAM.
    ///
    /// Accesses to the IO window through this segment do not reach the IO registers.
    /// Use [`Simulator::read_io`] and [`Simulator::write_io`] for those.
    pub data: Segment,

    /// Whether the processor is sleeping.
    sleeping: bool,

    /// The run state.
    state: RunState,

    /// Set by `RETI`, so one instruction runs before the next interrupt is dispatched.
    just_returned: bool,

    /// Whether the interrupt table can be skipped on the next step.
    inner_loop: bool,

    /// Cycles to consume before the next instruction.
    delay_cycles: u64,

    /// The number of instructions successfully run since this `Simulator` was initialized.
    ///
    /// This can be set to 0 to reset the counter.
    pub instructions_run: u64,

    /// A pause requested during the current step.
    halt: Option<PauseCondition>,

    /// Indicates the reason why the last execution (via [`Simulator::run_while`] and adjacent)
    /// had paused.
    pause_condition: PauseCondition,

    // ------------------ CONFIG/DEBUG STATE ------------------
    // Calling [`Simulator::reset`] does not reset these values.

    /// The IO registers.
    ioregs: Box<[IoReg]>,

    /// Flash memory.
    pub flash: CodeSegment,

    /// The interrupt table.
    interrupts: InterruptTable,

    /// The main clock and its event queue.
    pub clock: MainClock,

    /// The self-programming unit, if flash is reprogrammable.
    spm: Option<Arc<SpmControl>>,

    /// The part being simulated.
    props: McuProps,

    /// Configuration settings for the simulator.
    ///
    /// These are preserved between resets.
    ///
    /// See [`SimFlags`] for more details on what configuration
    /// settings are available.
    pub flags: SimFlags,

    /// Probes fired around every instruction.
    probes: Vec<ProbeRef>,

    /// Set to stop the simulator. See [`StopHandle`].
    stop_requested: Arc<AtomicBool>,
}
impl Simulator where Simulator: Send + Sync {}

impl Simulator {
    /// Creates a new simulator of the given part.
    ///
    /// Flash is erased and SRAM is filled according to [`SimFlags::mem_init`].
    pub fn with_props(props: McuProps, flags: SimFlags) -> Self {
        let mut sim = Self {
            pc: 0,
            sreg: Sreg::new(),
            data: Segment::new("data", props.data_size(), 0),
            sleeping: false,
            state: RunState::Running,
            just_returned: false,
            inner_loop: false,
            delay_cycles: 0,
            instructions_run: 0,
            halt: None,
            pause_condition: Default::default(),

            ioregs: (0..props.ioreg_size.min(256)).map(|_| IoReg::Plain(0)).collect(),
            flash: CodeSegment::new(props.flash_size),
            interrupts: InterruptTable::new(props.num_interrupts),
            clock: MainClock::new(props.hz),
            spm: None,
            props,
            flags,
            probes: vec![],
            stop_requested: Arc::new(AtomicBool::new(false)),
        };

        let core_regs = [
            (sim.props.sreg, IoReg::Status),
            (sim.props.spl, IoReg::StackLow(0)),
            (sim.props.sph, IoReg::StackHigh(0)),
        ];
        for (n, reg) in core_regs {
            if let Some(slot) = sim.ioregs.get_mut(usize::from(n)) {
                *slot = reg;
            }
        }
        if flags.reprogrammable_flash {
            let spm = SpmControl::new(sim.props.spm_ready, sim.props.page_size);
            if let Some(slot) = sim.ioregs.get_mut(usize::from(sim.props.spmcsr)) {
                *slot = IoReg::Custom(spm.clone());
            }
            sim.spm = Some(spm);
        }

        sim.reset_core();
        sim
    }

    /// Creates a new simulator of the default part (see [`McuProps::default`]).
    pub fn new(flags: SimFlags) -> Self {
        Self::with_props(McuProps::default(), flags)
    }

    fn reset_core(&mut self) {
        self.pc = 0;
        self.sreg = Sreg::new();

        let sram = self.props.sram_start();
        let len = self.data.len();
        self.data.as_mut_slice()[..sram.min(len)].fill(0);
        self.data.fill_with(sram.min(len)..len, &mut self.flags.mem_init.generator());
        let ramend = self.props.ramend();
        self.set_sp(ramend);

        self.sleeping = false;
        self.state = RunState::Running;
        self.just_returned = false;
        self.inner_loop = false;
        self.delay_cycles = 0;
        self.instructions_run = 0;
        self.halt = None;
        self.pause_condition = Default::default();
        self.stop_requested.store(false, Ordering::Relaxed);
        self.flash.rearm_breakpoints();
    }

    /// Resets the processor.
    ///
    /// The PC, status register, general purpose registers, SRAM, and run state are reset.
    /// Flash, IO registers, the clock, the interrupt table, instrumentation, and flags are preserved.
    pub fn reset(&mut self) {
        log::debug!("reset at cycle {}", self.cycles());
        self.reset_core();
    }

    /// The part being simulated.
    pub fn props(&self) -> &McuProps {
        &self.props
    }

    /// The number of cycles elapsed on the main clock.
    pub fn cycles(&self) -> u64 {
        self.clock.count()
    }

    /// The run state of the processor.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Whether the processor is sleeping.
    pub fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    /// Advances the main clock, firing every event that becomes due in order.
    pub fn advance_cycles(&mut self, cycles: u64) {
        self.clock.queue_mut().advance(cycles);
        while let Some(batch) = self.clock.queue_mut().pop_due() {
            for event in batch {
                event.fire(self);
            }
        }
    }

    /// Delays the processor by the given number of cycles.
    ///
    /// The cycles are consumed before the next instruction is executed.
    pub fn delay(&mut self, cycles: u64) {
        self.delay_cycles += cycles;
    }

    /// Schedules an event to fire every `period` cycles, starting `period` cycles from now.
    ///
    /// The returned handle can be passed to [`MainClock::remove_event`] to stop it.
    pub fn insert_periodic_event(&mut self, event: EventRef, period: u64) -> EventRef {
        let periodic = PeriodicEvent::new(event, period);
        let period = periodic.period();
        let handle: EventRef = periodic;
        self.clock.insert_event(Arc::clone(&handle), period);
        handle
    }

    /// Schedules a timeout which pauses execution `cycles` cycles from now.
    ///
    /// Execution pauses at the end of the step during which the timeout expires,
    /// and [`Simulator::hit_timeout`] is set. A timeout does not stop the simulator.
    pub fn insert_timeout(&mut self, cycles: u64) -> EventRef {
        let event: EventRef = Arc::new(|sim: &mut Simulator| sim.timeout());
        self.clock.insert_event(Arc::clone(&event), cycles);
        event
    }

    /// Pauses execution at the end of the current step, as a timeout.
    pub fn timeout(&mut self) {
        log::debug!("timeout at cycle {}", self.cycles());
        self.halt.get_or_insert(PauseCondition::Timeout);
    }

    /// Stops the simulator.
    ///
    /// The simulator stays stopped until [`Simulator::reset`].
    pub fn stop(&mut self) {
        log::debug!("stopped at cycle {}", self.cycles());
        self.state = RunState::Stopped;
        self.halt = Some(PauseCondition::Stop);
    }

    /// A handle which can stop this simulator from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop_requested))
    }

    // ------------------ REGISTERS ------------------

    /// Reads a general purpose register.
    pub fn reg(&self, r: Reg) -> u8 {
        self.data.as_slice()[usize::from(r)]
    }
    /// Writes a general purpose register.
    pub fn set_reg(&mut self, r: Reg, value: u8) {
        self.data.as_mut_slice()[usize::from(r)] = value;
    }
    /// Reads a register pair, with `lo` holding the low byte.
    pub fn reg_pair(&self, lo: Reg) -> u16 {
        let i = usize::from(lo);
        let d = self.data.as_slice();
        u16::from_le_bytes([d[i], d[(i + 1) % mcu::NUM_REGS]])
    }
    /// Writes a register pair, with `lo` holding the low byte.
    pub fn set_reg_pair(&mut self, lo: Reg, value: u16) {
        let i = usize::from(lo);
        let [l, h] = value.to_le_bytes();
        let d = self.data.as_mut_slice();
        d[i] = l;
        d[(i + 1) % mcu::NUM_REGS] = h;
    }
    /// Reads a pointer register.
    pub fn pointer(&self, ptr: Ptr) -> u16 {
        self.reg_pair(ptr.low())
    }
    /// Writes a pointer register.
    pub fn set_pointer(&mut self, ptr: Ptr, value: u16) {
        self.set_reg_pair(ptr.low(), value)
    }

    /// The status register.
    pub fn sreg(&self) -> Sreg {
        self.sreg
    }
    /// Writes the status register.
    ///
    /// Changing the `I` flag enables or disables interrupts (firing global interrupt probes).
    pub fn set_sreg(&mut self, value: u8) {
        let new = Sreg(value);
        let old_i = self.sreg.i();
        self.sreg = Sreg(value & !Sreg::I_MASK | self.sreg.0 & Sreg::I_MASK);

        match (old_i, new.i()) {
            (false, true) => self.enable_interrupts(),
            (true, false) => self.disable_interrupts(),
            _ => {}
        }
    }

    /// The stack pointer.
    pub fn sp(&self) -> u16 {
        u16::from_le_bytes([self.io_stored(self.props.spl), self.io_stored(self.props.sph)])
    }
    /// Sets the stack pointer.
    pub fn set_sp(&mut self, sp: u16) {
        let [lo, hi] = sp.to_le_bytes();
        self.set_io_stored(self.props.spl, lo);
        self.set_io_stored(self.props.sph, hi);
    }

    // ------------------ DATA MEMORY ------------------

    fn io_index(&self, addr: usize) -> Option<u8> {
        addr.checked_sub(self.props.io_start())
            .filter(|&n| n < self.ioregs.len())
            .and_then(|n| u8::try_from(n).ok())
    }

    /// Reads a data address as simulated code.
    ///
    /// This fires any watches at the address and routes the IO window to the IO registers.
    pub fn read_data(&mut self, addr: u16) -> u8 {
        let a = usize::from(addr);
        let watches = self.data.watches_at(a).map(<[WatchRef]>::to_vec);

        for w in watches.iter().flatten() {
            w.fire_before_read(self, addr);
        }
        let value = match self.io_index(a) {
            Some(n) => self.read_io(n),
            None => self.data.read(a),
        };
        for w in watches.iter().flatten() {
            w.fire_after_read(self, addr, value);
        }
        value
    }

    /// Writes a data address as simulated code.
    ///
    /// This fires any watches at the address and routes the IO window to the IO registers.
    pub fn write_data(&mut self, addr: u16, value: u8) -> Result<(), SimErr> {
        let a = usize::from(addr);
        let watches = self.data.watches_at(a).map(<[WatchRef]>::to_vec);

        for w in watches.iter().flatten() {
            w.fire_before_write(self, addr, value);
        }
        match self.io_index(a) {
            Some(n) => self.write_io(n, value)?,
            None => self.data.write(a, value),
        }
        for w in watches.iter().flatten() {
            w.fire_after_write(self, addr, value);
        }
        Ok(())
    }

    /// Pushes a byte onto the stack.
    pub fn push_byte(&mut self, value: u8) -> Result<(), SimErr> {
        let sp = self.sp();
        self.write_data(sp, value)?;
        self.set_sp(sp.wrapping_sub(1));
        Ok(())
    }
    /// Pops a byte off of the stack.
    pub fn pop_byte(&mut self) -> u8 {
        let sp = self.sp().wrapping_add(1);
        self.set_sp(sp);
        self.read_data(sp)
    }
    /// Pushes a return address (in words), low byte first.
    fn push_pc(&mut self, word: u32) -> Result<(), SimErr> {
        let [lo, hi, ..] = word.to_le_bytes();
        self.push_byte(lo)?;
        self.push_byte(hi)
    }
    /// Pops a return address (in words), high byte first.
    fn pop_pc(&mut self) -> u32 {
        let hi = self.pop_byte();
        let lo = self.pop_byte();
        u32::from(u16::from_le_bytes([lo, hi]))
    }

    // ------------------ INSTRUMENTATION ------------------

    /// Adds a probe fired around every instruction.
    pub fn insert_probe(&mut self, probe: ProbeRef) {
        self.probes.push(probe);
    }
    /// Removes a probe fired around every instruction, comparing by reference identity.
    pub fn remove_probe(&mut self, probe: &ProbeRef) -> bool {
        remove_ref(&mut self.probes, probe)
    }
    /// Adds a probe fired around the instruction at the byte address.
    pub fn insert_probe_at(&mut self, addr: u32, probe: ProbeRef) -> Result<(), SimErr> {
        self.flash.insert_probe(addr, probe)
    }
    /// Removes a probe from the instruction at the byte address, comparing by reference identity.
    pub fn remove_probe_at(&mut self, addr: u32, probe: &ProbeRef) -> bool {
        self.flash.remove_probe(addr, probe)
    }
    /// Adds a watch on a data address.
    pub fn insert_watch(&mut self, addr: u16, watch: WatchRef) -> Result<(), SimErr> {
        self.data.insert_watch(usize::from(addr), watch)
    }
    /// Removes a watch from a data address, comparing by reference identity.
    pub fn remove_watch(&mut self, addr: u16, watch: &WatchRef) -> bool {
        self.data.remove_watch(usize::from(addr), watch)
    }
    /// Sets a breakpoint on the instruction at the byte address.
    pub fn insert_breakpoint(&mut self, addr: u32) -> Result<(), SimErr> {
        self.flash.insert_breakpoint(addr)
    }
    /// Removes a breakpoint from the instruction at the byte address.
    pub fn remove_breakpoint(&mut self, addr: u32) -> bool {
        self.flash.remove_breakpoint(addr)
    }

    // ------------------ EXECUTION ------------------

    /// Indicates whether the last execution of the simulator hit a breakpoint.
    pub fn hit_breakpoint(&self) -> bool {
        matches!(self.pause_condition, PauseCondition::Breakpoint)
    }
    /// Indicates whether the last execution of the simulator executed `BREAK`.
    pub fn hit_break_instr(&self) -> bool {
        matches!(self.pause_condition, PauseCondition::Break)
    }
    /// Indicates whether the last execution of the simulator ended with the simulator stopped.
    ///
    /// This includes `BREAK`.
    pub fn hit_stop(&self) -> bool {
        matches!(self.pause_condition, PauseCondition::Stop | PauseCondition::Break)
    }
    /// Indicates whether the last execution of the simulator was paused by a timeout.
    pub fn hit_timeout(&self) -> bool {
        matches!(self.pause_condition, PauseCondition::Timeout)
    }

    /// Dispatches the handler of an interrupt.
    fn invoke_interrupt(&mut self, inum: u8) -> Result<(), SimErr> {
        log::debug!("interrupt {inum} dispatched at cycle {}", self.cycles());
        self.before_invoke(inum);

        self.push_pc(self.pc / 2)?;
        self.pc = self.props.interrupt_address(inum);
        self.disable_interrupts();
        self.advance_cycles(4);

        if self.sleeping {
            log::debug!("woke at cycle {}", self.cycles());
        }
        self.sleeping = false;
        if self.state == RunState::Sleeping {
            self.state = RunState::Running;
        }

        self.after_invoke(inum);
        Ok(())
    }

    fn take_halt(&mut self) -> Result<(), StepBreak> {
        match self.halt.take() {
            None => Ok(()),
            Some(PauseCondition::Break) => Err(StepBreak::Break),
            Some(PauseCondition::Timeout) => Err(StepBreak::Timeout),
            Some(_) => Err(StepBreak::Stopped),
        }
    }

    /// Simulate one step: dispatch a pending interrupt, then execute one instruction (or sleep).
    fn step(&mut self) -> Result<(), StepBreak> {
        if self.state == RunState::Stopped {
            return Err(StepBreak::Stopped);
        }

        if self.delay_cycles > 0 {
            let delay = std::mem::take(&mut self.delay_cycles);
            self.advance_cycles(delay);
        }

        let stale = self.interrupts.take_stale();
        let check = !self.inner_loop || stale;
        let returned = check && self.just_returned;
        self.inner_loop = true;
        if check {
            if returned {
                // one instruction runs before the next dispatch
                self.just_returned = false;
                self.inner_loop = false;
            } else if self.sreg.i() {
                if let Some(inum) = self.interrupts.highest_priority() {
                    self.invoke_interrupt(inum)?;
                }
            }
        }

        if self.sleeping {
            let delta = self.clock.first_event_delta().unwrap_or(1).max(1);
            self.advance_cycles(delta);
            self.inner_loop = false;
            return self.take_halt();
        }

        let pc = self.pc;
        let (instr, local) = match self.flash.fetch(pc)? {
            Fetch::Plain(i) => (i, None),
            Fetch::Probed(i, probes) => (i, Some(probes)),
            Fetch::Break => {
                log::debug!("breakpoint at {pc:#07x}");
                // nothing ran, so the instruction after RETI is still owed
                if returned {
                    self.just_returned = true;
                    self.inner_loop = false;
                }
                return Err(StepBreak::Breakpoint(pc));
            }
        };
        let global = match self.probes.is_empty() {
            true  => None,
            false => Some(self.probes.clone()),
        };

        for p in global.iter().flatten() {
            p.fire_before(self, pc);
        }
        for p in local.iter().flatten() {
            p.fire_before(self, pc);
        }

        let cycles = self.execute(instr)?;
        self.advance_cycles(cycles);

        for p in local.iter().flatten() {
            p.fire_after(self, pc);
        }
        for p in global.iter().flatten() {
            p.fire_after(self, pc);
        }

        self.instructions_run += 1;
        self.take_halt()
    }

    /// Runs until the tripwire condition returns false (or any of the typical breaks occur).
    ///
    /// The typical break conditions are:
    /// - `BREAK` is executed
    /// - the simulator is stopped
    /// - a breakpoint is reached
    /// - a timeout expires
    pub fn run_while(&mut self, mut tripwire: impl FnMut(&mut Simulator) -> bool) -> Result<(), SimErr> {
        std::mem::take(&mut self.pause_condition);

        // event loop
        // run until:
        // 1. the stop handle is triggered
        // 2. the tripwire condition returns false
        // 3. a step breaks
        let result = loop {
            if self.stop_requested.swap(false, Ordering::Relaxed) {
                self.stop();
                break Ok(PauseCondition::Stop);
            }
            if !tripwire(self) {
                break Ok(PauseCondition::Tripwire);
            }

            match self.step() {
                Ok(()) => {},
                Err(StepBreak::Breakpoint(_)) => break Ok(PauseCondition::Breakpoint),
                Err(StepBreak::Break) => break Ok(PauseCondition::Break),
                Err(StepBreak::Stopped) => break Ok(PauseCondition::Stop),
                Err(StepBreak::Timeout) => break Ok(PauseCondition::Timeout),
                Err(StepBreak::Err(e)) => break Err(e),
            }
        };

        self.pause_condition = result?;
        Ok(())
    }

    /// Execute the program.
    ///
    /// This blocks until the program stops.
    /// If you would like to limit the maximum number of steps to execute, consider [`Simulator::run_with_limit`].
    pub fn run(&mut self) -> Result<(), SimErr> {
        self.run_while(|_| true)
    }

    /// Execute the program with a limit on how many steps to execute.
    ///
    /// A step executes one instruction, or sleeps until the next event.
    pub fn run_with_limit(&mut self, max_steps: u64) -> Result<(), SimErr> {
        let mut steps = 0u64;
        self.run_while(|_| {
            steps += 1;
            steps <= max_steps
        })
    }

    /// Execute the program until the main clock has advanced by at least `cycles`.
    pub fn run_for_cycles(&mut self, cycles: u64) -> Result<(), SimErr> {
        let end = self.cycles().saturating_add(cycles);
        self.run_while(|sim| sim.cycles() < end)
    }

    /// Simulate one step, executing one instruction.
    ///
    /// This runs through breakpoints.
    pub fn step_in(&mut self) -> Result<(), SimErr> {
        let result = match self.step() {
            Err(StepBreak::Breakpoint(_)) => self.step(),
            r => r
        };

        self.pause_condition = match result {
            Ok(()) => PauseCondition::Tripwire,
            Err(StepBreak::Breakpoint(_)) => PauseCondition::Breakpoint,
            Err(StepBreak::Break) => PauseCondition::Break,
            Err(StepBreak::Stopped) => PauseCondition::Stop,
            Err(StepBreak::Timeout) => PauseCondition::Timeout,
            Err(StepBreak::Err(e)) => {
                self.pause_condition = PauseCondition::Unsuccessful;
                return Err(e);
            }
        };
        Ok(())
    }
}
impl Default for Simulator {
    fn default() -> Self {
        Self::new(Default::default())
    }
}
impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("mcu", &self.props.name)
            .field("pc", &format_args!("{:#07x}", self.pc))
            .field("sreg", &self.sreg)
            .field("sp", &format_args!("{:#06x}", self.sp()))
            .field("state", &self.state)
            .field("cycles", &self.cycles())
            .field("instructions_run", &self.instructions_run)
            .field("interrupts", &self.interrupts)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// A wrapper over `u8` in order to facilitate the status register.
///
/// The byte is encoded as the following:
///
/// ```text
/// bit:  7 6 5 4 3 2 1 0
/// flag: I T H S V N Z C
/// ```
///
/// - `I`: global interrupt enable
/// - `T`: bit copy storage
/// - `H`: half carry
/// - `S`: sign (`N ^ V`)
/// - `V`: two's complement overflow
/// - `N`: negative
/// - `Z`: zero
/// - `C`: carry
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Sreg(u8);

macro_rules! sreg_flags {
    ($($bit:literal => $get:ident, $set:ident, $name:literal);+ $(;)?) => {
        impl Sreg {
            $(
                #[doc = concat!("Checks the `", $name, "` flag.")]
                pub fn $get(&self) -> bool {
                    self.get(1 << $bit)
                }
                #[doc = concat!("Sets the `", $name, "` flag.")]
                pub fn $set(&mut self, value: bool) {
                    self.set(1 << $bit, value)
                }
            )+
        }
    }
}
sreg_flags! {
    0 => c, set_c, "C";
    1 => z, set_z, "Z";
    2 => n, set_n, "N";
    3 => v, set_v, "V";
    4 => s, set_s, "S";
    5 => h, set_h, "H";
    6 => t, set_t, "T";
    7 => i, set_i, "I";
}

impl Sreg {
    const I_MASK: u8 = 1 << 7;

    /// Creates a status register with every flag clear.
    pub fn new() -> Self {
        Sreg(0)
    }
    /// Gets the bit-representation of the status register.
    pub fn bits(&self) -> u8 {
        self.0
    }
    /// Checks whether every flag in `mask` is set.
    pub fn get(&self, mask: u8) -> bool {
        self.0 & mask == mask
    }
    /// Sets or clears every flag in `mask`.
    pub fn set(&mut self, mask: u8, value: bool) {
        match value {
            true  => self.0 |= mask,
            false => self.0 &= !mask,
        }
    }
    /// Checks the flag at the given bit index.
    pub fn bit(&self, bit: u8) -> bool {
        (self.0 >> (bit & 7)) & 1 != 0
    }

    /// Sets `N`, `Z`, and `S` from a result, with `S = N ^ V` using the current `V`.
    fn set_nzs(&mut self, result: u8) {
        self.set_n(result & 0x80 != 0);
        self.set_z(result == 0);
        self.set_s(self.n() ^ self.v());
    }
}
impl std::fmt::Debug for Sreg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use std::fmt::Write;

        f.write_str("Sreg(")?;
        for (bit, c) in (0..8).rev().zip("ITHSVNZC".chars()) {
            if self.bit(bit) { f.write_char(c)?; }
        }
        f.write_char(')')
    }
}
