//! A cycle-accurate AVR microcontroller simulator.
//!
//! This crate executes AVR program images instruction by instruction,
//! counting clock cycles exactly and giving tooling hooks into every part of the machine:
//! instruction probes, data watches, IO register watches, interrupt probes, breakpoints,
//! and scheduled events.
//!
//! # Usage
//!
//! A program is a flash image. It can be built from raw bytes, from words, or by encoding instructions:
//! ```
//! use avr_sim::isa::{Instr, reg_consts::R16};
//! use avr_sim::program::Program;
//!
//! let program = Program::from_instrs(&[
//!     Instr::LDI { rd: R16, k: 0xFF },
//!     Instr::BREAK,
//! ]);
//! assert_eq!(program.len(), 4);
//! assert_eq!(program.read_instr(0), Some(Instr::LDI { rd: R16, k: 0xFF }));
//! ```
//!
//! Once a program has been created, it can be executed with the simulator:
//! ```
//! # use avr_sim::isa::{Instr, reg_consts::R16};
//! # use avr_sim::program::Program;
//! # let program = Program::from_instrs(&[Instr::LDI { rd: R16, k: 0xFF }, Instr::BREAK]);
//! use avr_sim::sim::Simulator;
//!
//! let mut simulator = Simulator::new(Default::default());
//! simulator.load_program(&program).unwrap();
//! simulator.run().unwrap(); // <-- Result can be handled accordingly
//! assert!(simulator.hit_break_instr());
//! ```
//!
//! If more granularity is needed for simulation, there are also step-in and bounded run functions.
//! See the [`sim`] module for more details.
#![warn(missing_docs)]

pub mod isa;
pub mod program;
pub mod sim;
