//! Memory segments for the AVR simulator.
//!
//! This module consists of:
//! - [`Segment`]: A byte-addressable, bounds-checked memory array with optional per-address watches.
//! - [`ErrorReporter`]: The hook that receives guest out-of-bounds accesses.
//! - [`MemInitStrategy`]: How SRAM is filled when a simulator is created or reset.
//!
//! # Guest vs. tooling access
//!
//! A segment has two pairs of accessors with different contracts:
//! - [`Segment::read`] and [`Segment::write`] are what simulated code goes through.
//!   An out-of-bounds access is handed to the segment's [`ErrorReporter`] and simulation continues.
//! - [`Segment::get`] and [`Segment::set`] are for inspection tools.
//!   An out-of-bounds access is a [`SimErr::AddressOutOfBounds`] error.
//!
//! Watches installed on a segment are fired by the [`Simulator`]'s guest data accesses
//! ([`Simulator::read_data`] and [`Simulator::write_data`]). Tooling accesses never fire watches.
//!
//! ```
//! use avr_sim::sim::mem::Segment;
//!
//! let mut seg = Segment::new("sram", 16, 0xAA);
//! seg.write(3, 0x42);
//! assert_eq!(seg.read(3), 0x42);
//!
//! // Guest access out of bounds reports and returns the default value:
//! assert_eq!(seg.read(100), 0xAA);
//! // Tooling access out of bounds is an error:
//! assert!(seg.get(100).is_err());
//! ```
//!
//! [`Simulator`]: super::Simulator
//! [`Simulator::read_data`]: super::Simulator::read_data
//! [`Simulator::write_data`]: super::Simulator::write_data

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;

use super::probe::{same_ref, WatchRef};
use super::SimErr;

/// Receives out-of-bounds accesses made by simulated code.
pub trait ErrorReporter: Send + Sync {
    /// Called when simulated code reads an address outside of the segment.
    ///
    /// The returned byte is the result of the read.
    fn read_error(&self, segment: &str, address: usize, default: u8) -> u8;

    /// Called when simulated code writes an address outside of the segment.
    fn write_error(&self, segment: &str, address: usize, value: u8);
}

/// The default [`ErrorReporter`], which logs a warning and reads the segment default.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn read_error(&self, segment: &str, address: usize, default: u8) -> u8 {
        log::warn!("segment {segment}: read out of bounds at 0x{address:04X}");
        default
    }

    fn write_error(&self, segment: &str, address: usize, value: u8) {
        log::warn!("segment {segment}: write of 0x{value:02X} out of bounds at 0x{address:04X}");
    }
}

/// A byte-addressable memory array.
///
/// See the [module-level documentation](self) for the difference between its guest and tooling accessors.
pub struct Segment {
    name: String,
    data: Box<[u8]>,
    default_value: u8,
    /// Per-address watch lists.
    ///
    /// This is `None` until the first watch is inserted,
    /// so guest accesses on an unwatched segment skip watch lookup entirely.
    watches: Option<Box<[Vec<WatchRef>]>>,
    reporter: Arc<dyn ErrorReporter>
}

impl Segment {
    /// Creates a new segment filled with its default value.
    pub fn new(name: impl Into<String>, size: usize, default_value: u8) -> Self {
        Self {
            name: name.into(),
            data: vec![default_value; size].into_boxed_slice(),
            default_value,
            watches: None,
            reporter: Arc::new(LogReporter)
        }
    }

    /// Replaces the error reporter of this segment.
    pub fn set_reporter(&mut self, reporter: Arc<dyn ErrorReporter>) {
        self.reporter = reporter;
    }

    /// The name of this segment.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The size of this segment in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }
    /// Whether this segment has no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    /// The value out-of-bounds reads return by default.
    pub fn default_value(&self) -> u8 {
        self.default_value
    }

    /// Reads a byte as simulated code.
    ///
    /// Out-of-bounds addresses are forwarded to the [`ErrorReporter`].
    pub fn read(&self, addr: usize) -> u8 {
        match self.data.get(addr) {
            Some(&b) => b,
            None => self.reporter.read_error(&self.name, addr, self.default_value),
        }
    }

    /// Writes a byte as simulated code.
    ///
    /// Out-of-bounds addresses are forwarded to the [`ErrorReporter`].
    pub fn write(&mut self, addr: usize, value: u8) {
        match self.data.get_mut(addr) {
            Some(b) => *b = value,
            None => self.reporter.write_error(&self.name, addr, value),
        }
    }

    fn oob(&self, address: usize) -> SimErr {
        SimErr::AddressOutOfBounds { segment: self.name.clone(), address }
    }

    /// Reads a byte, failing if the address is out of bounds.
    pub fn get(&self, addr: usize) -> Result<u8, SimErr> {
        self.data.get(addr)
            .copied()
            .ok_or_else(|| self.oob(addr))
    }

    /// Writes a byte, failing if the address is out of bounds.
    pub fn set(&mut self, addr: usize, value: u8) -> Result<(), SimErr> {
        match self.data.get_mut(addr) {
            Some(b) => {
                *b = value;
                Ok(())
            },
            None => Err(self.oob(addr))
        }
    }

    /// Copies `bytes` into the segment starting at `offset`.
    pub fn load(&mut self, offset: usize, bytes: &[u8]) -> Result<(), SimErr> {
        let end = offset.checked_add(bytes.len())
            .filter(|&e| e <= self.len())
            .ok_or_else(|| self.oob(offset.saturating_add(bytes.len()).saturating_sub(1)))?;

        self.data[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Fills the given range of the segment from a byte filler.
    pub(crate) fn fill_with(&mut self, range: std::ops::Range<usize>, filler: &mut impl ByteFiller) {
        for b in &mut self.data[range] {
            *b = filler.generate();
        }
    }

    /// The raw contents of this segment.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
    /// The raw contents of this segment, mutably.
    ///
    /// This does not fire watches.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Adds a watch to the given address.
    ///
    /// Watches at the same address fire in insertion order.
    pub fn insert_watch(&mut self, addr: usize, watch: WatchRef) -> Result<(), SimErr> {
        if addr >= self.len() { return Err(self.oob(addr)); }

        let len = self.len();
        let table = self.watches.get_or_insert_with(|| vec![vec![]; len].into_boxed_slice());
        table[addr].push(watch);
        Ok(())
    }

    /// Removes a watch from the given address, comparing by reference identity.
    ///
    /// This returns whether the watch was present.
    pub fn remove_watch(&mut self, addr: usize, watch: &WatchRef) -> bool {
        let Some(list) = self.watches.as_mut().and_then(|t| t.get_mut(addr)) else { return false };

        match list.iter().position(|w| same_ref(w, watch)) {
            Some(i) => {
                list.remove(i);
                if self.watches.as_ref().is_some_and(|t| t.iter().all(Vec::is_empty)) {
                    self.watches = None;
                }
                true
            },
            None => false
        }
    }

    /// The watches at the given address, if any are installed.
    ///
    /// If no watch exists anywhere in the segment, this is a single `None` check.
    pub fn watches_at(&self, addr: usize) -> Option<&[WatchRef]> {
        self.watches.as_ref()?
            .get(addr)
            .map(Vec::as_slice)
            .filter(|l| !l.is_empty())
    }
}
impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("default_value", &self.default_value)
            .field("watched", &self.watches.is_some())
            .finish_non_exhaustive()
    }
}

/// Trait that describes types that can be used to fill uninitialized memory.
pub trait ByteFiller {
    /// Generate the data.
    fn generate(&mut self) -> u8;
}
impl ByteFiller for () {
    /// This creates unseeded, non-deterministic values.
    fn generate(&mut self) -> u8 {
        rand::random()
    }
}
impl ByteFiller for u8 {
    /// Sets each byte to the given value.
    fn generate(&mut self) -> u8 {
        *self
    }
}
impl ByteFiller for StdRng {
    /// This creates values from the standard random number generator.
    ///
    /// This can be used to create deterministic, seeded values.
    fn generate(&mut self) -> u8 {
        self.gen()
    }
}

/// Strategy used to fill SRAM of the [`Simulator`].
///
/// SRAM contents are undefined at power-on on real hardware.
/// The general purpose registers and IO registers are always cleared regardless of this strategy.
///
/// [`Simulator`]: super::Simulator
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum MemInitStrategy {
    /// Initializes each byte randomly and non-deterministically.
    #[default]
    Unseeded,

    /// Initializes each byte randomly and deterministically.
    Seeded {
        /// The seed the RNG was initialized with.
        seed: u64
    },

    /// Initializes each byte to a known value.
    Known {
        /// The value to initialize each byte to.
        value: u8
    }
}

impl MemInitStrategy {
    pub(super) fn generator(&self) -> impl ByteFiller {
        use rand::SeedableRng;

        match self {
            MemInitStrategy::Unseeded => MIGenerator::Unseeded,
            MemInitStrategy::Seeded { seed } => MIGenerator::Seeded(Box::new(StdRng::seed_from_u64(*seed))),
            MemInitStrategy::Known { value } => MIGenerator::Known(*value),
        }
    }
}

enum MIGenerator {
    Unseeded,
    Seeded(Box<StdRng>),
    Known(u8)
}
impl ByteFiller for MIGenerator {
    fn generate(&mut self) -> u8 {
        match self {
            MIGenerator::Unseeded  => ().generate(),
            MIGenerator::Seeded(r) => r.generate(),
            MIGenerator::Known(k)  => k.generate(),
        }
    }
}
