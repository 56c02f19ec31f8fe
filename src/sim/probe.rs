//! Instrumentation callbacks.
//!
//! Probes observe the simulator without changing guest-visible semantics.
//! There is one trait per thing being observed:
//! - [`Probe`]: fired before and after an instruction executes.
//! - [`Watch`]: fired around guest reads and writes of a data address.
//! - [`IoWatch`]: fired around reads and writes of an IO register.
//! - [`InterruptProbe`]: fired on interrupt table state changes.
//!
//! Every callback receives the [`Simulator`] mutably, so a probe may inspect state,
//! insert or remove other probes (or itself), and schedule events.
//!
//! Probes are shared as `Arc<dyn Trait>` handles.
//! Removal always compares handles by reference identity (see [`same_ref`]), never by value.
//! The same probe can be inserted more than once, in which case it fires once per insertion.
//!
//! Multicast lists are snapshotted before firing, so a probe removing itself or another
//! probe from the list it is being fired from does not affect the current round of firing.
//!
//! All trait methods have empty default implementations, so an implementor only needs to
//! provide the callbacks it cares about.
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use avr_sim::isa::Instr;
//! use avr_sim::program::Program;
//! use avr_sim::sim::probe::Probe;
//! use avr_sim::sim::Simulator;
//!
//! #[derive(Default)]
//! struct Trace(AtomicU64);
//! impl Probe for Trace {
//!     fn fire_before(&self, _sim: &mut Simulator, addr: u32) {
//!         self.0.store(u64::from(addr), Ordering::Relaxed);
//!     }
//! }
//!
//! let trace = Arc::new(Trace::default());
//! let mut sim = Simulator::default();
//! sim.load_program(&Program::from_instrs(&[Instr::NOP, Instr::NOP])).unwrap();
//! sim.insert_probe(trace.clone());
//! sim.step_in().unwrap();
//! sim.step_in().unwrap();
//! assert_eq!(trace.0.load(Ordering::Relaxed), 2);
//! ```

use std::sync::Arc;

use super::Simulator;

/// Checks whether two handles refer to the same object.
///
/// This compares the data pointers only,
/// so two handles to the same object coerced through different vtables still compare equal.
pub fn same_ref<T: ?Sized, U: ?Sized>(a: &Arc<T>, b: &Arc<U>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Removes the first handle in `list` that is `item` (by reference identity).
///
/// This returns whether anything was removed.
pub(crate) fn remove_ref<T: ?Sized>(list: &mut Vec<Arc<T>>, item: &Arc<T>) -> bool {
    match list.iter().position(|p| same_ref(p, item)) {
        Some(i) => {
            list.remove(i);
            true
        },
        None => false
    }
}

/// A probe fired around instruction execution.
///
/// `addr` is the byte address of the instruction.
#[allow(unused_variables)]
pub trait Probe: Send + Sync {
    /// Called before the instruction at `addr` executes.
    fn fire_before(&self, sim: &mut Simulator, addr: u32) {}
    /// Called after the instruction at `addr` executes and the PC and cycle count are committed.
    fn fire_after(&self, sim: &mut Simulator, addr: u32) {}
}
/// A shared [`Probe`] handle.
pub type ProbeRef = Arc<dyn Probe>;

/// A watch fired around guest accesses to a data address.
#[allow(unused_variables)]
pub trait Watch: Send + Sync {
    /// Called before the byte at `addr` is read.
    fn fire_before_read(&self, sim: &mut Simulator, addr: u16) {}
    /// Called after the byte at `addr` is read, with the value read.
    fn fire_after_read(&self, sim: &mut Simulator, addr: u16, value: u8) {}
    /// Called before `value` is written to `addr`.
    fn fire_before_write(&self, sim: &mut Simulator, addr: u16, value: u8) {}
    /// Called after `value` is written to `addr`.
    fn fire_after_write(&self, sim: &mut Simulator, addr: u16, value: u8) {}
}
/// A shared [`Watch`] handle.
pub type WatchRef = Arc<dyn Watch>;

/// A watch fired around accesses to an IO register.
///
/// `ioreg` is the IO register number (its address in the IO space, not the data space).
#[allow(unused_variables)]
pub trait IoWatch: Send + Sync {
    /// Called before the register is read.
    fn fire_before_read(&self, sim: &mut Simulator, ioreg: u8) {}
    /// Called after the register is read, with the value read.
    fn fire_after_read(&self, sim: &mut Simulator, ioreg: u8, value: u8) {}
    /// Called before `value` is written to the register.
    fn fire_before_write(&self, sim: &mut Simulator, ioreg: u8, value: u8) {}
    /// Called after `value` is written to the register.
    fn fire_after_write(&self, sim: &mut Simulator, ioreg: u8, value: u8) {}
    /// Called before a single bit of the register is read.
    fn fire_before_bit_read(&self, sim: &mut Simulator, ioreg: u8, bit: u8) {}
    /// Called after a single bit of the register is read.
    fn fire_after_bit_read(&self, sim: &mut Simulator, ioreg: u8, bit: u8, value: bool) {}
    /// Called before a single bit of the register is written.
    fn fire_before_bit_write(&self, sim: &mut Simulator, ioreg: u8, bit: u8, value: bool) {}
    /// Called after a single bit of the register is written.
    fn fire_after_bit_write(&self, sim: &mut Simulator, ioreg: u8, bit: u8, value: bool) {}
}
/// A shared [`IoWatch`] handle.
pub type IoWatchRef = Arc<dyn IoWatch>;

/// A probe fired on interrupt table state changes.
///
/// `inum` is the interrupt number.
/// Changes to the global interrupt enable flag are reported to global probes with `inum == 0`.
#[allow(unused_variables)]
pub trait InterruptProbe: Send + Sync {
    /// Called after the interrupt is posted.
    fn fire_when_posted(&self, sim: &mut Simulator, inum: u8) {}
    /// Called after the interrupt is unposted.
    fn fire_when_unposted(&self, sim: &mut Simulator, inum: u8) {}
    /// Called after the interrupt is enabled.
    fn fire_when_enabled(&self, sim: &mut Simulator, inum: u8) {}
    /// Called after the interrupt is disabled.
    fn fire_when_disabled(&self, sim: &mut Simulator, inum: u8) {}
    /// Called before the handler for the interrupt is dispatched.
    fn fire_before_invoke(&self, sim: &mut Simulator, inum: u8) {}
    /// Called after the handler for the interrupt is dispatched.
    fn fire_after_invoke(&self, sim: &mut Simulator, inum: u8) {}
}
/// A shared [`InterruptProbe`] handle.
pub type InterruptProbeRef = Arc<dyn InterruptProbe>;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{remove_ref, same_ref, Probe, ProbeRef};

    struct P;
    impl Probe for P {}

    #[test]
    fn test_identity() {
        let a = Arc::new(P);
        let a_dyn: ProbeRef = a.clone();
        let b: ProbeRef = Arc::new(P);

        assert!(same_ref(&a, &a_dyn));
        assert!(!same_ref(&a_dyn, &b));

        let mut list = vec![a_dyn.clone(), b.clone(), a_dyn.clone()];
        assert!(remove_ref(&mut list, &a_dyn));
        assert_eq!(list.len(), 2);
        assert!(same_ref(&list[0], &b));
        assert!(same_ref(&list[1], &a_dyn));
    }
}
